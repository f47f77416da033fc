//! Address interval algebra.
//!
//! Addresses are handled as `u128` so that IPv4 and IPv6 share one code
//! path; IPv4 values are zero-extended. Every range also carries its family
//! so that the two spaces never mix.

use ipnet::IpNet;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};
use crate::types::Family;

/// Well-known reasons for an address to be in (or out of) use
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RangePurpose {
    Unused,
    GatewayIp,
    Reserved,
    Dynamic,
    AssignedIp,
    DnsServer,
    Excluded,
    Neighbour,
    #[serde(rename = "rfc-4291-2.6.1")]
    Rfc4291,
    Unmanaged,
}

impl std::fmt::Display for RangePurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RangePurpose::Unused => "unused",
            RangePurpose::GatewayIp => "gateway-ip",
            RangePurpose::Reserved => "reserved",
            RangePurpose::Dynamic => "dynamic",
            RangePurpose::AssignedIp => "assigned-ip",
            RangePurpose::DnsServer => "dns-server",
            RangePurpose::Excluded => "excluded",
            RangePurpose::Neighbour => "neighbour",
            RangePurpose::Rfc4291 => "rfc-4291-2.6.1",
            RangePurpose::Unmanaged => "unmanaged",
        };
        f.write_str(s)
    }
}

/// Convert an IP address to its u128 representation.
pub fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Convert a u128 back to an address of the given family.
pub fn u128_to_ip(val: u128, family: Family) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::from(val as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(val)),
    }
}

/// First and last allocatable host of a network.
///
/// IPv4 drops the network and broadcast addresses except for /31 and /32.
/// IPv6 drops the subnet-router anycast (all-zero) address except for
/// /127 and /128.
pub fn usable_bounds(net: &IpNet) -> (u128, u128) {
    let first = ip_to_u128(net.network());
    let last = ip_to_u128(net.broadcast());
    match net {
        IpNet::V4(v4) if v4.prefix_len() < 31 => (first + 1, last - 1),
        IpNet::V6(v6) if v6.prefix_len() < 127 => (first + 1, last),
        _ => (first, last),
    }
}

/// A contiguous inclusive interval of addresses tagged with purposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    first: u128,
    last: u128,
    family: Family,
    purposes: BTreeSet<RangePurpose>,
}

impl AddressRange {
    pub fn new(start: IpAddr, end: IpAddr, purpose: RangePurpose) -> Result<Self> {
        let family = Family::of(&start);
        if Family::of(&end) != family {
            return Err(Error::InvalidRange(format!(
                "{start} and {end} belong to different address families"
            )));
        }
        let (first, last) = (ip_to_u128(start), ip_to_u128(end));
        if first > last {
            return Err(Error::InvalidRange(format!(
                "start address {start} is greater than end address {end}"
            )));
        }
        Ok(Self::from_bounds(first, last, family, [purpose].into()))
    }

    pub fn single(ip: IpAddr, purpose: RangePurpose) -> Self {
        let value = ip_to_u128(ip);
        Self::from_bounds(value, value, Family::of(&ip), [purpose].into())
    }

    pub(crate) fn from_bounds(
        first: u128,
        last: u128,
        family: Family,
        purposes: BTreeSet<RangePurpose>,
    ) -> Self {
        Self {
            first,
            last,
            family,
            purposes,
        }
    }

    pub fn start(&self) -> IpAddr {
        u128_to_ip(self.first, self.family)
    }

    pub fn end(&self) -> IpAddr {
        u128_to_ip(self.last, self.family)
    }

    pub fn first(&self) -> u128 {
        self.first
    }

    pub fn last(&self) -> u128 {
        self.last
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn num_addresses(&self) -> u128 {
        (self.last - self.first).saturating_add(1)
    }

    pub fn purposes(&self) -> &BTreeSet<RangePurpose> {
        &self.purposes
    }

    pub fn has_purpose(&self, purpose: RangePurpose) -> bool {
        self.purposes.contains(&purpose)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        if Family::of(ip) != self.family {
            return false;
        }
        let value = ip_to_u128(*ip);
        self.first <= value && value <= self.last
    }

    pub fn contains_range(&self, other: &AddressRange) -> bool {
        self.family == other.family && self.first <= other.first && other.last <= self.last
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        self.family == other.family && self.first <= other.last && other.first <= self.last
    }

    fn sort_key(&self) -> (Family, u128, u128) {
        (self.family, self.first, self.last)
    }
}

impl std::fmt::Display for AddressRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.start())
        } else {
            write!(f, "{}-{}", self.start(), self.end())
        }
    }
}

#[derive(Serialize)]
struct RangeJson<'a> {
    start: IpAddr,
    end: IpAddr,
    num_addresses: String,
    purpose: &'a BTreeSet<RangePurpose>,
}

impl Serialize for AddressRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        // u128 counts do not fit in a JSON number
        RangeJson {
            start: self.start(),
            end: self.end(),
            num_addresses: self.num_addresses().to_string(),
            purpose: &self.purposes,
        }
        .serialize(serializer)
    }
}

/// Sorted, condensed collection of address ranges.
///
/// Overlapping ranges are merged (their purposes unioned) and adjacent ranges
/// with identical purposes are coalesced, so every address appears at most
/// once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct AddressSet {
    ranges: Vec<AddressRange>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges<I: IntoIterator<Item = AddressRange>>(ranges: I) -> Self {
        let mut set = Self {
            ranges: ranges.into_iter().collect(),
        };
        set.condense();
        set
    }

    fn condense(&mut self) {
        self.ranges.sort_by_key(AddressRange::sort_key);

        let mut merged: Vec<AddressRange> = Vec::with_capacity(self.ranges.len());
        for item in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(prev) if prev.family == item.family && item.first <= prev.last => {
                    prev.last = prev.last.max(item.last);
                    prev.purposes.extend(item.purposes);
                }
                _ => merged.push(item),
            }
        }

        let mut coalesced: Vec<AddressRange> = Vec::with_capacity(merged.len());
        for item in merged {
            match coalesced.last_mut() {
                Some(prev)
                    if prev.family == item.family
                        && prev.last.checked_add(1) == Some(item.first)
                        && prev.purposes == item.purposes =>
                {
                    prev.last = item.last;
                }
                _ => coalesced.push(item),
            }
        }
        self.ranges = coalesced;
    }

    pub fn insert(&mut self, range: AddressRange) {
        self.ranges.push(range);
        self.condense();
    }

    pub fn union(&mut self, other: AddressSet) {
        self.ranges.extend(other.ranges);
        self.condense();
    }

    pub fn ranges(&self) -> &[AddressRange] {
        &self.ranges
    }

    pub fn iter(&self) -> std::slice::Iter<'_, AddressRange> {
        self.ranges.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// The range holding `ip`, if any.
    pub fn find(&self, ip: &IpAddr) -> Option<&AddressRange> {
        self.ranges.iter().find(|r| r.contains(ip))
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.find(ip).is_some()
    }

    pub fn ip_has_purpose(&self, ip: &IpAddr, purpose: RangePurpose) -> Result<bool> {
        match self.find(ip) {
            Some(range) => Ok(range.has_purpose(purpose)),
            None => Err(Error::Other(format!(
                "IP address {ip} does not exist in this address set"
            ))),
        }
    }

    pub fn is_unused(&self, ip: &IpAddr) -> Result<bool> {
        self.ip_has_purpose(ip, RangePurpose::Unused)
    }

    pub fn includes_purpose(&self, purpose: RangePurpose) -> bool {
        self.ranges.iter().any(|r| r.has_purpose(purpose))
    }

    pub fn first_unused(&self) -> Option<IpAddr> {
        self.ranges
            .iter()
            .find(|r| r.has_purpose(RangePurpose::Unused))
            .map(AddressRange::start)
    }

    /// Largest unused block; on equal sizes the later block wins.
    pub fn largest_unused_block(&self) -> Option<&AddressRange> {
        let mut largest: Option<&AddressRange> = None;
        for range in self.ranges.iter().filter(|r| r.has_purpose(RangePurpose::Unused)) {
            if largest.map_or(true, |l| range.num_addresses() >= l.num_addresses()) {
                largest = Some(range);
            }
        }
        largest
    }

    /// Smallest unused block; on equal sizes the lowest start wins.
    pub fn smallest_unused_block(&self) -> Option<&AddressRange> {
        let mut smallest: Option<&AddressRange> = None;
        for range in self.ranges.iter().filter(|r| r.has_purpose(RangePurpose::Unused)) {
            if smallest.map_or(true, |s| range.num_addresses() < s.num_addresses()) {
                smallest = Some(range);
            }
        }
        smallest
    }

    pub fn total_addresses(&self) -> u128 {
        self.ranges
            .iter()
            .fold(0u128, |acc, r| acc.saturating_add(r.num_addresses()))
    }

    /// Drop a single address, splitting the range that holds it.
    pub fn remove_address(&mut self, ip: &IpAddr) {
        let Some(idx) = self.ranges.iter().position(|r| r.contains(ip)) else {
            return;
        };
        let value = ip_to_u128(*ip);
        let range = self.ranges.remove(idx);
        if value < range.last {
            self.ranges.insert(
                idx,
                AddressRange::from_bounds(value + 1, range.last, range.family, range.purposes.clone()),
            );
        }
        if value > range.first {
            self.ranges.insert(
                idx,
                AddressRange::from_bounds(range.first, value - 1, range.family, range.purposes),
            );
        }
    }

    /// Ranges of `net`'s usable hosts not covered by this set.
    pub fn unused_for_network(&self, net: &IpNet) -> AddressSet {
        let family = Family::of_net(net);
        let (first, last) = usable_bounds(net);
        self.unused_in(&[(first, last)], family)
    }

    /// Ranges inside `within` not covered by this set.
    pub fn unused_within(&self, within: &[AddressRange]) -> AddressSet {
        let universe = AddressSet::from_ranges(within.iter().cloned());
        let mut result = AddressSet::new();
        for family in [Family::V4, Family::V6] {
            let bounds: Vec<(u128, u128)> = universe
                .ranges
                .iter()
                .filter(|r| r.family == family)
                .map(|r| (r.first, r.last))
                .collect();
            if !bounds.is_empty() {
                result.ranges.extend(self.unused_in(&bounds, family).ranges);
            }
        }
        result.condense();
        result
    }

    fn unused_in(&self, universe: &[(u128, u128)], family: Family) -> AddressSet {
        let used: Vec<&AddressRange> = self.ranges.iter().filter(|r| r.family == family).collect();
        let unused = || BTreeSet::from([RangePurpose::Unused]);
        let mut free = Vec::new();

        for &(ustart, uend) in universe {
            let mut cursor = ustart;
            let mut covered_to_end = false;
            for r in used.iter().filter(|r| r.last >= ustart && r.first <= uend) {
                if r.first > cursor {
                    free.push(AddressRange::from_bounds(cursor, r.first - 1, family, unused()));
                }
                if r.last >= uend {
                    covered_to_end = true;
                    break;
                }
                cursor = cursor.max(r.last + 1);
            }
            if !covered_to_end && cursor <= uend {
                free.push(AddressRange::from_bounds(cursor, uend, family, unused()));
            }
        }
        AddressSet::from_ranges(free)
    }

    /// The same addresses with every range tagged `purpose` alone.
    pub fn retagged(&self, purpose: RangePurpose) -> AddressSet {
        AddressSet::from_ranges(self.ranges.iter().map(|r| {
            AddressRange::from_bounds(r.first, r.last, r.family, BTreeSet::from([purpose]))
        }))
    }

    /// This set plus the unused remainder of `net`, covering the whole
    /// usable host range.
    pub fn full_range(&self, net: &IpNet) -> AddressSet {
        let unused = self.unused_for_network(net);
        let mut full = self.clone();
        full.union(unused);
        full
    }
}

impl<'a> IntoIterator for &'a AddressSet {
    type Item = &'a AddressRange;
    type IntoIter = std::slice::Iter<'a, AddressRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn range(start: &str, end: &str, purpose: RangePurpose) -> AddressRange {
        AddressRange::new(ip(start), ip(end), purpose).unwrap()
    }

    fn bounds(set: &AddressSet) -> Vec<String> {
        set.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn test_range_validation() {
        assert!(AddressRange::new(ip("10.0.0.5"), ip("10.0.0.1"), RangePurpose::Reserved).is_err());
        assert!(AddressRange::new(ip("10.0.0.1"), ip("::1"), RangePurpose::Reserved).is_err());
        let r = range("10.0.0.1", "10.0.0.10", RangePurpose::Reserved);
        assert_eq!(r.num_addresses(), 10);
        assert!(r.contains(&ip("10.0.0.10")));
        assert!(!r.contains(&ip("10.0.0.11")));
        assert!(!r.contains(&ip("::a")));
    }

    #[test]
    fn test_overlapping_ranges_merge_purposes() {
        let set = AddressSet::from_ranges([
            range("10.0.0.1", "10.0.0.10", RangePurpose::Reserved),
            range("10.0.0.5", "10.0.0.20", RangePurpose::Dynamic),
            AddressRange::single(ip("10.0.0.30"), RangePurpose::GatewayIp),
        ]);
        assert_eq!(bounds(&set), vec!["10.0.0.1-10.0.0.20", "10.0.0.30"]);
        assert!(set.ranges()[0].has_purpose(RangePurpose::Reserved));
        assert!(set.ranges()[0].has_purpose(RangePurpose::Dynamic));
    }

    #[test]
    fn test_adjacent_ranges_coalesce_only_with_same_purpose() {
        let set = AddressSet::from_ranges([
            AddressRange::single(ip("10.0.0.1"), RangePurpose::AssignedIp),
            AddressRange::single(ip("10.0.0.2"), RangePurpose::AssignedIp),
            AddressRange::single(ip("10.0.0.3"), RangePurpose::GatewayIp),
        ]);
        assert_eq!(bounds(&set), vec!["10.0.0.1-10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn test_unused_for_ipv4_network() {
        let net: IpNet = "10.0.0.0/24".parse().unwrap();
        let used = AddressSet::from_ranges([range("10.0.0.2", "10.0.0.100", RangePurpose::Dynamic)]);
        let unused = used.unused_for_network(&net);
        assert_eq!(bounds(&unused), vec!["10.0.0.1", "10.0.0.101-10.0.0.254"]);
        assert_eq!(unused.total_addresses(), 155);
        assert!(unused.iter().all(|r| r.has_purpose(RangePurpose::Unused)));
    }

    #[test]
    fn test_point_to_point_and_host_networks() {
        let empty = AddressSet::new();
        let p2p: IpNet = "10.0.0.0/31".parse().unwrap();
        assert_eq!(bounds(&empty.unused_for_network(&p2p)), vec!["10.0.0.0-10.0.0.1"]);

        let host: IpNet = "10.0.0.7/32".parse().unwrap();
        assert_eq!(empty.unused_for_network(&host).total_addresses(), 1);

        let used = AddressSet::from_ranges([AddressRange::single(ip("10.0.0.7"), RangePurpose::AssignedIp)]);
        assert!(used.unused_for_network(&host).is_empty());

        let v6_host: IpNet = "2001:db8::1/128".parse().unwrap();
        assert_eq!(bounds(&empty.unused_for_network(&v6_host)), vec!["2001:db8::1"]);

        let v6_p2p: IpNet = "2001:db8::/127".parse().unwrap();
        assert_eq!(empty.unused_for_network(&v6_p2p).total_addresses(), 2);
    }

    #[test]
    fn test_ipv6_network_excludes_only_anycast() {
        let net: IpNet = "2001:db8::/126".parse().unwrap();
        let unused = AddressSet::new().unused_for_network(&net);
        assert_eq!(bounds(&unused), vec!["2001:db8::1-2001:db8::3"]);
    }

    #[test]
    fn test_whole_ipv6_space_does_not_overflow() {
        let net: IpNet = "::/0".parse().unwrap();
        let unused = AddressSet::new().unused_for_network(&net);
        assert_eq!(unused.total_addresses(), u128::MAX);
    }

    #[test]
    fn test_unused_within_ranges() {
        let used = AddressSet::from_ranges([AddressRange::single(ip("10.0.0.12"), RangePurpose::AssignedIp)]);
        let reserved = [
            range("10.0.0.10", "10.0.0.14", RangePurpose::Reserved),
            range("10.0.0.40", "10.0.0.41", RangePurpose::Reserved),
        ];
        let unused = used.unused_within(&reserved);
        assert_eq!(
            bounds(&unused),
            vec!["10.0.0.10-10.0.0.11", "10.0.0.13-10.0.0.14", "10.0.0.40-10.0.0.41"]
        );
    }

    #[test]
    fn test_smallest_and_largest_blocks() {
        let net: IpNet = "10.0.0.0/29".parse().unwrap();
        let used = AddressSet::from_ranges([AddressRange::single(ip("10.0.0.4"), RangePurpose::AssignedIp)]);
        let unused = used.unused_for_network(&net);
        assert_eq!(unused.smallest_unused_block().unwrap().to_string(), "10.0.0.5-10.0.0.6");
        assert_eq!(unused.largest_unused_block().unwrap().to_string(), "10.0.0.1-10.0.0.3");
        assert_eq!(unused.first_unused(), Some(ip("10.0.0.1")));
    }

    #[test]
    fn test_smallest_block_tie_breaks_on_lowest_start() {
        let net: IpNet = "10.0.0.0/29".parse().unwrap();
        let used = AddressSet::from_ranges([range("10.0.0.3", "10.0.0.4", RangePurpose::Reserved)]);
        let unused = used.unused_for_network(&net);
        assert_eq!(unused.smallest_unused_block().unwrap().to_string(), "10.0.0.1-10.0.0.2");
    }

    #[test]
    fn test_remove_address_splits_range() {
        let mut set = AddressSet::from_ranges([range("10.0.0.1", "10.0.0.5", RangePurpose::Unused)]);
        set.remove_address(&ip("10.0.0.3"));
        assert_eq!(bounds(&set), vec!["10.0.0.1-10.0.0.2", "10.0.0.4-10.0.0.5"]);
        set.remove_address(&ip("10.0.0.1"));
        set.remove_address(&ip("10.0.0.5"));
        assert_eq!(bounds(&set), vec!["10.0.0.2", "10.0.0.4"]);
        set.remove_address(&ip("10.0.0.99"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_full_range_and_purpose_lookup() {
        let net: IpNet = "10.0.0.0/29".parse().unwrap();
        let used = AddressSet::from_ranges([AddressRange::single(ip("10.0.0.1"), RangePurpose::GatewayIp)]);
        let full = used.full_range(&net);
        assert_eq!(full.total_addresses(), 6);
        assert!(full.ip_has_purpose(&ip("10.0.0.1"), RangePurpose::GatewayIp).unwrap());
        assert!(full.is_unused(&ip("10.0.0.2")).unwrap());
        assert!(full.is_unused(&ip("10.0.0.7")).is_err());
        assert!(full.includes_purpose(RangePurpose::GatewayIp));
    }

    #[test]
    fn test_serializes_counts_as_strings() {
        let r = range("10.0.0.1", "10.0.0.4", RangePurpose::Dynamic);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["start"], "10.0.0.1");
        assert_eq!(json["num_addresses"], "4");
        assert_eq!(json["purpose"][0], "dynamic");
    }
}
