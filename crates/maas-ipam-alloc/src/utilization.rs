//! Derived address sets of a subnet: what is in use, what is free, and
//! where new ranges may be placed.

use ipnet::IpNet;
use maas_ipam_core::db::SubnetSnapshot;
use maas_ipam_core::error::{Error, Result};
use maas_ipam_core::ipset::{
    ip_to_u128, u128_to_ip, usable_bounds, AddressRange, AddressSet, RangePurpose,
};
use maas_ipam_core::types::{AllocType, Family, IpRangeType, Subnet};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Knobs shared by the in-use and free queries.
#[derive(Debug, Clone, Default)]
pub struct InUseOptions {
    /// Skip DISCOVERED rows when collecting allocated addresses.
    pub ignore_discovered: bool,
    /// Extra addresses to treat as taken.
    pub exclude_addresses: Vec<IpAddr>,
    /// Treat addresses seen by neighbour discovery as taken.
    pub include_neighbours: bool,
}

/// Automatic IPv6 reservations. A /64 keeps `::1` to `::ffff:ffff` for
/// administrator use, and every prefix shorter than /127 loses its
/// subnet-router anycast address (RFC 4291 2.6.1).
fn ipv6_reservations(cidr: &IpNet) -> Vec<AddressRange> {
    let mut ranges = Vec::new();
    if let IpNet::V6(net) = cidr {
        let network = net.network();
        let first = ip_to_u128(IpAddr::V6(network));
        if net.prefix_len() == 64 {
            ranges.extend(
                AddressRange::new(
                    u128_to_ip(first + 1, Family::V6),
                    u128_to_ip(first + 0xffff_ffff, Family::V6),
                    RangePurpose::Reserved,
                )
                .ok(),
            );
        }
        if net.prefix_len() < 127 {
            ranges.push(AddressRange::single(IpAddr::V6(network), RangePurpose::Rfc4291));
        }
    }
    ranges
}

/// Accumulates in-use ranges of one subnet, one source at a time.
struct InUseQuery<'a> {
    snapshot: &'a SubnetSnapshot,
    ranges: Vec<AddressRange>,
}

impl<'a> InUseQuery<'a> {
    fn new(snapshot: &'a SubnetSnapshot) -> Self {
        Self {
            ranges: ipv6_reservations(&snapshot.subnet.cidr),
            snapshot,
        }
    }

    fn subnet(&self) -> &Subnet {
        &self.snapshot.subnet
    }

    /// Gateway and the DNS servers that sit inside the cidr.
    fn with_subnet_ips(mut self) -> Self {
        let subnet = &self.snapshot.subnet;
        for dns in subnet.dns_servers.iter().filter(|ip| subnet.contains(ip)) {
            self.ranges.push(AddressRange::single(*dns, RangePurpose::DnsServer));
        }
        if let Some(gateway) = subnet.gateway_ip {
            self.ranges
                .push(AddressRange::single(gateway, RangePurpose::GatewayIp));
        }
        self
    }

    fn with_ipranges(mut self, range_type: IpRangeType, exclude_id: Option<u64>) -> Self {
        let purpose = match range_type {
            IpRangeType::Dynamic => RangePurpose::Dynamic,
            IpRangeType::Reserved => RangePurpose::Reserved,
        };
        for range in self
            .snapshot
            .ranges
            .iter()
            .filter(|r| r.range_type == range_type && Some(r.id) != exclude_id)
        {
            self.ranges
                .extend(AddressRange::new(range.start_ip, range.end_ip, purpose).ok());
        }
        self
    }

    fn with_reserved_ipranges(self, exclude_id: Option<u64>) -> Self {
        self.with_ipranges(IpRangeType::Reserved, exclude_id)
    }

    fn with_dynamic_ipranges(self, exclude_id: Option<u64>) -> Self {
        self.with_ipranges(IpRangeType::Dynamic, exclude_id)
    }

    fn with_staticroute_gateway_ip(mut self) -> Self {
        let gateways: Vec<IpAddr> = self
            .snapshot
            .static_routes
            .iter()
            .map(|r| r.gateway_ip)
            .filter(|ip| self.subnet().contains(ip))
            .collect();
        for gateway in gateways {
            self.ranges
                .push(AddressRange::single(gateway, RangePurpose::GatewayIp));
        }
        self
    }

    fn with_allocated_ips(mut self, include_discovered: bool) -> Self {
        let addresses: Vec<IpAddr> = self
            .snapshot
            .static_ips
            .iter()
            .filter(|s| include_discovered || s.alloc_type != AllocType::Discovered)
            .filter_map(|s| s.ip)
            .filter(|ip| self.subnet().contains(ip))
            .collect();
        for ip in addresses {
            self.ranges
                .push(AddressRange::single(ip, RangePurpose::AssignedIp));
        }
        self
    }

    fn with_neighbours(mut self) -> Self {
        let addresses: Vec<IpAddr> = self
            .snapshot
            .neighbours
            .iter()
            .map(|n| n.ip)
            .filter(|ip| self.subnet().contains(ip))
            .collect();
        for ip in addresses {
            self.ranges
                .push(AddressRange::single(ip, RangePurpose::Neighbour));
        }
        self
    }

    fn with_excluded(mut self, addresses: &[IpAddr]) -> Self {
        let snapshot = self.snapshot;
        for ip in addresses.iter().filter(|ip| snapshot.subnet.contains(ip)) {
            self.ranges
                .push(AddressRange::single(*ip, RangePurpose::Excluded));
        }
        self
    }

    fn build(self) -> AddressSet {
        AddressSet::from_ranges(self.ranges)
    }
}

/// Usage summary of one subnet
#[derive(Debug, Clone, Serialize)]
pub struct SubnetStatistics {
    pub total_addresses: u128,
    pub num_available: u128,
    pub num_unavailable: u128,
    pub largest_available: u128,
    /// Fraction of the usable host range that is unavailable, 0.0 to 1.0
    pub usage: f64,
    pub usage_string: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ranges: Option<AddressSet>,
}

/// Address-set queries over a consistent snapshot of one subnet.
///
/// Managed subnets treat the whole usable host range as allocatable minus
/// what is in use. Unmanaged subnets only hand out addresses inside their
/// RESERVED ranges.
pub struct SubnetUtilization<'a> {
    snapshot: &'a SubnetSnapshot,
}

impl<'a> SubnetUtilization<'a> {
    pub fn new(snapshot: &'a SubnetSnapshot) -> Self {
        Self { snapshot }
    }

    pub fn subnet(&self) -> &Subnet {
        &self.snapshot.subnet
    }

    fn cidr(&self) -> &IpNet {
        &self.snapshot.subnet.cidr
    }

    fn query(&self) -> InUseQuery<'a> {
        InUseQuery::new(self.snapshot)
    }

    fn reserved_ranges(&self, exclude_id: Option<u64>) -> Vec<AddressRange> {
        InUseQuery {
            snapshot: self.snapshot,
            ranges: Vec::new(),
        }
        .with_reserved_ipranges(exclude_id)
        .ranges
    }

    fn in_use(&self, opts: &InUseOptions, include_reserved: bool) -> AddressSet {
        let mut query = self
            .query()
            .with_subnet_ips()
            .with_allocated_ips(!opts.ignore_discovered)
            .with_staticroute_gateway_ip()
            .with_dynamic_ipranges(None)
            .with_excluded(&opts.exclude_addresses);
        if include_reserved {
            query = query.with_reserved_ipranges(None);
        }
        if opts.include_neighbours {
            query = query.with_neighbours();
        }
        query.build()
    }

    /// Addresses taken on this subnet, every DYNAMIC and RESERVED range
    /// included.
    pub fn ranges_in_use(&self, opts: &InUseOptions) -> AddressSet {
        self.in_use(opts, true)
    }

    pub fn ranges_not_in_use(&self, opts: &InUseOptions) -> AddressSet {
        if self.subnet().managed {
            self.in_use(opts, true).unused_for_network(self.cidr())
        } else {
            self.in_use(opts, false)
                .unused_within(&self.reserved_ranges(None))
        }
    }

    /// Free space as counted by the exhaustion monitor.
    pub fn free_ranges(&self) -> AddressSet {
        self.ranges_not_in_use(&InUseOptions::default())
    }

    /// Used ranges plus the unused remainder of the usable host range.
    /// On unmanaged subnets only space inside RESERVED ranges is `Unused`;
    /// the rest of the host range is tagged `Unmanaged`.
    pub fn utilization(&self) -> AddressSet {
        let opts = InUseOptions::default();
        if self.subnet().managed {
            return self.in_use(&opts, true).full_range(self.cidr());
        }

        let mut full = self.in_use(&opts, false);
        full.union(self.ranges_not_in_use(&opts));
        let outside = full
            .unused_for_network(self.cidr())
            .retagged(RangePurpose::Unmanaged);
        full.union(outside);
        full
    }

    fn in_use_for_reserved_range(&self, exclude_id: Option<u64>) -> AddressSet {
        let query = self.query().with_reserved_ipranges(exclude_id);
        if self.subnet().managed {
            query.with_dynamic_ipranges(exclude_id).build()
        } else {
            query.build()
        }
    }

    fn in_use_for_dynamic_range(&self, exclude_id: Option<u64>) -> AddressSet {
        let query = self
            .query()
            .with_subnet_ips()
            .with_allocated_ips(false)
            .with_staticroute_gateway_ip()
            .with_dynamic_ipranges(exclude_id);
        if self.subnet().managed {
            query.with_reserved_ipranges(exclude_id).build()
        } else {
            query.build()
        }
    }

    /// Where a RESERVED range may be placed. `exclude_id` names a range
    /// being updated, which does not conflict with itself.
    pub fn available_for_reserved_range(&self, exclude_id: Option<u64>) -> AddressSet {
        self.in_use_for_reserved_range(exclude_id)
            .unused_for_network(self.cidr())
    }

    /// Where a DYNAMIC range may be placed.
    pub fn available_for_dynamic_range(&self, exclude_id: Option<u64>) -> AddressSet {
        let used = self.in_use_for_dynamic_range(exclude_id);
        if self.subnet().managed {
            used.unused_for_network(self.cidr())
        } else {
            used.unused_within(&self.reserved_ranges(exclude_id))
        }
    }

    /// Check that `start..=end` can become a range of `range_type`.
    pub fn validate_range(
        &self,
        start: IpAddr,
        end: IpAddr,
        range_type: IpRangeType,
        exclude_id: Option<u64>,
    ) -> Result<()> {
        let subnet = self.subnet();
        if Family::of(&start) != subnet.family() || Family::of(&end) != subnet.family() {
            return Err(Error::InvalidRange(format!(
                "range {start}-{end} does not match the address family of subnet {}",
                subnet.cidr
            )));
        }
        let candidate = AddressRange::new(start, end, RangePurpose::Unused)?;

        let (first, last) = usable_bounds(&subnet.cidr);
        if candidate.first() < first || candidate.last() > last {
            return Err(Error::InvalidRange(format!(
                "range {start}-{end} is not within the usable addresses of subnet {}",
                subnet.cidr
            )));
        }

        let (available, used) = match range_type {
            IpRangeType::Reserved => (
                self.available_for_reserved_range(exclude_id),
                self.in_use_for_reserved_range(exclude_id),
            ),
            IpRangeType::Dynamic => (
                self.available_for_dynamic_range(exclude_id),
                self.in_use_for_dynamic_range(exclude_id),
            ),
        };
        if available.iter().any(|r| r.contains_range(&candidate)) {
            return Ok(());
        }

        let conflicts: BTreeSet<RangePurpose> = used
            .iter()
            .filter(|r| r.overlaps(&candidate))
            .flat_map(|r| r.purposes().iter().copied())
            .collect();
        if conflicts.is_empty() {
            return Err(Error::RangeOverlap(format!(
                "requested {range_type} range {start}-{end} must lie within a reserved range \
                 of unmanaged subnet {}",
                subnet.cidr
            )));
        }
        let purposes: Vec<String> = conflicts.iter().map(ToString::to_string).collect();
        Err(Error::RangeOverlap(format!(
            "requested {range_type} range {start}-{end} conflicts with existing {} on subnet {}",
            purposes.join(", "),
            subnet.cidr
        )))
    }

    pub fn statistics(&self, include_ranges: bool) -> SubnetStatistics {
        let full = self.utilization();
        let free = self.free_ranges();

        let total_addresses = AddressSet::new()
            .unused_for_network(self.cidr())
            .total_addresses();
        let num_available = free.total_addresses();
        let num_unavailable = total_addresses.saturating_sub(num_available);
        let largest_available = free
            .largest_unused_block()
            .map(AddressRange::num_addresses)
            .unwrap_or(0);
        let usage = if total_addresses == 0 {
            0.0
        } else {
            num_unavailable as f64 / total_addresses as f64
        };

        SubnetStatistics {
            total_addresses,
            num_available,
            num_unavailable,
            largest_available,
            usage,
            usage_string: format!("{:.0}%", usage * 100.0),
            ranges: include_ranges.then_some(full),
        }
    }
}
