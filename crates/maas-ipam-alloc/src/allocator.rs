use crate::locks::AllocationLocks;
use crate::utilization::{InUseOptions, SubnetUtilization};
use chrono::Utc;
use maas_ipam_core::db::{Db, SubnetSnapshot};
use maas_ipam_core::error::{Error, Result};
use maas_ipam_core::ipset::AddressSet;
use maas_ipam_core::types::{AllocType, Family, IpRangeType, StaticIpAddress};
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Parameters of one `allocate_new` call
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub alloc_type: AllocType,
    pub user: Option<String>,
    pub requested_address: Option<IpAddr>,
    pub exclude_addresses: Vec<IpAddr>,
    /// Reject a requested address inside a DYNAMIC range
    pub restrict_to_unreserved_ranges: bool,
    /// Ignored when `requested_address` is set
    pub count: u32,
}

impl Default for AllocationRequest {
    fn default() -> Self {
        Self {
            alloc_type: AllocType::Auto,
            user: None,
            requested_address: None,
            exclude_addresses: Vec::new(),
            restrict_to_unreserved_ranges: true,
            count: 1,
        }
    }
}

impl AllocationRequest {
    pub fn new(alloc_type: AllocType) -> Self {
        Self {
            alloc_type,
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn with_requested_address(mut self, ip: IpAddr) -> Self {
        self.requested_address = Some(ip);
        self
    }

    pub fn with_excluded(mut self, addresses: Vec<IpAddr>) -> Self {
        self.exclude_addresses = addresses;
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn unrestricted(mut self) -> Self {
        self.restrict_to_unreserved_ranges = false;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.alloc_type.is_allocatable() {
            return Err(Error::InvalidAllocationType(format!(
                "{} addresses cannot be allocated directly",
                self.alloc_type
            )));
        }
        if self.alloc_type == AllocType::UserReserved && self.user.is_none() {
            return Err(Error::InvalidAllocationType(
                "USER_RESERVED allocations require a user".to_string(),
            ));
        }
        if self.count == 0 {
            return Err(Error::InvalidAllocationType(
                "allocation count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pick addresses for `req` from a subnet snapshot. Pure: the caller
/// inserts the result and handles races.
pub fn select_addresses(snapshot: &SubnetSnapshot, req: &AllocationRequest) -> Result<Vec<IpAddr>> {
    let subnet = &snapshot.subnet;

    if let Some(ip) = req.requested_address {
        if !subnet.contains(&ip) {
            return Err(Error::AddressOutOfRange {
                address: ip,
                cidr: subnet.cidr.to_string(),
            });
        }
        if !subnet.is_usable_host(&ip) {
            return Err(Error::AddressUnavailable(format!(
                "requested address {ip} is not a usable host address of {}",
                subnet.cidr
            )));
        }
        if req.restrict_to_unreserved_ranges {
            if let Some(dynamic) = snapshot
                .ranges
                .iter()
                .find(|r| r.range_type == IpRangeType::Dynamic && r.contains(&ip))
            {
                return Err(Error::AddressUnavailable(format!(
                    "requested address {ip} is inside dynamic range {}-{}",
                    dynamic.start_ip, dynamic.end_ip
                )));
            }
        }
        return Ok(vec![ip]);
    }

    let util = SubnetUtilization::new(snapshot);
    let mut free = util.ranges_not_in_use(&InUseOptions {
        exclude_addresses: req.exclude_addresses.clone(),
        include_neighbours: true,
        ..Default::default()
    });
    let mut fallback: Option<AddressSet> = None;

    let mut picked = Vec::with_capacity(req.count as usize);
    while picked.len() < req.count as usize {
        if let Some(block) = free.smallest_unused_block() {
            let ip = block.start();
            free.remove_address(&ip);
            picked.push(ip);
            continue;
        }

        // Nothing unobserved left; reuse the stalest neighbour address
        let candidates = fallback.get_or_insert_with(|| {
            util.ranges_not_in_use(&InUseOptions {
                exclude_addresses: req.exclude_addresses.clone(),
                ..Default::default()
            })
        });
        let stalest = snapshot
            .neighbours
            .iter()
            .filter(|n| candidates.contains(&n.ip) && !picked.contains(&n.ip))
            .min_by(|a, b| a.last_seen.cmp(&b.last_seen).then(a.ip.cmp(&b.ip)));
        match stalest {
            Some(neighbour) => {
                warn!(
                    subnet = %subnet.cidr,
                    ip = %neighbour.ip,
                    last_seen = %neighbour.last_seen,
                    mac = neighbour.mac_address.as_deref().unwrap_or("unknown"),
                    "allocating address previously observed on the network"
                );
                candidates.remove_address(&neighbour.ip);
                picked.push(neighbour.ip);
            }
            None => {
                return Err(Error::AddressExhaustion {
                    cidr: subnet.cidr.to_string(),
                })
            }
        }
    }
    Ok(picked)
}

/// Runs selection and insert under the allocation locks, retrying when
/// another writer claims a chosen address first.
pub struct AddressAllocator<'a> {
    db: &'a Db,
    locks: &'a AllocationLocks,
    max_attempts: u32,
}

impl<'a> AddressAllocator<'a> {
    pub fn new(db: &'a Db, locks: &'a AllocationLocks, max_attempts: u32) -> Self {
        Self {
            db,
            locks,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn allocate_new(
        &self,
        subnet_id: u64,
        req: &AllocationRequest,
    ) -> Result<Vec<StaticIpAddress>> {
        req.validate()?;
        let family = self.db.require_subnet(subnet_id)?.family();

        self.with_retries(subnet_id, family, |raced| {
            if raced.is_empty() {
                return self.attempt(subnet_id, req);
            }
            let mut retry = req.clone();
            retry.exclude_addresses.extend_from_slice(raced);
            self.attempt(subnet_id, &retry)
        })
    }

    /// Run `attempt` until it stops reporting a claim race. The first try
    /// holds only the subnet lock; later tries also hold the family lock
    /// and receive every address lost to a race so far.
    fn with_retries<F>(&self, subnet_id: u64, family: Family, mut attempt: F) -> Result<Vec<StaticIpAddress>>
    where
        F: FnMut(&[IpAddr]) -> Result<Vec<StaticIpAddress>>,
    {
        let mut raced: Vec<IpAddr> = Vec::new();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = if attempts == 1 {
                self.locks
                    .with_subnet_lock(subnet_id, || attempt(&raced))
            } else {
                self.locks.with_family_lock(family, || {
                    self.locks
                        .with_subnet_lock(subnet_id, || attempt(&raced))
                })
            };

            match result {
                Err(Error::RetryableConflict { address }) => {
                    if attempts >= self.max_attempts {
                        warn!(subnet_id, attempts, "giving up allocation after repeated conflicts");
                        return Err(Error::AllocationConflict { attempts });
                    }
                    debug!(subnet_id, attempts, address = %address, "allocation conflict, retrying");
                    raced.push(address);
                }
                other => return other,
            }
        }
    }

    fn attempt(&self, subnet_id: u64, req: &AllocationRequest) -> Result<Vec<StaticIpAddress>> {
        if let Some(ip) = req.requested_address {
            if let Some(owner) = self.db.static_claim_owner(&ip)? {
                return Err(Error::AddressUnavailable(format!(
                    "requested address {ip} is already in use by static IP {owner}"
                )));
            }
        }

        let snapshot = self.db.subnet_snapshot(subnet_id)?;
        self.claim(&snapshot, req)
    }

    /// Select from `snapshot` and insert the rows in one transaction. A
    /// store-level claim collision comes back as `RetryableConflict`.
    fn claim(&self, snapshot: &SubnetSnapshot, req: &AllocationRequest) -> Result<Vec<StaticIpAddress>> {
        let subnet_id = snapshot.subnet.id;
        let addresses = select_addresses(snapshot, req)?;

        let now = Utc::now();
        let rows = addresses
            .iter()
            .map(|ip| StaticIpAddress {
                id: 0,
                ip: Some(*ip),
                alloc_type: req.alloc_type,
                subnet_id: Some(subnet_id),
                user: req.user.clone(),
                temp_expires_on: None,
                created_at: now,
                updated_at: now,
            })
            .collect();

        let inserted = self.db.insert_static_ips(rows).map_err(|e| match e {
            Error::UniqueViolation { address, .. } => Error::RetryableConflict { address },
            other => other,
        })?;

        info!(
            subnet = %snapshot.subnet.cidr,
            alloc_type = %req.alloc_type,
            count = inserted.len(),
            first = ?inserted.first().and_then(|s| s.ip),
            "allocated static IP addresses"
        );
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use maas_ipam_core::types::{IpRange, Neighbour, RdnsMode, Subnet};
    use tempfile::TempDir;

    fn snapshot(cidr: &str) -> SubnetSnapshot {
        SubnetSnapshot {
            subnet: Subnet {
                id: 1,
                name: cidr.to_string(),
                cidr: cidr.parse().unwrap(),
                gateway_ip: None,
                dns_servers: vec![],
                managed: true,
                allow_dns: true,
                allow_proxy: true,
                rdns_mode: RdnsMode::Default,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
            ranges: vec![],
            static_ips: vec![],
            static_routes: vec![],
            neighbours: vec![],
        }
    }

    fn dynamic(start: &str, end: &str) -> IpRange {
        IpRange {
            id: 1,
            subnet_id: 1,
            start_ip: start.parse().unwrap(),
            end_ip: end.parse().unwrap(),
            range_type: IpRangeType::Dynamic,
            user: None,
            comment: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn used(ip: &str) -> StaticIpAddress {
        StaticIpAddress {
            id: 1,
            ip: Some(ip.parse().unwrap()),
            alloc_type: AllocType::Auto,
            subnet_id: Some(1),
            user: None,
            temp_expires_on: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn neighbour(ip: &str, hours_ago: i64) -> Neighbour {
        let seen = Utc::now() - Duration::hours(hours_ago);
        Neighbour {
            ip: ip.parse().unwrap(),
            mac_address: None,
            subnet_id: Some(1),
            first_seen: seen,
            last_seen: seen,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_request_validation() {
        assert!(matches!(
            AllocationRequest::new(AllocType::Dhcp).validate(),
            Err(Error::InvalidAllocationType(_))
        ));
        assert!(matches!(
            AllocationRequest::new(AllocType::Discovered).validate(),
            Err(Error::InvalidAllocationType(_))
        ));
        assert!(matches!(
            AllocationRequest::new(AllocType::UserReserved).validate(),
            Err(Error::InvalidAllocationType(_))
        ));
        AllocationRequest::new(AllocType::UserReserved)
            .with_user("admin")
            .validate()
            .unwrap();
    }

    #[test]
    fn test_lowest_address_first() {
        let snap = snapshot("10.0.0.0/24");
        let picked = select_addresses(&snap, &AllocationRequest::default()).unwrap();
        assert_eq!(picked, vec![ip("10.0.0.1")]);
    }

    #[test]
    fn test_smallest_block_packing() {
        let mut snap = snapshot("10.0.0.0/29");
        snap.static_ips.push(used("10.0.0.4"));
        let picked = select_addresses(&snap, &AllocationRequest::default()).unwrap();
        assert_eq!(picked, vec![ip("10.0.0.5")]);
    }

    #[test]
    fn test_equal_blocks_pick_lowest() {
        let mut snap = snapshot("10.0.0.0/29");
        snap.static_ips.push(used("10.0.0.3"));
        snap.static_ips.push(used("10.0.0.6"));
        // .1-.2 and .4-.5 are both two addresses long
        let picked = select_addresses(&snap, &AllocationRequest::default()).unwrap();
        assert_eq!(picked, vec![ip("10.0.0.1")]);
    }

    #[test]
    fn test_dynamic_range_avoided() {
        let mut snap = snapshot("10.0.0.0/24");
        snap.ranges.push(dynamic("10.0.0.2", "10.0.0.100"));
        assert_eq!(
            select_addresses(&snap, &AllocationRequest::default()).unwrap(),
            vec![ip("10.0.0.1")]
        );
        snap.static_ips.push(used("10.0.0.1"));
        assert_eq!(
            select_addresses(&snap, &AllocationRequest::default()).unwrap(),
            vec![ip("10.0.0.101")]
        );
    }

    #[test]
    fn test_requested_address_checks() {
        let mut snap = snapshot("10.0.0.0/24");
        snap.ranges.push(dynamic("10.0.0.2", "10.0.0.100"));

        let err = select_addresses(
            &snap,
            &AllocationRequest::default().with_requested_address(ip("10.0.0.50")),
        )
        .unwrap_err();
        match err {
            Error::AddressUnavailable(msg) => assert!(msg.contains("10.0.0.2-10.0.0.100"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }

        let picked = select_addresses(
            &snap,
            &AllocationRequest::default()
                .with_requested_address(ip("10.0.0.50"))
                .unrestricted(),
        )
        .unwrap();
        assert_eq!(picked, vec![ip("10.0.0.50")]);

        assert!(matches!(
            select_addresses(
                &snap,
                &AllocationRequest::default().with_requested_address(ip("192.168.1.1"))
            ),
            Err(Error::AddressOutOfRange { .. })
        ));
    }

    #[test]
    fn test_excluded_addresses_skipped() {
        let snap = snapshot("10.0.0.0/24");
        let picked = select_addresses(
            &snap,
            &AllocationRequest::default().with_excluded(vec![ip("10.0.0.1"), ip("10.0.0.2")]),
        )
        .unwrap();
        assert_eq!(picked, vec![ip("10.0.0.3")]);
    }

    #[test]
    fn test_count_picks_distinct_addresses() {
        let snap = snapshot("10.0.0.0/24");
        let picked = select_addresses(&snap, &AllocationRequest::default().with_count(3)).unwrap();
        assert_eq!(picked, vec![ip("10.0.0.1"), ip("10.0.0.2"), ip("10.0.0.3")]);
    }

    #[test]
    fn test_count_beyond_free_space() {
        let snap = snapshot("10.0.0.0/30");
        assert!(matches!(
            select_addresses(&snap, &AllocationRequest::default().with_count(3)),
            Err(Error::AddressExhaustion { .. })
        ));
    }

    #[test]
    fn test_neighbours_avoided_then_reused_oldest_first() {
        let mut snap = snapshot("10.0.0.0/30");
        snap.neighbours.push(neighbour("10.0.0.1", 1));
        assert_eq!(
            select_addresses(&snap, &AllocationRequest::default()).unwrap(),
            vec![ip("10.0.0.2")]
        );

        snap.neighbours.push(neighbour("10.0.0.2", 5));
        assert_eq!(
            select_addresses(&snap, &AllocationRequest::default()).unwrap(),
            vec![ip("10.0.0.2")]
        );
        assert_eq!(
            select_addresses(&snap, &AllocationRequest::default().with_count(2)).unwrap(),
            vec![ip("10.0.0.2"), ip("10.0.0.1")]
        );
    }

    #[test]
    fn test_unmanaged_without_reserved_is_exhausted() {
        let mut snap = snapshot("10.0.0.0/24");
        snap.subnet.managed = false;
        assert!(matches!(
            select_addresses(&snap, &AllocationRequest::default()),
            Err(Error::AddressExhaustion { .. })
        ));
    }

    #[test]
    fn test_allocator_inserts_rows() {
        let dir = TempDir::new().unwrap();
        let db = Db::open(&dir.path().join("test.redb")).unwrap();
        let subnet = db.create_subnet(snapshot("10.0.0.0/24").subnet).unwrap();
        let locks = AllocationLocks::new();
        let allocator = AddressAllocator::new(&db, &locks, 5);

        let rows = allocator
            .allocate_new(subnet.id, &AllocationRequest::new(AllocType::Sticky).with_count(2))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.alloc_type == AllocType::Sticky));
        assert_eq!(db.list_static_ips(subnet.id).unwrap().len(), 2);

        let err = allocator
            .allocate_new(
                subnet.id,
                &AllocationRequest::default().with_requested_address(ip("10.0.0.1")),
            )
            .unwrap_err();
        assert!(matches!(err, Error::AddressUnavailable(_)));

        assert!(matches!(
            allocator.allocate_new(99, &AllocationRequest::default()),
            Err(Error::SubnetNotFound(99))
        ));
    }

    #[test]
    fn test_requested_network_and_broadcast_rejected() {
        let snap = snapshot("10.0.0.0/24");
        for addr in ["10.0.0.0", "10.0.0.255"] {
            let err = select_addresses(
                &snap,
                &AllocationRequest::default().with_requested_address(ip(addr)),
            )
            .unwrap_err();
            assert!(matches!(err, Error::AddressUnavailable(_)), "{addr}: {err}");
        }

        let p2p = snapshot("10.0.0.0/31");
        assert_eq!(
            select_addresses(
                &p2p,
                &AllocationRequest::default().with_requested_address(ip("10.0.0.0"))
            )
            .unwrap(),
            vec![ip("10.0.0.0")]
        );
    }

    fn open_store() -> (Db, TempDir, Subnet) {
        let dir = TempDir::new().unwrap();
        let db = Db::open(&dir.path().join("test.redb")).unwrap();
        let subnet = db.create_subnet(snapshot("10.0.0.0/24").subnet).unwrap();
        (db, dir, subnet)
    }

    #[test]
    fn test_orphaned_claim_is_skipped() {
        let (db, _dir, subnet) = open_store();
        let mut orphan = used("10.0.0.1");
        orphan.subnet_id = None;
        db.create_static_ip(orphan).unwrap();

        let locks = AllocationLocks::new();
        let rows = AddressAllocator::new(&db, &locks, 5)
            .allocate_new(subnet.id, &AllocationRequest::default())
            .unwrap();
        assert_eq!(rows[0].ip, Some(ip("10.0.0.2")));
    }

    #[test]
    fn test_lost_race_retried_without_raced_address() {
        let (db, _dir, subnet) = open_store();
        let locks = AllocationLocks::new();
        let allocator = AddressAllocator::new(&db, &locks, 5);

        // Read before a concurrent writer claims .1
        let stale = db.subnet_snapshot(subnet.id).unwrap();
        let mut rival = used("10.0.0.1");
        rival.subnet_id = Some(subnet.id);
        db.create_static_ip(rival).unwrap();

        let mut seen: Vec<Vec<IpAddr>> = Vec::new();
        let rows = allocator
            .with_retries(subnet.id, Family::V4, |raced| {
                seen.push(raced.to_vec());
                let req = AllocationRequest::default().with_excluded(raced.to_vec());
                allocator.claim(&stale, &req)
            })
            .unwrap();

        assert_eq!(rows[0].ip, Some(ip("10.0.0.2")));
        assert_eq!(seen, vec![vec![], vec![ip("10.0.0.1")]]);
    }

    #[test]
    fn test_retries_are_bounded() {
        let (db, _dir, subnet) = open_store();
        let locks = AllocationLocks::new();
        let allocator = AddressAllocator::new(&db, &locks, 3);

        let mut calls = 0;
        let err = allocator
            .with_retries(subnet.id, Family::V4, |_| {
                calls += 1;
                Err(Error::RetryableConflict {
                    address: ip("10.0.0.1"),
                })
            })
            .unwrap_err();
        assert!(matches!(err, Error::AllocationConflict { attempts: 3 }));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_foreign_key_failure_not_retried() {
        let (db, _dir, subnet) = open_store();
        let locks = AllocationLocks::new();
        let allocator = AddressAllocator::new(&db, &locks, 5);

        let mut calls = 0;
        let err = allocator
            .with_retries(subnet.id, Family::V4, |_| {
                calls += 1;
                Err(Error::ForeignKey(format!("subnet {} does not exist", subnet.id)))
            })
            .unwrap_err();
        assert!(matches!(err, Error::ForeignKey(_)));
        assert!(!err.is_retryable());
        assert_eq!(calls, 1);
    }
}
