//! IPAM operations with their side effects: validation, allocation locks,
//! exhaustion bookkeeping and change events.

use crate::allocator::{AddressAllocator, AllocationRequest};
use crate::hooks::ChangeHook;
use crate::locks::AllocationLocks;
use crate::monitor::{ExhaustionMonitor, ExhaustionOutcome};
use crate::utilization::{SubnetStatistics, SubnetUtilization};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use maas_ipam_core::config::IpamConfig;
use maas_ipam_core::db::Db;
use maas_ipam_core::error::{Error, Result};
use maas_ipam_core::ipset::{ip_to_u128, usable_bounds, AddressSet};
use maas_ipam_core::types::{
    exhaustion_ident, AddressState, AllocType, IpRange, IpRangeType, Neighbour, RdnsMode,
    StaticIpAddress, StaticRoute, Subnet,
};
use maas_ipam_msg::events::{ChangeAction, Event};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct NewSubnet {
    /// Defaults to the CIDR text
    pub name: Option<String>,
    pub cidr: IpNet,
    pub gateway_ip: Option<IpAddr>,
    pub dns_servers: Vec<IpAddr>,
    pub managed: bool,
    pub allow_dns: bool,
    pub allow_proxy: bool,
    pub rdns_mode: RdnsMode,
}

impl NewSubnet {
    pub fn new(cidr: IpNet) -> Self {
        Self {
            name: None,
            cidr,
            gateway_ip: None,
            dns_servers: Vec::new(),
            managed: true,
            allow_dns: true,
            allow_proxy: true,
            rdns_mode: RdnsMode::Default,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway_ip = Some(gateway);
        self
    }

    pub fn with_dns_servers(mut self, servers: Vec<IpAddr>) -> Self {
        self.dns_servers = servers;
        self
    }

    pub fn unmanaged(mut self) -> Self {
        self.managed = false;
        self
    }
}

/// Fields left as `None` keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct SubnetUpdate {
    pub name: Option<String>,
    pub cidr: Option<IpNet>,
    pub gateway_ip: Option<Option<IpAddr>>,
    pub dns_servers: Option<Vec<IpAddr>>,
    pub managed: Option<bool>,
    pub allow_dns: Option<bool>,
    pub allow_proxy: Option<bool>,
    pub rdns_mode: Option<RdnsMode>,
}

#[derive(Debug, Clone)]
pub struct NewIpRange {
    pub subnet_id: u64,
    pub start_ip: IpAddr,
    pub end_ip: IpAddr,
    pub range_type: IpRangeType,
    pub user: Option<String>,
    pub comment: Option<String>,
}

impl NewIpRange {
    pub fn new(subnet_id: u64, start_ip: IpAddr, end_ip: IpAddr, range_type: IpRangeType) -> Self {
        Self {
            subnet_id,
            start_ip,
            end_ip,
            range_type,
            user: None,
            comment: None,
        }
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct IpRangeUpdate {
    pub start_ip: Option<IpAddr>,
    pub end_ip: Option<IpAddr>,
    pub range_type: Option<IpRangeType>,
    pub comment: Option<Option<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct StaticIpUpdate {
    pub subnet_id: Option<Option<u64>>,
    pub alloc_type: Option<AllocType>,
    pub user: Option<Option<String>>,
}

fn claim_conflict(e: Error) -> Error {
    match e {
        Error::UniqueViolation {
            address,
            existing_id,
        } => Error::AddressUnavailable(format!(
            "IP address {address} is already in use by static IP {existing_id}"
        )),
        other => other,
    }
}

/// Entry point for every IPAM mutation.
///
/// Each mutating call commits, then re-evaluates the exhaustion warning of
/// every subnet it touched, then reports events to the registered hooks,
/// all before returning.
pub struct IpamService {
    db: Db,
    locks: AllocationLocks,
    hooks: Vec<Arc<dyn ChangeHook>>,
    instance_id: String,
    exhaustion_threshold: AtomicU32,
    max_allocation_retries: u32,
}

impl IpamService {
    pub fn new(db: Db, config: &IpamConfig) -> Self {
        Self {
            db,
            locks: AllocationLocks::new(),
            hooks: Vec::new(),
            instance_id: "standalone".to_string(),
            exhaustion_threshold: AtomicU32::new(config.exhaustion_threshold),
            max_allocation_retries: config.max_allocation_retries,
        }
    }

    pub fn with_instance_id(mut self, instance_id: &str) -> Self {
        self.instance_id = instance_id.to_string();
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn ChangeHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn exhaustion_threshold(&self) -> u32 {
        self.exhaustion_threshold.load(Ordering::Relaxed)
    }

    fn emit(&self, event: Event) {
        for hook in &self.hooks {
            hook.on_change(&event);
        }
    }

    fn subnet_changed(&self, subnet: &Subnet, action: ChangeAction) {
        self.emit(Event::SubnetChanged {
            instance_id: self.instance_id.clone(),
            subnet_id: subnet.id,
            cidr: subnet.cidr.to_string(),
            action,
            timestamp: Utc::now(),
        });
    }

    fn iprange_changed(&self, range: &IpRange, action: ChangeAction) {
        self.emit(Event::IpRangeChanged {
            instance_id: self.instance_id.clone(),
            subnet_id: range.subnet_id,
            iprange_id: range.id,
            start_ip: range.start_ip.to_string(),
            end_ip: range.end_ip.to_string(),
            action,
            timestamp: Utc::now(),
        });
    }

    fn static_ip_changed(&self, sip: &StaticIpAddress, subnet_ids: Vec<u64>, action: ChangeAction) {
        self.emit(Event::StaticIpChanged {
            instance_id: self.instance_id.clone(),
            subnet_ids,
            address_id: sip.id,
            ip: sip.ip.map(|ip| ip.to_string()),
            action,
            timestamp: Utc::now(),
        });
    }

    fn exhaustion_changed(&self, outcome: &ExhaustionOutcome) {
        self.emit(Event::ExhaustionChanged {
            instance_id: self.instance_id.clone(),
            subnet_id: outcome.subnet_id,
            ident: exhaustion_ident(outcome.subnet_id),
            raised: outcome.warning_present,
            free: u64::try_from(outcome.free).unwrap_or(u64::MAX),
            threshold: outcome.threshold,
            timestamp: Utc::now(),
        });
    }

    /// Re-run the exhaustion monitor for each existing subnet in `subnet_ids`.
    fn recompute<I: IntoIterator<Item = u64>>(&self, subnet_ids: I) -> Result<Vec<ExhaustionOutcome>> {
        let threshold = self.exhaustion_threshold();
        let monitor = ExhaustionMonitor::new(&self.db);
        let unique: BTreeSet<u64> = subnet_ids.into_iter().collect();

        let mut outcomes = Vec::with_capacity(unique.len());
        for subnet_id in unique {
            if self.db.get_subnet(subnet_id)?.is_none() {
                continue;
            }
            let outcome = monitor.recompute(subnet_id, threshold)?;
            if outcome.changed {
                self.exhaustion_changed(&outcome);
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn resolve_subnet(&self, ip: &IpAddr) -> Result<Option<Subnet>> {
        Ok(self.db.subnets_containing(ip)?.into_iter().next())
    }

    // --- Subnets ---

    pub fn create_subnet(&self, req: NewSubnet) -> Result<Subnet> {
        let cidr = req.cidr.trunc();
        let now = Utc::now();
        let subnet = Subnet {
            id: 0,
            name: req.name.unwrap_or_else(|| cidr.to_string()),
            cidr,
            gateway_ip: req.gateway_ip,
            dns_servers: req.dns_servers,
            managed: req.managed,
            allow_dns: req.allow_dns,
            allow_proxy: req.allow_proxy,
            rdns_mode: req.rdns_mode,
            created_at: now,
            updated_at: now,
        };
        subnet.validate_gateway()?;

        let subnet = self.db.create_subnet(subnet)?;
        info!(subnet_id = subnet.id, cidr = %subnet.cidr, managed = subnet.managed, "subnet created");

        self.recompute([subnet.id])?;
        self.subnet_changed(&subnet, ChangeAction::Created);
        Ok(subnet)
    }

    pub fn get_subnet(&self, id: u64) -> Result<Subnet> {
        self.db.require_subnet(id)
    }

    /// Look up a subnet by CIDR; host bits are ignored.
    pub fn find_subnet_by_cidr(&self, cidr: &IpNet) -> Result<Option<Subnet>> {
        self.db.get_subnet_by_cidr(cidr)
    }

    pub fn list_subnets(&self) -> Result<Vec<Subnet>> {
        self.db.list_subnets()
    }

    /// Apply `update`. A CIDR change keeps the address family, requires
    /// every range to stay inside the new usable host range, and detaches
    /// static IP rows whose address falls outside it.
    pub fn update_subnet(&self, id: u64, update: SubnetUpdate) -> Result<Subnet> {
        let (subnet, detached) = self.locks.with_subnet_lock(id, || -> Result<_> {
            let current = self.db.require_subnet(id)?;
            let mut subnet = current.clone();

            if let Some(name) = update.name {
                subnet.name = name;
            }
            if let Some(cidr) = update.cidr {
                subnet.cidr = cidr.trunc();
            }
            if let Some(gateway_ip) = update.gateway_ip {
                subnet.gateway_ip = gateway_ip;
            }
            if let Some(dns_servers) = update.dns_servers {
                subnet.dns_servers = dns_servers;
            }
            if let Some(managed) = update.managed {
                subnet.managed = managed;
            }
            if let Some(allow_dns) = update.allow_dns {
                subnet.allow_dns = allow_dns;
            }
            if let Some(allow_proxy) = update.allow_proxy {
                subnet.allow_proxy = allow_proxy;
            }
            if let Some(rdns_mode) = update.rdns_mode {
                subnet.rdns_mode = rdns_mode;
            }

            if subnet.cidr != current.cidr {
                if subnet.family() != current.family() {
                    return Err(Error::InvalidSubnet(format!(
                        "cannot change subnet {} to {}: address family differs",
                        current.cidr, subnet.cidr
                    )));
                }
                let (first, last) = usable_bounds(&subnet.cidr);
                for range in self.db.list_ipranges(id)? {
                    if ip_to_u128(range.start_ip) < first || ip_to_u128(range.end_ip) > last {
                        return Err(Error::InvalidRange(format!(
                            "{} range {}-{} would fall outside subnet {}",
                            range.range_type, range.start_ip, range.end_ip, subnet.cidr
                        )));
                    }
                }
            }
            subnet.validate_gateway()?;
            subnet.updated_at = Utc::now();

            let detached = self.db.update_subnet(&subnet)?;
            Ok((subnet, detached))
        })?;

        info!(subnet_id = id, cidr = %subnet.cidr, detached = detached.len(), "subnet updated");

        self.recompute([id])?;
        self.subnet_changed(&subnet, ChangeAction::Updated);
        for sip in &detached {
            self.static_ip_changed(sip, vec![id], ChangeAction::Updated);
        }
        Ok(subnet)
    }

    /// Delete a subnet. Fails with `SubnetInUse` while a DYNAMIC range
    /// exists on it.
    pub fn delete_subnet(&self, id: u64) -> Result<Subnet> {
        let deletion = self
            .locks
            .with_subnet_lock(id, || self.db.delete_subnet(id))?;
        self.locks.forget_subnet(id);

        info!(
            subnet_id = id,
            cidr = %deletion.subnet.cidr,
            ranges = deletion.ranges.len(),
            detached = deletion.detached_ips.len(),
            "subnet deleted"
        );

        for range in &deletion.ranges {
            self.iprange_changed(range, ChangeAction::Deleted);
        }
        for sip in &deletion.detached_ips {
            self.static_ip_changed(sip, vec![id], ChangeAction::Updated);
        }
        if deletion.removed_notification {
            self.exhaustion_changed(&ExhaustionOutcome {
                subnet_id: id,
                free: 0,
                threshold: self.exhaustion_threshold(),
                warning_present: false,
                changed: true,
            });
        }
        self.subnet_changed(&deletion.subnet, ChangeAction::Deleted);
        Ok(deletion.subnet)
    }

    pub fn subnet_statistics(&self, id: u64, include_ranges: bool) -> Result<SubnetStatistics> {
        let snapshot = self.db.subnet_snapshot(id)?;
        Ok(SubnetUtilization::new(&snapshot).statistics(include_ranges))
    }

    pub fn subnet_utilization(&self, id: u64) -> Result<AddressSet> {
        let snapshot = self.db.subnet_snapshot(id)?;
        Ok(SubnetUtilization::new(&snapshot).utilization())
    }

    pub fn free_ranges(&self, id: u64) -> Result<AddressSet> {
        let snapshot = self.db.subnet_snapshot(id)?;
        Ok(SubnetUtilization::new(&snapshot).free_ranges())
    }

    // --- IP ranges ---

    pub fn create_iprange(&self, req: NewIpRange) -> Result<IpRange> {
        let subnet_id = req.subnet_id;
        let range = self.locks.with_subnet_lock(subnet_id, || -> Result<_> {
            let snapshot = self.db.subnet_snapshot(subnet_id)?;
            SubnetUtilization::new(&snapshot).validate_range(
                req.start_ip,
                req.end_ip,
                req.range_type,
                None,
            )?;

            let now = Utc::now();
            self.db.create_iprange(IpRange {
                id: 0,
                subnet_id,
                start_ip: req.start_ip,
                end_ip: req.end_ip,
                range_type: req.range_type,
                user: req.user,
                comment: req.comment,
                created_at: now,
                updated_at: now,
            })
        })?;

        info!(
            subnet_id,
            range_type = %range.range_type,
            start = %range.start_ip,
            end = %range.end_ip,
            "IP range created"
        );

        self.recompute([subnet_id])?;
        self.iprange_changed(&range, ChangeAction::Created);
        Ok(range)
    }

    pub fn get_iprange(&self, id: u64) -> Result<IpRange> {
        self.db.get_iprange(id)?.ok_or(Error::IpRangeNotFound(id))
    }

    pub fn list_ipranges(&self, subnet_id: u64) -> Result<Vec<IpRange>> {
        self.db.list_ipranges(subnet_id)
    }

    pub fn update_iprange(&self, id: u64, update: IpRangeUpdate) -> Result<IpRange> {
        let subnet_id = self.get_iprange(id)?.subnet_id;
        let range = self.locks.with_subnet_lock(subnet_id, || -> Result<_> {
            let mut range = self.get_iprange(id)?;
            if let Some(start_ip) = update.start_ip {
                range.start_ip = start_ip;
            }
            if let Some(end_ip) = update.end_ip {
                range.end_ip = end_ip;
            }
            if let Some(range_type) = update.range_type {
                range.range_type = range_type;
            }
            if let Some(comment) = update.comment {
                range.comment = comment;
            }

            let snapshot = self.db.subnet_snapshot(subnet_id)?;
            SubnetUtilization::new(&snapshot).validate_range(
                range.start_ip,
                range.end_ip,
                range.range_type,
                Some(id),
            )?;

            range.updated_at = Utc::now();
            self.db.update_iprange(&range)?;
            Ok(range)
        })?;

        info!(iprange_id = id, start = %range.start_ip, end = %range.end_ip, "IP range updated");

        self.recompute([subnet_id])?;
        self.iprange_changed(&range, ChangeAction::Updated);
        Ok(range)
    }

    pub fn delete_iprange(&self, id: u64) -> Result<IpRange> {
        let subnet_id = self.get_iprange(id)?.subnet_id;
        let range = self
            .locks
            .with_subnet_lock(subnet_id, || self.db.delete_iprange(id))?;

        info!(iprange_id = id, start = %range.start_ip, end = %range.end_ip, "IP range deleted");

        self.recompute([subnet_id])?;
        self.iprange_changed(&range, ChangeAction::Deleted);
        Ok(range)
    }

    // --- Static routes and neighbours ---

    /// Add a static route. Its gateway must sit on the source subnet and
    /// counts as in use there.
    pub fn create_static_route(
        &self,
        source_subnet_id: u64,
        destination_subnet_id: u64,
        gateway_ip: IpAddr,
        metric: u32,
    ) -> Result<StaticRoute> {
        let source = self.db.require_subnet(source_subnet_id)?;
        if !source.contains(&gateway_ip) {
            return Err(Error::AddressOutOfRange {
                address: gateway_ip,
                cidr: source.cidr.to_string(),
            });
        }
        let route = self.locks.with_subnet_lock(source_subnet_id, || {
            self.db.create_static_route(StaticRoute {
                id: 0,
                source_subnet_id,
                destination_subnet_id,
                gateway_ip,
                metric,
                created_at: Utc::now(),
            })
        })?;
        debug!(route_id = route.id, gateway = %gateway_ip, "static route created");

        self.recompute([source_subnet_id])?;
        Ok(route)
    }

    pub fn list_static_routes(&self, source_subnet_id: u64) -> Result<Vec<StaticRoute>> {
        self.db.list_static_routes_from(source_subnet_id)
    }

    pub fn delete_static_route(&self, id: u64) -> Result<StaticRoute> {
        let route = self.db.delete_static_route(id)?;
        self.recompute([route.source_subnet_id])?;
        Ok(route)
    }

    /// Record that `ip` was seen on the wire.
    pub fn observe_neighbour(
        &self,
        ip: IpAddr,
        mac_address: Option<&str>,
        seen_at: DateTime<Utc>,
    ) -> Result<Neighbour> {
        let subnet_id = self.resolve_subnet(&ip)?.map(|s| s.id);
        let neighbour = self.db.upsert_neighbour(ip, mac_address, subnet_id, seen_at)?;
        debug!(ip = %ip, subnet_id = ?subnet_id, "neighbour observed");
        Ok(neighbour)
    }

    /// Drop a neighbour observation, e.g. once the host is known gone.
    /// Returns whether one existed.
    pub fn forget_neighbour(&self, ip: &IpAddr) -> Result<bool> {
        let removed = self.db.delete_neighbour(ip)?;
        if removed {
            debug!(ip = %ip, "neighbour forgotten");
        }
        Ok(removed)
    }

    // --- Static IP addresses ---

    /// Allocate one or more addresses on a subnet.
    pub fn allocate_new(
        &self,
        subnet_id: u64,
        req: &AllocationRequest,
    ) -> Result<Vec<StaticIpAddress>> {
        let rows = AddressAllocator::new(&self.db, &self.locks, self.max_allocation_retries)
            .allocate_new(subnet_id, req)?;

        self.recompute([subnet_id])?;
        for row in &rows {
            self.static_ip_changed(row, vec![subnet_id], ChangeAction::Created);
        }
        Ok(rows)
    }

    /// Create a row without an address, e.g. a placeholder waiting for DHCP.
    pub fn create_unassigned(
        &self,
        subnet_id: Option<u64>,
        alloc_type: AllocType,
        user: Option<&str>,
    ) -> Result<StaticIpAddress> {
        if alloc_type == AllocType::Discovered {
            return Err(Error::InvalidAllocationType(
                "DISCOVERED rows are only created from observations".to_string(),
            ));
        }
        if alloc_type == AllocType::UserReserved && user.is_none() {
            return Err(Error::InvalidAllocationType(
                "USER_RESERVED addresses require a user".to_string(),
            ));
        }

        let now = Utc::now();
        let row = self.db.create_static_ip(StaticIpAddress {
            id: 0,
            ip: None,
            alloc_type,
            subnet_id,
            user: user.map(String::from),
            temp_expires_on: None,
            created_at: now,
            updated_at: now,
        })?;
        debug!(address_id = row.id, alloc_type = %alloc_type, "unassigned static IP created");

        self.static_ip_changed(&row, subnet_id.into_iter().collect(), ChangeAction::Created);
        Ok(row)
    }

    /// Give an UNASSIGNED row an address. With `temp_expires_on` the row
    /// becomes PROVISIONAL until confirmed or purged.
    pub fn assign_ip(
        &self,
        id: u64,
        ip: IpAddr,
        temp_expires_on: Option<DateTime<Utc>>,
    ) -> Result<StaticIpAddress> {
        let current = self.db.require_static_ip(id)?;
        let subnet = match current.subnet_id {
            Some(subnet_id) => self.db.require_subnet(subnet_id)?,
            None => self
                .resolve_subnet(&ip)?
                .ok_or_else(|| Error::AddressUnavailable(format!("{ip} is not on any known subnet")))?,
        };
        if !subnet.contains(&ip) {
            return Err(Error::AddressOutOfRange {
                address: ip,
                cidr: subnet.cidr.to_string(),
            });
        }
        if !subnet.is_usable_host(&ip) {
            return Err(Error::AddressUnavailable(format!(
                "{ip} is not a usable host address of {}",
                subnet.cidr
            )));
        }

        let row = self.locks.with_subnet_lock(subnet.id, || -> Result<_> {
            let mut row = self.db.require_static_ip(id)?;
            if let Some(held) = row.ip {
                return Err(Error::InvalidTransition(format!(
                    "static IP {id} already holds {held}"
                )));
            }
            if row.alloc_type.is_static_family() {
                if let Some(owner) = self.db.static_claim_owner(&ip)? {
                    return Err(Error::AddressUnavailable(format!(
                        "IP address {ip} is already in use by static IP {owner}"
                    )));
                }
            }

            row.ip = Some(ip);
            row.subnet_id = Some(subnet.id);
            row.temp_expires_on = temp_expires_on;
            row.updated_at = Utc::now();
            self.db.update_static_ip(&row).map_err(claim_conflict)?;
            Ok(row)
        })?;

        info!(address_id = id, ip = %ip, state = ?row.state(), "static IP assigned");

        self.recompute([subnet.id])?;
        let subnet_ids = current.subnet_id.into_iter().chain([subnet.id]).collect::<BTreeSet<_>>();
        self.static_ip_changed(&row, subnet_ids.into_iter().collect(), ChangeAction::Updated);
        Ok(row)
    }

    /// PROVISIONAL to ASSIGNED. Confirming an ASSIGNED row is a no-op.
    pub fn confirm(&self, id: u64) -> Result<StaticIpAddress> {
        let mut row = self.db.require_static_ip(id)?;
        match row.state() {
            AddressState::Assigned => return Ok(row),
            AddressState::Unassigned => {
                return Err(Error::InvalidTransition(format!(
                    "static IP {id} has no address to confirm"
                )))
            }
            AddressState::Provisional => {}
        }

        row.temp_expires_on = None;
        row.updated_at = Utc::now();
        self.db.update_static_ip(&row)?;
        debug!(address_id = id, ip = ?row.ip, "provisional static IP confirmed");

        self.recompute(row.subnet_id)?;
        self.static_ip_changed(&row, row.subnet_id.into_iter().collect(), ChangeAction::Updated);
        Ok(row)
    }

    /// Move a row between subnets or change its alloc type or owner.
    pub fn update_static_ip(&self, id: u64, update: StaticIpUpdate) -> Result<StaticIpAddress> {
        let current = self.db.require_static_ip(id)?;
        let mut row = current.clone();
        if let Some(subnet_id) = update.subnet_id {
            row.subnet_id = subnet_id;
        }
        if let Some(alloc_type) = update.alloc_type {
            row.alloc_type = alloc_type;
        }
        if let Some(user) = update.user {
            row.user = user;
        }

        if row.alloc_type == AllocType::UserReserved && row.user.is_none() {
            return Err(Error::InvalidAllocationType(
                "USER_RESERVED addresses require a user".to_string(),
            ));
        }
        if let (Some(ip), Some(subnet_id)) = (row.ip, row.subnet_id) {
            let subnet = self.db.require_subnet(subnet_id)?;
            if !subnet.contains(&ip) {
                return Err(Error::AddressOutOfRange {
                    address: ip,
                    cidr: subnet.cidr.to_string(),
                });
            }
        }

        row.updated_at = Utc::now();
        self.db.update_static_ip(&row).map_err(claim_conflict)?;
        info!(
            address_id = id,
            alloc_type = %row.alloc_type,
            subnet_id = ?row.subnet_id,
            "static IP updated"
        );

        let subnet_ids: BTreeSet<u64> = current.subnet_id.into_iter().chain(row.subnet_id).collect();
        self.recompute(subnet_ids.iter().copied())?;
        self.static_ip_changed(&row, subnet_ids.into_iter().collect(), ChangeAction::Updated);
        Ok(row)
    }

    /// Delete a row, freeing its address.
    pub fn release(&self, id: u64) -> Result<StaticIpAddress> {
        let row = self.db.delete_static_ip(id)?;
        info!(address_id = id, ip = ?row.ip, "static IP released");

        self.recompute(row.subnet_id)?;
        self.static_ip_changed(&row, row.subnet_id.into_iter().collect(), ChangeAction::Deleted);
        Ok(row)
    }

    /// Delete PROVISIONAL rows whose expiry is at or before `now`.
    pub fn purge_expired_provisional(&self, now: DateTime<Utc>) -> Result<Vec<StaticIpAddress>> {
        let purged = self.db.delete_expired_static_ips(now)?;
        if purged.is_empty() {
            return Ok(purged);
        }
        info!(count = purged.len(), "purged expired provisional addresses");

        self.recompute(purged.iter().filter_map(|s| s.subnet_id))?;
        for row in &purged {
            self.static_ip_changed(row, row.subnet_id.into_iter().collect(), ChangeAction::Deleted);
        }
        Ok(purged)
    }

    /// Record an address handed out by DHCP or seen by discovery. The
    /// subnet defaults to the most specific one containing `ip`.
    pub fn record_observed_address(
        &self,
        ip: IpAddr,
        alloc_type: AllocType,
        subnet_id: Option<u64>,
    ) -> Result<StaticIpAddress> {
        if !matches!(alloc_type, AllocType::Dhcp | AllocType::Discovered) {
            return Err(Error::InvalidAllocationType(format!(
                "{alloc_type} addresses are not recorded from observations"
            )));
        }
        let subnet = match subnet_id {
            Some(id) => Some(self.db.require_subnet(id)?),
            None => self.resolve_subnet(&ip)?,
        };
        if let Some(subnet) = &subnet {
            if !subnet.contains(&ip) {
                return Err(Error::AddressOutOfRange {
                    address: ip,
                    cidr: subnet.cidr.to_string(),
                });
            }
        }
        let subnet_id = subnet.map(|s| s.id);
        let now = Utc::now();

        let existing = match alloc_type {
            AllocType::Discovered => self
                .db
                .find_static_ips_by_ip(&ip)?
                .into_iter()
                .find(|s| s.alloc_type == AllocType::Discovered),
            _ => match self.db.static_claim_owner(&ip)? {
                Some(owner) => {
                    let row = self.db.require_static_ip(owner)?;
                    if row.alloc_type != AllocType::Dhcp {
                        return Err(Error::AddressUnavailable(format!(
                            "IP address {ip} is already in use by static IP {owner}"
                        )));
                    }
                    Some(row)
                }
                None => None,
            },
        };

        let (row, action, previous_subnet) = match existing {
            Some(mut row) => {
                let previous_subnet = row.subnet_id;
                row.subnet_id = subnet_id;
                row.updated_at = now;
                self.db.update_static_ip(&row)?;
                (row, ChangeAction::Updated, previous_subnet)
            }
            None => {
                let row = self
                    .db
                    .create_static_ip(StaticIpAddress {
                        id: 0,
                        ip: Some(ip),
                        alloc_type,
                        subnet_id,
                        user: None,
                        temp_expires_on: None,
                        created_at: now,
                        updated_at: now,
                    })
                    .map_err(claim_conflict)?;
                (row, ChangeAction::Created, None)
            }
        };
        debug!(ip = %ip, alloc_type = %alloc_type, subnet_id = ?subnet_id, "observed address recorded");

        let subnet_ids: BTreeSet<u64> = previous_subnet.into_iter().chain(subnet_id).collect();
        self.recompute(subnet_ids.iter().copied())?;
        self.static_ip_changed(&row, subnet_ids.into_iter().collect(), action);
        Ok(row)
    }

    pub fn get_static_ip(&self, id: u64) -> Result<StaticIpAddress> {
        self.db.require_static_ip(id)
    }

    pub fn list_static_ips(&self, subnet_id: u64) -> Result<Vec<StaticIpAddress>> {
        self.db.list_static_ips(subnet_id)
    }

    // --- Exhaustion ---

    /// Change the warning threshold and re-evaluate every subnet.
    pub fn set_exhaustion_threshold(&self, threshold: u32) -> Result<Vec<ExhaustionOutcome>> {
        let previous = self.exhaustion_threshold.swap(threshold, Ordering::Relaxed);
        info!(previous, threshold, "exhaustion threshold changed");
        self.reconcile_exhaustion_all()
    }

    /// Bring every subnet's exhaustion warning in line with its free count.
    pub fn reconcile_exhaustion_all(&self) -> Result<Vec<ExhaustionOutcome>> {
        let ids: Vec<u64> = self.db.list_subnets()?.iter().map(|s| s.id).collect();
        let outcomes = self.recompute(ids)?;
        let raised = outcomes.iter().filter(|o| o.warning_present).count();
        info!(subnets = outcomes.len(), raised, "exhaustion warnings reconciled");
        Ok(outcomes)
    }
}
