use crate::error::{Error, Result};
use crate::types::{
    exhaustion_ident, IpRange, IpRangeType, Neighbour, Notification, StaticIpAddress, StaticRoute,
    Subnet,
};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Subnets table: subnet_id -> Subnet (JSON)
const SUBNETS_TABLE: TableDefinition<u64, &str> = TableDefinition::new("subnets");

/// CIDR index: normalized cidr -> subnet_id
const SUBNET_CIDR_INDEX: TableDefinition<&str, u64> = TableDefinition::new("subnet_cidr_index");

/// IP ranges table: iprange_id -> IpRange (JSON)
const IPRANGES_TABLE: TableDefinition<u64, &str> = TableDefinition::new("ipranges");

/// Static IP table: staticip_id -> StaticIpAddress (JSON)
const STATIC_IPS_TABLE: TableDefinition<u64, &str> = TableDefinition::new("static_ips");

/// Static-family claim index: ip -> staticip_id. DISCOVERED rows are not
/// indexed, so they may coexist with one claim on the same address.
const STATIC_IP_INDEX: TableDefinition<&str, u64> = TableDefinition::new("static_ip_index");

/// Static routes table: route_id -> StaticRoute (JSON)
const STATIC_ROUTES_TABLE: TableDefinition<u64, &str> = TableDefinition::new("static_routes");

/// Neighbour observations: ip -> Neighbour (JSON)
const NEIGHBOURS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("neighbours");

/// Notifications: ident -> Notification (JSON)
const NOTIFICATIONS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("notifications");

/// Id sequences: table name -> last issued id
const SEQUENCES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Everything the utilization queries need about one subnet, read from a
/// single read transaction.
#[derive(Debug, Clone)]
pub struct SubnetSnapshot {
    pub subnet: Subnet,
    pub ranges: Vec<IpRange>,
    pub static_ips: Vec<StaticIpAddress>,
    pub static_routes: Vec<StaticRoute>,
    pub neighbours: Vec<Neighbour>,
}

/// Rows removed or detached by a subnet deletion.
#[derive(Debug, Clone)]
pub struct SubnetDeletion {
    pub subnet: Subnet,
    pub ranges: Vec<IpRange>,
    pub detached_ips: Vec<StaticIpAddress>,
    pub removed_notification: bool,
}

#[derive(Clone)]
pub struct Db {
    inner: Arc<Database>,
}

fn next_id(txn: &WriteTransaction, sequence: &str) -> Result<u64> {
    let mut seq = txn.open_table(SEQUENCES_TABLE)?;
    let next = seq.get(sequence)?.map(|v| v.value()).unwrap_or(0) + 1;
    seq.insert(sequence, next)?;
    Ok(next)
}

fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<u64, &'static str>,
    id: u64,
) -> Result<Option<T>> {
    match table.get(id)? {
        Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
        None => Ok(None),
    }
}

fn scan_json<K: redb::Key + 'static, T: DeserializeOwned>(
    table: &impl ReadableTable<K, &'static str>,
) -> Result<Vec<T>> {
    let mut result = Vec::new();
    for entry in table.iter()? {
        let entry = entry.map_err(|e| Error::Database(e.to_string()))?;
        result.push(serde_json::from_str(entry.1.value())?);
    }
    Ok(result)
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Initialize tables
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SUBNETS_TABLE)?;
            let _ = write_txn.open_table(SUBNET_CIDR_INDEX)?;
            let _ = write_txn.open_table(IPRANGES_TABLE)?;
            let _ = write_txn.open_table(STATIC_IPS_TABLE)?;
            let _ = write_txn.open_table(STATIC_IP_INDEX)?;
            let _ = write_txn.open_table(STATIC_ROUTES_TABLE)?;
            let _ = write_txn.open_table(NEIGHBOURS_TABLE)?;
            let _ = write_txn.open_table(NOTIFICATIONS_TABLE)?;
            let _ = write_txn.open_table(SEQUENCES_TABLE)?;
        }
        write_txn.commit()?;
        debug!(path = %path.display(), "ipam store opened");

        Ok(Self {
            inner: Arc::new(db),
        })
    }

    // --- Subnet operations ---

    /// Insert a subnet, assigning its id. The CIDR must be unique.
    pub fn create_subnet(&self, mut subnet: Subnet) -> Result<Subnet> {
        let write_txn = self.inner.begin_write()?;
        {
            let cidr = subnet.cidr.to_string();
            let mut cidr_idx = write_txn.open_table(SUBNET_CIDR_INDEX)?;
            if cidr_idx.get(cidr.as_str())?.is_some() {
                return Err(Error::DuplicateSubnet(cidr));
            }

            subnet.id = next_id(&write_txn, "subnets")?;
            let json = serde_json::to_string(&subnet)?;

            let mut subnets = write_txn.open_table(SUBNETS_TABLE)?;
            subnets.insert(subnet.id, json.as_str())?;
            cidr_idx.insert(cidr.as_str(), subnet.id)?;
        }
        write_txn.commit()?;
        Ok(subnet)
    }

    pub fn get_subnet(&self, id: u64) -> Result<Option<Subnet>> {
        let read_txn = self.inner.begin_read()?;
        let subnets = read_txn.open_table(SUBNETS_TABLE)?;
        get_json(&subnets, id)
    }

    pub fn require_subnet(&self, id: u64) -> Result<Subnet> {
        self.get_subnet(id)?.ok_or(Error::SubnetNotFound(id))
    }

    pub fn get_subnet_by_cidr(&self, cidr: &IpNet) -> Result<Option<Subnet>> {
        let read_txn = self.inner.begin_read()?;
        let cidr_idx = read_txn.open_table(SUBNET_CIDR_INDEX)?;

        let subnet_id = match cidr_idx.get(cidr.trunc().to_string().as_str())? {
            Some(v) => v.value(),
            None => return Ok(None),
        };

        let subnets = read_txn.open_table(SUBNETS_TABLE)?;
        get_json(&subnets, subnet_id)
    }

    pub fn list_subnets(&self) -> Result<Vec<Subnet>> {
        let read_txn = self.inner.begin_read()?;
        let subnets = read_txn.open_table(SUBNETS_TABLE)?;
        scan_json(&subnets)
    }

    /// Subnets whose CIDR contains `ip`, most specific first.
    pub fn subnets_containing(&self, ip: &IpAddr) -> Result<Vec<Subnet>> {
        let mut result: Vec<Subnet> = self
            .list_subnets()?
            .into_iter()
            .filter(|s| s.contains(ip))
            .collect();
        result.sort_by(|a, b| b.cidr.prefix_len().cmp(&a.cidr.prefix_len()));
        Ok(result)
    }

    /// Replace a stored subnet, keeping the CIDR index in step. When the
    /// CIDR changes, static IP rows whose address left it are detached in
    /// the same transaction and returned.
    pub fn update_subnet(&self, subnet: &Subnet) -> Result<Vec<StaticIpAddress>> {
        let write_txn = self.inner.begin_write()?;
        let mut detached = Vec::new();
        {
            let mut subnets = write_txn.open_table(SUBNETS_TABLE)?;
            let existing: Subnet =
                get_json(&subnets, subnet.id)?.ok_or(Error::SubnetNotFound(subnet.id))?;

            if existing.cidr != subnet.cidr {
                let mut cidr_idx = write_txn.open_table(SUBNET_CIDR_INDEX)?;
                let new_cidr = subnet.cidr.to_string();
                if cidr_idx.get(new_cidr.as_str())?.is_some() {
                    return Err(Error::DuplicateSubnet(new_cidr));
                }
                cidr_idx.remove(existing.cidr.to_string().as_str())?;
                cidr_idx.insert(new_cidr.as_str(), subnet.id)?;

                let mut static_ips = write_txn.open_table(STATIC_IPS_TABLE)?;
                for mut sip in scan_json::<u64, StaticIpAddress>(&static_ips)? {
                    let outside = sip.ip.is_some_and(|ip| !subnet.contains(&ip));
                    if sip.subnet_id == Some(subnet.id) && outside {
                        sip.subnet_id = None;
                        sip.updated_at = Utc::now();
                        let json = serde_json::to_string(&sip)?;
                        static_ips.insert(sip.id, json.as_str())?;
                        detached.push(sip);
                    }
                }
            }

            let json = serde_json::to_string(subnet)?;
            subnets.insert(subnet.id, json.as_str())?;
        }
        write_txn.commit()?;
        Ok(detached)
    }

    /// Delete a subnet. Fails while a dynamic range exists; otherwise removes
    /// its ranges and static routes, and detaches its static IPs and
    /// neighbour observations.
    pub fn delete_subnet(&self, id: u64) -> Result<SubnetDeletion> {
        let write_txn = self.inner.begin_write()?;
        let deletion;
        {
            let mut subnets = write_txn.open_table(SUBNETS_TABLE)?;
            let subnet: Subnet = get_json(&subnets, id)?.ok_or(Error::SubnetNotFound(id))?;

            let mut ranges_table = write_txn.open_table(IPRANGES_TABLE)?;
            let ranges: Vec<IpRange> = scan_json::<u64, IpRange>(&ranges_table)?
                .into_iter()
                .filter(|r| r.subnet_id == id)
                .collect();
            if let Some(dynamic) = ranges.iter().find(|r| r.range_type == IpRangeType::Dynamic) {
                return Err(Error::SubnetInUse {
                    cidr: subnet.cidr.to_string(),
                    start: dynamic.start_ip,
                    end: dynamic.end_ip,
                });
            }
            for range in &ranges {
                ranges_table.remove(range.id)?;
            }

            let mut routes = write_txn.open_table(STATIC_ROUTES_TABLE)?;
            let route_ids: Vec<u64> = scan_json::<u64, StaticRoute>(&routes)?
                .into_iter()
                .filter(|r| r.source_subnet_id == id || r.destination_subnet_id == id)
                .map(|r| r.id)
                .collect();
            for route_id in route_ids {
                routes.remove(route_id)?;
            }

            let mut static_ips = write_txn.open_table(STATIC_IPS_TABLE)?;
            let mut detached_ips = Vec::new();
            for mut sip in scan_json::<u64, StaticIpAddress>(&static_ips)? {
                if sip.subnet_id == Some(id) {
                    sip.subnet_id = None;
                    sip.updated_at = Utc::now();
                    let json = serde_json::to_string(&sip)?;
                    static_ips.insert(sip.id, json.as_str())?;
                    detached_ips.push(sip);
                }
            }

            let mut neighbours = write_txn.open_table(NEIGHBOURS_TABLE)?;
            for mut neighbour in scan_json::<&str, Neighbour>(&neighbours)? {
                if neighbour.subnet_id == Some(id) {
                    neighbour.subnet_id = None;
                    let json = serde_json::to_string(&neighbour)?;
                    neighbours.insert(neighbour.ip.to_string().as_str(), json.as_str())?;
                }
            }

            let mut notifications = write_txn.open_table(NOTIFICATIONS_TABLE)?;
            let removed_notification = notifications
                .remove(exhaustion_ident(id).as_str())?
                .is_some();

            let mut cidr_idx = write_txn.open_table(SUBNET_CIDR_INDEX)?;
            cidr_idx.remove(subnet.cidr.to_string().as_str())?;
            subnets.remove(id)?;

            deletion = SubnetDeletion {
                subnet,
                ranges,
                detached_ips,
                removed_notification,
            };
        }
        write_txn.commit()?;
        Ok(deletion)
    }

    /// Read a consistent view of a subnet and everything attached to it.
    ///
    /// Static IPs include the subnet's own rows plus any static-family
    /// claim on an address inside the CIDR, whichever subnet (if any) the
    /// claiming row points at. The claim index is global, so those
    /// addresses cannot be handed out here either.
    pub fn subnet_snapshot(&self, id: u64) -> Result<SubnetSnapshot> {
        let read_txn = self.inner.begin_read()?;
        let subnets = read_txn.open_table(SUBNETS_TABLE)?;
        let subnet: Subnet = get_json(&subnets, id)?.ok_or(Error::SubnetNotFound(id))?;
        let cidr = subnet.cidr;

        let ranges = read_txn.open_table(IPRANGES_TABLE)?;
        let static_ips = read_txn.open_table(STATIC_IPS_TABLE)?;
        let routes = read_txn.open_table(STATIC_ROUTES_TABLE)?;
        let neighbours = read_txn.open_table(NEIGHBOURS_TABLE)?;

        Ok(SubnetSnapshot {
            ranges: scan_json::<u64, IpRange>(&ranges)?
                .into_iter()
                .filter(|r| r.subnet_id == id)
                .collect(),
            static_ips: scan_json::<u64, StaticIpAddress>(&static_ips)?
                .into_iter()
                .filter(|s| {
                    s.subnet_id == Some(id)
                        || s.static_claim().is_some_and(|ip| cidr.contains(&ip))
                })
                .collect(),
            static_routes: scan_json::<u64, StaticRoute>(&routes)?
                .into_iter()
                .filter(|r| r.source_subnet_id == id)
                .collect(),
            neighbours: scan_json::<&str, Neighbour>(&neighbours)?
                .into_iter()
                .filter(|n| n.subnet_id == Some(id))
                .collect(),
            subnet,
        })
    }

    // --- IP range operations ---

    pub fn create_iprange(&self, mut range: IpRange) -> Result<IpRange> {
        let write_txn = self.inner.begin_write()?;
        {
            let subnets = write_txn.open_table(SUBNETS_TABLE)?;
            if subnets.get(range.subnet_id)?.is_none() {
                return Err(Error::ForeignKey(format!(
                    "IP range references missing subnet {}",
                    range.subnet_id
                )));
            }

            range.id = next_id(&write_txn, "ipranges")?;
            let json = serde_json::to_string(&range)?;
            let mut ranges = write_txn.open_table(IPRANGES_TABLE)?;
            ranges.insert(range.id, json.as_str())?;
        }
        write_txn.commit()?;
        Ok(range)
    }

    pub fn get_iprange(&self, id: u64) -> Result<Option<IpRange>> {
        let read_txn = self.inner.begin_read()?;
        let ranges = read_txn.open_table(IPRANGES_TABLE)?;
        get_json(&ranges, id)
    }

    pub fn list_ipranges(&self, subnet_id: u64) -> Result<Vec<IpRange>> {
        let read_txn = self.inner.begin_read()?;
        let ranges = read_txn.open_table(IPRANGES_TABLE)?;
        Ok(scan_json::<u64, IpRange>(&ranges)?
            .into_iter()
            .filter(|r| r.subnet_id == subnet_id)
            .collect())
    }

    pub fn update_iprange(&self, range: &IpRange) -> Result<()> {
        let write_txn = self.inner.begin_write()?;
        {
            let mut ranges = write_txn.open_table(IPRANGES_TABLE)?;
            if ranges.get(range.id)?.is_none() {
                return Err(Error::IpRangeNotFound(range.id));
            }
            let json = serde_json::to_string(range)?;
            ranges.insert(range.id, json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn delete_iprange(&self, id: u64) -> Result<IpRange> {
        let write_txn = self.inner.begin_write()?;
        let range;
        {
            let mut ranges = write_txn.open_table(IPRANGES_TABLE)?;
            range = get_json::<IpRange>(&ranges, id)?.ok_or(Error::IpRangeNotFound(id))?;
            ranges.remove(id)?;
        }
        write_txn.commit()?;
        Ok(range)
    }

    // --- Static IP operations ---

    /// Insert static IP rows atomically, assigning ids. A static-family
    /// address already claimed (by a stored row or an earlier row of the
    /// batch) fails the whole batch with `UniqueViolation`.
    pub fn insert_static_ips(&self, rows: Vec<StaticIpAddress>) -> Result<Vec<StaticIpAddress>> {
        let write_txn = self.inner.begin_write()?;
        let mut inserted = Vec::with_capacity(rows.len());
        {
            let subnets = write_txn.open_table(SUBNETS_TABLE)?;
            let mut static_ips = write_txn.open_table(STATIC_IPS_TABLE)?;
            let mut claims = write_txn.open_table(STATIC_IP_INDEX)?;

            for mut sip in rows {
                if let Some(subnet_id) = sip.subnet_id {
                    if subnets.get(subnet_id)?.is_none() {
                        return Err(Error::ForeignKey(format!(
                            "static IP references missing subnet {subnet_id}"
                        )));
                    }
                }
                let claim = sip.static_claim().map(|ip| ip.to_string());
                if let (Some(ip), Some(key)) = (sip.static_claim(), claim.as_deref()) {
                    if let Some(existing) = claims.get(key)?.map(|v| v.value()) {
                        return Err(Error::UniqueViolation {
                            address: ip,
                            existing_id: existing,
                        });
                    }
                }

                sip.id = next_id(&write_txn, "static_ips")?;
                let json = serde_json::to_string(&sip)?;
                static_ips.insert(sip.id, json.as_str())?;
                if let Some(key) = claim.as_deref() {
                    claims.insert(key, sip.id)?;
                }
                inserted.push(sip);
            }
        }
        write_txn.commit()?;
        Ok(inserted)
    }

    pub fn create_static_ip(&self, sip: StaticIpAddress) -> Result<StaticIpAddress> {
        self.insert_static_ips(vec![sip])?
            .pop()
            .ok_or_else(|| Error::Other("static IP insert returned no row".to_string()))
    }

    pub fn get_static_ip(&self, id: u64) -> Result<Option<StaticIpAddress>> {
        let read_txn = self.inner.begin_read()?;
        let static_ips = read_txn.open_table(STATIC_IPS_TABLE)?;
        get_json(&static_ips, id)
    }

    pub fn require_static_ip(&self, id: u64) -> Result<StaticIpAddress> {
        self.get_static_ip(id)?.ok_or(Error::StaticIpNotFound(id))
    }

    pub fn list_static_ips(&self, subnet_id: u64) -> Result<Vec<StaticIpAddress>> {
        Ok(self
            .list_all_static_ips()?
            .into_iter()
            .filter(|s| s.subnet_id == Some(subnet_id))
            .collect())
    }

    pub fn list_all_static_ips(&self) -> Result<Vec<StaticIpAddress>> {
        let read_txn = self.inner.begin_read()?;
        let static_ips = read_txn.open_table(STATIC_IPS_TABLE)?;
        scan_json(&static_ips)
    }

    /// All rows (any alloc type) holding `ip`.
    pub fn find_static_ips_by_ip(&self, ip: &IpAddr) -> Result<Vec<StaticIpAddress>> {
        Ok(self
            .list_all_static_ips()?
            .into_iter()
            .filter(|s| s.ip.as_ref() == Some(ip))
            .collect())
    }

    /// Id of the static-family row claiming `ip`, if any.
    pub fn static_claim_owner(&self, ip: &IpAddr) -> Result<Option<u64>> {
        let read_txn = self.inner.begin_read()?;
        let claims = read_txn.open_table(STATIC_IP_INDEX)?;
        let owner = claims.get(ip.to_string().as_str())?.map(|v| v.value());
        Ok(owner)
    }

    /// Replace a stored row, moving its claim in the uniqueness index.
    /// Returns the previous version.
    pub fn update_static_ip(&self, sip: &StaticIpAddress) -> Result<StaticIpAddress> {
        let write_txn = self.inner.begin_write()?;
        let previous;
        {
            let subnets = write_txn.open_table(SUBNETS_TABLE)?;
            if let Some(subnet_id) = sip.subnet_id {
                if subnets.get(subnet_id)?.is_none() {
                    return Err(Error::ForeignKey(format!(
                        "static IP references missing subnet {subnet_id}"
                    )));
                }
            }

            let mut static_ips = write_txn.open_table(STATIC_IPS_TABLE)?;
            previous = get_json::<StaticIpAddress>(&static_ips, sip.id)?
                .ok_or(Error::StaticIpNotFound(sip.id))?;

            let old_claim = previous.static_claim();
            let new_claim = sip.static_claim();
            if old_claim != new_claim {
                let mut claims = write_txn.open_table(STATIC_IP_INDEX)?;
                if let Some(ip) = new_claim {
                    let key = ip.to_string();
                    if let Some(existing) = claims.get(key.as_str())?.map(|v| v.value()) {
                        if existing != sip.id {
                            return Err(Error::UniqueViolation {
                                address: ip,
                                existing_id: existing,
                            });
                        }
                    }
                    claims.insert(key.as_str(), sip.id)?;
                }
                if let Some(ip) = old_claim {
                    let key = ip.to_string();
                    let owner = claims.get(key.as_str())?.map(|v| v.value());
                    if owner == Some(sip.id) {
                        claims.remove(key.as_str())?;
                    }
                }
            }

            let json = serde_json::to_string(sip)?;
            static_ips.insert(sip.id, json.as_str())?;
        }
        write_txn.commit()?;
        Ok(previous)
    }

    pub fn delete_static_ip(&self, id: u64) -> Result<StaticIpAddress> {
        let write_txn = self.inner.begin_write()?;
        let sip;
        {
            let mut static_ips = write_txn.open_table(STATIC_IPS_TABLE)?;
            sip = get_json::<StaticIpAddress>(&static_ips, id)?.ok_or(Error::StaticIpNotFound(id))?;
            static_ips.remove(id)?;

            if let Some(ip) = sip.static_claim() {
                let mut claims = write_txn.open_table(STATIC_IP_INDEX)?;
                let key = ip.to_string();
                let owner = claims.get(key.as_str())?.map(|v| v.value());
                if owner == Some(id) {
                    claims.remove(key.as_str())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(sip)
    }

    /// Delete provisional rows whose `temp_expires_on` is at or before `now`.
    pub fn delete_expired_static_ips(&self, now: DateTime<Utc>) -> Result<Vec<StaticIpAddress>> {
        let write_txn = self.inner.begin_write()?;
        let expired: Vec<StaticIpAddress>;
        {
            let mut static_ips = write_txn.open_table(STATIC_IPS_TABLE)?;
            let mut claims = write_txn.open_table(STATIC_IP_INDEX)?;

            expired = scan_json::<u64, StaticIpAddress>(&static_ips)?
                .into_iter()
                .filter(|s| s.is_expired(now))
                .collect();

            for sip in &expired {
                static_ips.remove(sip.id)?;
                if let Some(ip) = sip.static_claim() {
                    let key = ip.to_string();
                    let owner = claims.get(key.as_str())?.map(|v| v.value());
                    if owner == Some(sip.id) {
                        claims.remove(key.as_str())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(expired)
    }

    // --- Static route operations ---

    pub fn create_static_route(&self, mut route: StaticRoute) -> Result<StaticRoute> {
        let write_txn = self.inner.begin_write()?;
        {
            let subnets = write_txn.open_table(SUBNETS_TABLE)?;
            for subnet_id in [route.source_subnet_id, route.destination_subnet_id] {
                if subnets.get(subnet_id)?.is_none() {
                    return Err(Error::ForeignKey(format!(
                        "static route references missing subnet {subnet_id}"
                    )));
                }
            }

            route.id = next_id(&write_txn, "static_routes")?;
            let json = serde_json::to_string(&route)?;
            let mut routes = write_txn.open_table(STATIC_ROUTES_TABLE)?;
            routes.insert(route.id, json.as_str())?;
        }
        write_txn.commit()?;
        Ok(route)
    }

    pub fn list_static_routes_from(&self, subnet_id: u64) -> Result<Vec<StaticRoute>> {
        let read_txn = self.inner.begin_read()?;
        let routes = read_txn.open_table(STATIC_ROUTES_TABLE)?;
        Ok(scan_json::<u64, StaticRoute>(&routes)?
            .into_iter()
            .filter(|r| r.source_subnet_id == subnet_id)
            .collect())
    }

    pub fn delete_static_route(&self, id: u64) -> Result<StaticRoute> {
        let write_txn = self.inner.begin_write()?;
        let route;
        {
            let mut routes = write_txn.open_table(STATIC_ROUTES_TABLE)?;
            route = get_json::<StaticRoute>(&routes, id)?.ok_or(Error::StaticRouteNotFound(id))?;
            routes.remove(id)?;
        }
        write_txn.commit()?;
        Ok(route)
    }

    // --- Neighbour operations ---

    /// Record a sighting of `ip`, keeping the original `first_seen`.
    pub fn upsert_neighbour(
        &self,
        ip: IpAddr,
        mac_address: Option<&str>,
        subnet_id: Option<u64>,
        seen_at: DateTime<Utc>,
    ) -> Result<Neighbour> {
        let write_txn = self.inner.begin_write()?;
        let neighbour;
        {
            let key = ip.to_string();
            let mut neighbours = write_txn.open_table(NEIGHBOURS_TABLE)?;
            let existing = neighbours.get(key.as_str())?.map(|v| v.value().to_string());

            neighbour = match existing {
                Some(json) => {
                    let mut n: Neighbour = serde_json::from_str(&json)?;
                    n.last_seen = n.last_seen.max(seen_at);
                    n.subnet_id = subnet_id;
                    if let Some(mac) = mac_address {
                        n.mac_address = Some(mac.to_string());
                    }
                    n
                }
                None => Neighbour {
                    ip,
                    mac_address: mac_address.map(String::from),
                    subnet_id,
                    first_seen: seen_at,
                    last_seen: seen_at,
                },
            };

            let json = serde_json::to_string(&neighbour)?;
            neighbours.insert(key.as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(neighbour)
    }

    pub fn get_neighbour(&self, ip: &IpAddr) -> Result<Option<Neighbour>> {
        let read_txn = self.inner.begin_read()?;
        let neighbours = read_txn.open_table(NEIGHBOURS_TABLE)?;
        match neighbours.get(ip.to_string().as_str())? {
            Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_neighbours(&self, subnet_id: u64) -> Result<Vec<Neighbour>> {
        let read_txn = self.inner.begin_read()?;
        let neighbours = read_txn.open_table(NEIGHBOURS_TABLE)?;
        Ok(scan_json::<&str, Neighbour>(&neighbours)?
            .into_iter()
            .filter(|n| n.subnet_id == Some(subnet_id))
            .collect())
    }

    pub fn delete_neighbour(&self, ip: &IpAddr) -> Result<bool> {
        let write_txn = self.inner.begin_write()?;
        let removed;
        {
            let mut neighbours = write_txn.open_table(NEIGHBOURS_TABLE)?;
            removed = neighbours.remove(ip.to_string().as_str())?.is_some();
        }
        write_txn.commit()?;
        Ok(removed)
    }

    // --- Notification operations ---

    pub fn get_notification(&self, ident: &str) -> Result<Option<Notification>> {
        let read_txn = self.inner.begin_read()?;
        let notifications = read_txn.open_table(NOTIFICATIONS_TABLE)?;
        match notifications.get(ident)? {
            Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
            None => Ok(None),
        }
    }

    /// Insert a notification unless one with the same ident exists.
    /// Returns true when a new record was written.
    pub fn ensure_notification(&self, notification: &Notification) -> Result<bool> {
        let write_txn = self.inner.begin_write()?;
        let created;
        {
            let mut notifications = write_txn.open_table(NOTIFICATIONS_TABLE)?;
            created = notifications.get(notification.ident.as_str())?.is_none();
            if created {
                let json = serde_json::to_string(notification)?;
                notifications.insert(notification.ident.as_str(), json.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(created)
    }

    /// Returns true when a record was removed.
    pub fn delete_notification(&self, ident: &str) -> Result<bool> {
        let write_txn = self.inner.begin_write()?;
        let removed;
        {
            let mut notifications = write_txn.open_table(NOTIFICATIONS_TABLE)?;
            removed = notifications.remove(ident)?.is_some();
        }
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn list_notifications(&self) -> Result<Vec<Notification>> {
        let read_txn = self.inner.begin_read()?;
        let notifications = read_txn.open_table(NOTIFICATIONS_TABLE)?;
        scan_json::<&str, Notification>(&notifications)
    }
}
