use crate::utilization::SubnetUtilization;
use chrono::Utc;
use maas_ipam_core::db::Db;
use maas_ipam_core::error::Result;
use maas_ipam_core::types::{exhaustion_ident, Notification, NotificationCategory};
use tracing::{debug, info};
use uuid::Uuid;

/// Result of one exhaustion check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExhaustionOutcome {
    pub subnet_id: u64,
    pub free: u128,
    pub threshold: u32,
    pub warning_present: bool,
    /// Whether this call created or removed the warning
    pub changed: bool,
}

/// Keeps the per-subnet exhaustion warning in step with the free count.
pub struct ExhaustionMonitor<'a> {
    db: &'a Db,
}

impl<'a> ExhaustionMonitor<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    /// Raise the warning when the free count is at or below `threshold`,
    /// clear it otherwise. A threshold of 0 disables the warning.
    pub fn recompute(&self, subnet_id: u64, threshold: u32) -> Result<ExhaustionOutcome> {
        let snapshot = self.db.subnet_snapshot(subnet_id)?;
        let free = SubnetUtilization::new(&snapshot)
            .free_ranges()
            .total_addresses();
        let ident = exhaustion_ident(subnet_id);
        let exhausted = threshold != 0 && free <= u128::from(threshold);

        let changed = if exhausted {
            let subnet = &snapshot.subnet;
            let notification = Notification {
                id: Uuid::new_v4(),
                ident: ident.clone(),
                category: NotificationCategory::Warning,
                message: format!(
                    "IP address exhaustion imminent on subnet {} ({}): {} free address(es) remain",
                    subnet.name, subnet.cidr, free
                ),
                subnet_id: Some(subnet_id),
                created_at: Utc::now(),
            };
            self.db.ensure_notification(&notification)?
        } else {
            self.db.delete_notification(&ident)?
        };

        if changed {
            info!(
                subnet_id,
                free = %free,
                threshold,
                raised = exhausted,
                "subnet exhaustion warning changed"
            );
        } else {
            debug!(subnet_id, free = %free, threshold, "subnet exhaustion unchanged");
        }

        Ok(ExhaustionOutcome {
            subnet_id,
            free,
            threshold,
            warning_present: exhausted,
            changed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maas_ipam_core::types::{IpRange, IpRangeType, RdnsMode, Subnet};
    use tempfile::TempDir;

    fn setup(cidr: &str) -> (Db, TempDir, u64) {
        let dir = TempDir::new().unwrap();
        let db = Db::open(&dir.path().join("test.redb")).unwrap();
        let subnet = db
            .create_subnet(Subnet {
                id: 0,
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
            })
            .unwrap();
        (db, dir, subnet.id)
    }

    fn reserve(db: &Db, subnet_id: u64, start: &str, end: &str) -> IpRange {
        db.create_iprange(IpRange {
            id: 0,
            subnet_id,
            start_ip: start.parse().unwrap(),
            end_ip: end.parse().unwrap(),
            range_type: IpRangeType::Reserved,
            user: None,
            comment: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .unwrap()
    }

    #[test]
    fn test_raise_is_idempotent() {
        let (db, _dir, id) = setup("10.0.0.0/26");
        reserve(&db, id, "10.0.0.1", "10.0.0.50");
        let monitor = ExhaustionMonitor::new(&db);

        let first = monitor.recompute(id, 16).unwrap();
        assert_eq!(first.free, 12);
        assert!(first.warning_present);
        assert!(first.changed);

        let second = monitor.recompute(id, 16).unwrap();
        assert!(second.warning_present);
        assert!(!second.changed);
        assert_eq!(db.list_notifications().unwrap().len(), 1);
    }

    #[test]
    fn test_clears_when_space_returns() {
        let (db, _dir, id) = setup("10.0.0.0/26");
        let range = reserve(&db, id, "10.0.0.1", "10.0.0.50");
        let monitor = ExhaustionMonitor::new(&db);
        monitor.recompute(id, 16).unwrap();

        db.delete_iprange(range.id).unwrap();
        let outcome = monitor.recompute(id, 16).unwrap();
        assert_eq!(outcome.free, 62);
        assert!(!outcome.warning_present);
        assert!(outcome.changed);
        assert!(db.get_notification(&exhaustion_ident(id)).unwrap().is_none());
    }

    #[test]
    fn test_threshold_boundary_and_disable() {
        let (db, _dir, id) = setup("10.0.0.0/26");
        reserve(&db, id, "10.0.0.1", "10.0.0.50");
        let monitor = ExhaustionMonitor::new(&db);

        assert!(!monitor.recompute(id, 11).unwrap().warning_present);
        assert!(monitor.recompute(id, 12).unwrap().warning_present);

        let disabled = monitor.recompute(id, 0).unwrap();
        assert!(!disabled.warning_present);
        assert!(disabled.changed);
    }
}
