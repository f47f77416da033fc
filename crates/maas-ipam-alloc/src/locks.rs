use dashmap::DashMap;
use maas_ipam_core::types::Family;
use std::sync::{Arc, Mutex, PoisonError};

/// Registry of allocation locks.
///
/// Address selection and insert for one subnet run under that subnet's
/// lock. Retries after a conflict take the per-family lock first and the
/// subnet lock second, so the two are always acquired in that order.
#[derive(Default)]
pub struct AllocationLocks {
    subnets: DashMap<u64, Arc<Mutex<()>>>,
    families: DashMap<Family, Arc<Mutex<()>>>,
}

impl AllocationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subnet_lock<T>(&self, subnet_id: u64, f: impl FnOnce() -> T) -> T {
        // Clone the Arc out so the map shard is not held while waiting
        let lock = self.subnets.entry(subnet_id).or_default().clone();
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    pub fn with_family_lock<T>(&self, family: Family, f: impl FnOnce() -> T) -> T {
        let lock = self.families.entry(family).or_default().clone();
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Drop the lock of a deleted subnet.
    pub fn forget_subnet(&self, subnet_id: u64) {
        self.subnets.remove(&subnet_id);
    }

    pub fn subnet_count(&self) -> usize {
        self.subnets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_subnet_lock_serializes() {
        let locks = AllocationLocks::new();
        let inside = AtomicU32::new(0);
        let max_seen = AtomicU32::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    locks.with_subnet_lock(1, || {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    });
                });
            }
        });

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_family_then_subnet_nesting() {
        let locks = AllocationLocks::new();
        let value = locks.with_family_lock(Family::V4, || locks.with_subnet_lock(3, || 42));
        assert_eq!(value, 42);
        assert_eq!(locks.subnet_count(), 1);
        locks.forget_subnet(3);
        assert_eq!(locks.subnet_count(), 0);
    }

    #[test]
    fn test_poisoned_lock_still_usable() {
        let locks = AllocationLocks::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            locks.with_subnet_lock(5, || panic!("boom"));
        }));
        assert!(result.is_err());
        assert_eq!(locks.with_subnet_lock(5, || 1), 1);
    }
}
