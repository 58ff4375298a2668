/// Per-owner, per-tier quota accounting.
///
/// Admission control runs a reserve/commit/rollback protocol: writers reserve
/// bytes before touching a tier store, commit once the write durably
/// succeeded, and roll back otherwise. `used` moves only on commit, so two
/// concurrent writers can never pass an initial check and jointly exceed the
/// limit.
///
/// Counters are partitioned by (owner, tier). Each counter mutates under its
/// own map entry lock; there is no global lock.
use crate::config::QuotaConfig;
use crate::error::{EngramError, EngramResult};
use crate::types::{MemoryTier, OwnerId};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// One (owner, tier) usage counter.
///
/// Invariant: `used + reserved <= limit` at all times. `used` equals the
/// summed sizes of committed items currently resident in the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaCounter {
    /// Bytes committed and resident
    pub used: u64,
    /// Bytes reserved by in-flight writes
    pub reserved: u64,
    /// Configured limit
    pub limit: u64,
}

impl QuotaCounter {
    fn new(limit: u64) -> Self {
        Self {
            used: 0,
            reserved: 0,
            limit,
        }
    }

    /// Bytes still admittable under the limit.
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used + self.reserved)
    }

    /// Committed usage as a fraction of the limit (0.0 to 1.0+).
    pub fn utilization(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        self.used as f64 / self.limit as f64
    }

    /// Bytes of committed usage above the limit, if any.
    ///
    /// Non-zero only after a limit was lowered under live data; meditation
    /// evicts until this returns zero.
    pub fn overage(&self) -> u64 {
        self.used.saturating_sub(self.limit)
    }
}

type CounterKey = (OwnerId, MemoryTier);

/// Quota manager over all (owner, tier) counters.
///
/// Cheap to clone; clones share the same counters.
#[derive(Debug, Clone)]
pub struct QuotaManager {
    counters: Arc<DashMap<CounterKey, QuotaCounter>>,
    config: QuotaConfig,
}

impl QuotaManager {
    /// Create a manager with the given per-tier default limits.
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Reserve `size` bytes for an in-flight write.
    ///
    /// Returns a token that must be committed after the tier write durably
    /// succeeds. Dropping the token without committing rolls the reservation
    /// back, so a failed or abandoned write never leaks reserved bytes.
    pub fn reserve(
        &self,
        owner: &OwnerId,
        tier: MemoryTier,
        size: u64,
    ) -> EngramResult<Reservation> {
        let key = (owner.clone(), tier);
        let mut counter = self
            .counters
            .entry(key)
            .or_insert_with(|| QuotaCounter::new(self.config.default_limit(tier)));

        let available = counter.available();
        if size > available {
            debug!(owner = %owner, tier = %tier, size, available, "Reservation rejected");
            return Err(EngramError::QuotaExceeded {
                owner: owner.clone(),
                tier: tier.to_string(),
                requested: size,
                available,
            });
        }

        counter.reserved += size;
        drop(counter);

        Ok(Reservation {
            counters: Arc::clone(&self.counters),
            owner: owner.clone(),
            tier,
            size,
            settled: false,
        })
    }

    /// Release `size` committed bytes after an item left the tier.
    pub fn release(&self, owner: &OwnerId, tier: MemoryTier, size: u64) {
        if let Some(mut counter) = self.counters.get_mut(&(owner.clone(), tier)) {
            counter.used = counter.used.saturating_sub(size);
        }
    }

    /// Account for bytes that already exist in a tier, bypassing the limit
    /// check. Used when rebuilding counters from persisted metadata; data
    /// loaded over a lowered limit shows up as [`QuotaCounter::overage`].
    pub fn record_existing(&self, owner: &OwnerId, tier: MemoryTier, size: u64) {
        let mut counter = self
            .counters
            .entry((owner.clone(), tier))
            .or_insert_with(|| QuotaCounter::new(self.config.default_limit(tier)));
        counter.used += size;
    }

    /// Current counter snapshot for one (owner, tier).
    pub fn usage(&self, owner: &OwnerId, tier: MemoryTier) -> QuotaCounter {
        self.counters
            .get(&(owner.clone(), tier))
            .map(|c| *c)
            .unwrap_or_else(|| QuotaCounter::new(self.config.default_limit(tier)))
    }

    /// Override the limit for one (owner, tier).
    ///
    /// Lowering a limit under live data is allowed; the counter reports the
    /// overage and meditation evicts down to it.
    pub fn set_limit(&self, owner: &OwnerId, tier: MemoryTier, limit: u64) {
        let mut counter = self
            .counters
            .entry((owner.clone(), tier))
            .or_insert_with(|| QuotaCounter::new(limit));
        counter.limit = limit;
    }

    /// Snapshot every non-empty counter, for metrics emission.
    pub fn all_usages(&self) -> Vec<(OwnerId, MemoryTier, QuotaCounter)> {
        self.counters
            .iter()
            .map(|entry| {
                let (owner, tier) = entry.key().clone();
                (owner, tier, *entry.value())
            })
            .collect()
    }
}

/// An in-flight reservation token.
///
/// Exactly one of `commit` or `rollback` settles the token; dropping an
/// unsettled token rolls it back.
#[derive(Debug)]
pub struct Reservation {
    counters: Arc<DashMap<CounterKey, QuotaCounter>>,
    owner: OwnerId,
    tier: MemoryTier,
    size: u64,
    settled: bool,
}

impl Reservation {
    /// Bytes held by this reservation.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Convert the reservation into committed usage.
    pub fn commit(mut self) {
        if let Some(mut counter) = self
            .counters
            .get_mut(&(self.owner.clone(), self.tier))
        {
            counter.reserved = counter.reserved.saturating_sub(self.size);
            counter.used += self.size;
        }
        self.settled = true;
    }

    /// Release the reservation without committing.
    pub fn rollback(mut self) {
        self.release_reserved();
        self.settled = true;
    }

    fn release_reserved(&self) {
        if let Some(mut counter) = self
            .counters
            .get_mut(&(self.owner.clone(), self.tier))
        {
            counter.reserved = counter.reserved.saturating_sub(self.size);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            self.release_reserved();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_limit(limit: u64) -> QuotaManager {
        QuotaManager::new(QuotaConfig {
            short_limit: limit,
            long_limit: limit,
            object_limit: limit,
        })
    }

    #[test]
    fn test_reserve_commit_moves_used() {
        let quota = manager_with_limit(1000);
        let owner = "u1".to_string();

        let token = quota.reserve(&owner, MemoryTier::Short, 500).unwrap();
        let usage = quota.usage(&owner, MemoryTier::Short);
        assert_eq!(usage.used, 0);
        assert_eq!(usage.reserved, 500);

        token.commit();
        let usage = quota.usage(&owner, MemoryTier::Short);
        assert_eq!(usage.used, 500);
        assert_eq!(usage.reserved, 0);
    }

    #[test]
    fn test_rollback_restores_availability() {
        let quota = manager_with_limit(1000);
        let owner = "u1".to_string();

        let token = quota.reserve(&owner, MemoryTier::Short, 800).unwrap();
        token.rollback();

        let usage = quota.usage(&owner, MemoryTier::Short);
        assert_eq!(usage.used, 0);
        assert_eq!(usage.reserved, 0);
        assert_eq!(usage.available(), 1000);
    }

    #[test]
    fn test_dropped_token_rolls_back() {
        let quota = manager_with_limit(1000);
        let owner = "u1".to_string();

        {
            let _token = quota.reserve(&owner, MemoryTier::Short, 800).unwrap();
            assert_eq!(quota.usage(&owner, MemoryTier::Short).reserved, 800);
        }

        assert_eq!(quota.usage(&owner, MemoryTier::Short).reserved, 0);
    }

    #[test]
    fn test_rejection_at_limit() {
        // Owner u1, Short limit 1000: a 500-byte item fits, a 600-byte
        // item is then rejected and used stays at 500.
        let quota = manager_with_limit(1000);
        let owner = "u1".to_string();

        quota
            .reserve(&owner, MemoryTier::Short, 500)
            .unwrap()
            .commit();

        let err = quota.reserve(&owner, MemoryTier::Short, 600).unwrap_err();
        match err {
            EngramError::QuotaExceeded {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 600);
                assert_eq!(available, 500);
            }
            other => panic!("expected QuotaExceeded, got {other:?}"),
        }

        assert_eq!(quota.usage(&owner, MemoryTier::Short).used, 500);
    }

    #[test]
    fn test_reservations_block_each_other() {
        let quota = manager_with_limit(1000);
        let owner = "u1".to_string();

        let first = quota.reserve(&owner, MemoryTier::Short, 700).unwrap();
        // Second writer passes no stale check: reserved bytes count.
        assert!(quota.reserve(&owner, MemoryTier::Short, 400).is_err());

        first.rollback();
        assert!(quota.reserve(&owner, MemoryTier::Short, 400).is_ok());
    }

    #[test]
    fn test_release_after_move() {
        let quota = manager_with_limit(1000);
        let owner = "u1".to_string();

        quota
            .reserve(&owner, MemoryTier::Short, 500)
            .unwrap()
            .commit();
        quota
            .reserve(&owner, MemoryTier::Long, 500)
            .unwrap()
            .commit();
        quota.release(&owner, MemoryTier::Short, 500);

        assert_eq!(quota.usage(&owner, MemoryTier::Short).used, 0);
        assert_eq!(quota.usage(&owner, MemoryTier::Long).used, 500);
    }

    #[test]
    fn test_owners_and_tiers_are_isolated() {
        let quota = manager_with_limit(1000);
        let u1 = "u1".to_string();
        let u2 = "u2".to_string();

        quota.reserve(&u1, MemoryTier::Short, 1000).unwrap().commit();

        // Other owner and other tier are unaffected.
        assert!(quota.reserve(&u2, MemoryTier::Short, 1000).is_ok());
        assert!(quota.reserve(&u1, MemoryTier::Long, 1000).is_ok());
    }

    #[test]
    fn test_lowered_limit_reports_overage() {
        let quota = manager_with_limit(1000);
        let owner = "u1".to_string();

        quota
            .reserve(&owner, MemoryTier::Long, 900)
            .unwrap()
            .commit();
        quota.set_limit(&owner, MemoryTier::Long, 400);

        let usage = quota.usage(&owner, MemoryTier::Long);
        assert_eq!(usage.overage(), 500);
        assert_eq!(usage.available(), 0);
    }

    #[test]
    fn test_concurrent_reserves_never_oversubscribe() {
        let quota = manager_with_limit(1000);
        let owner = "u1".to_string();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let quota = quota.clone();
            let owner = owner.clone();
            handles.push(std::thread::spawn(move || {
                let mut committed = 0u64;
                for _ in 0..50 {
                    if let Ok(token) = quota.reserve(&owner, MemoryTier::Short, 100) {
                        token.commit();
                        committed += 100;
                    }
                }
                committed
            }));
        }

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let usage = quota.usage(&owner, MemoryTier::Short);

        assert_eq!(usage.used, total);
        assert!(usage.used <= 1000, "used {} exceeds limit", usage.used);
        assert_eq!(usage.reserved, 0);
    }

    #[test]
    fn test_utilization() {
        let quota = manager_with_limit(1000);
        let owner = "u1".to_string();

        quota
            .reserve(&owner, MemoryTier::Short, 250)
            .unwrap()
            .commit();
        let usage = quota.usage(&owner, MemoryTier::Short);
        assert!((usage.utilization() - 0.25).abs() < 1e-9);
    }
}
