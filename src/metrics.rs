/// Operation counters for the memory manager.
///
/// Plain atomics bumped on the hot paths and read via [`MemoryMetrics::snapshot`].
/// Rates are derived on the snapshot, not maintained live.
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct MemoryMetrics {
    pub creates: AtomicU64,
    pub updates: AtomicU64,
    pub deletes: AtomicU64,
    pub payload_reads: AtomicU64,
    pub payload_read_misses: AtomicU64,
    pub promotions: AtomicU64,
    pub demotions: AtomicU64,
    pub prunes: AtomicU64,
    pub quota_rejections: AtomicU64,
    pub meditation_passes: AtomicU64,
    pub reconciled_orphans: AtomicU64,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            creates: self.creates.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            payload_reads: self.payload_reads.load(Ordering::Relaxed),
            payload_read_misses: self.payload_read_misses.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            prunes: self.prunes.load(Ordering::Relaxed),
            quota_rejections: self.quota_rejections.load(Ordering::Relaxed),
            meditation_passes: self.meditation_passes.load(Ordering::Relaxed),
            reconciled_orphans: self.reconciled_orphans.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of the counters at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub payload_reads: u64,
    pub payload_read_misses: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub prunes: u64,
    pub quota_rejections: u64,
    pub meditation_passes: u64,
    pub reconciled_orphans: u64,
}

impl MetricsSnapshot {
    /// Fraction of payload reads that found bytes (0.0 to 1.0).
    pub fn read_hit_rate(&self) -> f64 {
        let total = self.payload_reads + self.payload_read_misses;
        if total == 0 {
            0.0
        } else {
            self.payload_reads as f64 / total as f64
        }
    }

    /// Total lifecycle transitions applied by meditation.
    pub fn meditation_transitions(&self) -> u64 {
        self.promotions + self.demotions + self.prunes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = MemoryMetrics::new();
        metrics.creates.fetch_add(3, Ordering::Relaxed);
        metrics.promotions.fetch_add(2, Ordering::Relaxed);

        let snap = metrics.snapshot();
        assert_eq!(snap.creates, 3);
        assert_eq!(snap.promotions, 2);
        assert_eq!(snap.meditation_transitions(), 2);
    }

    #[test]
    fn test_read_hit_rate() {
        let metrics = MemoryMetrics::new();
        metrics.payload_reads.fetch_add(8, Ordering::Relaxed);
        metrics.payload_read_misses.fetch_add(2, Ordering::Relaxed);

        let snap = metrics.snapshot();
        assert!((snap.read_hit_rate() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_empty_rates_are_zero() {
        let snap = MemoryMetrics::new().snapshot();
        assert_eq!(snap.read_hit_rate(), 0.0);
        assert_eq!(snap.meditation_transitions(), 0);
    }
}
