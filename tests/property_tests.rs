/// Property tests for the quota counters and the scoring formula.
///
/// The quota test drives the manager through arbitrary interleavings of
/// reserve, commit, rollback, and release against a shadow model; the
/// scoring tests pin down the bounds and monotonicity the lifecycle
/// thresholds depend on.
use chrono::{Duration, Utc};
use engram::config::{QuotaConfig, ScoringWeights};
use engram::meditation::{ScoringStrategy, WeightedScorer};
use engram::quota::{QuotaManager, Reservation};
use engram::types::{Category, ContentRef, LifecycleState, MemoryItem, MemoryTier, OwnerId};
use proptest::prelude::*;

const LIMIT: u64 = 1_000;

#[derive(Debug, Clone)]
enum QuotaOp {
    Reserve(u64),
    Commit,
    Rollback,
    Release,
}

fn quota_op() -> impl Strategy<Value = QuotaOp> {
    prop_oneof![
        (0u64..=300).prop_map(QuotaOp::Reserve),
        Just(QuotaOp::Commit),
        Just(QuotaOp::Rollback),
        Just(QuotaOp::Release),
    ]
}

fn item_with(
    importance: f64,
    access_count: u64,
    idle_secs: i64,
    age_secs: i64,
    now: chrono::DateTime<Utc>,
) -> MemoryItem {
    MemoryItem {
        id: "prop-item".to_string(),
        owner: "prop".to_string(),
        tier: MemoryTier::Short,
        content: ContentRef::Inline("prop-item".to_string()),
        embedding: None,
        category: Category::Plain,
        consent: false,
        protected: false,
        importance,
        score: 0.0,
        created_at: now - Duration::seconds(age_secs),
        last_accessed_at: now - Duration::seconds(idle_secs),
        access_count,
        size: 1,
        state: LifecycleState::Ephemeral,
        tombstone_seq: None,
    }
}

proptest! {
    /// Whatever the interleaving, the counters match a shadow model and
    /// used + reserved never exceeds the limit.
    #[test]
    fn quota_counters_match_model(ops in proptest::collection::vec(quota_op(), 1..60)) {
        let manager = QuotaManager::new(QuotaConfig {
            short_limit: LIMIT,
            ..QuotaConfig::default()
        });
        let owner: OwnerId = "prop".to_string();

        let mut pending: Vec<Reservation> = Vec::new();
        let mut committed: Vec<u64> = Vec::new();
        let mut used = 0u64;
        let mut reserved = 0u64;

        for op in ops {
            match op {
                QuotaOp::Reserve(size) => match manager.reserve(&owner, MemoryTier::Short, size) {
                    Ok(r) => {
                        reserved += size;
                        pending.push(r);
                    }
                    Err(engram::EngramError::QuotaExceeded { .. }) => {
                        prop_assert!(
                            used + reserved + size > LIMIT,
                            "rejected a fitting reservation: used={} reserved={} size={}",
                            used, reserved, size
                        );
                    }
                    Err(e) => prop_assert!(false, "unexpected reserve error: {}", e),
                },
                QuotaOp::Commit => {
                    if let Some(r) = pending.pop() {
                        let size = r.size();
                        r.commit();
                        reserved -= size;
                        used += size;
                        committed.push(size);
                    }
                }
                QuotaOp::Rollback => {
                    if let Some(r) = pending.pop() {
                        let size = r.size();
                        r.rollback();
                        reserved -= size;
                    }
                }
                QuotaOp::Release => {
                    if let Some(size) = committed.pop() {
                        manager.release(&owner, MemoryTier::Short, size);
                        used -= size;
                    }
                }
            }

            let usage = manager.usage(&owner, MemoryTier::Short);
            prop_assert_eq!(usage.used, used);
            prop_assert_eq!(usage.reserved, reserved);
            prop_assert!(
                usage.used + usage.reserved <= usage.limit,
                "overcommitted: used={} reserved={} limit={}",
                usage.used, usage.reserved, usage.limit
            );
        }
    }

    /// Dropping a reservation without committing must leave no trace.
    #[test]
    fn quota_dropped_reservations_leave_no_trace(sizes in proptest::collection::vec(1u64..=200, 1..10)) {
        let manager = QuotaManager::new(QuotaConfig {
            short_limit: LIMIT,
            ..QuotaConfig::default()
        });
        let owner: OwnerId = "prop".to_string();

        {
            let mut held = Vec::new();
            for size in &sizes {
                if let Ok(r) = manager.reserve(&owner, MemoryTier::Short, *size) {
                    held.push(r);
                }
            }
            // All dropped uncommitted.
        }

        let usage = manager.usage(&owner, MemoryTier::Short);
        prop_assert_eq!(usage.used, 0);
        prop_assert_eq!(usage.reserved, 0);
    }

    /// The score stays within [-1, 1] for any item and any valid weights,
    /// so configured thresholds always remain meaningful.
    #[test]
    fn score_stays_bounded(
        recency in 0.0f64..=1.0,
        frequency in 0.0f64..=1.0,
        importance_weight in 0.0f64..=1.0,
        age in 0.0f64..=1.0,
        importance in 0.0f64..=1.0,
        access_count in 0u64..=100_000,
        idle_secs in 0i64..=1_000_000_000,
        age_secs in 0i64..=1_000_000_000,
    ) {
        let scorer = WeightedScorer::new(ScoringWeights {
            recency,
            frequency,
            importance: importance_weight,
            age,
        });
        let now = Utc::now();
        let item = item_with(importance, access_count, idle_secs, age_secs, now);

        let score = scorer.score(&item, now);
        prop_assert!(score.is_finite());
        prop_assert!(
            (-1.0..=1.0).contains(&score),
            "score {} out of bounds for weights r={} f={} i={} a={}",
            score, recency, frequency, importance_weight, age
        );
    }

    /// More recorded accesses can never lower an item's score.
    #[test]
    fn score_monotone_in_access_count(
        access_count in 0u64..=10_000,
        extra in 1u64..=10_000,
        idle_secs in 0i64..=100_000_000,
        age_secs in 0i64..=100_000_000,
        importance in 0.0f64..=1.0,
    ) {
        let scorer = WeightedScorer::new(ScoringWeights::default());
        let now = Utc::now();

        let quiet = item_with(importance, access_count, idle_secs, age_secs, now);
        let busy = item_with(importance, access_count + extra, idle_secs, age_secs, now);

        prop_assert!(
            scorer.score(&busy, now) >= scorer.score(&quiet, now),
            "extra accesses lowered the score"
        );
    }

    /// Sitting idle longer can never raise an item's score.
    #[test]
    fn score_antitone_in_idle_time(
        idle_secs in 0i64..=100_000_000,
        extra_idle in 1i64..=100_000_000,
        access_count in 0u64..=10_000,
        age_secs in 0i64..=100_000_000,
        importance in 0.0f64..=1.0,
    ) {
        let scorer = WeightedScorer::new(ScoringWeights::default());
        let now = Utc::now();

        let fresh = item_with(importance, access_count, idle_secs, age_secs, now);
        let stale = item_with(importance, access_count, idle_secs + extra_idle, age_secs, now);

        prop_assert!(
            scorer.score(&stale, now) <= scorer.score(&fresh, now),
            "longer idle time raised the score"
        );
    }

    /// Normalization always lands the weight mass on 1.0 when any weight
    /// is non-zero, so presets and custom weights score on the same scale.
    #[test]
    fn weights_normalize_to_unit_sum(
        recency in 0.0f64..=1.0,
        frequency in 0.0f64..=1.0,
        importance in 0.0f64..=1.0,
        age in 0.0f64..=1.0,
    ) {
        let weights = ScoringWeights { recency, frequency, importance, age };
        let norm = weights.normalized();
        let sum = norm.recency + norm.frequency + norm.importance + norm.age;

        if recency + frequency + importance + age > 0.0 {
            prop_assert!((sum - 1.0).abs() < 1e-9, "normalized sum {}", sum);
        } else {
            prop_assert_eq!(sum, 0.0);
        }
    }
}
