/// The meditation pass: score every live item, then promote, archive, or
/// prune according to the configured thresholds.
///
/// Owner partitions are independent: each is scanned, planned, and applied
/// on its own, with bounded retries, so one owner's failure never blocks
/// another's pass. Transitions go through the registry and inherit its
/// audit and quota discipline, which also makes a re-run over an already
/// settled partition a no-op.
use crate::config::{MeditationConfig, ScoringWeights};
use crate::error::{EngramError, EngramResult};
use crate::registry::{ACTOR_MEDITATION, MemoryRegistry};
use crate::types::{ItemId, LifecycleState, MemoryItem, OwnerId};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Days over which the recency signal decays to 1/e.
const RECENCY_DECAY_DAYS: f64 = 7.0;

/// Access count at which the frequency signal reaches 0.5.
const FREQUENCY_PIVOT: f64 = 10.0;

/// Longest backoff doubling applied between partition retries.
const MAX_BACKOFF_SHIFT: u32 = 10;

// ============================================================================
// Scoring
// ============================================================================

/// Scores an item for lifecycle decisions. Higher keeps, lower evicts.
pub trait ScoringStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Score relative to `now`. Implementations should stay within
    /// `[-1.0, 1.0]` so the configured thresholds remain meaningful.
    fn score(&self, item: &MemoryItem, now: DateTime<Utc>) -> f64;
}

/// The default weighted-linear scorer.
///
/// `score = w_r·recency + w_f·frequency + w_i·importance − w_a·age`
///
/// Component signals, each in `[0, 1]`:
/// - recency: exponential decay of days since last access
/// - frequency: access count saturating at `n / (n + 10)`
/// - importance: the caller-supplied hint, clamped
/// - age: days since creation against the retention horizon, clamped
pub struct WeightedScorer {
    weights: ScoringWeights,
    age_horizon_days: f64,
}

impl WeightedScorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self::with_age_horizon(weights, Duration::days(365))
    }

    /// Use the given retention window as the age horizon: an item that old
    /// carries the full age penalty.
    pub fn with_age_horizon(weights: ScoringWeights, horizon: Duration) -> Self {
        Self {
            weights: weights.normalized(),
            age_horizon_days: (horizon.num_days() as f64).max(1.0),
        }
    }
}

impl ScoringStrategy for WeightedScorer {
    fn name(&self) -> &str {
        "weighted"
    }

    fn score(&self, item: &MemoryItem, now: DateTime<Utc>) -> f64 {
        let days_idle =
            (now - item.last_accessed_at).num_seconds().max(0) as f64 / 86_400.0;
        let recency = (-days_idle / RECENCY_DECAY_DAYS).exp();

        let n = item.access_count as f64;
        let frequency = n / (n + FREQUENCY_PIVOT);

        let importance = item.importance.clamp(0.0, 1.0);

        let age_days = (now - item.created_at).num_seconds().max(0) as f64 / 86_400.0;
        let age = (age_days / self.age_horizon_days).min(1.0);

        let w = &self.weights;
        w.recency * recency + w.frequency * frequency + w.importance * importance - w.age * age
    }
}

// ============================================================================
// Planning
// ============================================================================

/// What one pass decided for one owner, before applying anything.
#[derive(Debug, Default, PartialEq)]
struct PartitionPlan {
    /// Ephemeral items scoring at or above the promote threshold
    promotes: Vec<ItemId>,
    /// Persisted items scoring below the demote threshold
    archives: Vec<ItemId>,
    /// Durable items scoring below the prune threshold
    prunes: Vec<ItemId>,
    /// Persisted keepers by ascending score, for quota-pressure eviction
    eviction_candidates: Vec<ItemId>,
    /// Items excluded by protection or a missing consent
    skipped: usize,
}

/// Pure planning over a scored snapshot. Protection exempts items from
/// demotion and pruning only; promotion additionally requires that durable
/// persistence is allowed for the item.
fn plan_partition(scored: &[(MemoryItem, f64)], config: &MeditationConfig) -> PartitionPlan {
    let mut plan = PartitionPlan::default();
    let mut keepers: Vec<(f64, ItemId)> = Vec::new();

    for (item, score) in scored {
        match item.state {
            LifecycleState::Ephemeral => {
                if *score < config.promote_threshold {
                    continue;
                }
                if item.durable_persistence_allowed() {
                    plan.promotes.push(item.id.clone());
                } else {
                    plan.skipped += 1;
                }
            }
            LifecycleState::Persisted => {
                if *score < config.prune_threshold {
                    if item.protected {
                        plan.skipped += 1;
                    } else {
                        plan.prunes.push(item.id.clone());
                    }
                } else if *score < config.demote_threshold {
                    if item.protected {
                        plan.skipped += 1;
                    } else {
                        plan.archives.push(item.id.clone());
                    }
                } else if !item.protected {
                    keepers.push((*score, item.id.clone()));
                }
            }
            LifecycleState::Archived => {
                if *score < config.prune_threshold {
                    if item.protected {
                        plan.skipped += 1;
                    } else {
                        plan.prunes.push(item.id.clone());
                    }
                }
            }
            LifecycleState::Pruned => {}
        }
    }

    keepers.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    plan.eviction_candidates = keepers.into_iter().map(|(_, id)| id).collect();
    plan
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome of one owner partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartitionReport {
    pub owner: OwnerId,
    pub scanned: usize,
    pub promoted: usize,
    pub archived: usize,
    pub pruned: usize,
    pub skipped: usize,
    pub retries: u32,
}

/// Outcome of a full meditation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeditationReport {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub partitions: Vec<PartitionReport>,
    /// Owners whose partition still failed after all retries
    pub failed_partitions: Vec<OwnerId>,
}

impl MeditationReport {
    pub fn promoted(&self) -> usize {
        self.partitions.iter().map(|p| p.promoted).sum()
    }

    pub fn archived(&self) -> usize {
        self.partitions.iter().map(|p| p.archived).sum()
    }

    pub fn pruned(&self) -> usize {
        self.partitions.iter().map(|p| p.pruned).sum()
    }

    pub fn scanned(&self) -> usize {
        self.partitions.iter().map(|p| p.scanned).sum()
    }

    pub fn transitions(&self) -> usize {
        self.promoted() + self.archived() + self.pruned()
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct MeditationEngine {
    registry: Arc<MemoryRegistry>,
    scorer: Arc<dyn ScoringStrategy>,
    config: MeditationConfig,
}

impl MeditationEngine {
    pub fn new(registry: Arc<MemoryRegistry>) -> Self {
        let config = registry.config();
        let scorer = WeightedScorer::with_age_horizon(
            config.scoring,
            config.retention.long_retention,
        );
        Self {
            scorer: Arc::new(scorer),
            config: config.meditation.clone(),
            registry,
        }
    }

    /// Swap the scoring strategy.
    pub fn with_scorer(mut self, scorer: Arc<dyn ScoringStrategy>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn scorer_name(&self) -> &str {
        self.scorer.name()
    }

    /// Run one pass over every owner, partitions in parallel up to the
    /// configured width. Failures are reported, never propagated.
    pub async fn run_all(&self) -> MeditationReport {
        let started_at = Utc::now();
        let owners = self.registry.owners();
        let mut report = MeditationReport {
            started_at: Some(started_at),
            ..MeditationReport::default()
        };

        let mut outcomes = stream::iter(owners)
            .map(|owner| async move {
                let partition = self.run_owner(&owner).await;
                (owner, partition)
            })
            .buffer_unordered(self.config.max_concurrent_partitions.max(1));

        while let Some((owner, outcome)) = outcomes.next().await {
            match outcome {
                Ok(partition) => report.partitions.push(partition),
                Err(e) => {
                    warn!(owner = %owner, error = %e, "partition failed after retries");
                    report.failed_partitions.push(owner);
                }
            }
        }

        report.finished_at = Some(Utc::now());
        self.registry
            .metrics()
            .meditation_passes
            .fetch_add(1, Ordering::Relaxed);
        info!(
            owners = report.partitions.len(),
            promoted = report.promoted(),
            archived = report.archived(),
            pruned = report.pruned(),
            failed = report.failed_partitions.len(),
            "meditation pass complete"
        );
        report
    }

    /// Run one owner's partition, retrying with exponential backoff and
    /// jitter on failure.
    pub async fn run_owner(&self, owner: &str) -> EngramResult<PartitionReport> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.run_partition(owner).await {
                Ok(mut report) => {
                    report.retries = attempt - 1;
                    return Ok(report);
                }
                Err(e) if attempt <= self.config.max_retries => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        owner = %owner,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "partition attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> std::time::Duration {
        let shift = (attempt - 1).min(MAX_BACKOFF_SHIFT);
        let base = std::time::Duration::from_millis(self.config.retry_base_delay_ms);
        let delay = base.saturating_mul(1u32 << shift);
        let jitter_cap = (delay.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_cap);
        delay + std::time::Duration::from_millis(jitter)
    }

    /// Score, plan, and apply one partition. A single attempt; item-level
    /// quota refusals and races are skips, infrastructure errors abort.
    async fn run_partition(&self, owner: &str) -> EngramResult<PartitionReport> {
        let now = Utc::now();
        let items = self.registry.live_items(owner);
        let mut report = PartitionReport {
            owner: owner.to_string(),
            scanned: items.len(),
            ..PartitionReport::default()
        };
        if items.is_empty() {
            return Ok(report);
        }

        let scored: Vec<(MemoryItem, f64)> = items
            .into_iter()
            .map(|item| {
                let score = self.scorer.score(&item, now);
                self.registry.record_score(&item.id, score);
                (item, score)
            })
            .collect();

        let mut plan = plan_partition(&scored, &self.config);
        report.skipped = plan.skipped;
        debug!(
            owner = %owner,
            promotes = plan.promotes.len(),
            archives = plan.archives.len(),
            prunes = plan.prunes.len(),
            "partition planned"
        );

        // Prunes and archives first: they free quota the promotions need.
        for id in &plan.prunes {
            match self.registry.prune(id, ACTOR_MEDITATION).await {
                Ok(true) => report.pruned += 1,
                Ok(false) => report.skipped += 1,
                Err(EngramError::NotFound { .. }) => report.skipped += 1,
                Err(e) => return Err(e),
            }
        }

        for id in &plan.archives {
            match self.registry.archive(id, ACTOR_MEDITATION).await {
                Ok(true) => report.archived += 1,
                Ok(false) => report.skipped += 1,
                Err(
                    EngramError::NotFound { .. }
                    | EngramError::QuotaExceeded { .. }
                    | EngramError::CapacityExceeded { .. },
                ) => report.skipped += 1,
                Err(e) => return Err(e),
            }
        }

        for id in &plan.promotes {
            match self.registry.promote(id, ACTOR_MEDITATION).await {
                Ok(true) => report.promoted += 1,
                Ok(false) => report.skipped += 1,
                Err(EngramError::QuotaExceeded { .. }) => {
                    // Make room by archiving the coldest persisted keeper,
                    // then try once more.
                    if self.evict_one(&mut plan.eviction_candidates, &mut report).await? {
                        match self.registry.promote(id, ACTOR_MEDITATION).await {
                            Ok(true) => report.promoted += 1,
                            Ok(false) | Err(EngramError::QuotaExceeded { .. }) => {
                                report.skipped += 1
                            }
                            Err(EngramError::NotFound { .. } | EngramError::ConsentRequired { .. }) => {
                                report.skipped += 1
                            }
                            Err(e) => return Err(e),
                        }
                    } else {
                        report.skipped += 1;
                    }
                }
                Err(
                    EngramError::NotFound { .. }
                    | EngramError::ConsentRequired { .. }
                    | EngramError::CapacityExceeded { .. },
                ) => report.skipped += 1,
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Archive the lowest-scored eviction candidate. Returns whether any
    /// space could be freed.
    async fn evict_one(
        &self,
        candidates: &mut Vec<ItemId>,
        report: &mut PartitionReport,
    ) -> EngramResult<bool> {
        while !candidates.is_empty() {
            let id = candidates.remove(0);
            match self.registry.archive(&id, ACTOR_MEDITATION).await {
                Ok(true) => {
                    debug!(item = %id, "archived under quota pressure");
                    report.archived += 1;
                    return Ok(true);
                }
                Ok(false) => continue,
                Err(
                    EngramError::NotFound { .. }
                    | EngramError::QuotaExceeded { .. }
                    | EngramError::CapacityExceeded { .. },
                ) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngramConfig;
    use crate::registry::CreateOptions;
    use crate::types::{Category, MemoryTier};
    use std::collections::HashMap;

    fn item(id: &str, state: LifecycleState) -> MemoryItem {
        let now = Utc::now();
        MemoryItem {
            id: id.to_string(),
            owner: "u1".to_string(),
            tier: state.resident_tier().unwrap_or(MemoryTier::Short),
            content: crate::types::ContentRef::Inline(id.to_string()),
            embedding: None,
            category: Category::Plain,
            consent: false,
            protected: false,
            importance: 0.5,
            score: 0.0,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            size: 1,
            state,
            tombstone_seq: None,
        }
    }

    // ------------------------------------------------------------------
    // Scorer
    // ------------------------------------------------------------------

    #[test]
    fn test_fresh_accessed_item_scores_high() {
        let scorer = WeightedScorer::new(ScoringWeights::default());
        let now = Utc::now();

        let mut hot = item("hot", LifecycleState::Ephemeral);
        hot.access_count = 50;
        hot.importance = 0.9;

        let mut cold = item("cold", LifecycleState::Ephemeral);
        cold.created_at = now - Duration::days(300);
        cold.last_accessed_at = now - Duration::days(300);
        cold.importance = 0.1;

        let hot_score = scorer.score(&hot, now);
        let cold_score = scorer.score(&cold, now);
        assert!(hot_score > 0.6, "hot item scored {hot_score}");
        assert!(cold_score < 0.1, "cold item scored {cold_score}");
    }

    #[test]
    fn test_frequency_signal_saturates() {
        let scorer = WeightedScorer::new(ScoringWeights {
            recency: 0.0,
            frequency: 1.0,
            importance: 0.0,
            age: 0.0,
        });
        let now = Utc::now();

        let mut prev = -1.0;
        for count in [0u64, 1, 10, 100, 10_000] {
            let mut it = item("i", LifecycleState::Ephemeral);
            it.access_count = count;
            let score = scorer.score(&it, now);
            assert!(score > prev, "frequency signal must be monotonic");
            assert!(score <= 1.0);
            prev = score;
        }
        assert!(prev > 0.99, "heavy access should approach 1.0, got {prev}");
    }

    #[test]
    fn test_idle_decay_lowers_score() {
        let scorer = WeightedScorer::new(ScoringWeights::default());
        let now = Utc::now();

        let fresh = item("a", LifecycleState::Persisted);
        let mut idle = item("b", LifecycleState::Persisted);
        idle.last_accessed_at = now - Duration::days(30);

        assert!(scorer.score(&fresh, now) > scorer.score(&idle, now));
    }

    #[test]
    fn test_age_horizon_caps_penalty() {
        let scorer = WeightedScorer::with_age_horizon(
            ScoringWeights {
                recency: 0.0,
                frequency: 0.0,
                importance: 0.0,
                age: 1.0,
            },
            Duration::days(10),
        );
        let now = Utc::now();

        let mut ancient = item("a", LifecycleState::Persisted);
        ancient.created_at = now - Duration::days(5000);
        // Fully aged, penalty clamps at the whole weight.
        assert!((scorer.score(&ancient, now) + 1.0).abs() < 1e-9);
    }

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------

    fn config() -> MeditationConfig {
        MeditationConfig::default()
    }

    #[test]
    fn test_plan_routes_by_threshold() {
        let scored = vec![
            (item("promote", LifecycleState::Ephemeral), 0.8),
            (item("stay-eph", LifecycleState::Ephemeral), 0.5),
            (item("keep", LifecycleState::Persisted), 0.7),
            (item("archive", LifecycleState::Persisted), 0.2),
            (item("prune", LifecycleState::Persisted), 0.05),
            (item("prune-arch", LifecycleState::Archived), 0.01),
        ];

        let plan = plan_partition(&scored, &config());
        assert_eq!(plan.promotes, vec!["promote"]);
        assert_eq!(plan.archives, vec!["archive"]);
        assert_eq!(plan.prunes, vec!["prune", "prune-arch"]);
        assert_eq!(plan.eviction_candidates, vec!["keep"]);
        assert_eq!(plan.skipped, 0);
    }

    #[test]
    fn test_plan_exempts_protected_from_demotion_and_prune() {
        let mut shielded = item("shielded", LifecycleState::Persisted);
        shielded.protected = true;
        let scored = vec![(shielded, 0.0)];

        let plan = plan_partition(&scored, &config());
        assert!(plan.archives.is_empty());
        assert!(plan.prunes.is_empty());
        assert!(plan.eviction_candidates.is_empty());
        assert_eq!(plan.skipped, 1);
    }

    #[test]
    fn test_plan_still_promotes_protected() {
        let mut shielded = item("shielded", LifecycleState::Ephemeral);
        shielded.protected = true;
        let plan = plan_partition(&[(shielded, 0.9)], &config());
        assert_eq!(plan.promotes, vec!["shielded"]);
    }

    #[test]
    fn test_plan_withholds_sensitive_without_consent() {
        let mut secret = item("secret", LifecycleState::Ephemeral);
        secret.category = Category::Sensitive;
        secret.consent = false;
        let plan = plan_partition(&[(secret, 0.9)], &config());
        assert!(plan.promotes.is_empty());
        assert_eq!(plan.skipped, 1);
    }

    #[test]
    fn test_eviction_candidates_sorted_coldest_first() {
        let scored = vec![
            (item("warm", LifecycleState::Persisted), 0.5),
            (item("hot", LifecycleState::Persisted), 0.9),
            (item("cool", LifecycleState::Persisted), 0.35),
        ];
        let plan = plan_partition(&scored, &config());
        assert_eq!(plan.eviction_candidates, vec!["cool", "warm", "hot"]);
    }

    // ------------------------------------------------------------------
    // Engine
    // ------------------------------------------------------------------

    /// Per-item fixed scores for deterministic transition tests.
    struct MapScorer {
        scores: HashMap<String, f64>,
        default: f64,
    }

    impl MapScorer {
        fn new(default: f64) -> Self {
            Self {
                scores: HashMap::new(),
                default,
            }
        }

        fn set(mut self, id: &str, score: f64) -> Self {
            self.scores.insert(id.to_string(), score);
            self
        }
    }

    impl ScoringStrategy for MapScorer {
        fn name(&self) -> &str {
            "map"
        }

        fn score(&self, item: &MemoryItem, _now: DateTime<Utc>) -> f64 {
            self.scores.get(&item.id).copied().unwrap_or(self.default)
        }
    }

    async fn registry() -> Arc<MemoryRegistry> {
        Arc::new(
            MemoryRegistry::in_memory(EngramConfig::default())
                .await
                .unwrap(),
        )
    }

    fn opts(id: &str) -> CreateOptions {
        CreateOptions::new().id(id)
    }

    #[tokio::test]
    async fn test_pass_promotes_hot_item_exactly_once() {
        let reg = registry().await;
        reg.create("u1", b"hot note", opts("hot").importance(0.9))
            .await
            .unwrap();
        reg.touch("u1", "hot").unwrap();

        let engine = MeditationEngine::new(Arc::clone(&reg));
        let report = engine.run_owner("u1").await.unwrap();

        assert_eq!(report.promoted, 1);
        let item = reg.get("u1", "hot").unwrap();
        assert_eq!(item.state, LifecycleState::Persisted);
        assert!(item.score > 0.6);
        assert_eq!(reg.index().len(), 1);
        assert_eq!(
            reg.ledger()
                .query_by_item("hot")
                .iter()
                .filter(|e| e.action == crate::audit::AuditAction::Promote)
                .count(),
            1
        );

        // A second pass over the settled partition changes nothing.
        let ledger_len = reg.ledger().len();
        let again = engine.run_owner("u1").await.unwrap();
        assert_eq!(again.promoted + again.archived + again.pruned, 0);
        assert_eq!(reg.ledger().len(), ledger_len);
        assert_eq!(reg.index().len(), 1);
    }

    #[tokio::test]
    async fn test_unimportant_item_stays_ephemeral() {
        let reg = registry().await;
        reg.create("u1", b"meh", opts("meh").importance(0.0))
            .await
            .unwrap();

        let engine = MeditationEngine::new(Arc::clone(&reg));
        let report = engine.run_owner("u1").await.unwrap();

        assert_eq!(report.promoted, 0);
        assert_eq!(
            reg.get("u1", "meh").unwrap().state,
            LifecycleState::Ephemeral
        );
    }

    #[tokio::test]
    async fn test_cold_persisted_item_is_archived_then_pruned() {
        let reg = registry().await;
        reg.create("u1", b"fading", opts("a")).await.unwrap();
        reg.promote("a", ACTOR_MEDITATION).await.unwrap();

        let engine = MeditationEngine::new(Arc::clone(&reg))
            .with_scorer(Arc::new(MapScorer::new(0.2)));
        let report = engine.run_owner("u1").await.unwrap();
        assert_eq!(report.archived, 1);
        assert_eq!(reg.get("u1", "a").unwrap().state, LifecycleState::Archived);

        let engine = MeditationEngine::new(Arc::clone(&reg))
            .with_scorer(Arc::new(MapScorer::new(0.05)));
        let report = engine.run_owner("u1").await.unwrap();
        assert_eq!(report.pruned, 1);
        assert!(reg.get("u1", "a").unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn test_protected_item_survives_low_scores() {
        let reg = registry().await;
        reg.create("u1", b"keep me", opts("a").protected(true))
            .await
            .unwrap();
        reg.promote("a", ACTOR_MEDITATION).await.unwrap();

        let engine = MeditationEngine::new(Arc::clone(&reg))
            .with_scorer(Arc::new(MapScorer::new(0.0)));
        let report = engine.run_owner("u1").await.unwrap();

        assert_eq!(report.pruned, 0);
        assert_eq!(report.archived, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(reg.get("u1", "a").unwrap().state, LifecycleState::Persisted);
    }

    #[tokio::test]
    async fn test_sensitive_without_consent_never_leaves_short() {
        let reg = registry().await;
        reg.create(
            "u1",
            b"secret",
            opts("s").category(Category::Sensitive).consent(false),
        )
        .await
        .unwrap();

        let engine = MeditationEngine::new(Arc::clone(&reg))
            .with_scorer(Arc::new(MapScorer::new(0.95)));
        let report = engine.run_owner("u1").await.unwrap();

        assert_eq!(report.promoted, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(reg.get("u1", "s").unwrap().tier, MemoryTier::Short);
    }

    #[tokio::test]
    async fn test_quota_pressure_archives_coldest_keeper() {
        let reg = registry().await;
        reg.create("u1", &[1u8; 400], opts("old-cold")).await.unwrap();
        reg.create("u1", &[2u8; 400], opts("old-warm")).await.unwrap();
        reg.promote("old-cold", ACTOR_MEDITATION).await.unwrap();
        reg.promote("old-warm", ACTOR_MEDITATION).await.unwrap();

        // Long tier now holds 800 bytes; cap it so nothing more fits.
        reg.quota()
            .set_limit(&"u1".to_string(), MemoryTier::Long, 1000);
        reg.create("u1", &[3u8; 400], opts("new-hot")).await.unwrap();

        let scorer = MapScorer::new(0.5)
            .set("new-hot", 0.9)
            .set("old-cold", 0.45)
            .set("old-warm", 0.7);
        let engine =
            MeditationEngine::new(Arc::clone(&reg)).with_scorer(Arc::new(scorer));
        let report = engine.run_owner("u1").await.unwrap();

        // The coldest keeper moved to Object to admit the hot item.
        assert_eq!(report.promoted, 1);
        assert_eq!(report.archived, 1);
        assert_eq!(
            reg.get("u1", "old-cold").unwrap().state,
            LifecycleState::Archived
        );
        assert_eq!(
            reg.get("u1", "old-warm").unwrap().state,
            LifecycleState::Persisted
        );
        assert_eq!(
            reg.get("u1", "new-hot").unwrap().state,
            LifecycleState::Persisted
        );
    }

    #[tokio::test]
    async fn test_run_all_partitions_owners_independently() {
        let reg = registry().await;
        reg.create("u1", b"one", opts("a").importance(1.0)).await.unwrap();
        reg.touch("u1", "a").unwrap();
        reg.create("u2", b"two", opts("b").importance(0.0)).await.unwrap();

        let engine = MeditationEngine::new(Arc::clone(&reg));
        let report = engine.run_all().await;

        assert_eq!(report.partitions.len(), 2);
        assert_eq!(report.promoted(), 1);
        assert!(report.failed_partitions.is_empty());
        assert_eq!(reg.metrics().snapshot().meditation_passes, 1);

        let u1 = report
            .partitions
            .iter()
            .find(|p| p.owner == "u1")
            .unwrap();
        assert_eq!(u1.promoted, 1);
    }
}
