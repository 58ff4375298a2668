/// Configuration for the memory manager.
///
/// All tunables live here: scoring weights, lifecycle thresholds, quota
/// defaults, and retention windows. Nothing in the invariant-enforcing code
/// hard-codes these values; components take a config at construction and the
/// defaults below are only a starting point.
///
/// Weights can be selected by preset name or overridden per component via
/// `ENGRAM_*` environment variables.
use crate::error::{EngramError, EngramResult};
use crate::types::MemoryTier;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Weights for the meditation scoring formula.
///
/// `score = recency·r + frequency·f + importance·i − age·a`, where each
/// component signal is normalized to `[0, 1]`. Weights are validated
/// (each in `[0, 1]`, at least one non-zero) and normalized to sum 1.0
/// before use, so presets and hand-rolled weights are comparable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    /// Weight on the recency-of-access signal
    pub recency: f64,

    /// Weight on the access-frequency signal
    pub frequency: f64,

    /// Weight on the caller-supplied importance hint
    pub importance: f64,

    /// Weight on the age penalty (subtractive)
    pub age: f64,
}

impl ScoringWeights {
    /// Named preset lookup.
    ///
    /// Available presets: `balanced` (default), `task-focused`,
    /// `feedback-driven`, `fresh-context`, `archival`.
    pub fn preset(name: &str) -> Option<Self> {
        let weights = match name {
            "balanced" => Self {
                recency: 0.4,
                frequency: 0.3,
                importance: 0.2,
                age: 0.1,
            },
            "task-focused" => Self {
                recency: 0.2,
                frequency: 0.2,
                importance: 0.5,
                age: 0.1,
            },
            "feedback-driven" => Self {
                recency: 0.2,
                frequency: 0.5,
                importance: 0.2,
                age: 0.1,
            },
            "fresh-context" => Self {
                recency: 0.6,
                frequency: 0.1,
                importance: 0.1,
                age: 0.2,
            },
            "archival" => Self {
                recency: 0.3,
                frequency: 0.3,
                importance: 0.4,
                age: 0.0,
            },
            _ => return None,
        };
        Some(weights)
    }

    /// Load weights from the environment.
    ///
    /// `ENGRAM_SCORING_PRESET` selects a base preset; individual
    /// `ENGRAM_WEIGHT_{RECENCY,FREQUENCY,IMPORTANCE,AGE}` variables override
    /// single components on top of it. Unparseable values are skipped with a
    /// warning rather than failing startup.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load weights through an arbitrary key lookup (tested directly).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut weights = match lookup("ENGRAM_SCORING_PRESET") {
            Some(name) => Self::preset(&name).unwrap_or_else(|| {
                warn!(preset = %name, "Unknown scoring preset, using balanced");
                Self::default()
            }),
            None => Self::default(),
        };

        let mut apply = |key: &str, slot: &mut f64| {
            if let Some(raw) = lookup(key) {
                match raw.parse::<f64>() {
                    Ok(v) => *slot = v,
                    Err(_) => warn!(key, value = %raw, "Ignoring unparseable weight override"),
                }
            }
        };

        apply("ENGRAM_WEIGHT_RECENCY", &mut weights.recency);
        apply("ENGRAM_WEIGHT_FREQUENCY", &mut weights.frequency);
        apply("ENGRAM_WEIGHT_IMPORTANCE", &mut weights.importance);
        apply("ENGRAM_WEIGHT_AGE", &mut weights.age);

        weights
    }

    /// Validate weight ranges.
    ///
    /// Every weight must lie in `[0, 1]` and at least one must be non-zero.
    pub fn validate(&self) -> EngramResult<()> {
        let components = [
            ("recency", self.recency),
            ("frequency", self.frequency),
            ("importance", self.importance),
            ("age", self.age),
        ];

        for (name, value) in components {
            if !(0.0..=1.0).contains(&value) || !value.is_finite() {
                return Err(EngramError::ValidationError {
                    reason: format!("weight '{name}' must be in [0, 1], got {value}"),
                });
            }
        }

        if components.iter().all(|(_, v)| *v == 0.0) {
            return Err(EngramError::ValidationError {
                reason: "at least one scoring weight must be non-zero".to_string(),
            });
        }

        Ok(())
    }

    /// Return a copy normalized so the weights sum to 1.0.
    pub fn normalized(&self) -> Self {
        let sum = self.recency + self.frequency + self.importance + self.age;
        if sum == 0.0 {
            return *self;
        }
        Self {
            recency: self.recency / sum,
            frequency: self.frequency / sum,
            importance: self.importance / sum,
            age: self.age / sum,
        }
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self::preset("balanced").unwrap()
    }
}

/// Meditation engine configuration.
#[derive(Debug, Clone)]
pub struct MeditationConfig {
    /// Score at or above which an ephemeral item is promoted
    pub promote_threshold: f64,

    /// Score below which a durable item is demoted toward Object
    pub demote_threshold: f64,

    /// Score below which a durable item is pruned outright
    pub prune_threshold: f64,

    /// Maximum owner partitions processed concurrently
    pub max_concurrent_partitions: usize,

    /// Retry attempts for a failed partition before reporting failure
    pub max_retries: u32,

    /// Base delay for exponential backoff between retries
    pub retry_base_delay_ms: u64,
}

impl Default for MeditationConfig {
    fn default() -> Self {
        Self {
            promote_threshold: 0.6,
            demote_threshold: 0.3,
            prune_threshold: 0.1,
            max_concurrent_partitions: 4,
            max_retries: 3,
            retry_base_delay_ms: 100,
        }
    }
}

impl MeditationConfig {
    /// Validate threshold ordering: promote > demote > prune.
    pub fn validate(&self) -> EngramResult<()> {
        if self.demote_threshold >= self.promote_threshold {
            return Err(EngramError::ValidationError {
                reason: format!(
                    "demote threshold {} must be below promote threshold {}",
                    self.demote_threshold, self.promote_threshold
                ),
            });
        }
        if self.prune_threshold >= self.demote_threshold {
            return Err(EngramError::ValidationError {
                reason: format!(
                    "prune threshold {} must be below demote threshold {}",
                    self.prune_threshold, self.demote_threshold
                ),
            });
        }
        Ok(())
    }
}

/// Per-tier default quota limits in bytes.
///
/// Limits apply per owner; the quota manager accepts per-owner overrides at
/// runtime on top of these defaults.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    /// Default Short-tier limit per owner
    pub short_limit: u64,

    /// Default Long-tier limit per owner
    pub long_limit: u64,

    /// Default Object-tier limit per owner
    pub object_limit: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            short_limit: 4 * 1024 * 1024,        // 4 MiB of working set
            long_limit: 256 * 1024 * 1024,       // 256 MiB durable
            object_limit: 1024 * 1024 * 1024,    // 1 GiB archived
        }
    }
}

impl QuotaConfig {
    /// Default limit for a tier.
    pub fn default_limit(&self, tier: MemoryTier) -> u64 {
        match tier {
            MemoryTier::Short => self.short_limit,
            MemoryTier::Long => self.long_limit,
            MemoryTier::Object => self.object_limit,
        }
    }
}

/// Retention windows per storage class.
///
/// The Short TTL is enforced by the ephemeral store itself; the Long window
/// feeds the age signal of scoring. Audit retention marks the compaction
/// boundary for ledger segments and never permits mid-file rewriting.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// TTL for Short-tier items
    pub short_ttl: Duration,

    /// Retention window for Long-tier items
    pub long_retention: Duration,

    /// Retention window for audit ledger segments
    pub audit_retention: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            short_ttl: Duration::days(7),
            long_retention: Duration::days(365),
            audit_retention: Duration::days(730),
        }
    }
}

/// Background task cadence.
///
/// Applies to registries opened with a data directory; ephemeral
/// registries run no background tasks.
#[derive(Debug, Clone)]
pub struct TaskConfig {
    /// How often the meditation pass runs
    pub meditation_interval: Duration,

    /// How often expired Short-tier items are swept
    pub sweep_interval: Duration,

    /// How often snapshots are written
    pub save_interval: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            meditation_interval: Duration::hours(1),
            sweep_interval: Duration::minutes(10),
            save_interval: Duration::minutes(5),
        }
    }
}

/// Short-tier store configuration.
#[derive(Debug, Clone)]
pub struct ShortTierConfig {
    /// Maximum number of entries held
    pub capacity: usize,

    /// Largest payload accepted, in bytes
    ///
    /// Also bounds what a consent revocation may demote back into the
    /// ephemeral tier; larger sensitive payloads are deleted instead.
    pub max_value_size: u64,
}

impl Default for ShortTierConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_value_size: 512 * 1024, // 512 KiB
        }
    }
}

/// Top-level configuration aggregating every component's tunables.
#[derive(Debug, Clone, Default)]
pub struct EngramConfig {
    /// Quota defaults
    pub quota: QuotaConfig,

    /// Meditation thresholds and retry policy
    pub meditation: MeditationConfig,

    /// Scoring weights (preset or custom)
    pub scoring: ScoringWeights,

    /// Retention windows
    pub retention: RetentionConfig,

    /// Short-tier store settings
    pub short_tier: ShortTierConfig,

    /// Background task cadence
    pub tasks: TaskConfig,
}

impl EngramConfig {
    /// Build a config from defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self {
            scoring: ScoringWeights::from_env(),
            ..Self::default()
        }
    }

    /// Validate the aggregate configuration.
    pub fn validate(&self) -> EngramResult<()> {
        self.scoring.validate()?;
        self.meditation.validate()?;
        Ok(())
    }
}
