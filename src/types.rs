/// Core types for the memory manager.
///
/// This module defines the item metadata record, the storage tiers, and the
/// lifecycle state machine. Everything else in the crate moves these values
/// around; the legality of a lifecycle transition is decided here and nowhere
/// else.
use crate::vector::Embedding;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable item identifier, unique across the whole store. A random UUID
/// unless the caller supplies one.
pub type ItemId = String;

/// Owner identifier; the unit of quota accounting and meditation partitioning.
pub type OwnerId = String;

/// The three storage classes, ordered by durability.
///
/// A closed set: tier-specific behavior dispatches on this enum rather than
/// on trait objects, so adding a tier is a compile-time event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryTier {
    /// Ephemeral key-value tier (in-memory, TTL, may lose data on restart)
    Short,
    /// Durable record tier with vector search
    Long,
    /// Content-addressed blob tier (durable, out of active search)
    Object,
}

impl MemoryTier {
    /// All tiers, in promotion order.
    pub fn all() -> [MemoryTier; 3] {
        [MemoryTier::Short, MemoryTier::Long, MemoryTier::Object]
    }

    /// Whether payloads in this tier survive a restart.
    pub fn is_durable(&self) -> bool {
        !matches!(self, MemoryTier::Short)
    }
}

impl fmt::Display for MemoryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryTier::Short => write!(f, "short"),
            MemoryTier::Long => write!(f, "long"),
            MemoryTier::Object => write!(f, "object"),
        }
    }
}

impl FromStr for MemoryTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "short" => Ok(MemoryTier::Short),
            "long" => Ok(MemoryTier::Long),
            "object" => Ok(MemoryTier::Object),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Content classification controlling where an item may persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Ordinary content, persistable in any tier
    Plain,
    /// Content that may not leave the ephemeral tier without consent
    Sensitive,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Plain => write!(f, "plain"),
            Category::Sensitive => write!(f, "sensitive"),
        }
    }
}

/// Lifecycle state of an item.
///
/// The machine is `Ephemeral → Persisted → Archived → Pruned` with direct
/// prune edges from every live state, and demotion edges back to `Ephemeral`
/// for consent revocation. `Pruned` is terminal. The protected flag is a
/// modifier on the item, not a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// In the Short tier; initial state for all new items
    Ephemeral,
    /// In the Long tier with a vector index entry
    Persisted,
    /// In the Object tier; metadata retained, no vector entry
    Archived,
    /// Terminal tombstone; payload gone from every tier
    Pruned,
}

impl LifecycleState {
    /// The tier an item in this state resides in, if any.
    pub fn resident_tier(&self) -> Option<MemoryTier> {
        match self {
            LifecycleState::Ephemeral => Some(MemoryTier::Short),
            LifecycleState::Persisted => Some(MemoryTier::Long),
            LifecycleState::Archived => Some(MemoryTier::Object),
            LifecycleState::Pruned => None,
        }
    }

    /// Whether a direct transition to `next` is legal.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Ephemeral, Persisted)
                | (Ephemeral, Pruned)
                | (Persisted, Archived)
                | (Persisted, Ephemeral)
                | (Persisted, Pruned)
                | (Archived, Ephemeral)
                | (Archived, Pruned)
        )
    }

    /// Whether this state is the terminal tombstone.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Pruned)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Ephemeral => write!(f, "ephemeral"),
            LifecycleState::Persisted => write!(f, "persisted"),
            LifecycleState::Archived => write!(f, "archived"),
            LifecycleState::Pruned => write!(f, "pruned"),
        }
    }
}

/// Reference to an item's payload, shaped by the tier holding it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "lowercase")]
pub enum ContentRef {
    /// Key in the ephemeral store
    Inline(String),
    /// Record id in the durable store
    Record(String),
    /// SHA-256 hex digest of a blob
    Blob(String),
}

impl ContentRef {
    /// The tier this reference points into.
    pub fn tier(&self) -> MemoryTier {
        match self {
            ContentRef::Inline(_) => MemoryTier::Short,
            ContentRef::Record(_) => MemoryTier::Long,
            ContentRef::Blob(_) => MemoryTier::Object,
        }
    }

    /// The raw key/id/digest inside the tier.
    pub fn as_str(&self) -> &str {
        match self {
            ContentRef::Inline(s) | ContentRef::Record(s) | ContentRef::Blob(s) => s,
        }
    }
}

impl fmt::Display for ContentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tier(), self.as_str())
    }
}

/// Canonical metadata record for one memory item.
///
/// The registry holds the authoritative copy; the tier stores hold only
/// payload bytes. The `content` field is the single pointer deciding which
/// tier currently owns the payload (flipped atomically during moves).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryItem {
    /// Stable id, unique within the owner
    pub id: ItemId,

    /// Owning principal
    pub owner: OwnerId,

    /// Tier currently holding the payload
    pub tier: MemoryTier,

    /// Pointer to the payload within `tier`
    pub content: ContentRef,

    /// Embedding, present while the item is indexed for search
    pub embedding: Option<Embedding>,

    /// Content classification
    pub category: Category,

    /// Consent to persist beyond the ephemeral tier
    pub consent: bool,

    /// Exempt from automated pruning and demotion
    pub protected: bool,

    /// Caller-supplied importance hint (0.0 to 1.0)
    pub importance: f64,

    /// Last score computed by a meditation pass
    pub score: f64,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last read or write touch
    pub last_accessed_at: DateTime<Utc>,

    /// Number of accesses recorded via touch
    pub access_count: u64,

    /// Payload size in bytes, as accounted against quota
    pub size: u64,

    /// Lifecycle state
    pub state: LifecycleState,

    /// Ledger sequence of the final audit entry, set when pruned
    pub tombstone_seq: Option<u64>,
}

impl MemoryItem {
    /// Record an access: bump the counter and refresh the timestamp.
    pub fn mark_accessed(&mut self) {
        self.access_count += 1;
        self.last_accessed_at = Utc::now();
    }

    /// Whether this item may persist in a durable tier right now.
    ///
    /// Plain items always may; sensitive items require consent.
    pub fn durable_persistence_allowed(&self) -> bool {
        match self.category {
            Category::Plain => true,
            Category::Sensitive => self.consent,
        }
    }

    /// Time since creation.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
    }

    /// Time since the last access.
    pub fn idle(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.last_accessed_at)
    }

    /// Whether this item is a pruned tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item(category: Category, consent: bool) -> MemoryItem {
        let now = Utc::now();
        MemoryItem {
            id: "item-1".to_string(),
            owner: "u1".to_string(),
            tier: MemoryTier::Short,
            content: ContentRef::Inline("item-1".to_string()),
            embedding: None,
            category,
            consent,
            protected: false,
            importance: 0.5,
            score: 0.0,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            size: 128,
            state: LifecycleState::Ephemeral,
            tombstone_seq: None,
        }
    }

    #[test]
    fn test_tier_display_and_parse() {
        for tier in MemoryTier::all() {
            let parsed: MemoryTier = tier.to_string().parse().unwrap();
            assert_eq!(parsed, tier);
        }
        assert!("glacier".parse::<MemoryTier>().is_err());
    }

    #[test]
    fn test_tier_durability() {
        assert!(!MemoryTier::Short.is_durable());
        assert!(MemoryTier::Long.is_durable());
        assert!(MemoryTier::Object.is_durable());
    }

    #[test]
    fn test_transition_legality() {
        use LifecycleState::*;

        // Forward path
        assert!(Ephemeral.can_transition_to(Persisted));
        assert!(Persisted.can_transition_to(Archived));

        // Direct prune edges
        assert!(Ephemeral.can_transition_to(Pruned));
        assert!(Persisted.can_transition_to(Pruned));
        assert!(Archived.can_transition_to(Pruned));

        // Consent revocation returns to ephemeral
        assert!(Persisted.can_transition_to(Ephemeral));
        assert!(Archived.can_transition_to(Ephemeral));

        // Illegal: skipping states, resurrecting tombstones
        assert!(!Ephemeral.can_transition_to(Archived));
        assert!(!Archived.can_transition_to(Persisted));
        assert!(!Pruned.can_transition_to(Ephemeral));
        assert!(!Pruned.can_transition_to(Persisted));
        assert!(!Ephemeral.can_transition_to(Ephemeral));
    }

    #[test]
    fn test_state_resident_tier() {
        assert_eq!(
            LifecycleState::Ephemeral.resident_tier(),
            Some(MemoryTier::Short)
        );
        assert_eq!(
            LifecycleState::Persisted.resident_tier(),
            Some(MemoryTier::Long)
        );
        assert_eq!(
            LifecycleState::Archived.resident_tier(),
            Some(MemoryTier::Object)
        );
        assert_eq!(LifecycleState::Pruned.resident_tier(), None);
    }

    #[test]
    fn test_content_ref_tier() {
        assert_eq!(
            ContentRef::Inline("k".to_string()).tier(),
            MemoryTier::Short
        );
        assert_eq!(ContentRef::Record("k".to_string()).tier(), MemoryTier::Long);
        assert_eq!(
            ContentRef::Blob("ab12".to_string()).tier(),
            MemoryTier::Object
        );
    }

    #[test]
    fn test_consent_gates_durable_persistence() {
        assert!(sample_item(Category::Plain, false).durable_persistence_allowed());
        assert!(sample_item(Category::Sensitive, true).durable_persistence_allowed());
        assert!(!sample_item(Category::Sensitive, false).durable_persistence_allowed());
    }

    #[test]
    fn test_mark_accessed() {
        let mut item = sample_item(Category::Plain, true);
        let before = item.last_accessed_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        item.mark_accessed();
        assert_eq!(item.access_count, 1);
        assert!(item.last_accessed_at > before);
    }
}
