//! # Engram — Tiered Memory Manager
//!
//! Engram stores memories for many owners across three storage tiers and
//! moves them between tiers based on how much they are worth keeping:
//! - **Short** - ephemeral working memory (TTL, LRU-bounded, lost on restart)
//! - **Long** - durable records with vector-indexed recall
//! - **Object** - content-addressed archive for cold payloads
//!
//! Every lifecycle change lands in an append-only audit ledger before it is
//! acknowledged, per-owner quotas gate admission into each tier, and
//! sensitive payloads never leave the ephemeral tier without consent.
//!
//! ## Quick Start
//!
//! ```ignore
//! use engram::{CreateOptions, Engram, SearchOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Open a manager (snapshots, ledger, and blobs live under ./data)
//!     let engram = Engram::open("./data", Default::default()).await?;
//!
//!     // Remember something
//!     let item = engram
//!         .create("alice", b"prefers dark roast", CreateOptions::new())
//!         .await?;
//!
//!     // Read it back
//!     let payload = engram.get_payload("alice", &item.id).await?;
//!
//!     // Let a meditation pass promote what is worth keeping
//!     let report = engram.meditate().await;
//!     println!("promoted {}", report.promoted());
//!
//!     // Recall persisted memories by similarity
//!     let matches = engram
//!         .recall("alice", b"coffee preference", &SearchOptions::new())
//!         .await?;
//!     for m in matches {
//!         println!("{} scored {:.2}", m.item_id, m.score);
//!     }
//!
//!     engram.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Core API
//!
//! - [`Engram::open()`] - Open a manager and start its background tasks
//! - [`Engram::create()`] - Store a memory (ephemeral at first)
//! - [`Engram::get_payload()`] - Read a memory, recording the access
//! - [`Engram::recall()`] - Similarity search over persisted memories
//! - [`Engram::meditate()`] - Score items and apply lifecycle transitions
//! - [`Engram::export_owner()`] / [`Engram::purge_owner()`] - Owner data rights
//!
//! ## Architecture
//!
//! 1. **Engram API** (`core`) - User-facing handle and background tasks
//! 2. **Registry** (`registry`) - Canonical metadata, transitions, recovery
//! 3. **Tier stores** (`tier`) - Short / Long / Object payload storage
//! 4. **Meditation** (`meditation`) - Scoring and the promotion pipeline
//!
//! The audit ledger (`audit`) and quota manager (`quota`) sit underneath
//! every mutation: writes reserve quota first and append to the ledger
//! before they are acknowledged.
//!
//! ## Thread Safety
//!
//! All operations are thread-safe. Clone an `Engram` cheaply and share it
//! across tasks:
//!
//! ```ignore
//! let engram = Engram::open("./data", Default::default()).await?;
//! let handle = engram.clone(); // Cheap clone (Arc internally)
//!
//! tokio::spawn(async move {
//!     handle.create("alice", b"note", Default::default()).await.unwrap();
//! });
//! ```

// Internal modules
mod core;

// Component modules (public for library consumers and integration tests)
pub mod audit;
pub mod config;
pub mod error;
pub mod meditation;
pub mod metrics;
pub mod quota;
pub mod registry;
pub mod tier;
pub mod types;
pub mod vector;

// Public API exports
pub use crate::core::{Engram, EngramStats};
pub use error::{EngramError, EngramResult};
pub use types::{Category, ContentRef, ItemId, LifecycleState, MemoryItem, MemoryTier, OwnerId};

// Configuration exports
pub use config::{EngramConfig, ScoringWeights};

// Registry exports
pub use registry::{
    CreateOptions, MemoryRegistry, OwnerExport, PurgeReport, ReconcileReport, RegistryStats,
};

// Audit exports
pub use audit::{AuditAction, AuditEntry, AuditQuery};

// Quota exports
pub use quota::QuotaCounter;

// Meditation exports
pub use meditation::{MeditationReport, PartitionReport, ScoringStrategy, WeightedScorer};

// Recall exports
pub use vector::{Embedder, Embedding, SearchMatch, SearchOptions};

// Metrics exports
pub use metrics::MetricsSnapshot;

// Re-export commonly used external types for convenience
pub use chrono::{DateTime, Utc};

/// Prelude module for convenient imports.
///
/// Import everything you need with:
/// ```ignore
/// use engram::prelude::*;
/// ```
pub mod prelude {
    pub use crate::audit::{AuditAction, AuditEntry, AuditQuery};
    pub use crate::config::{EngramConfig, ScoringWeights};
    pub use crate::core::{Engram, EngramStats};
    pub use crate::error::{EngramError, EngramResult};
    pub use crate::meditation::{MeditationReport, PartitionReport};
    pub use crate::registry::{CreateOptions, OwnerExport, PurgeReport};
    pub use crate::types::{Category, LifecycleState, MemoryItem, MemoryTier};
    pub use crate::vector::{SearchMatch, SearchOptions};
    pub use chrono::{DateTime, Utc};
}
