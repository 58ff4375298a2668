/// Error types for engram operations.
///
/// This module provides the error taxonomy shared by every component. All
/// errors are well-typed and can be pattern-matched for precise handling;
/// callers use the kinds to decide between rejecting, retrying, and alerting.
use thiserror::Error;

/// The main error type for engram operations.
///
/// All fallible operations in engram return `Result<T, EngramError>`.
/// Retry behavior is part of the contract: only `TierUnavailable` is
/// transient; every other variant is surfaced to the caller unmodified.
#[derive(Error, Debug)]
pub enum EngramError {
    /// Item not found in the registry
    #[error("Item '{id}' not found for owner '{owner}'")]
    NotFound {
        /// The owner that was queried
        owner: String,
        /// The item id that was not found
        id: String,
    },

    /// A per-owner, per-tier quota would be exceeded
    #[error("Quota exceeded for owner '{owner}' in tier {tier}: requested {requested} bytes, {available} available")]
    QuotaExceeded {
        /// The owner whose quota was hit
        owner: String,
        /// The tier whose counter rejected the reservation
        tier: String,
        /// Bytes the caller asked for
        requested: u64,
        /// Bytes still available under the limit
        available: u64,
    },

    /// A sensitive item was refused durable persistence without consent
    #[error("Consent required to persist sensitive item '{id}' beyond the ephemeral tier")]
    ConsentRequired {
        /// The item that was blocked
        id: String,
    },

    /// Transient backing-store failure; safe to retry with backoff
    #[error("Tier {tier} unavailable: {reason}")]
    TierUnavailable {
        /// The tier whose backing store failed
        tier: String,
        /// Description of the transient failure
        reason: String,
    },

    /// The backing store itself is out of space, distinct from the logical quota
    #[error("Tier {tier} capacity exceeded")]
    CapacityExceeded {
        /// The tier that is physically full
        tier: String,
    },

    /// Registry, index, or ledger state disagree; never auto-corrected silently
    #[error("Integrity violation: {reason}")]
    IntegrityViolation {
        /// What the consistency check found
        reason: String,
    },

    /// Malformed input rejected before any state change
    #[error("Validation error: {reason}")]
    ValidationError {
        /// Description of why the input is invalid
        reason: String,
    },

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Filesystem operation failed
    #[error("Storage error: {0}")]
    StorageError(String),
}

impl EngramError {
    /// Whether the operation that produced this error may be retried.
    ///
    /// Only transient backing-store failures qualify; logical rejections
    /// (`QuotaExceeded`, `ConsentRequired`, validation) never do.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngramError::TierUnavailable { .. })
    }
}

impl From<std::io::Error> for EngramError {
    fn from(err: std::io::Error) -> Self {
        EngramError::StorageError(err.to_string())
    }
}

/// Result type alias for engram operations.
///
/// This is a convenience alias for `Result<T, EngramError>` that makes
/// function signatures more concise throughout the codebase.
pub type EngramResult<T> = Result<T, EngramError>;
