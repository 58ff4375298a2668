/// Tier store abstraction.
///
/// The three backing stores (Short, Long, Object) are a closed set, so
/// dispatch is by `MemoryTier` value rather than trait object. Callers
/// hand in payload bytes and get back a `ContentRef` locating them; reads
/// and deletes take the same reference back.
///
/// Object-tier operations touch disk and may fail transiently, so they
/// run through a bounded retry loop with exponential backoff and jitter.
pub mod long;
pub mod object;
pub mod short;

pub use long::{LongRecord, LongStore};
pub use object::ObjectStore;
pub use short::{EvictedShort, ShortStore, ShortStoreStats};

use crate::config::EngramConfig;
use crate::error::EngramResult;
use crate::types::{ContentRef, MemoryTier};
use rand::Rng;
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Bounded retry schedule for transient tier failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles each attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based), with jitter so
    /// concurrent failures do not retry in lockstep.
    fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(10);
        let backoff = self.base_delay.saturating_mul(1u32 << shift);
        let jitter_cap = (self.base_delay.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_cap);
        backoff + Duration::from_millis(jitter)
    }
}

/// Run an operation, retrying on retryable errors per the policy.
pub(crate) async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    op_name: &str,
    mut op: F,
) -> EngramResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngramResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "tier operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Outcome of a tier write.
#[derive(Debug)]
pub struct TierWrite {
    /// Where the payload now lives
    pub content: ContentRef,
    /// Entry the Short store pushed out to make room, if any
    pub evicted: Option<EvictedShort>,
}

/// The three backing stores behind one dispatch surface.
pub struct TierStores {
    short: ShortStore,
    long: LongStore,
    object: ObjectStore,
    retry: RetryPolicy,
}

impl TierStores {
    /// Open all three stores under `data_dir`.
    pub async fn open(data_dir: &Path, config: &EngramConfig) -> EngramResult<Self> {
        Ok(Self {
            short: ShortStore::new(config.short_tier.clone(), config.retention.short_ttl),
            long: LongStore::new(),
            object: ObjectStore::open(data_dir.join("blobs")).await?,
            retry: RetryPolicy::default(),
        })
    }

    /// Write a payload into `tier` under `id`, returning where it landed.
    pub async fn put(&self, tier: MemoryTier, id: &str, payload: &[u8]) -> EngramResult<TierWrite> {
        match tier {
            MemoryTier::Short => {
                let evicted = self.short.put(id, payload)?;
                Ok(TierWrite {
                    content: ContentRef::Inline(id.to_string()),
                    evicted,
                })
            }
            MemoryTier::Long => {
                self.long.put(id, payload);
                Ok(TierWrite {
                    content: ContentRef::Record(id.to_string()),
                    evicted: None,
                })
            }
            MemoryTier::Object => {
                let digest =
                    with_retries(&self.retry, "object put", || self.object.put(payload)).await?;
                Ok(TierWrite {
                    content: ContentRef::Blob(digest),
                    evicted: None,
                })
            }
        }
    }

    /// Read the payload a reference points at. `Ok(None)` when the tier
    /// has no data for it (expired, evicted, or never written).
    pub async fn get(&self, content: &ContentRef) -> EngramResult<Option<Vec<u8>>> {
        match content {
            ContentRef::Inline(key) => Ok(self.short.get(key)),
            ContentRef::Record(id) => Ok(self.long.get(id)),
            ContentRef::Blob(digest) => {
                with_retries(&self.retry, "object get", || self.object.get(digest)).await
            }
        }
    }

    /// Remove the payload a reference points at. Returns whether anything
    /// was actually stored there.
    pub async fn delete(&self, content: &ContentRef) -> EngramResult<bool> {
        match content {
            ContentRef::Inline(key) => Ok(self.short.delete(key).is_some()),
            ContentRef::Record(id) => Ok(self.long.delete(id).is_some()),
            ContentRef::Blob(digest) => {
                with_retries(&self.retry, "object delete", || self.object.delete(digest)).await
            }
        }
    }

    pub async fn exists(&self, content: &ContentRef) -> EngramResult<bool> {
        match content {
            ContentRef::Inline(key) => Ok(self.short.contains_any(key)),
            ContentRef::Record(id) => Ok(self.long.contains(id)),
            ContentRef::Blob(digest) => self.object.contains(digest).await,
        }
    }

    pub fn short(&self) -> &ShortStore {
        &self.short
    }

    pub fn long(&self) -> &LongStore {
        &self.long
    }

    pub fn object(&self) -> &ObjectStore {
        &self.object
    }
}
