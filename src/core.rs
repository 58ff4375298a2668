/// Core Engram memory manager implementation.
///
/// This module provides the main user-facing API. It wraps the registry
/// and the meditation engine behind one cheaply-cloneable handle and owns
/// the background tasks: TTL sweeps, periodic meditation passes, and
/// snapshot saves.
///
/// # Design Philosophy
///
/// - **Small API**: remember, recall, and the lifecycle controls
/// - **Async-ready**: every payload-touching operation is async
/// - **Thread-safe**: share an Engram instance across tasks freely
use crate::audit::{AuditEntry, AuditQuery};
use crate::config::EngramConfig;
use crate::error::EngramResult;
use crate::meditation::{MeditationEngine, MeditationReport, PartitionReport};
use crate::metrics::MetricsSnapshot;
use crate::quota::QuotaCounter;
use crate::registry::{
    CreateOptions, MemoryRegistry, OwnerExport, PurgeReport, RegistryStats,
};
use crate::tier::ShortStoreStats;
use crate::types::{MemoryItem, MemoryTier};
use crate::vector::{SearchMatch, SearchOptions};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{info, warn};

/// Combined statistics across every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngramStats {
    /// Item counts by lifecycle state
    pub items: RegistryStats,
    /// Operation counters since this process started
    pub operations: MetricsSnapshot,
    /// Ephemeral store internals
    pub short_tier: ShortStoreStats,
}

/// The main memory manager handle.
///
/// # Thread Safety
///
/// Engram is fully thread-safe and can be cloned cheaply to share across
/// tasks (uses Arc internally).
///
/// # Example
///
/// ```ignore
/// use engram::{CreateOptions, Engram};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engram = Engram::open("./data", Default::default()).await?;
///
///     let item = engram
///         .create("alice", b"prefers dark roast", CreateOptions::new())
///         .await?;
///     let payload = engram.get_payload("alice", &item.id).await?;
///     println!("remembered {} bytes", payload.len());
///
///     engram.shutdown().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Engram {
    /// Canonical item metadata and every operation on it
    registry: Arc<MemoryRegistry>,
    /// Scoring and lifecycle pass
    meditation: Arc<MeditationEngine>,
    /// Stop signal for background tasks
    shutdown: Arc<AtomicBool>,
    /// Handles of the spawned background tasks
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl std::fmt::Debug for Engram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engram")
            .field("items", &self.registry.stats().total_items)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl Engram {
    /// Open a manager rooted at `path` and start the background tasks.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let engram = Engram::open("./data", EngramConfig::from_env()).await?;
    /// ```
    pub async fn open(path: impl AsRef<Path>, config: EngramConfig) -> EngramResult<Self> {
        let registry = Arc::new(MemoryRegistry::open(path.as_ref(), config).await?);
        let engram = Self::assemble(registry);
        engram.note_audit_retention();
        engram.spawn_background_tasks();
        info!(path = %path.as_ref().display(), "engram open");
        Ok(engram)
    }

    /// An ephemeral manager: nothing survives the process and no
    /// background tasks run. Sweeps and meditation are caller-driven.
    pub async fn in_memory() -> EngramResult<Self> {
        Self::in_memory_with(EngramConfig::default()).await
    }

    /// An ephemeral manager with explicit configuration.
    pub async fn in_memory_with(config: EngramConfig) -> EngramResult<Self> {
        let registry = Arc::new(MemoryRegistry::in_memory(config).await?);
        Ok(Self::assemble(registry))
    }

    fn assemble(registry: Arc<MemoryRegistry>) -> Self {
        let meditation = Arc::new(MeditationEngine::new(Arc::clone(&registry)));
        Self {
            registry,
            meditation,
            shutdown: Arc::new(AtomicBool::new(false)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn spawn_background_tasks(&self) {
        let cadence = self.registry.config().tasks.clone();
        let mut handles = Vec::with_capacity(3);

        {
            let registry = Arc::clone(&self.registry);
            let shutdown = Arc::clone(&self.shutdown);
            let every = cadence.sweep_interval;
            handles.push(tokio::spawn(async move {
                let mut int = interval(tokio::time::Duration::from_secs(
                    every.num_seconds().max(1) as u64,
                ));
                loop {
                    int.tick().await;
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = registry.sweep_expired().await {
                        warn!(error = %e, "ttl sweep failed");
                    }
                }
            }));
        }

        {
            let meditation = Arc::clone(&self.meditation);
            let shutdown = Arc::clone(&self.shutdown);
            let registry = Arc::clone(&self.registry);
            let every = cadence.meditation_interval;
            handles.push(tokio::spawn(async move {
                let mut int = interval(tokio::time::Duration::from_secs(
                    every.num_seconds().max(1) as u64,
                ));
                // The first tick fires immediately; skip it so a fresh
                // process does not meditate over a half-loaded view.
                int.tick().await;
                loop {
                    int.tick().await;
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let report = meditation.run_all().await;
                    if report.transitions() > 0 {
                        if let Err(e) = registry.save().await {
                            warn!(error = %e, "post-meditation snapshot failed");
                        }
                    }
                }
            }));
        }

        {
            let registry = Arc::clone(&self.registry);
            let shutdown = Arc::clone(&self.shutdown);
            let every = cadence.save_interval;
            handles.push(tokio::spawn(async move {
                let mut int = interval(tokio::time::Duration::from_secs(
                    every.num_seconds().max(1) as u64,
                ));
                int.tick().await;
                loop {
                    int.tick().await;
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if let Err(e) = registry.save().await {
                        warn!(error = %e, "periodic snapshot failed");
                    }
                }
            }));
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
    }

    fn note_audit_retention(&self) {
        let retention = self.registry.config().retention.audit_retention;
        let oldest = self.registry.ledger().query(&AuditQuery::new().page(0, 1));
        if let Some(first) = oldest.first() {
            if first.timestamp < Utc::now() - retention {
                info!(
                    oldest = %first.timestamp,
                    "audit ledger holds entries beyond the retention window; \
                     older segments are eligible for offline compaction"
                );
            }
        }
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Store a new memory. All items begin ephemeral.
    pub async fn create(
        &self,
        owner: &str,
        payload: &[u8],
        opts: CreateOptions,
    ) -> EngramResult<MemoryItem> {
        self.registry.create(owner, payload, opts).await
    }

    /// Item metadata, tombstones included.
    pub fn get(&self, owner: &str, id: &str) -> EngramResult<MemoryItem> {
        self.registry.get(owner, id)
    }

    /// Read a payload and record the access.
    pub async fn get_payload(&self, owner: &str, id: &str) -> EngramResult<Vec<u8>> {
        self.registry.get_payload(owner, id).await
    }

    /// Record an access without reading the payload.
    pub fn touch(&self, owner: &str, id: &str) -> EngramResult<()> {
        self.registry.touch(owner, id)
    }

    /// Replace a payload in place.
    pub async fn update(&self, owner: &str, id: &str, payload: &[u8]) -> EngramResult<MemoryItem> {
        self.registry.update(owner, id, payload).await
    }

    /// Delete an item, leaving a tombstone.
    pub async fn delete(&self, owner: &str, id: &str) -> EngramResult<()> {
        self.registry.delete(owner, id).await
    }

    /// Set or clear protection against automated pruning and demotion.
    pub async fn protect(&self, owner: &str, id: &str, protected: bool) -> EngramResult<MemoryItem> {
        self.registry.protect(owner, id, protected).await
    }

    /// Grant or revoke durable-persistence consent.
    pub async fn set_consent(
        &self,
        owner: &str,
        id: &str,
        consent: bool,
    ) -> EngramResult<MemoryItem> {
        self.registry.set_consent(owner, id, consent).await
    }

    /// Similarity search over an owner's persisted items.
    pub async fn recall(
        &self,
        owner: &str,
        query: &[u8],
        opts: &SearchOptions,
    ) -> EngramResult<Vec<SearchMatch>> {
        self.registry.recall(owner, query, opts).await
    }

    /// An owner's items, oldest first.
    pub fn list(&self, owner: &str, include_pruned: bool) -> Vec<MemoryItem> {
        self.registry.list_owner(owner, include_pruned)
    }

    // ========================================================================
    // Audit and quota
    // ========================================================================

    /// Full audit trail for one item.
    pub fn audit_trail(&self, id: &str) -> Vec<AuditEntry> {
        self.registry.ledger().query_by_item(id)
    }

    /// Filtered ledger query.
    pub fn audit_query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        self.registry.ledger().query(query)
    }

    /// Current quota counter for one (owner, tier).
    pub fn quota_usage(&self, owner: &str, tier: MemoryTier) -> QuotaCounter {
        self.registry.quota().usage(&owner.to_string(), tier)
    }

    /// Override the limit for one (owner, tier).
    pub fn set_quota_limit(&self, owner: &str, tier: MemoryTier, limit: u64) {
        self.registry.quota().set_limit(&owner.to_string(), tier, limit)
    }

    // ========================================================================
    // Owner-level operations
    // ========================================================================

    /// Export everything recorded for one owner.
    pub async fn export_owner(&self, owner: &str) -> EngramResult<OwnerExport> {
        self.registry.export_owner(owner).await
    }

    /// Remove every live item in an owner's space.
    pub async fn purge_owner(&self, owner: &str) -> EngramResult<PurgeReport> {
        self.registry.purge_owner(owner).await
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Run one meditation pass over every owner.
    pub async fn meditate(&self) -> MeditationReport {
        self.meditation.run_all().await
    }

    /// Run one meditation pass over a single owner.
    pub async fn meditate_owner(&self, owner: &str) -> EngramResult<PartitionReport> {
        self.meditation.run_owner(owner).await
    }

    /// Prune expired ephemeral items now.
    pub async fn sweep_expired(&self) -> EngramResult<usize> {
        self.registry.sweep_expired().await
    }

    /// Combined statistics.
    pub fn stats(&self) -> EngramStats {
        EngramStats {
            items: self.registry.stats(),
            operations: self.registry.metrics().snapshot(),
            short_tier: self.registry.tiers().short().stats(),
        }
    }

    /// Write snapshots now.
    pub async fn save(&self) -> EngramResult<()> {
        self.registry.save().await
    }

    /// The underlying registry, for advanced use.
    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }

    /// Stop background tasks and write final snapshots.
    pub async fn shutdown(&self) -> EngramResult<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            handle.abort();
        }
        self.registry.save().await?;
        info!("engram shut down");
        Ok(())
    }
}
