/// The memory registry: canonical item metadata and every operation on it.
///
/// The registry owns the authoritative `MemoryItem` map; tier stores hold
/// only payload bytes. Tier moves follow one discipline throughout:
///
/// 1. reserve quota
/// 2. write payload to the destination tier
/// 3. flip the item metadata (the commit point)
/// 4. append the audit entry; a failed append reverts the flip
/// 5. release source-side quota and delete the source payload
///
/// Source payloads are deleted after the pointer flip, so a crash in
/// between leaves an orphaned copy and never a dangling pointer. The
/// reconciliation scan removes such orphans at startup. Creation inverts
/// steps 2 and 3: the metadata entry claims the id before any bytes are
/// written, so duplicate-id racers fail without touching the winner's
/// payload.
use crate::audit::{AuditAction, AuditEntry, AuditEvent, AuditLedger, AuditQuery};
use crate::config::EngramConfig;
use crate::error::{EngramError, EngramResult};
use crate::metrics::MemoryMetrics;
use crate::quota::QuotaManager;
use crate::tier::{EvictedShort, TierStores};
use crate::types::{Category, ContentRef, ItemId, LifecycleState, MemoryItem, MemoryTier, OwnerId};
use crate::vector::{Embedder, HashEmbedder, SearchMatch, SearchOptions, VectorIndex};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Audit actor for registry-internal maintenance (sweeps, reconciliation).
pub const ACTOR_SYSTEM: &str = "system";

/// Audit actor for the meditation engine.
pub const ACTOR_MEDITATION: &str = "meditation";

/// Item id used in owner-level audit entries (export).
pub const OWNER_SCOPE_ITEM: &str = "*";

const AUDIT_FILE: &str = "audit.log";
const ITEMS_FILE: &str = "items.snapshot";
const LONG_FILE: &str = "long.snapshot";
const INDEX_FILE: &str = "vector.idx";

/// Items snapshot format version. Bump when the layout changes.
const ITEMS_SNAPSHOT_VERSION: u32 = 1;

fn owner_actor(owner: &str) -> String {
    format!("owner:{owner}")
}

fn not_found(owner: &str, id: &str) -> EngramError {
    EngramError::NotFound {
        owner: owner.to_string(),
        id: id.to_string(),
    }
}

// ============================================================================
// Options and reports
// ============================================================================

/// Options for creating an item. Builder-style, all fields optional.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Explicit item id; a v4 UUID is generated when absent
    pub id: Option<ItemId>,
    /// Content classification
    pub category: Category,
    /// Consent to persist beyond the ephemeral tier
    pub consent: bool,
    /// Exempt from automated pruning and demotion
    pub protected: bool,
    /// Importance hint (0.0 to 1.0)
    pub importance: f64,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self {
            id: None,
            category: Category::Plain,
            consent: false,
            protected: false,
            importance: 0.5,
        }
    }

    pub fn id(mut self, id: impl Into<ItemId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn consent(mut self, consent: bool) -> Self {
        self.consent = consent;
        self
    }

    pub fn protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }

    pub fn importance(mut self, importance: f64) -> Self {
        self.importance = importance;
        self
    }
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// What the startup reconciliation scan found and fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Payloads present in a tier but referenced by no live item
    pub orphans_removed: usize,
    /// Ephemeral items whose Short payload did not survive, now pruned
    pub lost_ephemeral_pruned: usize,
    /// Live items whose durable payload is missing (reported, not fixed)
    pub dangling_durable: usize,
}

/// Outcome of purging one owner's space.
#[derive(Debug, Clone, Default)]
pub struct PurgeReport {
    pub items_purged: usize,
    pub bytes_freed: u64,
}

/// One exported item with its payload, when still readable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportedItem {
    pub item: MemoryItem,
    pub payload: Option<Vec<u8>>,
}

/// Complete export of one owner's space: metadata, payloads, audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerExport {
    pub owner: OwnerId,
    pub exported_at: DateTime<Utc>,
    pub items: Vec<ExportedItem>,
    pub audit: Vec<AuditEntry>,
}

/// Registry-wide counts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_items: usize,
    pub ephemeral: usize,
    pub persisted: usize,
    pub archived: usize,
    pub tombstones: usize,
    pub indexed: usize,
    pub audit_entries: usize,
}

impl RegistryStats {
    pub fn live_items(&self) -> usize {
        self.ephemeral + self.persisted + self.archived
    }
}

#[derive(Serialize, Deserialize)]
struct ItemsSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    items: Vec<MemoryItem>,
}

/// Outcome of the metadata flip inside a move.
enum Flip {
    Applied(FlipPrev),
    Lost,
}

struct FlipPrev {
    tier: MemoryTier,
    content: ContentRef,
    state: LifecycleState,
    embedding: Option<crate::vector::Embedding>,
}

// ============================================================================
// Registry
// ============================================================================

pub struct MemoryRegistry {
    /// Canonical metadata, including tombstones
    items: DashMap<ItemId, MemoryItem>,
    tiers: Arc<TierStores>,
    quota: QuotaManager,
    ledger: AuditLedger,
    index: VectorIndex,
    embedder: Arc<dyn Embedder>,
    metrics: Arc<MemoryMetrics>,
    config: EngramConfig,
    /// None for ephemeral registries; snapshots are skipped
    data_dir: Option<PathBuf>,
}

impl MemoryRegistry {
    /// Open a registry rooted at `data_dir`, loading any snapshots found
    /// there and reconciling tier contents against them.
    pub async fn open(data_dir: impl Into<PathBuf>, config: EngramConfig) -> EngramResult<Self> {
        let dir = data_dir.into();
        config.validate()?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngramError::StorageError(format!("failed to create data dir: {}", e)))?;

        let ledger = AuditLedger::open(&dir.join(AUDIT_FILE)).await?;
        let tiers = Arc::new(TierStores::open(&dir, &config).await?);

        let registry = Self {
            items: DashMap::new(),
            tiers,
            quota: QuotaManager::new(config.quota.clone()),
            ledger,
            index: VectorIndex::new_flat(),
            embedder: Arc::new(HashEmbedder::new()),
            metrics: Arc::new(MemoryMetrics::new()),
            config,
            data_dir: Some(dir.clone()),
        };

        registry.load_snapshots(&dir).await?;
        let report = registry.reconcile().await?;
        if report != ReconcileReport::default() {
            info!(
                orphans = report.orphans_removed,
                lost_ephemeral = report.lost_ephemeral_pruned,
                dangling = report.dangling_durable,
                "startup reconciliation applied"
            );
        }
        Ok(registry)
    }

    /// An ephemeral registry: no snapshots, in-memory ledger, blobs under a
    /// scratch directory. Nothing survives the process.
    pub async fn in_memory(config: EngramConfig) -> EngramResult<Self> {
        config.validate()?;
        let scratch = std::env::temp_dir().join(format!("engram-ephemeral-{}", Uuid::new_v4()));
        let tiers = Arc::new(TierStores::open(&scratch, &config).await?);

        Ok(Self {
            items: DashMap::new(),
            tiers,
            quota: QuotaManager::new(config.quota.clone()),
            ledger: AuditLedger::in_memory(),
            index: VectorIndex::new_flat(),
            embedder: Arc::new(HashEmbedder::new()),
            metrics: Arc::new(MemoryMetrics::new()),
            config,
            data_dir: None,
        })
    }

    /// Swap the embedder. Must be called before any items are persisted,
    /// or index entries will mix models.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    pub fn ledger(&self) -> &AuditLedger {
        &self.ledger
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn metrics(&self) -> &Arc<MemoryMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &EngramConfig {
        &self.config
    }

    pub fn tiers(&self) -> &TierStores {
        &self.tiers
    }

    // ========================================================================
    // Item operations
    // ========================================================================

    /// Create an item. All items begin `Ephemeral` in the Short tier.
    pub async fn create(
        &self,
        owner: &str,
        payload: &[u8],
        opts: CreateOptions,
    ) -> EngramResult<MemoryItem> {
        if owner.is_empty() {
            return Err(EngramError::ValidationError {
                reason: "owner must not be empty".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&opts.importance) || !opts.importance.is_finite() {
            return Err(EngramError::ValidationError {
                reason: format!("importance {} outside 0.0..=1.0", opts.importance),
            });
        }
        if let Some(ref id) = opts.id {
            if id.is_empty() {
                return Err(EngramError::ValidationError {
                    reason: "explicit item id must not be empty".to_string(),
                });
            }
        }

        let id = opts.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.items.contains_key(&id) {
            return Err(EngramError::ValidationError {
                reason: format!("item id '{}' already exists", id),
            });
        }

        let owner_id: OwnerId = owner.to_string();
        let size = payload.len() as u64;
        let reservation = self.reserve_counted(&owner_id, MemoryTier::Short, size)?;

        // Claim the id before writing any bytes. The loser of a duplicate-id
        // race must never reach the tier stores: the Short key is the item id,
        // so a late write would clobber the winner's payload.
        let now = Utc::now();
        let item = MemoryItem {
            id: id.clone(),
            owner: owner_id.clone(),
            tier: MemoryTier::Short,
            content: ContentRef::Inline(id.clone()),
            embedding: None,
            category: opts.category,
            consent: opts.consent,
            protected: opts.protected,
            importance: opts.importance,
            score: 0.0,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            size,
            state: LifecycleState::Ephemeral,
            tombstone_seq: None,
        };
        let claimed = match self.items.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(item.clone());
                true
            }
            dashmap::mapref::entry::Entry::Occupied(_) => false,
        };
        if !claimed {
            drop(reservation);
            return Err(EngramError::ValidationError {
                reason: format!("item id '{}' already exists", id),
            });
        }

        let write = match self.tiers.put(MemoryTier::Short, &id, payload).await {
            Ok(write) => write,
            Err(e) => {
                self.revert_claim(&id, now);
                drop(reservation);
                return Err(e);
            }
        };
        if let Some(ev) = &write.evicted {
            self.reconcile_evicted(ev, &id).await;
        }

        let event = AuditEvent {
            actor: owner_actor(owner),
            owner: owner_id.clone(),
            item_id: id.clone(),
            action: AuditAction::Create,
            before: None,
            after: Some(LifecycleState::Ephemeral),
        };
        if let Err(e) = self.ledger.append(event).await {
            // Not acknowledged: remove the payload and return the quota.
            self.revert_claim(&id, now);
            if let Err(del) = self.tiers.delete(&write.content).await {
                warn!(item = %id, error = %del, "cleanup after failed audit append");
            }
            drop(reservation);
            return Err(e);
        }
        reservation.commit();

        self.metrics.creates.fetch_add(1, Ordering::Relaxed);
        debug!(item = %id, owner = %owner, bytes = size, "item created");
        Ok(item)
    }

    /// Remove a claimed-but-unacknowledged item, unless something else
    /// already rewrote it.
    fn revert_claim(&self, id: &str, created_at: DateTime<Utc>) {
        self.items.remove_if(id, |_, v| {
            v.state == LifecycleState::Ephemeral && v.created_at == created_at
        });
    }

    /// Item metadata, tombstones included. Cross-owner lookups read as
    /// absent rather than revealing existence.
    pub fn get(&self, owner: &str, id: &str) -> EngramResult<MemoryItem> {
        let item = self
            .items
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| not_found(owner, id))?;
        if item.owner != owner {
            return Err(not_found(owner, id));
        }
        Ok(item)
    }

    /// Read an item's payload and record the access.
    pub async fn get_payload(&self, owner: &str, id: &str) -> EngramResult<Vec<u8>> {
        let item = self.get(owner, id)?;
        if item.is_tombstone() {
            return Err(not_found(owner, id));
        }

        match self.tiers.get(&item.content).await? {
            Some(bytes) => {
                if let Some(mut entry) = self.items.get_mut(id) {
                    entry.mark_accessed();
                }
                self.metrics.payload_reads.fetch_add(1, Ordering::Relaxed);
                Ok(bytes)
            }
            None => {
                self.metrics
                    .payload_read_misses
                    .fetch_add(1, Ordering::Relaxed);
                if item.tier.is_durable() {
                    Err(EngramError::IntegrityViolation {
                        reason: format!(
                            "payload for item '{}' missing from {} tier",
                            id, item.tier
                        ),
                    })
                } else {
                    // Short tier is best-effort: expired or evicted.
                    Err(not_found(owner, id))
                }
            }
        }
    }

    /// Record an access without reading the payload. Access-stat updates
    /// are not audited.
    pub fn touch(&self, owner: &str, id: &str) -> EngramResult<()> {
        let mut entry = self.items.get_mut(id).ok_or_else(|| not_found(owner, id))?;
        if entry.owner != owner || entry.is_tombstone() {
            return Err(not_found(owner, id));
        }
        entry.mark_accessed();
        Ok(())
    }

    /// Replace an item's payload in place, within its current tier.
    pub async fn update(&self, owner: &str, id: &str, payload: &[u8]) -> EngramResult<MemoryItem> {
        let snapshot = self.get(owner, id)?;
        if snapshot.is_tombstone() {
            return Err(not_found(owner, id));
        }

        // Old bytes are needed to restore in-place stores on a failed append.
        let old_payload = match self.tiers.get(&snapshot.content).await? {
            Some(bytes) => bytes,
            None => {
                if snapshot.tier.is_durable() {
                    return Err(EngramError::IntegrityViolation {
                        reason: format!(
                            "payload for item '{}' missing from {} tier",
                            id, snapshot.tier
                        ),
                    });
                }
                return Err(not_found(owner, id));
            }
        };

        let owner_id = snapshot.owner.clone();
        let new_size = payload.len() as u64;
        let reservation = self.reserve_counted(&owner_id, snapshot.tier, new_size)?;
        let write = self.tiers.put(snapshot.tier, id, payload).await?;
        if let Some(ev) = &write.evicted {
            self.reconcile_evicted(ev, id).await;
        }

        let embedding = if snapshot.state == LifecycleState::Persisted {
            Some(self.embedder.embed(payload).await?)
        } else {
            None
        };

        let flip = match self.items.get_mut(id) {
            None => Flip::Lost,
            Some(mut entry) => {
                if entry.state != snapshot.state || entry.content != snapshot.content {
                    Flip::Lost
                } else {
                    let prev = FlipPrev {
                        tier: entry.tier,
                        content: entry.content.clone(),
                        state: entry.state,
                        embedding: entry.embedding.take(),
                    };
                    entry.content = write.content.clone();
                    entry.size = new_size;
                    entry.embedding = embedding.clone();
                    entry.mark_accessed();
                    Flip::Applied(prev)
                }
            }
        };

        let prev = match flip {
            Flip::Lost => {
                if write.content != snapshot.content {
                    if let Err(del) = self.tiers.delete(&write.content).await {
                        warn!(item = %id, error = %del, "cleanup after lost update race");
                    }
                }
                drop(reservation);
                return Err(EngramError::ValidationError {
                    reason: format!("item '{}' modified concurrently", id),
                });
            }
            Flip::Applied(prev) => prev,
        };

        let event = AuditEvent {
            actor: owner_actor(owner),
            owner: owner_id.clone(),
            item_id: id.to_string(),
            action: AuditAction::Update,
            before: Some(snapshot.state),
            after: Some(snapshot.state),
        };
        if let Err(e) = self.ledger.append(event).await {
            // Revert the flip and put the old bytes back.
            if let Err(restore) = self.tiers.put(prev.tier, id, &old_payload).await {
                error!(item = %id, error = %restore, "failed to restore payload after audit failure");
            }
            if let Some(mut entry) = self.items.get_mut(id) {
                entry.content = prev.content.clone();
                entry.size = snapshot.size;
                entry.embedding = prev.embedding;
            }
            if write.content != prev.content {
                if let Err(del) = self.tiers.delete(&write.content).await {
                    warn!(item = %id, error = %del, "cleanup after failed audit append");
                }
            }
            drop(reservation);
            return Err(e);
        }
        reservation.commit();
        self.quota.release(&owner_id, snapshot.tier, snapshot.size);

        if let Some(emb) = embedding {
            self.index.add(&owner_id, id, emb);
        }
        if write.content != prev.content {
            self.delete_payload_guarded(id, &prev.content).await;
        }

        self.metrics.updates.fetch_add(1, Ordering::Relaxed);
        debug!(item = %id, bytes = new_size, "item updated");
        self.get(owner, id)
    }

    /// Set or clear the protected flag. No-op when unchanged.
    pub async fn protect(&self, owner: &str, id: &str, protected: bool) -> EngramResult<MemoryItem> {
        let snapshot = self.get(owner, id)?;
        if snapshot.is_tombstone() {
            return Err(not_found(owner, id));
        }
        if snapshot.protected == protected {
            return Ok(snapshot);
        }

        let event = AuditEvent {
            actor: owner_actor(owner),
            owner: snapshot.owner.clone(),
            item_id: id.to_string(),
            action: AuditAction::Protect,
            before: Some(snapshot.state),
            after: Some(snapshot.state),
        };
        self.ledger.append(event).await?;

        if let Some(mut entry) = self.items.get_mut(id) {
            entry.protected = protected;
        }
        self.get(owner, id)
    }

    /// Grant or revoke consent to persist beyond the ephemeral tier.
    ///
    /// Revoking consent on a sensitive item resident in a durable tier
    /// pulls the payload back immediately: demoted to the Short tier when
    /// it fits, pruned otherwise. Protection does not override revocation.
    pub async fn set_consent(
        &self,
        owner: &str,
        id: &str,
        consent: bool,
    ) -> EngramResult<MemoryItem> {
        let snapshot = self.get(owner, id)?;
        if snapshot.is_tombstone() {
            return Err(not_found(owner, id));
        }
        if snapshot.consent == consent {
            return Ok(snapshot);
        }

        let event = AuditEvent {
            actor: owner_actor(owner),
            owner: snapshot.owner.clone(),
            item_id: id.to_string(),
            action: AuditAction::ConsentChange,
            before: Some(snapshot.state),
            after: Some(snapshot.state),
        };
        self.ledger.append(event).await?;

        if let Some(mut entry) = self.items.get_mut(id) {
            entry.consent = consent;
        }

        let revoked_while_durable = !consent
            && snapshot.category == Category::Sensitive
            && snapshot.tier.is_durable();
        if revoked_while_durable {
            let fits_short = snapshot.size <= self.config.short_tier.max_value_size;
            let actor = owner_actor(owner);
            if fits_short {
                match self
                    .move_payload(id, LifecycleState::Ephemeral, &actor, AuditAction::Demote)
                    .await
                {
                    Ok(_) => {}
                    Err(
                        EngramError::QuotaExceeded { .. } | EngramError::CapacityExceeded { .. },
                    ) => {
                        // No room in the ephemeral tier: the payload must
                        // still leave durable storage now.
                        self.prune_item(id, &actor, AuditAction::Prune).await?;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                self.prune_item(id, &actor, AuditAction::Prune).await?;
            }
        }

        self.get(owner, id)
    }

    /// Explicit owner delete. Idempotent on tombstones.
    pub async fn delete(&self, owner: &str, id: &str) -> EngramResult<()> {
        let snapshot = self.get(owner, id)?;
        if snapshot.is_tombstone() {
            return Ok(());
        }
        self.prune_item(id, &owner_actor(owner), AuditAction::Delete)
            .await?;
        Ok(())
    }

    // ========================================================================
    // Recall
    // ========================================================================

    /// Similarity search over one owner's persisted items.
    pub async fn recall(
        &self,
        owner: &str,
        query: &[u8],
        opts: &SearchOptions,
    ) -> EngramResult<Vec<SearchMatch>> {
        let embedding = self.embedder.embed(query).await?;
        Ok(self.index.search(Some(owner), &embedding, opts))
    }

    // ========================================================================
    // Listing
    // ========================================================================

    /// All of one owner's items, oldest first.
    pub fn list_owner(&self, owner: &str, include_pruned: bool) -> Vec<MemoryItem> {
        let mut items: Vec<MemoryItem> = self
            .items
            .iter()
            .filter(|e| e.owner == owner && (include_pruned || !e.is_tombstone()))
            .map(|e| e.clone())
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        items
    }

    /// Distinct owners with at least one item, sorted.
    pub fn owners(&self) -> Vec<OwnerId> {
        let set: BTreeSet<OwnerId> = self.items.iter().map(|e| e.owner.clone()).collect();
        set.into_iter().collect()
    }

    pub(crate) fn live_items(&self, owner: &str) -> Vec<MemoryItem> {
        self.items
            .iter()
            .filter(|e| e.owner == owner && !e.is_tombstone())
            .map(|e| e.clone())
            .collect()
    }

    /// Write back a meditation score. Not audited.
    pub(crate) fn record_score(&self, id: &str, score: f64) {
        if let Some(mut entry) = self.items.get_mut(id) {
            entry.score = score;
        }
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_items: 0,
            ephemeral: 0,
            persisted: 0,
            archived: 0,
            tombstones: 0,
            indexed: self.index.len(),
            audit_entries: self.ledger.len(),
        };
        for entry in self.items.iter() {
            stats.total_items += 1;
            match entry.state {
                LifecycleState::Ephemeral => stats.ephemeral += 1,
                LifecycleState::Persisted => stats.persisted += 1,
                LifecycleState::Archived => stats.archived += 1,
                LifecycleState::Pruned => stats.tombstones += 1,
            }
        }
        stats
    }

    // ========================================================================
    // Lifecycle transitions
    // ========================================================================

    /// Promote an ephemeral item into the Long tier.
    pub async fn promote(&self, id: &str, actor: &str) -> EngramResult<bool> {
        self.move_payload(id, LifecycleState::Persisted, actor, AuditAction::Promote)
            .await
    }

    /// Archive a persisted item into the Object tier.
    pub async fn archive(&self, id: &str, actor: &str) -> EngramResult<bool> {
        self.move_payload(id, LifecycleState::Archived, actor, AuditAction::Demote)
            .await
    }

    /// Prune a live item to a tombstone.
    pub async fn prune(&self, id: &str, actor: &str) -> EngramResult<bool> {
        self.prune_item(id, actor, AuditAction::Prune).await
    }

    /// Two-phase payload move. Returns `Ok(false)` when the item vanished
    /// or changed underneath (callers treat that as a skip).
    async fn move_payload(
        &self,
        id: &str,
        dest_state: LifecycleState,
        actor: &str,
        action: AuditAction,
    ) -> EngramResult<bool> {
        let snapshot = self
            .items
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| not_found(OWNER_SCOPE_ITEM, id))?;

        if snapshot.state == dest_state {
            return Ok(true);
        }
        if !snapshot.state.can_transition_to(dest_state) {
            return Err(EngramError::ValidationError {
                reason: format!(
                    "illegal transition {} -> {} for item '{}'",
                    snapshot.state, dest_state, id
                ),
            });
        }
        if snapshot.protected && actor == ACTOR_MEDITATION && action == AuditAction::Demote {
            return Ok(false);
        }
        let Some(dest_tier) = dest_state.resident_tier() else {
            return Err(EngramError::ValidationError {
                reason: format!("{} is not a resident state", dest_state),
            });
        };
        if dest_tier.is_durable() && !snapshot.durable_persistence_allowed() {
            return Err(EngramError::ConsentRequired { id: id.to_string() });
        }

        // Phase one: copy the payload into the destination tier.
        let payload = match self.tiers.get(&snapshot.content).await? {
            Some(bytes) => bytes,
            None => {
                if snapshot.content.tier().is_durable() {
                    return Err(EngramError::IntegrityViolation {
                        reason: format!(
                            "payload for item '{}' missing from {} tier",
                            id,
                            snapshot.content.tier()
                        ),
                    });
                }
                // Expired or evicted between scan and apply.
                return Ok(false);
            }
        };

        let embedding = if dest_state == LifecycleState::Persisted {
            Some(self.embedder.embed(&payload).await?)
        } else {
            None
        };

        let reservation = self.reserve_counted(&snapshot.owner, dest_tier, snapshot.size)?;
        let write = self.tiers.put(dest_tier, id, &payload).await?;
        if let Some(ev) = &write.evicted {
            self.reconcile_evicted(ev, id).await;
        }

        // Phase two: flip the pointer. This is the commit point.
        let flip = match self.items.get_mut(id) {
            None => Flip::Lost,
            Some(mut entry) => {
                if entry.state != snapshot.state {
                    Flip::Lost
                } else {
                    let prev = FlipPrev {
                        tier: entry.tier,
                        content: entry.content.clone(),
                        state: entry.state,
                        embedding: entry.embedding.take(),
                    };
                    entry.tier = dest_tier;
                    entry.content = write.content.clone();
                    entry.state = dest_state;
                    entry.embedding = embedding.clone();
                    Flip::Applied(prev)
                }
            }
        };

        let prev = match flip {
            Flip::Lost => {
                if let Err(del) = self.tiers.delete(&write.content).await {
                    warn!(item = %id, error = %del, "cleanup after lost transition race");
                }
                drop(reservation);
                return Ok(false);
            }
            Flip::Applied(prev) => prev,
        };
        reservation.commit();

        let event = AuditEvent {
            actor: actor.to_string(),
            owner: snapshot.owner.clone(),
            item_id: id.to_string(),
            action,
            before: Some(prev.state),
            after: Some(dest_state),
        };
        if let Err(e) = self.ledger.append(event).await {
            if let Some(mut entry) = self.items.get_mut(id) {
                entry.tier = prev.tier;
                entry.content = prev.content.clone();
                entry.state = prev.state;
                entry.embedding = prev.embedding;
            }
            self.quota.release(&snapshot.owner, dest_tier, snapshot.size);
            if let Err(del) = self.tiers.delete(&write.content).await {
                warn!(item = %id, error = %del, "cleanup after failed audit append");
            }
            return Err(e);
        }

        if prev.state == LifecycleState::Persisted {
            self.index.remove(&snapshot.owner, id);
        }
        if dest_state == LifecycleState::Persisted {
            if let Some(emb) = embedding {
                self.index.add(&snapshot.owner, id, emb);
            }
        }

        self.quota.release(&snapshot.owner, prev.tier, snapshot.size);
        self.delete_payload_guarded(id, &prev.content).await;

        match action {
            AuditAction::Promote => self.metrics.promotions.fetch_add(1, Ordering::Relaxed),
            _ => self.metrics.demotions.fetch_add(1, Ordering::Relaxed),
        };
        debug!(
            item = %id,
            from = %prev.state,
            to = %dest_state,
            actor = %actor,
            "payload moved"
        );
        Ok(true)
    }

    /// Collapse a live item into a tombstone: audit entry, payload removed,
    /// quota released, index entry dropped.
    pub(crate) async fn prune_item(
        &self,
        id: &str,
        actor: &str,
        action: AuditAction,
    ) -> EngramResult<bool> {
        let snapshot = self
            .items
            .get(id)
            .map(|e| e.clone())
            .ok_or_else(|| not_found(OWNER_SCOPE_ITEM, id))?;

        if snapshot.is_tombstone() {
            return Ok(false);
        }
        if snapshot.protected && actor == ACTOR_MEDITATION {
            return Ok(false);
        }

        let flip = match self.items.get_mut(id) {
            None => Flip::Lost,
            Some(mut entry) => {
                if entry.state != snapshot.state {
                    Flip::Lost
                } else {
                    let prev = FlipPrev {
                        tier: entry.tier,
                        content: entry.content.clone(),
                        state: entry.state,
                        embedding: entry.embedding.take(),
                    };
                    entry.state = LifecycleState::Pruned;
                    Flip::Applied(prev)
                }
            }
        };

        let prev = match flip {
            Flip::Lost => return Ok(false),
            Flip::Applied(prev) => prev,
        };

        let event = AuditEvent {
            actor: actor.to_string(),
            owner: snapshot.owner.clone(),
            item_id: id.to_string(),
            action,
            before: Some(prev.state),
            after: Some(LifecycleState::Pruned),
        };
        let seq = match self.ledger.append(event).await {
            Ok(seq) => seq,
            Err(e) => {
                if let Some(mut entry) = self.items.get_mut(id) {
                    entry.state = prev.state;
                    entry.embedding = prev.embedding;
                }
                return Err(e);
            }
        };

        if let Some(mut entry) = self.items.get_mut(id) {
            entry.tombstone_seq = Some(seq);
        }

        if prev.state == LifecycleState::Persisted {
            self.index.remove(&snapshot.owner, id);
        }
        self.quota.release(&snapshot.owner, prev.tier, snapshot.size);
        self.delete_payload_guarded(id, &prev.content).await;

        if action == AuditAction::Prune {
            self.metrics.prunes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.deletes.fetch_add(1, Ordering::Relaxed);
        }
        debug!(item = %id, actor = %actor, action = %action, "item pruned");
        Ok(true)
    }

    /// Account for an entry the Short store evicted to admit a write.
    async fn reconcile_evicted(&self, evicted: &EvictedShort, admitting_id: &str) {
        if evicted.key == admitting_id {
            return;
        }
        warn!(
            evicted = %evicted.key,
            admitted = %admitting_id,
            "short tier evicted an entry to admit a new one"
        );
        let is_resident_ephemeral = self
            .items
            .get(&evicted.key)
            .map(|e| {
                !e.is_tombstone()
                    && e.state == LifecycleState::Ephemeral
                    && e.content == ContentRef::Inline(evicted.key.clone())
            })
            .unwrap_or(false);
        if is_resident_ephemeral {
            match self
                .prune_item(&evicted.key, ACTOR_SYSTEM, AuditAction::Prune)
                .await
            {
                Ok(_) => {}
                Err(EngramError::NotFound { .. }) => {}
                Err(e) => warn!(item = %evicted.key, error = %e, "failed to prune evicted item"),
            }
        }
    }

    /// Delete a payload that no live item should reference anymore. Blob
    /// deletes run inline behind a shared-content check; Short and Long
    /// deletes are deferred off the calling task.
    async fn delete_payload_guarded(&self, item_id: &str, content: &ContentRef) {
        if let ContentRef::Blob(digest) = content {
            let shared = self.items.iter().any(|e| {
                e.id != item_id
                    && !e.is_tombstone()
                    && matches!(&e.content, ContentRef::Blob(d) if d == digest)
            });
            if shared {
                debug!(digest = %digest, "blob retained, shared with another item");
                return;
            }
            if let Err(e) = self.tiers.delete(content).await {
                warn!(item = %item_id, error = %e, "source blob delete failed");
            }
            return;
        }

        let tiers = Arc::clone(&self.tiers);
        let old_ref = content.clone();
        let item_id = item_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = tiers.delete(&old_ref).await {
                warn!(item = %item_id, error = %e, "deferred source payload delete failed");
            }
        });
    }

    fn reserve_counted(
        &self,
        owner: &OwnerId,
        tier: MemoryTier,
        size: u64,
    ) -> EngramResult<crate::quota::Reservation> {
        match self.quota.reserve(owner, tier, size) {
            Ok(reservation) => Ok(reservation),
            Err(e) => {
                if matches!(e, EngramError::QuotaExceeded { .. }) {
                    self.metrics.quota_rejections.fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // TTL sweep and reconciliation
    // ========================================================================

    /// Prune items whose Short-tier TTL has elapsed. Returns how many.
    pub async fn sweep_expired(&self) -> EngramResult<usize> {
        let mut pruned = 0;
        for key in self.tiers.short().expired_keys() {
            let owns_entry = self
                .items
                .get(&key)
                .map(|e| {
                    !e.is_tombstone()
                        && e.state == LifecycleState::Ephemeral
                        && e.content == ContentRef::Inline(key.clone())
                })
                .unwrap_or(false);
            if owns_entry {
                match self.prune_item(&key, ACTOR_SYSTEM, AuditAction::Prune).await {
                    Ok(true) => pruned += 1,
                    Ok(false) => {}
                    Err(EngramError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            } else {
                // Stale payload no item points at anymore.
                self.tiers.short().delete(&key);
            }
        }
        if pruned > 0 {
            info!(pruned, "expired ephemeral items pruned");
        }
        Ok(pruned)
    }

    /// Cross-check tier contents against item metadata.
    ///
    /// Removes payloads no live item references (crash leftovers from
    /// interrupted moves), prunes ephemeral items whose payload did not
    /// survive, and reports durable payloads that are missing.
    pub async fn reconcile(&self) -> EngramResult<ReconcileReport> {
        let mut short_refs: HashSet<String> = HashSet::new();
        let mut long_refs: HashSet<String> = HashSet::new();
        let mut blob_refs: HashSet<String> = HashSet::new();
        for entry in self.items.iter() {
            if entry.is_tombstone() {
                continue;
            }
            match &entry.content {
                ContentRef::Inline(k) => short_refs.insert(k.clone()),
                ContentRef::Record(r) => long_refs.insert(r.clone()),
                ContentRef::Blob(d) => blob_refs.insert(d.clone()),
            };
        }

        let mut report = ReconcileReport::default();

        for key in self.tiers.short().keys() {
            if !short_refs.contains(&key) {
                self.tiers.short().delete(&key);
                report.orphans_removed += 1;
            }
        }
        for key in self.tiers.long().keys() {
            if !long_refs.contains(&key) {
                self.tiers.long().delete(&key);
                report.orphans_removed += 1;
            }
        }
        for digest in self.tiers.object().digests().await? {
            if !blob_refs.contains(&digest) {
                self.tiers.object().delete(&digest).await?;
                report.orphans_removed += 1;
            }
        }

        // Live items whose payload is gone.
        let live: Vec<(ItemId, ContentRef)> = self
            .items
            .iter()
            .filter(|e| !e.is_tombstone())
            .map(|e| (e.id.clone(), e.content.clone()))
            .collect();
        for (id, content) in live {
            if self.tiers.exists(&content).await? {
                continue;
            }
            if content.tier().is_durable() {
                error!(item = %id, tier = %content.tier(), "durable payload missing");
                report.dangling_durable += 1;
            } else {
                match self.prune_item(&id, ACTOR_SYSTEM, AuditAction::Prune).await {
                    Ok(true) => report.lost_ephemeral_pruned += 1,
                    Ok(false) => {}
                    Err(EngramError::NotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        self.metrics
            .reconciled_orphans
            .fetch_add(report.orphans_removed as u64, Ordering::Relaxed);
        Ok(report)
    }

    // ========================================================================
    // Export and purge
    // ========================================================================

    /// Export everything recorded for one owner: item metadata including
    /// tombstones, readable payloads, and the owner's audit trail.
    pub async fn export_owner(&self, owner: &str) -> EngramResult<OwnerExport> {
        let mut exported = Vec::new();
        for item in self.list_owner(owner, true) {
            let payload = if item.is_tombstone() {
                None
            } else {
                match self.tiers.get(&item.content).await {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(item = %item.id, error = %e, "payload unreadable during export");
                        None
                    }
                }
            };
            exported.push(ExportedItem { item, payload });
        }

        let audit = self
            .ledger
            .query(&AuditQuery::new().owner(owner).page(0, usize::MAX));

        self.ledger
            .append(AuditEvent {
                actor: owner_actor(owner),
                owner: owner.to_string(),
                item_id: OWNER_SCOPE_ITEM.to_string(),
                action: AuditAction::Export,
                before: None,
                after: None,
            })
            .await?;

        info!(owner = %owner, items = exported.len(), "owner data exported");
        Ok(OwnerExport {
            owner: owner.to_string(),
            exported_at: Utc::now(),
            items: exported,
            audit,
        })
    }

    /// Remove every live item in an owner's space, protected ones included.
    /// Tombstones and the audit trail remain.
    pub async fn purge_owner(&self, owner: &str) -> EngramResult<PurgeReport> {
        let actor = owner_actor(owner);
        let mut report = PurgeReport::default();
        for item in self.live_items(owner) {
            match self.prune_item(&item.id, &actor, AuditAction::Purge).await {
                Ok(true) => {
                    report.items_purged += 1;
                    report.bytes_freed += item.size;
                }
                Ok(false) => {}
                Err(EngramError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        // Per-item prunes already emptied the partition; this catches
        // entries left by any historical inconsistency.
        self.index.remove_owner(owner);

        info!(
            owner = %owner,
            items = report.items_purged,
            bytes = report.bytes_freed,
            "owner space purged"
        );
        Ok(report)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Persist item metadata, Long-tier records, and the vector index.
    /// No-op for ephemeral registries.
    pub async fn save(&self) -> EngramResult<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };

        let snapshot = ItemsSnapshot {
            version: ITEMS_SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            items: self.items.iter().map(|e| e.clone()).collect(),
        };
        let json = serde_json::to_vec(&snapshot)?;
        let path = dir.join(ITEMS_FILE);
        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json).await.map_err(|e| {
            EngramError::StorageError(format!("failed to write items snapshot: {}", e))
        })?;
        tokio::fs::rename(&temp_path, &path).await.map_err(|e| {
            EngramError::StorageError(format!("failed to commit items snapshot: {}", e))
        })?;

        self.tiers.long().save(&dir.join(LONG_FILE)).await?;
        self.index.save(&dir.join(INDEX_FILE)).await?;

        debug!(items = snapshot.items.len(), "registry snapshots saved");
        Ok(())
    }

    async fn load_snapshots(&self, dir: &Path) -> EngramResult<()> {
        let items_path = dir.join(ITEMS_FILE);
        if tokio::fs::metadata(&items_path).await.is_ok() {
            let json = tokio::fs::read(&items_path).await.map_err(|e| {
                EngramError::StorageError(format!("failed to read items snapshot: {}", e))
            })?;
            let snapshot: ItemsSnapshot = serde_json::from_slice(&json)?;
            if snapshot.version != ITEMS_SNAPSHOT_VERSION {
                return Err(EngramError::IntegrityViolation {
                    reason: format!(
                        "items snapshot version mismatch: found {}, expected {}",
                        snapshot.version, ITEMS_SNAPSHOT_VERSION
                    ),
                });
            }
            for item in snapshot.items {
                if !item.is_tombstone() {
                    self.quota
                        .record_existing(&item.owner, item.tier, item.size);
                }
                self.items.insert(item.id.clone(), item);
            }
            info!(items = self.items.len(), "item metadata loaded");
        }

        let long_path = dir.join(LONG_FILE);
        if tokio::fs::metadata(&long_path).await.is_ok() {
            self.tiers.long().load(&long_path).await?;
        }

        let index_path = dir.join(INDEX_FILE);
        if tokio::fs::metadata(&index_path).await.is_ok() {
            // The index is derived data: fall back to a rebuild rather
            // than refusing to open.
            if let Err(e) = self.index.load(&index_path).await {
                warn!(error = %e, "vector index snapshot unusable, rebuilding");
                self.rebuild_index();
            }
        } else {
            self.rebuild_index();
        }

        Ok(())
    }

    fn rebuild_index(&self) {
        self.index.clear();
        let mut rebuilt = 0;
        for entry in self.items.iter() {
            if entry.state != LifecycleState::Persisted {
                continue;
            }
            if let Some(emb) = &entry.embedding {
                self.index.add(&entry.owner, &entry.id, emb.clone());
                rebuilt += 1;
            }
        }
        if rebuilt > 0 {
            info!(entries = rebuilt, "vector index rebuilt from metadata");
        }
    }
}
