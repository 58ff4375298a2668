/// Append-only audit and consent ledger.
///
/// Every mutating operation on an item lands here as exactly one entry, and
/// the entry is durable before the operation acknowledges. No code path
/// updates or deletes an existing entry; compaction, when it happens, drops
/// whole expired segments and never rewrites the active file.
///
/// Entries reference items by id only. The ledger never holds a live
/// reference into the registry, so history stays immutable while items keep
/// mutating.
///
/// # File Format
///
/// One JSON object per line, in sequence order. A torn final line (crash
/// mid-write of an unacknowledged operation) is skipped on load; corruption
/// anywhere earlier is an integrity violation.
use crate::error::{EngramError, EngramResult};
use crate::types::{ItemId, LifecycleState, OwnerId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Action recorded by an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    /// Item created in the Short tier
    Create,
    /// Item content or metadata rewritten by its owner
    Update,
    /// Moved to a more durable tier by meditation
    Promote,
    /// Moved to a less durable tier
    Demote,
    /// Payload removed by meditation or TTL
    Prune,
    /// Consent flag changed; first-class for compliance queries
    ConsentChange,
    /// Protected flag changed
    Protect,
    /// Explicit owner delete
    Delete,
    /// Owner data export produced
    Export,
    /// Owner purge completed
    Purge,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Promote => "promote",
            AuditAction::Demote => "demote",
            AuditAction::Prune => "prune",
            AuditAction::ConsentChange => "consent-change",
            AuditAction::Protect => "protect",
            AuditAction::Delete => "delete",
            AuditAction::Export => "export",
            AuditAction::Purge => "purge",
        };
        write!(f, "{s}")
    }
}

/// An immutable ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic sequence id, assigned by the ledger
    pub seq: u64,
    /// Who performed the operation ("owner:<id>" or "meditation")
    pub actor: String,
    /// Owner of the referenced item
    pub owner: OwnerId,
    /// Referenced item, by id only
    pub item_id: ItemId,
    /// What happened
    pub action: AuditAction,
    /// Lifecycle state before the operation, if the item existed
    pub before: Option<LifecycleState>,
    /// Lifecycle state after the operation, if the item remains
    pub after: Option<LifecycleState>,
    /// When the entry was appended
    pub timestamp: DateTime<Utc>,
}

/// The entry-to-be handed to `append`; the ledger stamps seq and timestamp.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub actor: String,
    pub owner: OwnerId,
    pub item_id: ItemId,
    pub action: AuditAction,
    pub before: Option<LifecycleState>,
    pub after: Option<LifecycleState>,
}

/// Filter for ledger queries. Builder-style, all filters optional.
#[derive(Debug, Clone)]
pub struct AuditQuery {
    /// Restrict to one item
    pub item_id: Option<ItemId>,
    /// Restrict to one owner
    pub owner: Option<OwnerId>,
    /// Restrict to one action kind
    pub action: Option<AuditAction>,
    /// Inclusive lower time bound
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper time bound
    pub to: Option<DateTime<Utc>>,
    /// Entries to skip (pagination)
    pub offset: usize,
    /// Maximum entries returned
    pub limit: usize,
}

impl AuditQuery {
    /// New query with no filters and a page size of 100.
    pub fn new() -> Self {
        Self {
            item_id: None,
            owner: None,
            action: None,
            from: None,
            to: None,
            offset: 0,
            limit: 100,
        }
    }

    /// Restrict to one item.
    pub fn item(mut self, id: impl Into<ItemId>) -> Self {
        self.item_id = Some(id.into());
        self
    }

    /// Restrict to one owner.
    pub fn owner(mut self, owner: impl Into<OwnerId>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Restrict to one action kind.
    pub fn action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }

    /// Restrict to `[from, to)`.
    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Set pagination.
    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(ref id) = self.item_id {
            if &entry.item_id != id {
                return false;
            }
        }
        if let Some(ref owner) = self.owner {
            if &entry.owner != owner {
                return false;
            }
        }
        if let Some(action) = self.action {
            if entry.action != action {
                return false;
            }
        }
        if let Some(from) = self.from {
            if entry.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.timestamp >= to {
                return false;
            }
        }
        true
    }
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self::new()
    }
}

struct LedgerInner {
    /// seq -> entry; append-only, never mutated in place
    log: DashMap<u64, AuditEntry>,
    /// item id -> sequence ids, for point lookups
    by_item: DashMap<ItemId, Vec<u64>>,
    /// Append handle; also serializes seq assignment with file order
    file: tokio::sync::Mutex<Option<File>>,
    /// Highest assigned sequence id
    last_seq: AtomicU64,
    /// Backing path, if durable
    path: Option<PathBuf>,
}

/// Handle to the ledger. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AuditLedger {
    inner: Arc<LedgerInner>,
}

impl fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLedger")
            .field("entries", &self.len())
            .field("path", &self.inner.path)
            .finish()
    }
}

impl AuditLedger {
    /// Create a volatile ledger with no backing file.
    ///
    /// Used in tests and by callers that handle durability elsewhere.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(LedgerInner {
                log: DashMap::new(),
                by_item: DashMap::new(),
                file: tokio::sync::Mutex::new(None),
                last_seq: AtomicU64::new(0),
                path: None,
            }),
        }
    }

    /// Open (or create) a durable ledger at `path`.
    ///
    /// Existing entries are loaded and the sequence counter resumes after
    /// the highest loaded entry.
    pub async fn open(path: &Path) -> EngramResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                EngramError::StorageError(format!("Failed to create ledger directory: {e}"))
            })?;
        }

        let log: DashMap<u64, AuditEntry> = DashMap::new();
        let by_item: DashMap<ItemId, Vec<u64>> = DashMap::new();
        let mut last_seq = 0u64;

        if fs::metadata(path).await.is_ok() {
            let raw = fs::read_to_string(path).await.map_err(|e| {
                EngramError::StorageError(format!("Failed to read ledger: {e}"))
            })?;
            let lines: Vec<&str> = raw.lines().collect();
            for (i, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEntry>(line) {
                    Ok(entry) => {
                        last_seq = last_seq.max(entry.seq);
                        by_item
                            .entry(entry.item_id.clone())
                            .or_default()
                            .push(entry.seq);
                        log.insert(entry.seq, entry);
                    }
                    Err(e) if i + 1 == lines.len() => {
                        // Torn final line from a crash mid-append; the
                        // operation it belonged to was never acknowledged.
                        warn!(line = i + 1, error = %e, "Dropping torn final ledger line");
                    }
                    Err(e) => {
                        return Err(EngramError::IntegrityViolation {
                            reason: format!("corrupt ledger entry at line {}: {e}", i + 1),
                        });
                    }
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| EngramError::StorageError(format!("Failed to open ledger: {e}")))?;

        Ok(Self {
            inner: Arc::new(LedgerInner {
                log,
                by_item,
                file: tokio::sync::Mutex::new(Some(file)),
                last_seq: AtomicU64::new(last_seq),
                path: Some(path.to_path_buf()),
            }),
        })
    }

    /// Append one entry, durably, and return its sequence id.
    ///
    /// The file write completes (and is synced) before the entry becomes
    /// visible in memory, which is what lets callers acknowledge only after
    /// the history is safe.
    pub async fn append(&self, event: AuditEvent) -> EngramResult<u64> {
        // Holding the file lock across seq assignment keeps file order and
        // sequence order identical.
        let mut file_guard = self.inner.file.lock().await;

        let seq = self.inner.last_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = AuditEntry {
            seq,
            actor: event.actor,
            owner: event.owner,
            item_id: event.item_id,
            action: event.action,
            before: event.before,
            after: event.after,
            timestamp: Utc::now(),
        };

        if let Some(file) = file_guard.as_mut() {
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            file.write_all(line.as_bytes()).await.map_err(|e| {
                EngramError::StorageError(format!("Failed to append ledger entry: {e}"))
            })?;
            file.sync_data().await.map_err(|e| {
                EngramError::StorageError(format!("Failed to sync ledger: {e}"))
            })?;
        }

        self.inner
            .by_item
            .entry(entry.item_id.clone())
            .or_default()
            .push(seq);
        self.inner.log.insert(seq, entry);

        drop(file_guard);
        Ok(seq)
    }

    /// All entries for one item, in sequence order.
    pub fn query_by_item(&self, id: &str) -> Vec<AuditEntry> {
        let seqs = match self.inner.by_item.get(id) {
            Some(seqs) => seqs.clone(),
            None => return Vec::new(),
        };
        seqs.iter()
            .filter_map(|seq| self.inner.log.get(seq).map(|e| e.clone()))
            .collect()
    }

    /// Filtered, paginated query over the whole ledger, in sequence order.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        let mut entries: Vec<AuditEntry> = self
            .inner
            .log
            .iter()
            .map(|e| e.value().clone())
            .filter(|entry| query.matches(entry))
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect()
    }

    /// Fetch one entry by sequence id.
    pub fn get(&self, seq: u64) -> Option<AuditEntry> {
        self.inner.log.get(&seq).map(|e| e.clone())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.log.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.log.is_empty()
    }

    /// Highest assigned sequence id.
    pub fn last_seq(&self) -> u64 {
        self.inner.last_seq.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LifecycleState;
    use tempfile::TempDir;

    fn event(item: &str, action: AuditAction) -> AuditEvent {
        AuditEvent {
            actor: "owner:u1".to_string(),
            owner: "u1".to_string(),
            item_id: item.to_string(),
            action,
            before: Some(LifecycleState::Ephemeral),
            after: Some(LifecycleState::Persisted),
        }
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_seqs() {
        let ledger = AuditLedger::in_memory();

        let s1 = ledger.append(event("a", AuditAction::Create)).await.unwrap();
        let s2 = ledger.append(event("a", AuditAction::Promote)).await.unwrap();
        let s3 = ledger.append(event("b", AuditAction::Create)).await.unwrap();

        assert_eq!((s1, s2, s3), (1, 2, 3));
        assert_eq!(ledger.last_seq(), 3);
    }

    #[tokio::test]
    async fn test_query_by_item_ordered() {
        let ledger = AuditLedger::in_memory();
        ledger.append(event("a", AuditAction::Create)).await.unwrap();
        ledger.append(event("b", AuditAction::Create)).await.unwrap();
        ledger.append(event("a", AuditAction::Promote)).await.unwrap();
        ledger.append(event("a", AuditAction::Prune)).await.unwrap();

        let entries = ledger.query_by_item("a");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].action, AuditAction::Create);
        assert_eq!(entries[1].action, AuditAction::Promote);
        assert_eq!(entries[2].action, AuditAction::Prune);
        assert!(entries.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[tokio::test]
    async fn test_consent_changes_are_first_class() {
        let ledger = AuditLedger::in_memory();
        ledger.append(event("a", AuditAction::Create)).await.unwrap();
        ledger
            .append(event("a", AuditAction::ConsentChange))
            .await
            .unwrap();
        ledger.append(event("a", AuditAction::Update)).await.unwrap();

        // "When was consent revoked" needs no state reconstruction.
        let consent = ledger.query(&AuditQuery::new().item("a").action(AuditAction::ConsentChange));
        assert_eq!(consent.len(), 1);
        assert_eq!(consent[0].seq, 2);
    }

    #[tokio::test]
    async fn test_query_filters_and_pagination() {
        let ledger = AuditLedger::in_memory();
        for i in 0..10 {
            let mut ev = event(&format!("item-{i}"), AuditAction::Create);
            if i % 2 == 0 {
                ev.owner = "u2".to_string();
            }
            ledger.append(ev).await.unwrap();
        }

        let u2 = ledger.query(&AuditQuery::new().owner("u2"));
        assert_eq!(u2.len(), 5);

        let page = ledger.query(&AuditQuery::new().owner("u2").page(2, 2));
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].item_id, "item-4");
    }

    #[tokio::test]
    async fn test_time_range_query() {
        let ledger = AuditLedger::in_memory();
        ledger.append(event("a", AuditAction::Create)).await.unwrap();
        let mid = Utc::now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ledger.append(event("b", AuditAction::Create)).await.unwrap();

        let late = ledger.query(&AuditQuery::new().between(mid, Utc::now()));
        assert_eq!(late.len(), 1);
        assert_eq!(late[0].item_id, "b");
    }

    #[tokio::test]
    async fn test_reload_preserves_entries_and_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let ledger = AuditLedger::open(&path).await.unwrap();
            ledger.append(event("a", AuditAction::Create)).await.unwrap();
            ledger.append(event("a", AuditAction::Promote)).await.unwrap();
        }

        let reloaded = AuditLedger::open(&path).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.last_seq(), 2);

        let seq = reloaded
            .append(event("a", AuditAction::Prune))
            .await
            .unwrap();
        assert_eq!(seq, 3);
        assert_eq!(reloaded.query_by_item("a").len(), 3);
    }

    #[tokio::test]
    async fn test_torn_final_line_is_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let ledger = AuditLedger::open(&path).await.unwrap();
            ledger.append(event("a", AuditAction::Create)).await.unwrap();
        }

        // Simulate a crash mid-append.
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"seq\":2,\"actor\":\"owner");
        std::fs::write(&path, raw).unwrap();

        let reloaded = AuditLedger::open(&path).await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.last_seq(), 1);
    }

    #[tokio::test]
    async fn test_corruption_mid_file_is_integrity_violation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");

        {
            let ledger = AuditLedger::open(&path).await.unwrap();
            ledger.append(event("a", AuditAction::Create)).await.unwrap();
            ledger.append(event("b", AuditAction::Create)).await.unwrap();
        }

        // Corrupt the first line, keeping the file multi-line.
        let raw = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = raw.lines().map(String::from).collect();
        lines[0] = "garbage".to_string();
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();

        let result = AuditLedger::open(&path).await;
        assert!(matches!(
            result,
            Err(EngramError::IntegrityViolation { .. })
        ));
    }
}
