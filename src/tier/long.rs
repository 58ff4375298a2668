/// Long tier: durable record storage.
///
/// Records live in memory for serving and are persisted as a versioned
/// snapshot file. Writes go to a temporary file first and are renamed into
/// place, so a crash mid-save leaves the previous snapshot intact.
use crate::error::{EngramError, EngramResult};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Snapshot format version. Bump when the layout changes.
const SNAPSHOT_VERSION: u32 = 1;

/// One durable record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongRecord {
    pub payload: Vec<u8>,
    pub stored_at: DateTime<Utc>,
}

/// Serializable snapshot of the Long tier.
#[derive(Serialize, Deserialize)]
struct LongSnapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    records: HashMap<String, LongRecord>,
}

/// The durable record store backing the Long tier.
#[derive(Default)]
pub struct LongStore {
    records: DashMap<String, LongRecord>,
}

impl LongStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a payload under `id`, replacing any previous record.
    pub fn put(&self, id: &str, payload: &[u8]) {
        self.records.insert(
            id.to_string(),
            LongRecord {
                payload: payload.to_vec(),
                stored_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        self.records.get(id).map(|r| r.payload.clone())
    }

    /// Remove a record, returning its payload size.
    pub fn delete(&self, id: &str) -> Option<u64> {
        self.records.remove(id).map(|(_, r)| r.payload.len() as u64)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// All record ids, for the reconciliation scan.
    pub fn keys(&self) -> Vec<String> {
        self.records.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Save all records to disk atomically (write to temp file, then rename).
    pub async fn save(&self, path: &Path) -> EngramResult<()> {
        let snapshot = LongSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            records: self
                .records
                .iter()
                .map(|r| (r.key().clone(), r.value().clone()))
                .collect(),
        };

        let json = serde_json::to_vec(&snapshot)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngramError::StorageError(format!("failed to create snapshot dir: {}", e))
            })?;
        }

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json).await.map_err(|e| {
            EngramError::StorageError(format!("failed to write snapshot: {}", e))
        })?;
        tokio::fs::rename(&temp_path, path).await.map_err(|e| {
            EngramError::StorageError(format!("failed to commit snapshot: {}", e))
        })?;

        debug!(
            records = snapshot.records.len(),
            bytes = json.len(),
            "long tier snapshot saved"
        );
        Ok(())
    }

    /// Load records from a snapshot file, replacing current contents.
    pub async fn load(&self, path: &Path) -> EngramResult<()> {
        let json = tokio::fs::read(path).await.map_err(|e| {
            EngramError::StorageError(format!("failed to read snapshot: {}", e))
        })?;

        let snapshot: LongSnapshot = serde_json::from_slice(&json)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngramError::IntegrityViolation {
                reason: format!(
                    "snapshot version mismatch: found {}, expected {}",
                    snapshot.version, SNAPSHOT_VERSION
                ),
            });
        }

        self.records.clear();
        for (id, record) in snapshot.records {
            self.records.insert(id, record);
        }

        info!(records = self.records.len(), "long tier snapshot loaded");
        Ok(())
    }

    /// Check if a snapshot exists at the given path.
    pub async fn snapshot_exists(path: &Path) -> bool {
        tokio::fs::metadata(path).await.is_ok()
    }
}
