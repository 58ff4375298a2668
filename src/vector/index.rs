//! Vector indexing for similarity search over persisted items.
//!
//! Implements a flat (brute-force) index partitioned by owner, which is
//! exact and fast enough for the small-to-medium spaces one owner holds.
//! The trait boundary leaves room for ANN backends later.

use super::{Embedding, SearchMatch, SearchOptions};
use crate::error::{EngramError, EngramResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Snapshot format version. Bump when the layout changes.
const INDEX_SNAPSHOT_VERSION: u32 = 1;

/// An index over item embeddings.
///
/// Abstracts the indexing strategy so a flat scan can be swapped for an
/// ANN structure without touching callers.
pub trait AnnIndex: Send + Sync {
    /// Add or replace the embedding for an item.
    fn add(&self, owner: &str, item_id: &str, embedding: Embedding);

    /// Remove one item's embedding. Returns whether it was present.
    fn remove(&self, owner: &str, item_id: &str) -> bool;

    /// Remove every embedding in an owner's space, returning how many.
    fn remove_owner(&self, owner: &str) -> usize;

    /// Whether an item currently has an index entry.
    fn contains(&self, owner: &str, item_id: &str) -> bool;

    /// Search for nearest neighbors, scoped to one owner when given.
    fn search(
        &self,
        owner: Option<&str>,
        query: &Embedding,
        opts: &SearchOptions,
    ) -> Vec<SearchMatch>;

    /// Number of indexed embeddings.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool;

    fn clear(&self);

    /// All entries, for snapshotting.
    fn entries(&self) -> Vec<(String, String, Embedding)>;
}

/// A flat (brute-force) index: owner -> (item id -> embedding).
///
/// Exact k-NN by scanning each candidate. O(n) per query over the scoped
/// partition, which holds up well into the tens of thousands of entries.
#[derive(Debug, Default)]
pub struct FlatIndex {
    embeddings: DashMap<String, DashMap<String, Embedding>>,
}

impl FlatIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn scan_partition(
        &self,
        owner: &str,
        partition: &DashMap<String, Embedding>,
        query: &Embedding,
        opts: &SearchOptions,
        results: &mut Vec<SearchMatch>,
    ) {
        for entry in partition.iter() {
            let embedding = entry.value();

            if let Some(ref model_filter) = opts.model_filter {
                if embedding.model() != model_filter {
                    continue;
                }
            }

            if let Some(similarity) = query.cosine_similarity(embedding) {
                if similarity >= opts.threshold {
                    results.push(SearchMatch::new(owner, entry.key().clone(), similarity));
                }
            }
        }
    }
}

impl AnnIndex for FlatIndex {
    fn add(&self, owner: &str, item_id: &str, embedding: Embedding) {
        let partition = self.embeddings.entry(owner.to_string()).or_default();
        partition.insert(item_id.to_string(), embedding);
    }

    fn remove(&self, owner: &str, item_id: &str) -> bool {
        let Some(partition) = self.embeddings.get(owner) else {
            return false;
        };
        let removed = partition.remove(item_id).is_some();
        // Drop empty partitions so owner listings stay accurate.
        if partition.is_empty() {
            drop(partition);
            self.embeddings.remove_if(owner, |_, p| p.is_empty());
        }
        removed
    }

    fn remove_owner(&self, owner: &str) -> usize {
        self.embeddings
            .remove(owner)
            .map(|(_, partition)| partition.len())
            .unwrap_or(0)
    }

    fn contains(&self, owner: &str, item_id: &str) -> bool {
        self.embeddings
            .get(owner)
            .map(|partition| partition.contains_key(item_id))
            .unwrap_or(false)
    }

    fn search(
        &self,
        owner: Option<&str>,
        query: &Embedding,
        opts: &SearchOptions,
    ) -> Vec<SearchMatch> {
        let mut results = Vec::new();

        match owner {
            Some(owner) => {
                if let Some(partition) = self.embeddings.get(owner) {
                    self.scan_partition(owner, partition.value(), query, opts, &mut results);
                }
            }
            None => {
                for entry in self.embeddings.iter() {
                    self.scan_partition(entry.key(), entry.value(), query, opts, &mut results);
                }
            }
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(opts.top_k);
        results
    }

    fn len(&self) -> usize {
        self.embeddings.iter().map(|e| e.value().len()).sum()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self) {
        self.embeddings.clear();
    }

    fn entries(&self) -> Vec<(String, String, Embedding)> {
        let mut out = Vec::with_capacity(self.len());
        for partition in self.embeddings.iter() {
            for entry in partition.value().iter() {
                out.push((
                    partition.key().clone(),
                    entry.key().clone(),
                    entry.value().clone(),
                ));
            }
        }
        out
    }
}

/// On-disk snapshot of the index.
#[derive(Serialize, Deserialize)]
struct IndexSnapshot {
    version: u32,
    entries: Vec<(String, String, Embedding)>,
}

/// A thread-safe, cloneable handle over the active index backend.
pub struct VectorIndex {
    inner: Arc<dyn AnnIndex>,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("len", &self.len())
            .finish()
    }
}

impl VectorIndex {
    /// Create an index with a flat backend.
    pub fn new_flat() -> Self {
        Self {
            inner: Arc::new(FlatIndex::new()),
        }
    }

    pub fn add(&self, owner: &str, item_id: &str, embedding: Embedding) {
        self.inner.add(owner, item_id, embedding);
    }

    pub fn remove(&self, owner: &str, item_id: &str) -> bool {
        self.inner.remove(owner, item_id)
    }

    pub fn remove_owner(&self, owner: &str) -> usize {
        self.inner.remove_owner(owner)
    }

    pub fn contains(&self, owner: &str, item_id: &str) -> bool {
        self.inner.contains(owner, item_id)
    }

    pub fn search(
        &self,
        owner: Option<&str>,
        query: &Embedding,
        opts: &SearchOptions,
    ) -> Vec<SearchMatch> {
        self.inner.search(owner, query, opts)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Save the index to disk atomically (write to temp file, then rename).
    pub async fn save(&self, path: &Path) -> EngramResult<()> {
        let snapshot = IndexSnapshot {
            version: INDEX_SNAPSHOT_VERSION,
            entries: self.inner.entries(),
        };
        let bytes = bincode::serialize(&snapshot).map_err(|e| {
            EngramError::StorageError(format!("failed to encode vector index: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngramError::StorageError(format!("failed to create index dir: {}", e))
            })?;
        }

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &bytes).await.map_err(|e| {
            EngramError::StorageError(format!("failed to write vector index: {}", e))
        })?;
        tokio::fs::rename(&temp_path, path).await.map_err(|e| {
            EngramError::StorageError(format!("failed to commit vector index: {}", e))
        })?;

        debug!(entries = snapshot.entries.len(), "vector index saved");
        Ok(())
    }

    /// Load the index from a snapshot file, replacing current contents.
    pub async fn load(&self, path: &Path) -> EngramResult<()> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            EngramError::StorageError(format!("failed to read vector index: {}", e))
        })?;

        let snapshot: IndexSnapshot = bincode::deserialize(&bytes).map_err(|e| {
            EngramError::IntegrityViolation {
                reason: format!("vector index snapshot corrupted: {}", e),
            }
        })?;

        if snapshot.version != INDEX_SNAPSHOT_VERSION {
            return Err(EngramError::IntegrityViolation {
                reason: format!(
                    "vector index version mismatch: found {}, expected {}",
                    snapshot.version, INDEX_SNAPSHOT_VERSION
                ),
            });
        }

        self.inner.clear();
        let count = snapshot.entries.len();
        for (owner, item_id, embedding) in snapshot.entries {
            self.inner.add(&owner, &item_id, embedding);
        }

        info!(entries = count, "vector index loaded");
        Ok(())
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new_flat()
    }
}

impl Clone for VectorIndex {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
