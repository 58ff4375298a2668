//! Vector embeddings and similarity search.
//!
//! Every item persisted to the Long tier gets an embedding in the vector
//! index so it can be recalled by similarity. Embeddings are produced by
//! an [`Embedder`]; the built-in [`HashEmbedder`] derives them from payload
//! bytes deterministically, with no external model service.

pub mod index;

pub use index::{AnnIndex, FlatIndex, VectorIndex};

use crate::error::EngramResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A vector embedding with metadata.
///
/// Stored as an `f32` array behind an `Arc`, so clones are cheap and the
/// index and item metadata can share one allocation.
#[derive(Debug, Clone)]
pub struct Embedding {
    /// The vector components (f32 for memory efficiency vs f64)
    data: Arc<[f32]>,
    /// The embedding model that produced this vector
    model: String,
    /// Magnitude, computed once at construction
    magnitude: f32,
}

impl Serialize for Embedding {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("Embedding", 3)?;
        state.serialize_field("data", &self.data.as_ref())?;
        state.serialize_field("model", &self.model)?;
        state.serialize_field("dimensions", &self.dimensions())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Embedding {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct EmbeddingData {
            data: Vec<f32>,
            model: String,
            dimensions: usize,
        }

        let helper = EmbeddingData::deserialize(deserializer)?;
        if helper.data.len() != helper.dimensions {
            return Err(serde::de::Error::custom(format!(
                "embedding declares {} dimensions but carries {}",
                helper.dimensions,
                helper.data.len()
            )));
        }
        Ok(Embedding::new(helper.data, helper.model))
    }
}

impl Embedding {
    /// Create an embedding from raw components.
    pub fn new(data: Vec<f32>, model: impl Into<String>) -> Self {
        let magnitude = data.iter().map(|&x| x * x).sum::<f32>().sqrt();
        Self {
            data: Arc::from(data.into_boxed_slice()),
            model: model.into(),
            magnitude,
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn dimensions(&self) -> usize {
        self.data.len()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Cosine similarity with another embedding.
    ///
    /// Ranges from -1.0 (opposite) to 1.0 (identical). Returns `None` when
    /// dimensions differ; a zero vector compares as `Some(0.0)`.
    pub fn cosine_similarity(&self, other: &Embedding) -> Option<f32> {
        if self.dimensions() != other.dimensions() {
            return None;
        }

        if self.magnitude == 0.0 || other.magnitude == 0.0 {
            return Some(0.0);
        }

        let dot: f32 = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .sum();

        Some(dot / (self.magnitude * other.magnitude))
    }
}

impl PartialEq for Embedding {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data && self.model == other.model
    }
}

impl fmt::Display for Embedding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Embedding(dims={}, model={})",
            self.dimensions(),
            self.model
        )
    }
}

/// A search hit pointing at an indexed item.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchMatch {
    /// Owner whose space the item lives in
    pub owner: String,
    /// The matched item
    pub item_id: String,
    /// Similarity score (higher = more similar)
    pub score: f32,
}

impl SearchMatch {
    pub fn new(owner: impl Into<String>, item_id: impl Into<String>, score: f32) -> Self {
        Self {
            owner: owner.into(),
            item_id: item_id.into(),
            score,
        }
    }
}

/// Options for similarity search.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Number of results to return
    pub top_k: usize,
    /// Minimum similarity threshold (0.0 to 1.0 for cosine)
    pub threshold: f32,
    /// Filter by embedding model (optional)
    pub model_filter: Option<String>,
}

impl SearchOptions {
    /// Defaults: top_k 10, no threshold, no model filter.
    pub fn new() -> Self {
        Self {
            top_k: 10,
            threshold: 0.0,
            model_filter: None,
        }
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn model_filter(mut self, model: impl Into<String>) -> Self {
        self.model_filter = Some(model.into());
        self
    }
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Produces embeddings for item payloads.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier stamped on produced embeddings.
    fn model(&self) -> &str;

    /// Embed payload bytes into a fixed-dimension vector.
    async fn embed(&self, payload: &[u8]) -> EngramResult<Embedding>;
}

/// Deterministic embedder derived from payload bytes.
///
/// No model service involved: the vector mixes a content-address spread,
/// a folded byte histogram, and a positional fingerprint, then normalizes
/// to the unit sphere. Identical payloads always embed identically and
/// byte-wise similar payloads land near each other, which is enough for
/// tests and for deployments that bring their own [`Embedder`] later.
pub struct HashEmbedder;

/// Canonical dimension of reference embeddings.
pub const REFERENCE_DIMENSIONS: usize = 128;

const REFERENCE_MODEL: &str = "hash-embed-v1";

impl HashEmbedder {
    pub fn new() -> Self {
        Self
    }

    fn synthesize(payload: &[u8]) -> Embedding {
        let mut data = vec![0.0f32; REFERENCE_DIMENSIONS];

        // Content-address spread across the first 32 dims.
        for (i, byte) in payload.iter().take(64).enumerate() {
            data[i % 32] += (*byte as f32) / 255.0;
        }

        // Byte histogram folded four buckets per dim (dims 32..96).
        if !payload.is_empty() {
            let mut histogram = [0usize; 256];
            for &byte in payload {
                histogram[byte as usize] += 1;
            }
            for i in 0..64 {
                let bucket: usize = histogram[i * 4..i * 4 + 4].iter().sum();
                data[32 + i] = bucket as f32 / payload.len() as f32;
            }
        }

        // Positional fingerprint: stride-sampled bytes (dims 96..128).
        let stride = (payload.len() / 32).max(1);
        for i in 0..32 {
            let byte = payload.get(i * stride).copied().unwrap_or(0);
            data[96 + i] = byte as f32 / 255.0;
        }

        // Normalize to the unit sphere.
        let magnitude: f32 = data.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for val in &mut data {
                *val /= magnitude;
            }
        }

        Embedding::new(data, REFERENCE_MODEL)
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model(&self) -> &str {
        REFERENCE_MODEL
    }

    async fn embed(&self, payload: &[u8]) -> EngramResult<Embedding> {
        Ok(Self::synthesize(payload))
    }
}
