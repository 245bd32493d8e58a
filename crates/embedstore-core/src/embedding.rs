//! Embedding gateway trait and vector utilities.
//!
//! Defines the [`Embedder`] trait that every embedding client implements,
//! the batched [`EmbedResponse`] it returns, a zero-vector
//! [`PlaceholderEmbedder`], and pure helpers for vector serialization and
//! similarity.
//!
//! HTTP clients (OpenAI, Ollama) and local inference live in the
//! `embedstore` app crate. Clients are constructed explicitly and handed to
//! [`EmbeddingIndex`](crate::index::EmbeddingIndex); there is no global client.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Approximate chars-per-token ratio used for usage accounting.
const CHARS_PER_TOKEN: usize = 4;

/// One vector in an [`EmbedResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingItem {
    /// Position of the input text this vector belongs to.
    pub index: usize,
    pub embedding: Vec<f32>,
    pub text: String,
}

/// Result of one batched embedding call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedResponse {
    /// Model that actually produced the vectors.
    pub model: String,
    pub data: Vec<EmbeddingItem>,
}

impl EmbedResponse {
    /// Return the vectors in input order, checking the response shape.
    ///
    /// Fails if the count differs from `expected`, an index is out of range
    /// or repeated, or the vectors do not share one dimension.
    pub fn into_vectors(self, expected: usize) -> Result<Vec<Vec<f32>>> {
        if self.data.len() != expected {
            bail!(
                "embedding response has {} vectors, expected {}",
                self.data.len(),
                expected
            );
        }

        let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
        for item in self.data {
            let slot = slots.get_mut(item.index).ok_or_else(|| {
                anyhow::anyhow!("embedding response index {} out of range", item.index)
            })?;
            if slot.is_some() {
                bail!("embedding response repeats index {}", item.index);
            }
            *slot = Some(item.embedding);
        }

        let vectors: Vec<Vec<f32>> = slots.into_iter().flatten().collect();
        if let Some(first) = vectors.first() {
            let dim = first.len();
            if dim == 0 || vectors.iter().any(|v| v.len() != dim) {
                bail!("embedding response has empty or ragged vectors");
            }
        }
        Ok(vectors)
    }
}

/// A client for an external embedding provider.
///
/// `embed` is a single round trip: no streaming, no partial results and no
/// retry loop of its own. Callers decide what a failure means.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provider tag stored on each row (e.g. `"openai"`).
    fn provider(&self) -> &str;
    /// Model used when the caller does not override it.
    fn default_model(&self) -> &str;
    /// Vector dimensionality of the default model.
    fn dims(&self) -> usize;
    /// Embed a batch of texts; `model` overrides [`default_model`](Embedder::default_model).
    async fn embed(&self, texts: &[String], model: Option<&str>) -> Result<EmbedResponse>;
}

/// Stand-in used when no provider is configured.
///
/// Returns zero vectors so rows can be stored now and re-embedded by the
/// freshness pass once a real provider is available. Zero vectors score
/// `0.0` against everything.
pub struct PlaceholderEmbedder {
    dims: usize,
}

impl PlaceholderEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl Embedder for PlaceholderEmbedder {
    fn provider(&self) -> &str {
        "none"
    }
    fn default_model(&self) -> &str {
        "placeholder"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String], _model: Option<&str>) -> Result<EmbedResponse> {
        Ok(EmbedResponse {
            model: self.default_model().to_string(),
            data: texts
                .iter()
                .enumerate()
                .map(|(index, text)| EmbeddingItem {
                    index,
                    embedding: vec![0.0; self.dims],
                    text: text.clone(),
                })
                .collect(),
        })
    }
}

/// Rough token count of a batch, for usage accounting only.
pub fn estimate_tokens(texts: &[String]) -> i64 {
    let chars: usize = texts.iter().map(|t| t.chars().count()).sum();
    chars.div_ceil(CHARS_PER_TOKEN) as i64
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use embedstore_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors.
///
/// Returns a value in `[-1.0, 1.0]`. Empty vectors, vectors of different
/// lengths and zero-magnitude vectors all score `0.0`.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Cosine distance, the ordering key of an ANN index: `1 - cosine_similarity`.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    1.0 - cosine_similarity(a, b) as f64
}
