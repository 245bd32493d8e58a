//! Storage abstraction for chunk rows.
//!
//! The [`ChunkStore`] trait is everything the engines need from a backend:
//! per-entity reads, atomic write sets, a recency scan for brute-force
//! search, an optional nearest-neighbour query, and the oldest-first scan
//! behind the freshness pass.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{ChunkFilter, ChunkRecord, EmbeddingRefresh, EntityWrites};

/// Abstract chunk storage backend.
///
/// # Operations
///
/// | Method | Used by |
/// |--------|---------|
/// | [`entity_chunks`](ChunkStore::entity_chunks) | upsert: load current rows |
/// | [`apply_entity_writes`](ChunkStore::apply_entity_writes) | upsert: commit |
/// | [`recent_chunks`](ChunkStore::recent_chunks) | search, brute-force path |
/// | [`nearest_chunks`](ChunkStore::nearest_chunks) | search, ANN path |
/// | [`stale_chunks`](ChunkStore::stale_chunks) | freshness: select |
/// | [`apply_refreshes`](ChunkStore::apply_refreshes) | freshness: commit |
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// All rows for one entity, in any order.
    ///
    /// `entity_id = None` selects the rows stored without an entity id.
    async fn entity_chunks(
        &self,
        entity_type: &str,
        entity_id: Option<&str>,
    ) -> Result<Vec<ChunkRecord>>;

    /// Apply inserts, rewrites and pruning as one transaction.
    ///
    /// Returns the ids of rewritten and inserted rows. On error nothing
    /// from `writes` may remain applied.
    async fn apply_entity_writes(&self, writes: &EntityWrites) -> Result<Vec<i64>>;

    /// Up to `limit` matching rows, most recently written first.
    async fn recent_chunks(&self, filter: &ChunkFilter<'_>, limit: usize)
        -> Result<Vec<ChunkRecord>>;

    /// Whether [`nearest_chunks`](ChunkStore::nearest_chunks) is backed by a
    /// native vector index.
    fn supports_ann(&self) -> bool {
        false
    }

    /// The `k` matching rows closest to `query` by cosine distance, nearest
    /// first, each paired with its distance.
    ///
    /// `probes` tunes recall against speed where the index supports it.
    async fn nearest_chunks(
        &self,
        _query: &[f32],
        _k: usize,
        _filter: &ChunkFilter<'_>,
        _probes: Option<u32>,
    ) -> Result<Vec<(ChunkRecord, f64)>> {
        bail!("this store has no vector index")
    }

    /// Up to `limit` matching rows with `ts < cutoff`, oldest first.
    ///
    /// `cutoff = None` selects regardless of age.
    async fn stale_chunks(
        &self,
        cutoff: Option<DateTime<Utc>>,
        filter: &ChunkFilter<'_>,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>>;

    /// Overwrite the embedding columns of existing rows as one transaction.
    ///
    /// `reembed_ts` is merged into the row's `meta` as stored at update time
    /// (see [`mark_reembedded`](crate::freshness::mark_reembedded)). Rows that
    /// were deleted, or whose `text_hash` changed since selection, are
    /// skipped. Returns the ids that were updated.
    async fn apply_refreshes(&self, refreshes: &[EmbeddingRefresh]) -> Result<Vec<i64>>;

    /// Number of matching rows.
    async fn count(&self, filter: &ChunkFilter<'_>) -> Result<i64>;
}

/// Lets callers pick a backend at runtime with `Box<dyn ChunkStore>`.
#[async_trait]
impl<T: ChunkStore + ?Sized> ChunkStore for Box<T> {
    async fn entity_chunks(
        &self,
        entity_type: &str,
        entity_id: Option<&str>,
    ) -> Result<Vec<ChunkRecord>> {
        (**self).entity_chunks(entity_type, entity_id).await
    }

    async fn apply_entity_writes(&self, writes: &EntityWrites) -> Result<Vec<i64>> {
        (**self).apply_entity_writes(writes).await
    }

    async fn recent_chunks(
        &self,
        filter: &ChunkFilter<'_>,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>> {
        (**self).recent_chunks(filter, limit).await
    }

    fn supports_ann(&self) -> bool {
        (**self).supports_ann()
    }

    async fn nearest_chunks(
        &self,
        query: &[f32],
        k: usize,
        filter: &ChunkFilter<'_>,
        probes: Option<u32>,
    ) -> Result<Vec<(ChunkRecord, f64)>> {
        (**self).nearest_chunks(query, k, filter, probes).await
    }

    async fn stale_chunks(
        &self,
        cutoff: Option<DateTime<Utc>>,
        filter: &ChunkFilter<'_>,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>> {
        (**self).stale_chunks(cutoff, filter, limit).await
    }

    async fn apply_refreshes(&self, refreshes: &[EmbeddingRefresh]) -> Result<Vec<i64>> {
        (**self).apply_refreshes(refreshes).await
    }

    async fn count(&self, filter: &ChunkFilter<'_>) -> Result<i64> {
        (**self).count(filter).await
    }
}
