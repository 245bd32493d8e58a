//! In-memory [`ChunkStore`] implementation for tests and embedded use.
//!
//! Rows live in a `Vec` behind `std::sync::RwLock`. Ids come from an atomic
//! sequence, so they increase monotonically even under concurrent writers.
//! Write sets are staged on a copy and swapped in, which makes each call
//! all-or-nothing.
//!
//! [`InMemoryStore::with_ann`] makes the store answer
//! [`nearest_chunks`](ChunkStore::nearest_chunks) by exact cosine distance over
//! every row, standing in for a native vector index.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::cosine_distance;
use crate::freshness::mark_reembedded;
use crate::models::{ChunkFilter, ChunkRecord, EmbeddingRefresh, EntityWrites};

use super::ChunkStore;

/// In-memory chunk store.
pub struct InMemoryStore {
    rows: RwLock<Vec<ChunkRecord>>,
    next_id: AtomicI64,
    ann: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
            ann: false,
        }
    }

    /// A store that advertises ANN support (exact ordering by cosine distance).
    pub fn with_ann() -> Self {
        Self {
            ann: true,
            ..Self::new()
        }
    }

    /// Snapshot of every row, ordered by id.
    pub fn rows(&self) -> Result<Vec<ChunkRecord>> {
        let mut rows = self.read()?.clone();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    /// Insert a fully-formed row as-is, assigning a fresh id.
    ///
    /// Lets tests seed rows with arbitrary timestamps.
    pub fn insert_raw(&self, mut row: ChunkRecord) -> Result<i64> {
        row.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = row.id;
        self.write()?.push(row);
        Ok(id)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<ChunkRecord>>> {
        self.rows
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<ChunkRecord>>> {
        self.rows
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn same_entity(row: &ChunkRecord, entity_type: &str, entity_id: Option<&str>) -> bool {
    row.entity_type == entity_type && row.entity_id.as_deref() == entity_id
}

#[async_trait]
impl ChunkStore for InMemoryStore {
    async fn entity_chunks(
        &self,
        entity_type: &str,
        entity_id: Option<&str>,
    ) -> Result<Vec<ChunkRecord>> {
        Ok(self
            .read()?
            .iter()
            .filter(|r| same_entity(r, entity_type, entity_id))
            .cloned()
            .collect())
    }

    async fn apply_entity_writes(&self, writes: &EntityWrites) -> Result<Vec<i64>> {
        let mut guard = self.write()?;
        let mut staged = guard.clone();
        let mut touched = Vec::with_capacity(writes.rewrites.len() + writes.inserts.len());

        for rw in &writes.rewrites {
            let row = staged
                .iter_mut()
                .find(|r| r.id == rw.id)
                .ok_or_else(|| anyhow!("chunk row {} disappeared during upsert", rw.id))?;
            row.provider = rw.provider.clone();
            row.model = rw.model.clone();
            row.scope_id = rw.scope_id.clone();
            row.title = rw.title.clone();
            row.text = rw.text.clone();
            row.text_hash = rw.text_hash.clone();
            row.meta = rw.meta.clone();
            row.embedding = rw.embedding.clone();
            row.ts = rw.ts;
            touched.push(rw.id);
        }

        for ins in &writes.inserts {
            if ins.entity_type != writes.entity_type || ins.entity_id != writes.entity_id {
                bail!("insert does not belong to the entity being written");
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            staged.push(ChunkRecord {
                id,
                provider: ins.provider.clone(),
                model: ins.model.clone(),
                entity_type: ins.entity_type.clone(),
                entity_id: ins.entity_id.clone(),
                scope_id: ins.scope_id.clone(),
                title: ins.title.clone(),
                text: ins.text.clone(),
                text_hash: ins.text_hash.clone(),
                chunk_index: ins.chunk_index,
                meta: ins.meta.clone(),
                embedding: ins.embedding.clone(),
                ts: ins.ts,
            });
            touched.push(id);
        }

        if let Some(from) = writes.prune_from {
            let entity_id = writes.entity_id.as_deref();
            staged.retain(|r| {
                !(same_entity(r, &writes.entity_type, entity_id) && r.chunk_index >= from)
            });
        }

        *guard = staged;
        Ok(touched)
    }

    async fn recent_chunks(
        &self,
        filter: &ChunkFilter<'_>,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>> {
        let mut rows: Vec<ChunkRecord> = self
            .read()?
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.ts.cmp(&a.ts).then(b.id.cmp(&a.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    fn supports_ann(&self) -> bool {
        self.ann
    }

    async fn nearest_chunks(
        &self,
        query: &[f32],
        k: usize,
        filter: &ChunkFilter<'_>,
        _probes: Option<u32>,
    ) -> Result<Vec<(ChunkRecord, f64)>> {
        if !self.ann {
            bail!("this store has no vector index");
        }
        let mut scored: Vec<(ChunkRecord, f64)> = self
            .read()?
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| (r.clone(), cosine_distance(query, &r.embedding)))
            .collect();
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.id.cmp(&b.0.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn stale_chunks(
        &self,
        cutoff: Option<DateTime<Utc>>,
        filter: &ChunkFilter<'_>,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>> {
        let mut rows: Vec<ChunkRecord> = self
            .read()?
            .iter()
            .filter(|r| filter.matches(r))
            .filter(|r| cutoff.map_or(true, |c| r.ts < c))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.ts.cmp(&b.ts).then(a.id.cmp(&b.id)));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn apply_refreshes(&self, refreshes: &[EmbeddingRefresh]) -> Result<Vec<i64>> {
        let mut guard = self.write()?;
        let mut updated = Vec::with_capacity(refreshes.len());
        for rf in refreshes {
            let row = guard
                .iter_mut()
                .find(|r| r.id == rf.id && r.text_hash == rf.text_hash);
            if let Some(row) = row {
                row.provider = rf.provider.clone();
                row.model = rf.model.clone();
                row.embedding = rf.embedding.clone();
                row.meta = mark_reembedded(&row.meta, &rf.reembed_ts);
                row.ts = rf.ts;
                updated.push(rf.id);
            }
        }
        Ok(updated)
    }

    async fn count(&self, filter: &ChunkFilter<'_>) -> Result<i64> {
        Ok(self.read()?.iter().filter(|r| filter.matches(r)).count() as i64)
    }
}
