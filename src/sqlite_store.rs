//! SQLite-backed [`ChunkStore`] implementation.
//!
//! Rows live in the `embedding` table created by [`migrate`](crate::migrate).
//! Vectors are stored as little-endian f32 BLOBs, `meta` as JSON text and
//! `ts` as unix milliseconds. SQLite has no vector index, so
//! [`supports_ann`](ChunkStore::supports_ann) stays `false` and search uses
//! the brute-force path.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use embedstore_core::embedding::{blob_to_vec, vec_to_blob};
use embedstore_core::models::{ChunkFilter, ChunkRecord, EmbeddingRefresh, EntityWrites};
use embedstore_core::store::ChunkStore;

const COLUMNS: &str = "id, provider, model, entity_type, entity_id, scope_id, title, text, \
                       text_hash, chunk_index, meta, embedding, ts";

/// SQLite implementation of [`ChunkStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn ts_to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn millis_to_ts(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp out of range: {}", ms))
}

pub(crate) fn meta_to_text(meta: &serde_json::Value) -> Option<String> {
    if meta.is_null() {
        None
    } else {
        Some(meta.to_string())
    }
}

fn row_to_record(row: &SqliteRow) -> Result<ChunkRecord> {
    let meta: Option<String> = row.try_get("meta")?;
    let meta = match meta {
        Some(text) if !text.is_empty() => {
            serde_json::from_str(&text).context("embedding.meta is not valid JSON")?
        }
        _ => serde_json::Value::Null,
    };
    let blob: Vec<u8> = row.try_get("embedding")?;

    Ok(ChunkRecord {
        id: row.try_get("id")?,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        entity_type: row.try_get("entity_type")?,
        entity_id: row.try_get("entity_id")?,
        scope_id: row.try_get("scope_id")?,
        title: row.try_get("title")?,
        text: row.try_get("text")?,
        text_hash: row.try_get("text_hash")?,
        chunk_index: row.try_get("chunk_index")?,
        meta,
        embedding: blob_to_vec(&blob),
        ts: millis_to_ts(row.try_get("ts")?)?,
    })
}

fn rows_to_records(rows: &[SqliteRow]) -> Result<Vec<ChunkRecord>> {
    rows.iter().map(row_to_record).collect()
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn entity_chunks(
        &self,
        entity_type: &str,
        entity_id: Option<&str>,
    ) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM embedding \
             WHERE entity_type = ? AND entity_id IS ? \
             ORDER BY chunk_index ASC, id ASC"
        ))
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        rows_to_records(&rows)
    }

    async fn apply_entity_writes(&self, writes: &EntityWrites) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut touched = Vec::with_capacity(writes.rewrites.len() + writes.inserts.len());

        for rw in &writes.rewrites {
            let result = sqlx::query(
                r#"
                UPDATE embedding SET
                    provider = ?, model = ?, scope_id = ?, title = ?, text = ?,
                    text_hash = ?, meta = ?, embedding = ?, dim = ?, ts = ?
                WHERE id = ?
                "#,
            )
            .bind(&rw.provider)
            .bind(&rw.model)
            .bind(&rw.scope_id)
            .bind(&rw.title)
            .bind(&rw.text)
            .bind(&rw.text_hash)
            .bind(meta_to_text(&rw.meta))
            .bind(vec_to_blob(&rw.embedding))
            .bind(rw.embedding.len() as i64)
            .bind(ts_to_millis(rw.ts))
            .bind(rw.id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                // Dropping the transaction rolls it back
                return Err(anyhow!("chunk row {} disappeared during upsert", rw.id));
            }
            touched.push(rw.id);
        }

        for ins in &writes.inserts {
            let result = sqlx::query(
                r#"
                INSERT INTO embedding (provider, model, entity_type, entity_id, scope_id,
                                       title, text, text_hash, chunk_index, meta,
                                       embedding, dim, ts)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&ins.provider)
            .bind(&ins.model)
            .bind(&ins.entity_type)
            .bind(&ins.entity_id)
            .bind(&ins.scope_id)
            .bind(&ins.title)
            .bind(&ins.text)
            .bind(&ins.text_hash)
            .bind(ins.chunk_index)
            .bind(meta_to_text(&ins.meta))
            .bind(vec_to_blob(&ins.embedding))
            .bind(ins.embedding.len() as i64)
            .bind(ts_to_millis(ins.ts))
            .execute(&mut *tx)
            .await?;
            touched.push(result.last_insert_rowid());
        }

        if let Some(from) = writes.prune_from {
            sqlx::query(
                "DELETE FROM embedding WHERE entity_type = ? AND entity_id IS ? AND chunk_index >= ?",
            )
            .bind(&writes.entity_type)
            .bind(&writes.entity_id)
            .bind(from)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(touched)
    }

    async fn recent_chunks(
        &self,
        filter: &ChunkFilter<'_>,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM embedding \
             WHERE (?1 IS NULL OR entity_type = ?1) AND (?2 IS NULL OR scope_id = ?2) \
             ORDER BY ts DESC, id DESC \
             LIMIT ?3"
        ))
        .bind(filter.entity_type)
        .bind(filter.scope_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows_to_records(&rows)
    }

    async fn stale_chunks(
        &self,
        cutoff: Option<DateTime<Utc>>,
        filter: &ChunkFilter<'_>,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM embedding \
             WHERE (?1 IS NULL OR entity_type = ?1) AND (?2 IS NULL OR scope_id = ?2) \
               AND (?3 IS NULL OR ts < ?3) \
             ORDER BY ts ASC, id ASC \
             LIMIT ?4"
        ))
        .bind(filter.entity_type)
        .bind(filter.scope_id)
        .bind(cutoff.map(ts_to_millis))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows_to_records(&rows)
    }

    async fn apply_refreshes(&self, refreshes: &[EmbeddingRefresh]) -> Result<Vec<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut updated = Vec::with_capacity(refreshes.len());

        for rf in refreshes {
            // meta is merged in SQL so a concurrent meta edit survives
            let result = sqlx::query(
                r#"
                UPDATE embedding SET
                    provider = ?1, model = ?2, embedding = ?3, dim = ?4, ts = ?5,
                    meta = CASE
                        WHEN meta IS NULL OR meta = '' THEN json_object('reembed_ts', ?6)
                        WHEN json_type(meta) = 'object' THEN json_set(meta, '$.reembed_ts', ?6)
                        WHEN json_type(meta) = 'null' THEN json_object('reembed_ts', ?6)
                        ELSE json_object('value', json(meta), 'reembed_ts', ?6)
                    END
                WHERE id = ?7 AND text_hash = ?8
                "#,
            )
            .bind(&rf.provider)
            .bind(&rf.model)
            .bind(vec_to_blob(&rf.embedding))
            .bind(rf.embedding.len() as i64)
            .bind(ts_to_millis(rf.ts))
            .bind(&rf.reembed_ts)
            .bind(rf.id)
            .bind(&rf.text_hash)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                updated.push(rf.id);
            }
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn count(&self, filter: &ChunkFilter<'_>) -> Result<i64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM embedding \
             WHERE (?1 IS NULL OR entity_type = ?1) AND (?2 IS NULL OR scope_id = ?2)",
        )
        .bind(filter.entity_type)
        .bind(filter.scope_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }
}
