//! Postgres + pgvector [`ChunkStore`] (cargo feature `postgres`).
//!
//! Same `embedding` table shape as the SQLite store, with a `vector(dims)`
//! column and an ivfflat cosine index, so search takes the ANN path:
//! `ORDER BY embedding <=> $1` with `SET LOCAL ivfflat.probes` applied
//! inside the query transaction when probes are configured.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use embedstore_core::models::{ChunkFilter, ChunkRecord, EmbeddingRefresh, EntityWrites};
use embedstore_core::store::ChunkStore;

use crate::sqlite_store::{meta_to_text, millis_to_ts, ts_to_millis};

const COLUMNS: &str = "id, provider, model, entity_type, entity_id, scope_id, title, text, \
                       text_hash, chunk_index, meta::text AS meta, embedding, ts";

/// Name of the ivfflat index created with the schema.
pub const VECTOR_INDEX: &str = "idx_embedding_vec";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn connect_pool(url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await
        .context("Failed to connect to postgres")
}

/// Idempotent pgvector schema for vectors of `dims`.
///
/// `lists` only applies when the vector index is first created; use
/// `estore index create` to build one with different settings.
pub async fn apply_schema(pool: &PgPool, dims: usize, lists: u32) -> Result<()> {
    if dims == 0 {
        bail!("embedding.dims must be set for the postgres store");
    }

    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(pool)
        .await?;
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS embedding (
            id BIGSERIAL PRIMARY KEY,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            scope_id TEXT,
            title TEXT,
            text TEXT NOT NULL,
            text_hash TEXT NOT NULL,
            chunk_index BIGINT NOT NULL DEFAULT 0,
            meta JSONB,
            embedding vector({dims}) NOT NULL,
            dim BIGINT NOT NULL,
            ts BIGINT NOT NULL
        )
        "#
    ))
    .execute(pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quota_usage (
            id BIGSERIAL PRIMARY KEY,
            ts BIGINT NOT NULL,
            provider TEXT NOT NULL,
            metric TEXT NOT NULL,
            amount BIGINT NOT NULL DEFAULT 0,
            scope_id TEXT,
            request_id TEXT,
            endpoint TEXT,
            extra TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_quota_usage_ts ON quota_usage(ts)")
        .execute(pool)
        .await?;

    for column in ["entity_type", "entity_id", "scope_id", "text_hash", "ts"] {
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_embedding_{column} ON embedding({column})"
        ))
        .execute(pool)
        .await?;
    }
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embedding_entity_chunk \
         ON embedding(entity_type, entity_id, chunk_index)",
    )
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {VECTOR_INDEX} ON embedding \
         USING ivfflat (embedding vector_cosine_ops) WITH (lists = {lists})"
    ))
    .execute(pool)
    .await?;

    Ok(())
}

fn row_to_record(row: &PgRow) -> Result<ChunkRecord> {
    let meta: Option<String> = row.try_get("meta")?;
    let meta = match meta {
        Some(text) => serde_json::from_str(&text).context("embedding.meta is not valid JSON")?,
        None => serde_json::Value::Null,
    };
    let vector: Vector = row.try_get("embedding")?;

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
        embedding: vector.to_vec(),
        ts: millis_to_ts(row.try_get("ts")?)?,
    })
}

fn rows_to_records(rows: &[PgRow]) -> Result<Vec<ChunkRecord>> {
    rows.iter().map(row_to_record).collect()
}

#[async_trait]
impl ChunkStore for PgStore {
    async fn entity_chunks(
        &self,
        entity_type: &str,
        entity_id: Option<&str>,
    ) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM embedding \
             WHERE entity_type = $1 AND entity_id IS NOT DISTINCT FROM $2 \
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
                    provider = $1, model = $2, scope_id = $3, title = $4, text = $5,
                    text_hash = $6, meta = $7::jsonb, embedding = $8, dim = $9, ts = $10
                WHERE id = $11
                "#,
            )
            .bind(&rw.provider)
            .bind(&rw.model)
            .bind(&rw.scope_id)
            .bind(&rw.title)
            .bind(&rw.text)
            .bind(&rw.text_hash)
            .bind(meta_to_text(&rw.meta))
            .bind(Vector::from(rw.embedding.clone()))
            .bind(rw.embedding.len() as i64)
            .bind(ts_to_millis(rw.ts))
            .bind(rw.id)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 0 {
                return Err(anyhow!("chunk row {} disappeared during upsert", rw.id));
            }
            touched.push(rw.id);
        }

        for ins in &writes.inserts {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO embedding (provider, model, entity_type, entity_id, scope_id,
                                       title, text, text_hash, chunk_index, meta,
                                       embedding, dim, ts)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10::jsonb, $11, $12, $13)
                RETURNING id
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
            .bind(Vector::from(ins.embedding.clone()))
            .bind(ins.embedding.len() as i64)
            .bind(ts_to_millis(ins.ts))
            .fetch_one(&mut *tx)
            .await?;
            touched.push(id);
        }

        if let Some(from) = writes.prune_from {
            sqlx::query(
                "DELETE FROM embedding \
                 WHERE entity_type = $1 AND entity_id IS NOT DISTINCT FROM $2 AND chunk_index >= $3",
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
             WHERE ($1::text IS NULL OR entity_type = $1) AND ($2::text IS NULL OR scope_id = $2) \
             ORDER BY ts DESC, id DESC \
             LIMIT $3"
        ))
        .bind(filter.entity_type)
        .bind(filter.scope_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows_to_records(&rows)
    }

    fn supports_ann(&self) -> bool {
        true
    }

    async fn nearest_chunks(
        &self,
        query: &[f32],
        k: usize,
        filter: &ChunkFilter<'_>,
        probes: Option<u32>,
    ) -> Result<Vec<(ChunkRecord, f64)>> {
        let mut tx = self.pool.begin().await?;
        if let Some(probes) = probes {
            // SET does not take bind parameters
            sqlx::query(&format!("SET LOCAL ivfflat.probes = {probes}"))
                .execute(&mut *tx)
                .await?;
        }

        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS}, (embedding <=> $1)::float8 AS distance FROM embedding \
             WHERE ($2::text IS NULL OR entity_type = $2) AND ($3::text IS NULL OR scope_id = $3) \
             ORDER BY embedding <=> $1 ASC, id ASC \
             LIMIT $4"
        ))
        .bind(Vector::from(query.to_vec()))
        .bind(filter.entity_type)
        .bind(filter.scope_id)
        .bind(k as i64)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        rows.iter()
            .map(|row| {
                let distance: f64 = row.try_get("distance")?;
                Ok((row_to_record(row)?, distance))
            })
            .collect()
    }

    async fn stale_chunks(
        &self,
        cutoff: Option<DateTime<Utc>>,
        filter: &ChunkFilter<'_>,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM embedding \
             WHERE ($1::text IS NULL OR entity_type = $1) AND ($2::text IS NULL OR scope_id = $2) \
               AND ($3::bigint IS NULL OR ts < $3) \
             ORDER BY ts ASC, id ASC \
             LIMIT $4"
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
            let result = sqlx::query(
                r#"
                UPDATE embedding SET
                    provider = $1, model = $2, embedding = $3, dim = $4, ts = $5,
                    meta = CASE
                        WHEN meta IS NULL OR jsonb_typeof(meta) = 'null'
                            THEN jsonb_build_object('reembed_ts', $6::text)
                        WHEN jsonb_typeof(meta) = 'object'
                            THEN jsonb_set(meta, '{reembed_ts}', to_jsonb($6::text))
                        ELSE jsonb_build_object('value', meta, 'reembed_ts', $6::text)
                    END
                WHERE id = $7 AND text_hash = $8
                "#,
            )
            .bind(&rf.provider)
            .bind(&rf.model)
            .bind(Vector::from(rf.embedding.clone()))
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
             WHERE ($1::text IS NULL OR entity_type = $1) AND ($2::text IS NULL OR scope_id = $2)",
        )
        .bind(filter.entity_type)
        .bind(filter.scope_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(n)
    }
}
