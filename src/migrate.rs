use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create the schema on the configured backend. Returns the backend name.
pub async fn run_migrations(config: &Config) -> Result<&'static str> {
    let pool = db::open(config).await?;
    let backend = pool.backend();
    pool.close().await;
    Ok(backend)
}

/// Create the `embedding` and `quota_usage` tables and their indexes.
/// Safe to run repeatedly.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            scope_id TEXT,
            title TEXT,
            text TEXT NOT NULL,
            text_hash TEXT NOT NULL,
            chunk_index INTEGER NOT NULL DEFAULT 0,
            meta TEXT,
            embedding BLOB NOT NULL,
            dim INTEGER NOT NULL,
            ts INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Accounting sink; written fire-and-forget by the usage recorder
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS quota_usage (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts INTEGER NOT NULL,
            provider TEXT NOT NULL,
            metric TEXT NOT NULL,
            amount INTEGER NOT NULL DEFAULT 0,
            scope_id TEXT,
            request_id TEXT,
            endpoint TEXT,
            extra TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    for column in [
        "provider",
        "model",
        "entity_type",
        "entity_id",
        "scope_id",
        "text_hash",
        "ts",
    ] {
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
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_quota_usage_ts ON quota_usage(ts)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_quota_usage_provider ON quota_usage(provider)")
        .execute(pool)
        .await?;

    Ok(())
}
