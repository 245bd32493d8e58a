use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::config::Config;
use crate::migrate;

/// Connection pool for whichever backend `[db]` selects.
///
/// `db.url` picks Postgres (feature `postgres`); otherwise `db.path` is a
/// SQLite file.
#[derive(Clone, Debug)]
pub enum DbPool {
    Sqlite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(sqlx::PgPool),
}

/// Run `$body` with `$p` bound to the concrete pool of either backend.
///
/// The body is compiled once per backend, so plain `sqlx` calls work as
/// long as the SQL is valid on both.
macro_rules! on_pool {
    ($pool:expr, |$p:ident| $body:expr) => {
        match $pool {
            $crate::db::DbPool::Sqlite($p) => $body,
            #[cfg(feature = "postgres")]
            $crate::db::DbPool::Postgres($p) => $body,
        }
    };
}
pub(crate) use on_pool;

impl DbPool {
    pub fn backend(&self) -> &'static str {
        match self {
            DbPool::Sqlite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            DbPool::Postgres(_) => "postgres",
        }
    }

    pub async fn close(&self) {
        on_pool!(self, |p| p.close().await)
    }
}

/// Connect to the configured backend and make sure the schema exists.
pub async fn open(config: &Config) -> Result<DbPool> {
    match &config.db.url {
        Some(url) => open_postgres(url, config).await,
        None => {
            let pool = connect(config).await?;
            migrate::apply_schema(&pool).await?;
            Ok(DbPool::Sqlite(pool))
        }
    }
}

#[cfg(feature = "postgres")]
async fn open_postgres(url: &str, config: &Config) -> Result<DbPool> {
    let dims = match config.embedding.dims {
        Some(d) => d,
        None => anyhow::bail!("embedding.dims must be set when db.url is used"),
    };
    let pool = crate::pg_store::connect_pool(url).await?;
    crate::pg_store::apply_schema(&pool, dims, config.retrieval.ivfflat_lists()).await?;
    Ok(DbPool::Postgres(pool))
}

#[cfg(not(feature = "postgres"))]
async fn open_postgres(_url: &str, _config: &Config) -> Result<DbPool> {
    anyhow::bail!("db.url requires building with --features postgres")
}

pub async fn connect(config: &Config) -> Result<SqlitePool> {
    connect_path(&config.db.path).await
}

/// Open (creating if needed) the SQLite file at `db_path` in WAL mode.
pub async fn connect_path(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
