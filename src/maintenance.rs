//! Vector index maintenance for the pgvector store.
//!
//! ivfflat picks its list centroids from the rows present when the index is
//! built, so after bulk loads the planner statistics and the index both need
//! refreshing. `estore index` exposes:
//!
//! - `analyze [--reindex]`: `ANALYZE embedding`, then optionally
//!   `REINDEX INDEX CONCURRENTLY` on the schema's vector index. A reindex
//!   failure is reported, not raised.
//! - `create` / `drop`: an alternate ivfflat index with its own `lists`.
//!
//! On SQLite every action is a no-op.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::db::DbPool;

pub const DEFAULT_IVFFLAT_LISTS: u32 = 100;
pub const MIN_IVFFLAT_LISTS: u32 = 10;
pub const MAX_IVFFLAT_LISTS: u32 = 65535;

pub fn clamp_lists(lists: u32) -> u32 {
    lists.clamp(MIN_IVFFLAT_LISTS, MAX_IVFFLAT_LISTS)
}

/// Name for an alternate index: `name` if given, else
/// `idx_embedding_vec_l{lists}`. Only ASCII letters, digits and `_` are
/// accepted since the name is spliced into DDL.
pub fn alt_index_name(name: Option<&str>, lists: u32) -> Result<String> {
    let name = match name {
        Some(n) => n.to_string(),
        None => format!("idx_embedding_vec_l{}", lists),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("invalid index name: {:?}", name);
    }
    Ok(name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexAction {
    Analyze,
    Create,
    Drop,
    Noop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub def: String,
}

/// Outcome of one maintenance call, printed as JSON by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub backend: &'static str,
    pub action: IndexAction,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub analyzed: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reindexed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reindex_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lists: Option<u32>,
    /// Indexes on `embedding` after the action.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexInfo>,
}

impl MaintenanceReport {
    fn noop(backend: &'static str) -> Self {
        Self {
            backend,
            action: IndexAction::Noop,
            analyzed: false,
            reindexed: false,
            reindex_error: None,
            index: None,
            lists: None,
            indexes: Vec::new(),
        }
    }
}

/// Refresh planner statistics and optionally rebuild the vector index.
#[cfg_attr(not(feature = "postgres"), allow(unused_variables))]
pub async fn analyze(pool: &DbPool, reindex: bool) -> Result<MaintenanceReport> {
    match pool {
        DbPool::Sqlite(_) => Ok(MaintenanceReport::noop(pool.backend())),
        #[cfg(feature = "postgres")]
        DbPool::Postgres(pg) => pg_ops::analyze(pg, reindex).await,
    }
}

/// Create or drop an alternate ivfflat index. `lists` is clamped.
#[cfg_attr(not(feature = "postgres"), allow(unused_variables))]
pub async fn alt_index(
    pool: &DbPool,
    action: IndexAction,
    lists: u32,
    name: Option<&str>,
) -> Result<MaintenanceReport> {
    if !matches!(action, IndexAction::Create | IndexAction::Drop) {
        bail!("alternate index action must be create or drop");
    }
    let lists = clamp_lists(lists);
    let name = alt_index_name(name, lists)?;
    match pool {
        DbPool::Sqlite(_) => Ok(MaintenanceReport::noop(pool.backend())),
        #[cfg(feature = "postgres")]
        DbPool::Postgres(pg) => pg_ops::alt_index(pg, action, lists, &name).await,
    }
}

#[cfg(feature = "postgres")]
mod pg_ops {
    use anyhow::Result;
    use sqlx::PgPool;
    use tracing::{info, warn};

    use super::{IndexAction, IndexInfo, MaintenanceReport};
    use crate::pg_store::VECTOR_INDEX;

    fn report(action: IndexAction) -> MaintenanceReport {
        MaintenanceReport {
            action,
            ..MaintenanceReport::noop("postgres")
        }
    }

    // CONCURRENTLY cannot run inside a transaction; pool queries autocommit.
    pub(super) async fn analyze(pool: &PgPool, reindex: bool) -> Result<MaintenanceReport> {
        let mut out = report(IndexAction::Analyze);
        sqlx::query("ANALYZE embedding").execute(pool).await?;
        out.analyzed = true;

        if reindex {
            let sql = format!("REINDEX INDEX CONCURRENTLY {VECTOR_INDEX}");
            match sqlx::query(&sql).execute(pool).await {
                Ok(_) => out.reindexed = true,
                Err(e) => {
                    warn!(error = %e, index = VECTOR_INDEX, "reindex failed");
                    out.reindex_error = Some(e.to_string());
                }
            }
        }
        out.index = Some(VECTOR_INDEX.to_string());
        out.indexes = list_indexes(pool).await?;
        info!(reindexed = out.reindexed, "analyzed embedding table");
        Ok(out)
    }

    pub(super) async fn alt_index(
        pool: &PgPool,
        action: IndexAction,
        lists: u32,
        name: &str,
    ) -> Result<MaintenanceReport> {
        let sql = match action {
            IndexAction::Create => format!(
                "CREATE INDEX CONCURRENTLY IF NOT EXISTS {name} ON embedding \
                 USING ivfflat (embedding vector_cosine_ops) WITH (lists = {lists})"
            ),
            _ => format!("DROP INDEX CONCURRENTLY IF EXISTS {name}"),
        };
        sqlx::query(&sql).execute(pool).await?;
        info!(?action, index = name, lists, "alternate vector index updated");

        let mut out = report(action);
        out.index = Some(name.to_string());
        out.lists = Some(lists);
        out.indexes = list_indexes(pool).await?;
        Ok(out)
    }

    async fn list_indexes(pool: &PgPool) -> Result<Vec<IndexInfo>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT indexname, indexdef FROM pg_indexes \
             WHERE schemaname = current_schema() AND tablename = 'embedding' \
             ORDER BY indexname",
        )
        .fetch_all(pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(name, def)| IndexInfo { name, def })
            .collect())
    }
}
