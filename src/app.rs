//! Wiring from [`Config`] to a ready [`EmbeddingIndex`].

use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

use embedstore_core::store::ChunkStore;
use embedstore_core::usage::{NoopUsage, UsageRecorder};
use embedstore_core::EmbeddingIndex;

use crate::config::Config;
use crate::db::{self, DbPool};
use crate::embedding::create_embedder;
use crate::sqlite_store::SqliteStore;
use crate::usage_log::QuotaUsageRecorder;

/// Store chosen at runtime from `[db]`.
pub type DynStore = Box<dyn ChunkStore>;

/// An index plus the handles the CLI needs to shut it down cleanly.
pub struct App {
    pub index: Arc<EmbeddingIndex<DynStore>>,
    pub pool: DbPool,
    usage: Option<QuotaUsageRecorder>,
}

impl App {
    /// Wait for pending usage writes.
    pub async fn shutdown(&self) {
        if let Some(usage) = &self.usage {
            usage.flush().await;
        }
    }
}

fn store_for(pool: &DbPool) -> DynStore {
    match pool {
        DbPool::Sqlite(p) => Box::new(SqliteStore::new(p.clone())),
        #[cfg(feature = "postgres")]
        DbPool::Postgres(p) => Box::new(crate::pg_store::PgStore::new(p.clone())),
    }
}

/// Open the configured store (creating the schema if needed) and build the
/// index around it. Usage events go to the same database as the chunks.
pub async fn open(config: &Config) -> Result<App> {
    let embedder = create_embedder(&config.embedding)?;
    let pool = db::open(config).await?;
    let store = store_for(&pool);
    let usage = config
        .usage
        .enabled
        .then(|| QuotaUsageRecorder::new(pool.clone()));
    debug!(
        backend = pool.backend(),
        provider = embedder.provider(),
        model = embedder.default_model(),
        ann = store.supports_ann(),
        usage = usage.is_some(),
        "index opened"
    );

    let recorder: Arc<dyn UsageRecorder> = match &usage {
        Some(u) => Arc::new(u.clone()),
        None => Arc::new(NoopUsage),
    };
    let index = EmbeddingIndex::new(store, embedder)
        .with_usage(recorder)
        .with_search_params(config.retrieval.search_params());

    Ok(App {
        index: Arc::new(index),
        pool,
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedstore_core::search::SearchRequest;
    use embedstore_core::upsert::UpsertRequest;

    use crate::usage_log::usage_totals;

    #[tokio::test]
    async fn test_usage_lands_in_configured_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_path(dir.path().join("app.sqlite"));
        let app = open(&config).await.unwrap();
        assert_eq!(app.pool.backend(), "sqlite");

        app.index
            .upsert(&UpsertRequest::new("doc", Some("d1"), "hello world"))
            .await
            .unwrap();
        app.index
            .search(&SearchRequest::new("hello"))
            .await
            .unwrap();
        app.shutdown().await;

        let totals = usage_totals(&app.pool).await.unwrap();
        let requests: i64 = totals
            .iter()
            .filter(|(_, metric, _)| metric == "requests")
            .map(|(_, _, n)| n)
            .sum();
        assert_eq!(requests, 2);
    }

    #[tokio::test]
    async fn test_usage_disabled_records_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_path(dir.path().join("app.sqlite"));
        config.usage.enabled = false;
        let app = open(&config).await.unwrap();

        app.index
            .upsert(&UpsertRequest::new("doc", Some("d1"), "hello world"))
            .await
            .unwrap();
        app.shutdown().await;

        assert!(usage_totals(&app.pool).await.unwrap().is_empty());
    }
}
