//! Composition root tying a store, an embedding client and a usage sink.
//!
//! [`EmbeddingIndex`] owns no state of its own; every call delegates to the
//! engine modules. Stores are generic so the in-memory and database
//! backends share one code path.

use std::sync::Arc;

use crate::embedding::Embedder;
use crate::error::IndexResult;
use crate::freshness::{self, ReembedOptions};
use crate::models::{ReembedReport, SearchHit};
use crate::search::{self, SearchParams, SearchPath, SearchRequest};
use crate::store::ChunkStore;
use crate::upsert::{self, UpsertRequest};
use crate::usage::{NoopUsage, UsageRecorder};

pub struct EmbeddingIndex<S> {
    store: S,
    embedder: Arc<dyn Embedder>,
    usage: Arc<dyn UsageRecorder>,
    search_params: SearchParams,
}

impl<S: ChunkStore> EmbeddingIndex<S> {
    /// Index with default search params and no usage accounting.
    pub fn new(store: S, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            usage: Arc::new(NoopUsage),
            search_params: SearchParams::default(),
        }
    }

    pub fn with_usage(mut self, usage: Arc<dyn UsageRecorder>) -> Self {
        self.usage = usage;
        self
    }

    pub fn with_search_params(mut self, params: SearchParams) -> Self {
        self.search_params = params;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    pub fn search_path(&self) -> SearchPath {
        SearchPath::for_store(&self.store)
    }

    pub async fn upsert(&self, req: &UpsertRequest<'_>) -> IndexResult<Vec<i64>> {
        upsert::upsert(
            &self.store,
            self.embedder.as_ref(),
            self.usage.as_ref(),
            req,
        )
        .await
    }

    pub async fn search(&self, req: &SearchRequest<'_>) -> IndexResult<Vec<SearchHit>> {
        search::search(
            &self.store,
            self.embedder.as_ref(),
            self.usage.as_ref(),
            &self.search_params,
            req,
        )
        .await
    }

    pub async fn reembed_stale(&self, opts: &ReembedOptions<'_>) -> IndexResult<ReembedReport> {
        freshness::reembed_stale(
            &self.store,
            self.embedder.as_ref(),
            self.usage.as_ref(),
            opts,
        )
        .await
    }
}
