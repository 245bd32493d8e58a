//! Retrieval engine: similarity search over stored chunks.
//!
//! Two interchangeable strategies, chosen by store capability:
//!
//! - **ANN** ([`ChunkStore::supports_ann`] is true): one ordered query for the
//!   `k` nearest rows by cosine distance; `score = 1 - distance`, or `0.0`
//!   when the distance is not finite.
//! - **Brute force**: scan the `max(recent_window, k)` most recently written
//!   matching rows and score each by cosine similarity in-process. This is a
//!   bounded recency window, not an exact top-k over the whole table.
//!
//! Both paths take the same request and return identically shaped
//! [`SearchHit`]s, higher score = more similar.

use tracing::debug;

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{IndexError, IndexResult};
use crate::models::{ChunkFilter, SearchHit};
use crate::store::ChunkStore;
use crate::usage::{record_embedding_call, UsageRecorder};

pub const DEFAULT_K: usize = 8;
/// Minimum number of recent rows the brute-force path scores.
pub const DEFAULT_RECENT_WINDOW: usize = 200;
/// Usage endpoint tag for query embedding calls.
pub const USAGE_ENDPOINT: &str = "embeddings.search";

/// Retrieval tuning, decoupled from application config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    /// Brute-force scan size is `max(recent_window, k)`.
    pub recent_window: usize,
    /// ANN recall/speed knob (e.g. ivfflat probes); ignored by brute force.
    pub probes: Option<u32>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            recent_window: DEFAULT_RECENT_WINDOW,
            probes: None,
        }
    }
}

/// Inputs for a single [`search`] call.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub k: usize,
    pub entity_type: Option<&'a str>,
    pub scope_id: Option<&'a str>,
    /// Model override for embedding the query.
    pub model: Option<&'a str>,
}

impl<'a> SearchRequest<'a> {
    pub fn new(query: &'a str) -> Self {
        Self {
            query,
            k: DEFAULT_K,
            entity_type: None,
            scope_id: None,
            model: None,
        }
    }

    pub fn filter(&self) -> ChunkFilter<'a> {
        ChunkFilter::new(self.entity_type, self.scope_id)
    }
}

/// Which strategy served a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPath {
    BruteForce,
    Ann,
}

impl SearchPath {
    pub fn for_store<S: ChunkStore + ?Sized>(store: &S) -> Self {
        if store.supports_ann() {
            SearchPath::Ann
        } else {
            SearchPath::BruteForce
        }
    }
}

/// ANN similarity for a cosine distance.
///
/// Zero-magnitude vectors have no defined distance (pgvector returns NaN);
/// they score `0.0`, matching [`cosine_similarity`] on the brute-force path.
pub fn score_from_distance(distance: f64) -> f64 {
    if distance.is_finite() {
        1.0 - distance
    } else {
        0.0
    }
}

/// Embed `req.query` once and return the `k` most similar chunks.
///
/// # Errors
///
/// - [`IndexError::Precondition`] for a blank query or `k == 0`.
/// - [`IndexError::Embedding`] if the query cannot be embedded.
/// - [`IndexError::Store`] if the store query fails.
///
/// No matching rows is not an error: the result is empty.
pub async fn search<S: ChunkStore + ?Sized>(
    store: &S,
    embedder: &dyn Embedder,
    usage: &dyn UsageRecorder,
    params: &SearchParams,
    req: &SearchRequest<'_>,
) -> IndexResult<Vec<SearchHit>> {
    if req.query.trim().is_empty() {
        return Err(IndexError::precondition("query text is required"));
    }
    if req.k == 0 {
        return Err(IndexError::precondition("k must be >= 1"));
    }

    let texts = vec![req.query.to_string()];
    let resp = embedder
        .embed(&texts, req.model)
        .await
        .map_err(IndexError::Embedding)?;
    record_embedding_call(
        usage,
        embedder.provider(),
        USAGE_ENDPOINT,
        req.scope_id,
        &texts,
    );
    let query_vec = resp
        .into_vectors(1)
        .map_err(IndexError::Embedding)?
        .into_iter()
        .next()
        .ok_or_else(|| IndexError::Embedding(anyhow::anyhow!("empty embedding response")))?;

    let filter = req.filter();
    let path = SearchPath::for_store(store);

    let mut hits: Vec<SearchHit> = match path {
        SearchPath::Ann => store
            .nearest_chunks(&query_vec, req.k, &filter, params.probes)
            .await
            .map_err(IndexError::Store)?
            .into_iter()
            .map(|(row, distance)| SearchHit::from_record(row, score_from_distance(distance)))
            .collect(),
        SearchPath::BruteForce => {
            let window = params.recent_window.max(req.k);
            store
                .recent_chunks(&filter, window)
                .await
                .map_err(IndexError::Store)?
                .into_iter()
                .map(|row| {
                    let score = cosine_similarity(&query_vec, &row.embedding) as f64;
                    SearchHit::from_record(row, score)
                })
                .collect()
        }
    };

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    hits.truncate(req.k);

    debug!(?path, k = req.k, returned = hits.len(), "search complete");
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChunkRecord;
    use crate::store::memory::InMemoryStore;
    use crate::upsert::tests::FakeEmbedder;
    use crate::usage::NoopUsage;
    use chrono::{Duration, Utc};

    fn row(entity_type: &str, scope: Option<&str>, text: &str) -> ChunkRecord {
        ChunkRecord {
            id: 0,
            provider: "fake".to_string(),
            model: "fake-model".to_string(),
            entity_type: entity_type.to_string(),
            entity_id: Some(format!("{}:{}", entity_type, text)),
            scope_id: scope.map(str::to_string),
            title: Some(text.to_string()),
            text: text.to_string(),
            text_hash: crate::chunk::fingerprint(text),
            chunk_index: 0,
            meta: serde_json::Value::Null,
            embedding: FakeEmbedder::vector_for(text),
            ts: Utc::now(),
        }
    }

    fn seed(store: &InMemoryStore) {
        for (et, scope, text) in [
            ("keyword", Some("123"), "running shoes"),
            ("keyword", Some("123"), "trail running shoes"),
            ("keyword", Some("456"), "running shoes sale"),
            ("campaign", Some("123"), "running shoes"),
            ("search_term", None, "cheap flights"),
        ] {
            store.insert_raw(row(et, scope, text)).unwrap();
        }
    }

    async fn run(store: &InMemoryStore, req: &SearchRequest<'_>) -> Vec<SearchHit> {
        search(
            store,
            &FakeEmbedder::new(),
            &NoopUsage,
            &SearchParams::default(),
            req,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_results_sorted_descending() {
        let store = InMemoryStore::new();
        seed(&store);
        let hits = run(&store, &SearchRequest::new("running shoes")).await;
        assert_eq!(hits.len(), 5);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_filters_exclude_better_scoring_rows() {
        for store in [InMemoryStore::new(), InMemoryStore::with_ann()] {
            seed(&store);
            let req = SearchRequest {
                entity_type: Some("keyword"),
                scope_id: Some("123"),
                ..SearchRequest::new("running shoes sale")
            };
            let hits = run(&store, &req).await;
            assert_eq!(hits.len(), 2);
            for h in &hits {
                assert_eq!(h.entity_type, "keyword");
                assert_eq!(h.scope_id.as_deref(), Some("123"));
            }
        }
    }

    #[tokio::test]
    async fn test_brute_force_and_ann_agree_on_top_result() {
        let brute = InMemoryStore::new();
        let ann = InMemoryStore::with_ann();
        seed(&brute);
        seed(&ann);
        assert_eq!(SearchPath::for_store(&brute), SearchPath::BruteForce);
        assert_eq!(SearchPath::for_store(&ann), SearchPath::Ann);

        for query in ["trail running shoes", "cheap flights", "running shoes sale"] {
            let req = SearchRequest {
                k: 3,
                ..SearchRequest::new(query)
            };
            let a = run(&brute, &req).await;
            let b = run(&ann, &req).await;
            assert_eq!(a[0].text, b[0].text, "top result differs for {query}");
            assert!((a[0].score - b[0].score).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn test_zero_vectors_score_zero() {
        let store = InMemoryStore::new();
        let mut r = row("doc", None, "placeholder");
        r.embedding = vec![0.0; 8];
        store.insert_raw(r).unwrap();
        let hits = run(&store, &SearchRequest::new("anything")).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].score, 0.0);
    }

    /// ANN store whose index reports NaN distances, as pgvector does for
    /// zero vectors.
    struct NanDistanceStore(InMemoryStore);

    #[async_trait::async_trait]
    impl ChunkStore for NanDistanceStore {
        async fn entity_chunks(
            &self,
            entity_type: &str,
            entity_id: Option<&str>,
        ) -> anyhow::Result<Vec<ChunkRecord>> {
            self.0.entity_chunks(entity_type, entity_id).await
        }

        async fn apply_entity_writes(
            &self,
            writes: &crate::models::EntityWrites,
        ) -> anyhow::Result<Vec<i64>> {
            self.0.apply_entity_writes(writes).await
        }

        async fn recent_chunks(
            &self,
            filter: &ChunkFilter<'_>,
            limit: usize,
        ) -> anyhow::Result<Vec<ChunkRecord>> {
            self.0.recent_chunks(filter, limit).await
        }

        fn supports_ann(&self) -> bool {
            true
        }

        async fn nearest_chunks(
            &self,
            _query: &[f32],
            k: usize,
            filter: &ChunkFilter<'_>,
            _probes: Option<u32>,
        ) -> anyhow::Result<Vec<(ChunkRecord, f64)>> {
            let rows = self.0.recent_chunks(filter, k).await?;
            Ok(rows.into_iter().map(|r| (r, f64::NAN)).collect())
        }

        async fn stale_chunks(
            &self,
            cutoff: Option<chrono::DateTime<Utc>>,
            filter: &ChunkFilter<'_>,
            limit: usize,
        ) -> anyhow::Result<Vec<ChunkRecord>> {
            self.0.stale_chunks(cutoff, filter, limit).await
        }

        async fn apply_refreshes(
            &self,
            refreshes: &[crate::models::EmbeddingRefresh],
        ) -> anyhow::Result<Vec<i64>> {
            self.0.apply_refreshes(refreshes).await
        }

        async fn count(&self, filter: &ChunkFilter<'_>) -> anyhow::Result<i64> {
            self.0.count(filter).await
        }
    }

    #[tokio::test]
    async fn test_zero_vectors_score_zero_on_both_paths() {
        let brute = InMemoryStore::new();
        let ann = NanDistanceStore(InMemoryStore::new());
        for store in [&brute, &ann.0] {
            let mut r = row("doc", None, "placeholder");
            r.embedding = vec![0.0; 8];
            store.insert_raw(r).unwrap();
        }
        assert_eq!(SearchPath::for_store(&ann), SearchPath::Ann);

        let req = SearchRequest::new("anything");
        let params = SearchParams::default();
        let embedder = FakeEmbedder::new();
        let a = search(&brute, &embedder, &NoopUsage, &params, &req)
            .await
            .unwrap();
        let b = search(&ann, &embedder, &NoopUsage, &params, &req)
            .await
            .unwrap();

        assert_eq!(a[0].score, 0.0);
        assert_eq!(b[0].score, 0.0);
        let json = serde_json::to_value(&b[0]).unwrap();
        assert_eq!(json["score"], serde_json::json!(0.0));
    }

    #[test]
    fn test_score_from_distance() {
        assert_eq!(score_from_distance(0.25), 0.75);
        assert_eq!(score_from_distance(f64::NAN), 0.0);
        assert_eq!(score_from_distance(f64::INFINITY), 0.0);
    }

    #[tokio::test]
    async fn test_k_truncates() {
        let store = InMemoryStore::with_ann();
        seed(&store);
        let req = SearchRequest {
            k: 2,
            ..SearchRequest::new("running")
        };
        assert_eq!(run(&store, &req).await.len(), 2);
    }

    #[tokio::test]
    async fn test_brute_force_scans_recent_window_only() {
        let store = InMemoryStore::new();
        let mut old = row("doc", None, "exact match");
        old.ts = Utc::now() - Duration::days(30);
        store.insert_raw(old).unwrap();
        store.insert_raw(row("doc", None, "something else")).unwrap();

        let hits = search(
            &store,
            &FakeEmbedder::new(),
            &NoopUsage,
            &SearchParams {
                recent_window: 1,
                probes: None,
            },
            &SearchRequest {
                k: 1,
                ..SearchRequest::new("exact match")
            },
        )
        .await
        .unwrap();

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "something else");
    }

    #[tokio::test]
    async fn test_empty_store_returns_nothing() {
        let store = InMemoryStore::new();
        assert!(run(&store, &SearchRequest::new("anything")).await.is_empty());
    }

    #[tokio::test]
    async fn test_blank_query_rejected_without_embedding() {
        let store = InMemoryStore::new();
        let embedder = FakeEmbedder::new();
        let err = search(
            &store,
            &embedder,
            &NoopUsage,
            &SearchParams::default(),
            &SearchRequest::new("  "),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IndexError::Precondition(_)));
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_gateway_failure_aborts_search() {
        let store = InMemoryStore::new();
        seed(&store);
        let embedder = FakeEmbedder::new();
        embedder
            .fail
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = search(
            &store,
            &embedder,
            &NoopUsage,
            &SearchParams::default(),
            &SearchRequest::new("running"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IndexError::Embedding(_)));
    }

    #[tokio::test]
    async fn test_model_override_forwarded() {
        let store = InMemoryStore::new();
        let embedder = FakeEmbedder::new();
        let req = SearchRequest {
            model: Some("text-embedding-3-large"),
            ..SearchRequest::new("running")
        };
        search(&store, &embedder, &NoopUsage, &SearchParams::default(), &req)
            .await
            .unwrap();
        assert_eq!(
            embedder.last_model.lock().unwrap().as_deref(),
            Some("text-embedding-3-large")
        );
    }
}
