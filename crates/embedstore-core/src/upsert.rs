//! Upsert engine: make an entity's stored chunks match its current text.
//!
//! # Algorithm
//!
//! 1. Chunk the text; empty input is a no-op.
//! 2. Fingerprint every chunk.
//! 3. Load the entity's stored rows, keyed by `chunk_index`.
//! 4. Keep positions whose stored `text_hash` matches.
//! 5. Embed every changed or new chunk in **one** gateway call.
//! 6. Rewrite changed rows in place, insert new positions, and prune rows
//!    past the new chunk count, all in one store transaction.
//!
//! Re-submitting identical text therefore costs zero embedding calls.

use std::collections::HashMap;

use chrono::Utc;
use tracing::debug;

use crate::chunk::{chunk_words, fingerprint, DEFAULT_CHUNK_WORDS, DEFAULT_OVERLAP_WORDS};
use crate::embedding::Embedder;
use crate::error::{IndexError, IndexResult};
use crate::models::{ChunkRecord, ChunkRewrite, EntityWrites, NewChunk};
use crate::store::ChunkStore;
use crate::usage::{record_embedding_call, UsageRecorder};

/// Usage endpoint tag for upsert embedding calls.
pub const USAGE_ENDPOINT: &str = "embeddings.upsert";

/// Inputs for one [`upsert`] call.
#[derive(Debug, Clone)]
pub struct UpsertRequest<'a> {
    /// Required category tag (e.g. `"campaign"`, `"keyword"`).
    pub entity_type: &'a str,
    /// Logical source id; `None` for untagged content.
    pub entity_id: Option<&'a str>,
    pub scope_id: Option<&'a str>,
    pub title: Option<&'a str>,
    pub text: &'a str,
    /// Model override passed to the embedding client.
    pub model: Option<&'a str>,
    /// Opaque caller data, overwritten on every changed row.
    pub meta: Option<&'a serde_json::Value>,
    pub chunk_words: usize,
    pub overlap_words: usize,
}

impl<'a> UpsertRequest<'a> {
    pub fn new(entity_type: &'a str, entity_id: Option<&'a str>, text: &'a str) -> Self {
        Self {
            entity_type,
            entity_id,
            scope_id: None,
            title: None,
            text,
            model: None,
            meta: None,
            chunk_words: DEFAULT_CHUNK_WORDS,
            overlap_words: DEFAULT_OVERLAP_WORDS,
        }
    }
}

/// Reconcile the stored chunks of one entity with `req.text`.
///
/// Returns the ids of rows rewritten or inserted, ascending. Unchanged
/// chunks are not touched and keep their `ts`.
///
/// # Errors
///
/// - [`IndexError::Precondition`] for an empty `entity_type` or invalid
///   chunking parameters, before any store or gateway access.
/// - [`IndexError::Embedding`] if the gateway fails; nothing is written.
/// - [`IndexError::Store`] if loading or committing fails; the commit is
///   all-or-nothing.
pub async fn upsert<S: ChunkStore + ?Sized>(
    store: &S,
    embedder: &dyn Embedder,
    usage: &dyn UsageRecorder,
    req: &UpsertRequest<'_>,
) -> IndexResult<Vec<i64>> {
    if req.entity_type.trim().is_empty() {
        return Err(IndexError::precondition("entity_type is required"));
    }

    let chunks = chunk_words(req.text, req.chunk_words, req.overlap_words)?;
    if chunks.is_empty() {
        return Ok(Vec::new());
    }
    let hashes: Vec<String> = chunks.iter().map(|c| fingerprint(c)).collect();

    let existing = store
        .entity_chunks(req.entity_type, req.entity_id)
        .await
        .map_err(IndexError::Store)?;
    let by_index: HashMap<i64, &ChunkRecord> =
        existing.iter().map(|r| (r.chunk_index, r)).collect();

    let changed: Vec<usize> = (0..chunks.len())
        .filter(|&i| {
            by_index
                .get(&(i as i64))
                .map_or(true, |row| row.text_hash != hashes[i])
        })
        .collect();

    let new_len = chunks.len() as i64;
    let prune_from = existing
        .iter()
        .any(|r| r.chunk_index >= new_len)
        .then_some(new_len);

    debug!(
        entity_type = req.entity_type,
        entity_id = req.entity_id,
        chunks = chunks.len(),
        changed = changed.len(),
        pruning = prune_from.is_some(),
        "upsert plan"
    );

    if changed.is_empty() && prune_from.is_none() {
        return Ok(Vec::new());
    }

    let mut writes = EntityWrites {
        entity_type: req.entity_type.to_string(),
        entity_id: req.entity_id.map(str::to_string),
        inserts: Vec::new(),
        rewrites: Vec::new(),
        prune_from,
    };

    if !changed.is_empty() {
        let texts: Vec<String> = changed.iter().map(|&i| chunks[i].clone()).collect();
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
        let model = resp.model.clone();
        let vectors = resp
            .into_vectors(texts.len())
            .map_err(IndexError::Embedding)?;

        let now = Utc::now();
        let meta = req.meta.cloned().unwrap_or(serde_json::Value::Null);
        let title = req.title.map(str::to_string);
        let scope_id = req.scope_id.map(str::to_string);

        for (&i, vector) in changed.iter().zip(vectors) {
            match by_index.get(&(i as i64)) {
                Some(row) => writes.rewrites.push(ChunkRewrite {
                    id: row.id,
                    provider: embedder.provider().to_string(),
                    model: model.clone(),
                    scope_id: scope_id.clone(),
                    title: title.clone(),
                    text: chunks[i].clone(),
                    text_hash: hashes[i].clone(),
                    meta: meta.clone(),
                    embedding: vector,
                    ts: now,
                }),
                None => writes.inserts.push(NewChunk {
                    provider: embedder.provider().to_string(),
                    model: model.clone(),
                    entity_type: req.entity_type.to_string(),
                    entity_id: req.entity_id.map(str::to_string),
                    scope_id: scope_id.clone(),
                    title: title.clone(),
                    text: chunks[i].clone(),
                    text_hash: hashes[i].clone(),
                    chunk_index: i as i64,
                    meta: meta.clone(),
                    embedding: vector,
                    ts: now,
                }),
            }
        }
    }

    let mut touched = store
        .apply_entity_writes(&writes)
        .await
        .map_err(IndexError::Store)?;
    touched.sort_unstable();
    Ok(touched)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embedding::{EmbedResponse, EmbeddingItem};
    use crate::models::ChunkFilter;
    use crate::store::memory::InMemoryStore;
    use crate::usage::{MemoryUsage, NoopUsage};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Deterministic fake: a vector derived from the text bytes, plus call counters.
    pub(crate) struct FakeEmbedder {
        pub calls: AtomicUsize,
        pub texts_embedded: AtomicUsize,
        pub fail: AtomicBool,
        pub last_model: Mutex<Option<String>>,
    }

    impl FakeEmbedder {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                texts_embedded: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                last_model: Mutex::new(None),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn vector_for(text: &str) -> Vec<f32> {
            let mut v = vec![0.0f32; 8];
            for (i, b) in text.bytes().enumerate() {
                v[i % 8] += b as f32;
            }
            v
        }
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        fn provider(&self) -> &str {
            "fake"
        }
        fn default_model(&self) -> &str {
            "fake-model"
        }
        fn dims(&self) -> usize {
            8
        }
        async fn embed(&self, texts: &[String], model: Option<&str>) -> Result<EmbedResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("provider unavailable");
            }
            self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
            *self.last_model.lock().unwrap() = model.map(str::to_string);
            Ok(EmbedResponse {
                model: model.unwrap_or("fake-model").to_string(),
                data: texts
                    .iter()
                    .enumerate()
                    .map(|(index, t)| EmbeddingItem {
                        index,
                        embedding: Self::vector_for(t),
                        text: t.clone(),
                    })
                    .collect(),
            })
        }
    }

    fn words(prefix: &str, n: usize) -> String {
        (0..n)
            .map(|i| format!("{}{}", prefix, i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn req<'a>(text: &'a str) -> UpsertRequest<'a> {
        UpsertRequest {
            chunk_words: 10,
            overlap_words: 2,
            ..UpsertRequest::new("campaign", Some("c:1"), text)
        }
    }

    #[tokio::test]
    async fn test_first_upsert_inserts_dense_sequence() {
        let store = InMemoryStore::new();
        let embedder = FakeEmbedder::new();
        let text = words("w", 25);

        let ids = upsert(&store, &embedder, &NoopUsage, &req(&text))
            .await
            .unwrap();

        assert_eq!(ids.len(), 3);
        assert_eq!(embedder.calls(), 1);
        let mut idx: Vec<i64> = store
            .entity_chunks("campaign", Some("c:1"))
            .await
            .unwrap()
            .iter()
            .map(|r| r.chunk_index)
            .collect();
        idx.sort();
        assert_eq!(idx, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_identical_resubmit_makes_no_calls() {
        let store = InMemoryStore::new();
        let embedder = FakeEmbedder::new();
        let text = words("w", 25);

        upsert(&store, &embedder, &NoopUsage, &req(&text))
            .await
            .unwrap();
        let before = store.rows().unwrap();

        let ids = upsert(&store, &embedder, &NoopUsage, &req(&text))
            .await
            .unwrap();

        assert!(ids.is_empty());
        assert_eq!(embedder.calls(), 1);
        assert_eq!(store.rows().unwrap(), before);
    }

    #[tokio::test]
    async fn test_partial_change_reembeds_only_changed_chunk() {
        let store = InMemoryStore::new();
        let embedder = FakeEmbedder::new();
        // Three disjoint windows of 10 words each (overlap 0).
        let original = format!("{} {} {}", words("a", 10), words("b", 10), words("c", 10));
        let edited = format!("{} {} {}", words("a", 10), words("B", 10), words("c", 10));

        let first = UpsertRequest {
            overlap_words: 0,
            ..req(&original)
        };
        upsert(&store, &embedder, &NoopUsage, &first).await.unwrap();
        let before = store.rows().unwrap();

        let second = UpsertRequest {
            overlap_words: 0,
            ..req(&edited)
        };
        let ids = upsert(&store, &embedder, &NoopUsage, &second).await.unwrap();

        assert_eq!(embedder.calls(), 2);
        assert_eq!(embedder.texts_embedded.load(Ordering::SeqCst), 4);
        let after = store.rows().unwrap();
        let changed = after.iter().find(|r| r.chunk_index == 1).unwrap();
        assert_eq!(ids, vec![changed.id]);
        for (b, a) in before.iter().zip(after.iter()) {
            if a.chunk_index == 1 {
                assert_ne!(a.text_hash, b.text_hash);
                assert!(a.ts >= b.ts);
            } else {
                assert_eq!(a, b, "untouched chunk must keep ts and vector");
            }
        }
    }

    #[tokio::test]
    async fn test_shrinking_text_prunes_orphans() {
        let store = InMemoryStore::new();
        let embedder = FakeEmbedder::new();
        let long = words("w", 25);
        let short = words("w", 8);

        upsert(&store, &embedder, &NoopUsage, &req(&long))
            .await
            .unwrap();
        upsert(&store, &embedder, &NoopUsage, &req(&short))
            .await
            .unwrap();

        let rows = store.entity_chunks("campaign", Some("c:1")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].chunk_index, 0);
        assert_eq!(rows[0].text, short);
    }

    #[tokio::test]
    async fn test_empty_text_is_noop() {
        let store = InMemoryStore::new();
        let embedder = FakeEmbedder::new();
        let ids = upsert(&store, &embedder, &NoopUsage, &req("   "))
            .await
            .unwrap();
        assert!(ids.is_empty());
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_entity_type_rejected_before_embedding() {
        let store = InMemoryStore::new();
        let embedder = FakeEmbedder::new();
        let r = UpsertRequest::new("", None, "some text");
        let err = upsert(&store, &embedder, &NoopUsage, &r).await.unwrap_err();
        assert!(matches!(err, IndexError::Precondition(_)));
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_gateway_failure_writes_nothing() {
        let store = InMemoryStore::new();
        let embedder = FakeEmbedder::new();
        embedder.fail.store(true, Ordering::SeqCst);
        let text = words("w", 25);

        let err = upsert(&store, &embedder, &NoopUsage, &req(&text))
            .await
            .unwrap_err();

        assert!(matches!(err, IndexError::Embedding(_)));
        assert!(err.is_retryable());
        assert_eq!(store.count(&ChunkFilter::default()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rewrite_refreshes_metadata_and_model() {
        let store = InMemoryStore::new();
        let embedder = FakeEmbedder::new();
        let meta = serde_json::json!({"level": "campaign", "period": "THIS_MONTH"});

        upsert(&store, &embedder, &NoopUsage, &req("spring sale"))
            .await
            .unwrap();
        let r = UpsertRequest {
            title: Some("Spring Sale"),
            scope_id: Some("123"),
            model: Some("text-embedding-3-large"),
            meta: Some(&meta),
            ..req("spring sale extended")
        };
        upsert(&store, &embedder, &NoopUsage, &r).await.unwrap();

        let rows = store.rows().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title.as_deref(), Some("Spring Sale"));
        assert_eq!(rows[0].scope_id.as_deref(), Some("123"));
        assert_eq!(rows[0].model, "text-embedding-3-large");
        assert_eq!(rows[0].provider, "fake");
        assert_eq!(rows[0].meta, meta);
    }

    #[tokio::test]
    async fn test_untagged_entities_share_identity() {
        let store = InMemoryStore::new();
        let embedder = FakeEmbedder::new();
        let a = UpsertRequest::new("note", None, "first note");
        let b = UpsertRequest::new("note", None, "second note");

        upsert(&store, &embedder, &NoopUsage, &a).await.unwrap();
        upsert(&store, &embedder, &NoopUsage, &b).await.unwrap();

        let rows = store.entity_chunks("note", None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "second note");
    }

    #[tokio::test]
    async fn test_usage_recorded_per_gateway_call() {
        let store = InMemoryStore::new();
        let embedder = FakeEmbedder::new();
        let usage = MemoryUsage::new();
        let r = UpsertRequest {
            scope_id: Some("123"),
            ..req("keyword running shoes")
        };

        upsert(&store, &embedder, &usage, &r).await.unwrap();
        upsert(&store, &embedder, &usage, &r).await.unwrap();

        let events = usage.events();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.endpoint.as_deref() == Some(USAGE_ENDPOINT)));
    }
}
