//! One freshness pass: re-embed the oldest stale rows.
//!
//! A pass selects up to `limit` rows whose `ts` is older than
//! `max_age_hours` (every row when `force` is set), oldest first, embeds
//! their current text in one gateway call and overwrites the embedding
//! columns in one store transaction. Text, fingerprint, title, scope and
//! chunk index are left alone; `meta.reembed_ts` records the refresh and
//! `ts` moves forward so the row leaves the stale set.
//!
//! The recurring loop that drives passes lives in the app crate.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::embedding::Embedder;
use crate::error::{IndexError, IndexResult};
use crate::models::{ChunkFilter, EmbeddingRefresh, ReembedReport};
use crate::store::ChunkStore;
use crate::usage::{record_embedding_call, UsageRecorder};

pub const DEFAULT_MAX_AGE_HOURS: u32 = 24;
pub const DEFAULT_LIMIT: usize = 200;
/// Usage endpoint tag for refresh embedding calls.
pub const USAGE_ENDPOINT: &str = "embeddings.reembed";
/// Key added to `meta` on every refreshed row.
pub const REEMBED_MARKER: &str = "reembed_ts";

const SAMPLE_IDS: usize = 10;

/// Inputs for one freshness pass.
#[derive(Debug, Clone)]
pub struct ReembedOptions<'a> {
    pub max_age_hours: u32,
    /// Upper bound on rows touched by this pass.
    pub limit: usize,
    /// Model override for the embedding client.
    pub model: Option<&'a str>,
    pub entity_type: Option<&'a str>,
    pub scope_id: Option<&'a str>,
    /// Ignore the age threshold and take the oldest `limit` rows.
    pub force: bool,
}

impl Default for ReembedOptions<'_> {
    fn default() -> Self {
        Self {
            max_age_hours: DEFAULT_MAX_AGE_HOURS,
            limit: DEFAULT_LIMIT,
            model: None,
            entity_type: None,
            scope_id: None,
            force: false,
        }
    }
}

/// Run one pass using the current wall clock.
pub async fn reembed_stale<S: ChunkStore + ?Sized>(
    store: &S,
    embedder: &dyn Embedder,
    usage: &dyn UsageRecorder,
    opts: &ReembedOptions<'_>,
) -> IndexResult<ReembedReport> {
    reembed_stale_at(store, embedder, usage, opts, Utc::now()).await
}

/// Run one pass treating `now` as the current time.
///
/// # Errors
///
/// [`IndexError::Embedding`] or [`IndexError::Store`]; a failed pass writes
/// nothing.
pub async fn reembed_stale_at<S: ChunkStore + ?Sized>(
    store: &S,
    embedder: &dyn Embedder,
    usage: &dyn UsageRecorder,
    opts: &ReembedOptions<'_>,
    now: DateTime<Utc>,
) -> IndexResult<ReembedReport> {
    if opts.limit == 0 {
        return Ok(ReembedReport::default());
    }

    let cutoff = if opts.force {
        None
    } else {
        Some(now - Duration::hours(i64::from(opts.max_age_hours)))
    };
    let filter = ChunkFilter::new(opts.entity_type, opts.scope_id);

    let candidates = store
        .stale_chunks(cutoff, &filter, opts.limit)
        .await
        .map_err(IndexError::Store)?;
    let total_candidates = candidates.len();

    let (embeddable, blank): (Vec<_>, Vec<_>) = candidates
        .into_iter()
        .partition(|r| !r.text.trim().is_empty());

    let mut report = ReembedReport {
        total_candidates,
        skipped: blank.len(),
        ..ReembedReport::default()
    };
    if embeddable.is_empty() {
        debug!(total_candidates, "no stale rows to re-embed");
        return Ok(report);
    }

    let texts: Vec<String> = embeddable.iter().map(|r| r.text.clone()).collect();
    let resp = embedder
        .embed(&texts, opts.model)
        .await
        .map_err(IndexError::Embedding)?;
    record_embedding_call(
        usage,
        embedder.provider(),
        USAGE_ENDPOINT,
        opts.scope_id,
        &texts,
    );
    let model = resp.model.clone();
    let vectors = resp
        .into_vectors(texts.len())
        .map_err(IndexError::Embedding)?;

    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let refreshes: Vec<EmbeddingRefresh> = embeddable
        .iter()
        .zip(vectors)
        .map(|(row, embedding)| EmbeddingRefresh {
            id: row.id,
            text_hash: row.text_hash.clone(),
            provider: embedder.provider().to_string(),
            model: model.clone(),
            embedding,
            reembed_ts: stamp.clone(),
            ts: now,
        })
        .collect();

    let updated = store
        .apply_refreshes(&refreshes)
        .await
        .map_err(IndexError::Store)?;

    report.reembedded = updated.len();
    report.skipped += refreshes.len().saturating_sub(updated.len());
    report.sample_ids = updated.into_iter().take(SAMPLE_IDS).collect();
    report.model = Some(model);

    info!(
        reembedded = report.reembedded,
        skipped = report.skipped,
        total_candidates = report.total_candidates,
        "re-embedded stale rows"
    );
    Ok(report)
}

/// Copy of `meta` with `reembed_ts` set.
///
/// Object meta keeps its keys, `null` becomes a new object, and any other
/// value is kept under `"value"`. SQL stores apply the same rule in their
/// refresh statements.
pub fn mark_reembedded(meta: &Value, stamp: &str) -> Value {
    let mut obj = match meta {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    obj.insert(REEMBED_MARKER.to_string(), Value::String(stamp.to_string()));
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChunkRecord, ChunkRewrite, EntityWrites};
    use crate::store::memory::InMemoryStore;
    use crate::upsert::tests::FakeEmbedder;
    use crate::usage::NoopUsage;
    use std::sync::atomic::Ordering;

    fn aged_row(now: DateTime<Utc>, hours: i64, text: &str) -> ChunkRecord {
        ChunkRecord {
            id: 0,
            provider: "none".to_string(),
            model: "placeholder".to_string(),
            entity_type: "keyword".to_string(),
            entity_id: Some(format!("kw:{}", text)),
            scope_id: Some("123".to_string()),
            title: None,
            text: text.to_string(),
            text_hash: crate::chunk::fingerprint(text),
            chunk_index: 0,
            meta: serde_json::json!({"level": "keyword"}),
            embedding: vec![0.0; 8],
            ts: now - Duration::hours(hours),
        }
    }

    #[tokio::test]
    async fn test_selects_only_rows_past_threshold() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let fresh = store.insert_raw(aged_row(now, 1, "one hour")).unwrap();
        let stale = store.insert_raw(aged_row(now, 30, "thirty hours")).unwrap();
        let recent = store.insert_raw(aged_row(now, 10, "ten hours")).unwrap();
        let before = store.rows().unwrap();

        let report = reembed_stale_at(
            &store,
            &FakeEmbedder::new(),
            &NoopUsage,
            &ReembedOptions::default(),
            now,
        )
        .await
        .unwrap();

        assert_eq!(report.total_candidates, 1);
        assert_eq!(report.reembedded, 1);
        assert_eq!(report.sample_ids, vec![stale]);
        assert_eq!(report.model.as_deref(), Some("fake-model"));

        let after = store.rows().unwrap();
        for (b, a) in before.iter().zip(after.iter()) {
            if a.id == fresh || a.id == recent {
                assert_eq!(a, b);
            } else {
                assert_eq!(a.ts, now);
                assert_eq!(a.embedding, FakeEmbedder::vector_for("thirty hours"));
                assert_eq!(a.model, "fake-model");
                assert_eq!(a.provider, "fake");
                assert_eq!(a.text, b.text);
                assert_eq!(a.text_hash, b.text_hash);
                assert_eq!(a.meta["level"], "keyword");
                assert!(a.meta[REEMBED_MARKER].is_string());
            }
        }
    }

    #[tokio::test]
    async fn test_limit_bounds_work_and_takes_oldest() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for i in 0..500 {
            store
                .insert_raw(aged_row(now, 25 + i, &format!("row {}", i)))
                .unwrap();
        }
        let embedder = FakeEmbedder::new();

        let report = reembed_stale_at(
            &store,
            &embedder,
            &NoopUsage,
            &ReembedOptions {
                limit: 5,
                ..ReembedOptions::default()
            },
            now,
        )
        .await
        .unwrap();

        assert_eq!(report.reembedded, 5);
        assert_eq!(embedder.texts_embedded.load(Ordering::SeqCst), 5);
        let touched: Vec<ChunkRecord> = store
            .rows()
            .unwrap()
            .into_iter()
            .filter(|r| r.ts == now)
            .collect();
        assert_eq!(touched.len(), 5);
        let mut texts: Vec<String> = touched.into_iter().map(|r| r.text).collect();
        texts.sort();
        assert_eq!(texts, vec!["row 495", "row 496", "row 497", "row 498", "row 499"]);
    }

    #[tokio::test]
    async fn test_force_ignores_age() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.insert_raw(aged_row(now, 1, "fresh")).unwrap();

        let report = reembed_stale_at(
            &store,
            &FakeEmbedder::new(),
            &NoopUsage,
            &ReembedOptions {
                force: true,
                ..ReembedOptions::default()
            },
            now,
        )
        .await
        .unwrap();
        assert_eq!(report.reembedded, 1);
    }

    #[tokio::test]
    async fn test_blank_rows_skipped() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.insert_raw(aged_row(now, 48, "  ")).unwrap();
        let embedder = FakeEmbedder::new();

        let report = reembed_stale_at(
            &store,
            &embedder,
            &NoopUsage,
            &ReembedOptions::default(),
            now,
        )
        .await
        .unwrap();
        assert_eq!(report.total_candidates, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.reembedded, 0);
        assert_eq!(embedder.calls(), 0);
    }

    #[tokio::test]
    async fn test_filters_restrict_selection() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.insert_raw(aged_row(now, 48, "mine")).unwrap();
        let mut other = aged_row(now, 48, "theirs");
        other.scope_id = Some("456".to_string());
        store.insert_raw(other).unwrap();

        let report = reembed_stale_at(
            &store,
            &FakeEmbedder::new(),
            &NoopUsage,
            &ReembedOptions {
                scope_id: Some("123"),
                ..ReembedOptions::default()
            },
            now,
        )
        .await
        .unwrap();
        assert_eq!(report.total_candidates, 1);
    }

    #[tokio::test]
    async fn test_gateway_failure_leaves_rows_untouched() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.insert_raw(aged_row(now, 48, "stale")).unwrap();
        let before = store.rows().unwrap();
        let embedder = FakeEmbedder::new();
        embedder.fail.store(true, Ordering::SeqCst);

        let err = reembed_stale_at(
            &store,
            &embedder,
            &NoopUsage,
            &ReembedOptions::default(),
            now,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, IndexError::Embedding(_)));
        assert_eq!(store.rows().unwrap(), before);
    }

    #[tokio::test]
    async fn test_zero_limit_is_noop() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.insert_raw(aged_row(now, 48, "stale")).unwrap();
        let report = reembed_stale_at(
            &store,
            &FakeEmbedder::new(),
            &NoopUsage,
            &ReembedOptions {
                limit: 0,
                ..ReembedOptions::default()
            },
            now,
        )
        .await
        .unwrap();
        assert_eq!(report, ReembedReport::default());
    }

    /// Applies `race` to the inner store between selection and commit.
    struct RacingStore {
        inner: InMemoryStore,
        race: Vec<EntityWrites>,
    }

    #[async_trait::async_trait]
    impl ChunkStore for RacingStore {
        async fn entity_chunks(
            &self,
            entity_type: &str,
            entity_id: Option<&str>,
        ) -> anyhow::Result<Vec<ChunkRecord>> {
            self.inner.entity_chunks(entity_type, entity_id).await
        }

        async fn apply_entity_writes(&self, writes: &EntityWrites) -> anyhow::Result<Vec<i64>> {
            self.inner.apply_entity_writes(writes).await
        }

        async fn recent_chunks(
            &self,
            filter: &ChunkFilter<'_>,
            limit: usize,
        ) -> anyhow::Result<Vec<ChunkRecord>> {
            self.inner.recent_chunks(filter, limit).await
        }

        async fn stale_chunks(
            &self,
            cutoff: Option<DateTime<Utc>>,
            filter: &ChunkFilter<'_>,
            limit: usize,
        ) -> anyhow::Result<Vec<ChunkRecord>> {
            self.inner.stale_chunks(cutoff, filter, limit).await
        }

        async fn apply_refreshes(
            &self,
            refreshes: &[EmbeddingRefresh],
        ) -> anyhow::Result<Vec<i64>> {
            for writes in &self.race {
                self.inner.apply_entity_writes(writes).await?;
            }
            self.inner.apply_refreshes(refreshes).await
        }

        async fn count(&self, filter: &ChunkFilter<'_>) -> anyhow::Result<i64> {
            self.inner.count(filter).await
        }
    }

    fn rewrite(row: &ChunkRecord, text: &str, meta: Value, now: DateTime<Utc>) -> EntityWrites {
        EntityWrites {
            entity_type: row.entity_type.clone(),
            entity_id: row.entity_id.clone(),
            inserts: vec![],
            rewrites: vec![ChunkRewrite {
                id: row.id,
                provider: "fake".to_string(),
                model: "fake-model".to_string(),
                scope_id: row.scope_id.clone(),
                title: row.title.clone(),
                text: text.to_string(),
                text_hash: crate::chunk::fingerprint(text),
                meta,
                embedding: FakeEmbedder::vector_for(text),
                ts: now,
            }],
            prune_from: None,
        }
    }

    #[tokio::test]
    async fn test_concurrent_writes_win_over_refresh() {
        let inner = InMemoryStore::new();
        let now = Utc::now();
        let edited = inner.insert_raw(aged_row(now, 48, "alpha")).unwrap();
        let deleted = inner.insert_raw(aged_row(now, 47, "beta")).unwrap();
        let retagged = inner.insert_raw(aged_row(now, 46, "gamma")).unwrap();
        let rows = inner.rows().unwrap();

        let race = vec![
            rewrite(
                &rows[0],
                "alpha v2",
                serde_json::json!({"level": "edited"}),
                now,
            ),
            EntityWrites {
                entity_type: rows[1].entity_type.clone(),
                entity_id: rows[1].entity_id.clone(),
                inserts: vec![],
                rewrites: vec![],
                prune_from: Some(0),
            },
            rewrite(
                &rows[2],
                "gamma",
                serde_json::json!({"level": "campaign"}),
                rows[2].ts,
            ),
        ];
        let store = RacingStore { inner, race };

        let report = reembed_stale_at(
            &store,
            &FakeEmbedder::new(),
            &NoopUsage,
            &ReembedOptions::default(),
            now,
        )
        .await
        .unwrap();

        assert_eq!(report.total_candidates, 3);
        assert_eq!(report.reembedded, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.sample_ids, vec![retagged]);

        let after = store.inner.rows().unwrap();
        assert!(after.iter().all(|r| r.id != deleted));

        let a = after.iter().find(|r| r.id == edited).unwrap();
        assert_eq!(a.text, "alpha v2");
        assert_eq!(a.embedding, FakeEmbedder::vector_for("alpha v2"));
        assert_eq!(a.meta, serde_json::json!({"level": "edited"}));

        let c = after.iter().find(|r| r.id == retagged).unwrap();
        assert_eq!(c.meta["level"], "campaign");
        assert!(c.meta[REEMBED_MARKER].is_string());
        assert_eq!(c.ts, now);
    }

    #[test]
    fn test_marker_preserves_meta() {
        let stamp = "2026-10-18T00:00:00Z";
        let m = mark_reembedded(&serde_json::json!({"a": 1}), stamp);
        assert_eq!(m, serde_json::json!({"a": 1, "reembed_ts": stamp}));
        let m = mark_reembedded(&Value::Null, stamp);
        assert_eq!(m, serde_json::json!({"reembed_ts": stamp}));
        let m = mark_reembedded(&serde_json::json!([1, 2]), stamp);
        assert_eq!(m, serde_json::json!({"value": [1, 2], "reembed_ts": stamp}));
    }
}
