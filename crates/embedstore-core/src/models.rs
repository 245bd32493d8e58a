//! Core data models for the embedding store.
//!
//! [`ChunkRecord`] is the only persisted entity. The remaining types describe
//! the write sets the engines hand to a [`ChunkStore`](crate::store::ChunkStore)
//! and the results they hand back to callers.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One stored chunk of an entity's text together with its embedding.
///
/// `(entity_type, entity_id, chunk_index)` is the logical identity of a row;
/// `id` is the store-assigned surrogate key.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub id: i64,
    pub provider: String,
    pub model: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub scope_id: Option<String>,
    pub title: Option<String>,
    pub text: String,
    /// SHA-256 hex of `text`.
    pub text_hash: String,
    pub chunk_index: i64,
    pub meta: serde_json::Value,
    pub embedding: Vec<f32>,
    /// Last write; staleness is measured against this.
    pub ts: DateTime<Utc>,
}

impl ChunkRecord {
    pub fn dim(&self) -> usize {
        self.embedding.len()
    }
}

/// A chunk row that does not exist yet.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub provider: String,
    pub model: String,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub scope_id: Option<String>,
    pub title: Option<String>,
    pub text: String,
    pub text_hash: String,
    pub chunk_index: i64,
    pub meta: serde_json::Value,
    pub embedding: Vec<f32>,
    pub ts: DateTime<Utc>,
}

/// In-place replacement of an existing row whose text changed.
///
/// Identity columns (`entity_type`, `entity_id`, `chunk_index`) are kept.
#[derive(Debug, Clone)]
pub struct ChunkRewrite {
    pub id: i64,
    pub provider: String,
    pub model: String,
    pub scope_id: Option<String>,
    pub title: Option<String>,
    pub text: String,
    pub text_hash: String,
    pub meta: serde_json::Value,
    pub embedding: Vec<f32>,
    pub ts: DateTime<Utc>,
}

/// Everything one upsert call writes for a single entity.
///
/// Stores must apply the whole set in one transaction.
#[derive(Debug, Clone)]
pub struct EntityWrites {
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub inserts: Vec<NewChunk>,
    pub rewrites: Vec<ChunkRewrite>,
    /// Delete rows of this entity with `chunk_index >= prune_from`.
    pub prune_from: Option<i64>,
}

impl EntityWrites {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.rewrites.is_empty() && self.prune_from.is_none()
    }
}

/// A fresh vector for an existing row, produced by the freshness pass.
///
/// Only the embedding columns, `meta.reembed_ts` and `ts` change. The row is
/// left alone if its `text_hash` no longer matches, since a concurrent upsert
/// has already written a vector for the new text.
#[derive(Debug, Clone)]
pub struct EmbeddingRefresh {
    pub id: i64,
    /// Fingerprint of the text that was embedded.
    pub text_hash: String,
    pub provider: String,
    pub model: String,
    pub embedding: Vec<f32>,
    /// RFC 3339 stamp merged into the row's current `meta`.
    pub reembed_ts: String,
    pub ts: DateTime<Utc>,
}

/// Optional equality filters shared by search and the freshness pass.
///
/// `None` leaves the column unfiltered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkFilter<'a> {
    pub entity_type: Option<&'a str>,
    pub scope_id: Option<&'a str>,
}

impl<'a> ChunkFilter<'a> {
    pub fn new(entity_type: Option<&'a str>, scope_id: Option<&'a str>) -> Self {
        Self {
            entity_type,
            scope_id,
        }
    }

    pub fn matches(&self, row: &ChunkRecord) -> bool {
        if let Some(et) = self.entity_type {
            if row.entity_type != et {
                return false;
            }
        }
        if let Some(scope) = self.scope_id {
            if row.scope_id.as_deref() != Some(scope) {
                return false;
            }
        }
        true
    }
}

/// A ranked search result. `score` is higher-is-better on both search paths.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: Option<String>,
    pub scope_id: Option<String>,
    pub title: Option<String>,
    pub text: String,
    pub score: f64,
    pub meta: serde_json::Value,
}

impl SearchHit {
    pub fn from_record(row: ChunkRecord, score: f64) -> Self {
        Self {
            id: row.id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            scope_id: row.scope_id,
            title: row.title,
            text: row.text,
            score,
            meta: row.meta,
        }
    }
}

/// Summary of one freshness pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReembedReport {
    pub reembedded: usize,
    pub skipped: usize,
    pub total_candidates: usize,
    pub sample_ids: Vec<i64>,
    /// Model reported by the provider; `None` if nothing was embedded.
    pub model: Option<String>,
}
