//! # embedstore core
//!
//! Storage-agnostic logic for the embedding store: chunk models, the
//! word-window chunker, content fingerprints, the [`Embedder`](embedding::Embedder)
//! and [`ChunkStore`](store::ChunkStore) seams, and the three engines that run
//! on top of them:
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`upsert`] | Reconcile an entity's text against its stored chunk rows |
//! | [`search`] | Similarity search (brute-force cosine or store-native ANN) |
//! | [`freshness`] | One pass of stale-row re-embedding |
//! | [`index`] | [`EmbeddingIndex`](index::EmbeddingIndex), the composition root |
//!
//! This crate contains no tokio, sqlx or network code. Concrete stores and
//! HTTP embedding clients live in the `embedstore` app crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod freshness;
pub mod index;
pub mod models;
pub mod search;
pub mod store;
pub mod upsert;
pub mod usage;

pub use error::IndexError;
pub use index::EmbeddingIndex;
