//! # embedstore
//!
//! Content-addressed embedding store with similarity search and background
//! re-embedding.
//!
//! Source text is split into overlapping word windows, each window is
//! fingerprinted, and only windows whose fingerprint changed are sent to the
//! embedding provider. Stored vectors are searched by cosine similarity
//! (brute force over recent rows on SQLite, pgvector ANN on Postgres) and a
//! background scheduler keeps old vectors fresh.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────────┐   ┌──────────────────┐
//! │  CLI (estore)│──▶│ EmbeddingIndex  │──▶│ SQLite / pgvector │
//! │  scheduler   │   │ upsert / search │   │   embedding table │
//! └──────────────┘   │ reembed_stale   │   └──────────────────┘
//!                    └───────┬─────────┘
//!                            ▼
//!                  ┌───────────────────┐
//!                  │ OpenAI / Ollama / │
//!                  │ local embedder    │
//!                  └───────────────────┘
//! ```
//!
//! The storage-agnostic engines live in [`embedstore_core`]; this crate
//! supplies configuration, concrete stores, HTTP embedding clients, usage
//! logging and the CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Backend selection and connection pools |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite [`ChunkStore`](embedstore_core::store::ChunkStore) |
//! | `pg_store` | pgvector store (feature `postgres`) |
//! | [`embedding`] | Embedding clients and provider selection |
//! | [`usage_log`] | `quota_usage` event sink |
//! | [`scheduler`] | Background freshness loop |
//! | [`app`] | Config-to-index wiring |
//! | [`commands`] | CLI command implementations |
//! | [`stats`] | Database statistics |
//! | [`maintenance`] | pgvector index upkeep |

pub mod app;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod maintenance;
pub mod migrate;
#[cfg(feature = "postgres")]
pub mod pg_store;
pub mod scheduler;
pub mod sqlite_store;
pub mod stats;
pub mod usage_log;

pub use embedstore_core;
