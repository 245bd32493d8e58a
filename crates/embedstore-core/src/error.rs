//! Error taxonomy for the engines.
//!
//! Stores and embedding clients report failures as [`anyhow::Error`]; the
//! engines classify them so callers can tell a bad request from a failing
//! dependency.

use thiserror::Error;

/// Errors surfaced by [`upsert`](crate::upsert), [`search`](crate::search)
/// and [`freshness`](crate::freshness).
#[derive(Error, Debug)]
pub enum IndexError {
    /// The request was rejected before any external call.
    #[error("invalid request: {0}")]
    Precondition(String),

    /// The embedding provider failed or returned malformed data.
    #[error("embedding provider failed: {0:#}")]
    Embedding(#[source] anyhow::Error),

    /// The chunk store failed; no partial writes were kept.
    #[error("chunk store failed: {0:#}")]
    Store(#[source] anyhow::Error),
}

impl IndexError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Dependency failures are worth retrying; bad requests are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Precondition(_))
    }
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;
