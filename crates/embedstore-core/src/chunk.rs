//! Word-window text chunker and content fingerprints.
//!
//! Source text is split on whitespace into windows of at most `max_words`
//! words. Consecutive windows share `overlap` words so context survives a
//! chunk boundary. Words inside a chunk are re-joined with a single space,
//! which normalizes whitespace before fingerprinting.
//!
//! Each chunk's fingerprint is the SHA-256 of its exact text; the upsert
//! engine compares fingerprints to skip unchanged chunks.

use sha2::{Digest, Sha256};

use crate::error::{IndexError, IndexResult};

/// Default window size, in words.
pub const DEFAULT_CHUNK_WORDS: usize = 800;
/// Default number of words shared by adjacent windows.
pub const DEFAULT_OVERLAP_WORDS: usize = 50;

/// Split `text` into overlapping word windows.
///
/// Returns an empty list for empty or whitespace-only input. Windows start at
/// `0, max_words - overlap, 2 * (max_words - overlap), ...`; the last one holds
/// whatever words remain.
///
/// # Errors
///
/// [`IndexError::Precondition`] if `max_words == 0` or `overlap >= max_words`
/// (the window would never advance).
///
/// # Example
///
/// ```rust
/// use embedstore_core::chunk::chunk_words;
///
/// let chunks = chunk_words("a b c d e", 3, 1).unwrap();
/// assert_eq!(chunks, vec!["a b c", "c d e"]);
/// ```
pub fn chunk_words(text: &str, max_words: usize, overlap: usize) -> IndexResult<Vec<String>> {
    if max_words == 0 {
        return Err(IndexError::precondition("chunk max_words must be > 0"));
    }
    if overlap >= max_words {
        return Err(IndexError::precondition(format!(
            "chunk overlap ({}) must be smaller than max_words ({})",
            overlap, max_words
        )));
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    let n = words.len();
    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < n {
        let end = n.min(start + max_words);
        chunks.push(words[start..end].join(" "));
        if end == n {
            break;
        }
        start = end - overlap;
    }

    Ok(chunks)
}

/// SHA-256 of the chunk text, as 64 lowercase hex characters.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
