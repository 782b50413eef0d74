//! Error types for attention construction and weight loading.
//!
//! Forward passes deliberately return `candle_core::Result` so shape and
//! numeric failures from tensor operations propagate unmodified; the variants
//! here cover configuration and checkpoint-loading failures, which are fatal
//! caller bugs rather than transient conditions.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttentionError {
    /// Head-count or geometry invariants violated at construction.
    #[error("invalid attention configuration: {context}")]
    Config { context: String },

    /// A projection weight expected by the loader is absent.
    #[error("missing weight: {0}")]
    MissingWeight(String),

    /// The checkpoint mapping contains entries no parameter consumes.
    #[error("unused weight(s): {}", keys.join(", "))]
    UnusedWeights { keys: Vec<String> },

    /// Tensor-library failure surfaced during loading.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}
