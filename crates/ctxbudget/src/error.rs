//! Error types for the context engine.
//!
//! Budget pressure is never an error here: exhaustion shows up as `None` /
//! `false` return values and negative available-token counts. `ContextError`
//! covers the cases where a collaborator genuinely fails (summarizer, config
//! file) or a caller-supplied allocation schema is invalid.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    /// The injected summarizer failed. The message is passed through as-is.
    #[error("summarizer failed: {0}")]
    Summarizer(String),

    #[error("summarizer timed out after {after_ms}ms")]
    SummarizerTimeout { after_ms: u64 },

    #[error("invalid budget allocation: {reason}")]
    InvalidAllocation { reason: String },

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
