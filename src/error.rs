//! Error types for s2s-decode

use std::collections::TryReserveError;

use thiserror::Error;

/// Result type alias for decoding operations
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Errors that can occur while decoding
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Decoding parameters out of range (beam width, max length, length penalty)
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Encoder memory or collaborator output with an unexpected shape
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Allocation failure while sizing per-call buffers
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A layer, embedder or classifier reported a failure
    #[error("model error: {0}")]
    Model(String),

    /// NaN or overflow in log-probabilities or accumulated scores
    #[error("numeric error: {0}")]
    Numeric(String),
}

impl From<TryReserveError> for DecodeError {
    fn from(err: TryReserveError) -> Self {
        Self::ResourceExhausted(err.to_string())
    }
}
