use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::types::StreamName;

/// Error type for mixing, packing, caching, and pipeline failures.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("stream '{stream}' exhausted")]
    Exhausted { stream: StreamName },
    #[error("document stream '{stream}' is unavailable: {reason}")]
    StreamUnavailable { stream: StreamName, reason: String },
    #[error("invalid token batch: {0}")]
    InvalidBatch(String),
    #[error("tokenizer failure: {0}")]
    Tokenizer(String),
    #[error("cache file '{}' is corrupt: {details}", path.display())]
    CacheCorruption { path: PathBuf, details: String },
    #[error("cache production was cancelled")]
    Cancelled,
    #[error("cache worker stopped: {0}")]
    WorkerStopped(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub(crate) fn corruption(path: impl Into<PathBuf>, details: impl Into<String>) -> Self {
        Self::CacheCorruption {
            path: path.into(),
            details: details.into(),
        }
    }

    /// Returns `true` for the cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
