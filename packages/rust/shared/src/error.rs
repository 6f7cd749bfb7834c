//! Error types for MarketBrief.
//!
//! Library crates use [`MarketBriefError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all MarketBrief operations.
#[derive(Debug, thiserror::Error)]
pub enum MarketBriefError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Connection or timeout failure reaching a remote endpoint.
    #[error("network error: {0}")]
    Network(String),

    /// Embedding or chat endpoint failure (after retries).
    #[error("inference error: {0}")]
    Inference(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad date, malformed artifact, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON/TOML parsing error for an artifact or response.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Another orchestrator run holds the pipeline lock.
    #[error("pipeline lock held at {path:?}: {holder}")]
    LockHeld { path: PathBuf, holder: String },

    /// A pipeline stage exited unsuccessfully.
    #[error("stage `{stage}` failed: {detail}")]
    StageFailed { stage: String, detail: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, MarketBriefError>;

impl MarketBriefError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the lock-conflict failure, which callers report distinctly.
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }
}
