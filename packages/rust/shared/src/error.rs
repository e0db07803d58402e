//! Error types for WikiSelect.
//!
//! Library crates use [`WikiSelectError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all WikiSelect operations.
#[derive(Debug, thiserror::Error)]
pub enum WikiSelectError {
    /// Configuration loading or validation error, including unknown model tags.
    #[error("config error: {message}")]
    Config { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Job broker error (enqueue, dequeue, bookkeeping).
    #[error("queue error: {0}")]
    Queue(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Builder parameters were rejected by the model validator.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Duplicate version or duplicate in-flight archive task. Callers may retry.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Unknown builder, selection, schedule, job or token.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// The acting user does not own the resource.
    #[error("not authorized: {message}")]
    Authorization { message: String },

    /// Export exceeds the configured size limit.
    #[error("capacity exceeded: {message}")]
    Capacity { message: String },

    /// Build service, mail delivery or article source failure.
    #[error("upstream error: {message}")]
    Upstream { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, WikiSelectError>;

impl WikiSelectError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict {
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound {
            message: msg.into(),
        }
    }

    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::Authorization {
            message: msg.into(),
        }
    }

    pub fn capacity(msg: impl Into<String>) -> Self {
        Self::Capacity {
            message: msg.into(),
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream {
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

    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = WikiSelectError::config("unknown model tag 'xyz'");
        assert_eq!(err.to_string(), "config error: unknown model tag 'xyz'");

        let err = WikiSelectError::capacity("60000 articles, max 50000");
        assert!(err.to_string().contains("60000 articles"));
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(WikiSelectError::conflict("version 3 taken").is_retryable());
        assert!(!WikiSelectError::not_found("builder").is_retryable());
        assert!(!WikiSelectError::upstream("farm down").is_retryable());
    }
}
