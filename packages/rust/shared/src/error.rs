//! Error types for Leadscope.
//!
//! Library crates use [`LeadscopeError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for Leadscope operations that are not entity-scoped.
///
/// Entity-level outcomes (rejected evidence, malformed classifier output)
/// are values in `leadscope-core`, not variants here.
#[derive(Debug, thiserror::Error)]
pub enum LeadscopeError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to an external provider.
    #[error("network error: {0}")]
    Network(String),

    /// Persisted data that no longer decodes (corrupt rows, unknown enum values).
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input, invalid tunables, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LeadscopeError>;

impl LeadscopeError {
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LeadscopeError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = LeadscopeError::validation("batch_size must be at least 1");
        assert!(err.to_string().contains("batch_size"));

        let err = LeadscopeError::parse("unknown run state: exploded");
        assert_eq!(err.to_string(), "parse error: unknown run state: exploded");
    }
}
