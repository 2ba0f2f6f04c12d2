//! Error types for Newsloom.
//!
//! Library crates use [`NewsloomError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Newsloom operations.
#[derive(Debug, thiserror::Error)]
pub enum NewsloomError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// A plugin `type` with no registered constructor.
    #[error("unknown plugin type '{kind}' for plugin '{name}'")]
    UnknownPluginType { kind: String, name: String },

    /// A source failed to produce items.
    #[error("source '{source_name}' failed: {message}")]
    Source {
        source_name: String,
        message: String,
    },

    /// An enricher failed while transforming a batch.
    #[error("enrichment error: {0}")]
    Enrichment(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A generator or exporter failed.
    #[error("generator error: {0}")]
    Generator(String),

    /// Generators form a dependency cycle.
    #[error("dependency cycle detected involving generator '{0}'")]
    DependencyCycle(String),

    /// Job lifecycle error (bad transition, missing job, task failure).
    #[error("job error: {0}")]
    Job(String),

    /// Lookup of a named entity failed.
    #[error("not found: {0}")]
    NotFound(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad date range, malformed item, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, NewsloomError>;

impl NewsloomError {
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

    /// Create a source error attributed to `source_name`.
    pub fn source(source_name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Source {
            source_name: source_name.into(),
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
