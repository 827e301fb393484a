//! Error types for LeadEnrich.
//!
//! Library crates use [`LeadEnrichError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Only setup-time failures travel through this type. Per-row enrichment
//! failures are recorded as data in the output table instead.

use std::path::PathBuf;

/// Top-level error type for all LeadEnrich operations.
#[derive(Debug, thiserror::Error)]
pub enum LeadEnrichError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// The input table could not be read or is malformed.
    #[error("input error at {path:?}: {message}")]
    Input { path: PathBuf, message: String },

    /// The output table could not be read or written.
    #[error("output error at {path:?}: {message}")]
    Output { path: PathBuf, message: String },

    /// CSV encoding or decoding error.
    #[error("csv error: {0}")]
    Csv(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error.
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, LeadEnrichError>;

impl LeadEnrichError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an input error for the table at `path`.
    pub fn input(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Input {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an output error for the table at `path`.
    pub fn output(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Output {
            path: path.into(),
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

impl From<csv::Error> for LeadEnrichError {
    fn from(err: csv::Error) -> Self {
        Self::Csv(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = LeadEnrichError::config("concurrency must be at least 1");
        assert_eq!(err.to_string(), "config error: concurrency must be at least 1");

        let err = LeadEnrichError::input("companies.csv", "missing column");
        assert!(err.to_string().contains("companies.csv"));
        assert!(err.to_string().contains("missing column"));
    }
}
