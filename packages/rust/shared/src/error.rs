//! Error types for graphloom.
//!
//! Library crates use [`PipelineError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Page- and pair-level variants ([`PipelineError::Fetch`],
//! [`PipelineError::Extraction`], [`PipelineError::Consolidation`]) are counted
//! and logged by the orchestrator; only [`PipelineError::FatalJob`] aborts a job.

use std::path::PathBuf;

/// Top-level error type for all graphloom operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Rejected input: bad job config or an illegal state transition.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Network/HTTP failure on a single page.
    #[error("fetch error for {url}: {message}")]
    Fetch { url: String, message: String },

    /// A strategy failed on a single page.
    #[error("extraction error: {0}")]
    Extraction(String),

    /// Scoring failed for a single entity pair.
    #[error("consolidation error: {0}")]
    Consolidation(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Infrastructure failure that aborts the whole job.
    #[error("fatal job error: {0}")]
    FatalJob(String),

    /// A referenced record does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
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

    /// Create a fetch error for `url`.
    pub fn fetch(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a not-found error for a record kind and id.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Promote an error to [`PipelineError::FatalJob`].
    pub fn into_fatal(self) -> Self {
        match self {
            Self::FatalJob(_) => self,
            other => Self::FatalJob(other.to_string()),
        }
    }

    /// Whether this error only affects a single page or pair.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Fetch { .. } | Self::Extraction(_) | Self::Consolidation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = PipelineError::validation("crawl_depth must be between 1 and 10");
        assert_eq!(
            err.to_string(),
            "validation error: crawl_depth must be between 1 and 10"
        );

        let err = PipelineError::fetch("https://example.com/a", "HTTP 503");
        assert!(err.to_string().contains("https://example.com/a"));
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn storage_errors_promote_to_fatal() {
        let err = PipelineError::Storage("database is locked".into()).into_fatal();
        assert!(matches!(err, PipelineError::FatalJob(_)));
        assert!(err.to_string().contains("database is locked"));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn page_level_errors_are_recoverable() {
        assert!(PipelineError::Extraction("bad json-ld".into()).is_recoverable());
        assert!(PipelineError::Consolidation("dimension mismatch".into()).is_recoverable());
        assert!(!PipelineError::config("x").is_recoverable());
    }
}
