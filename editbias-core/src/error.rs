//! Error types for the editbias measurement pipeline.
//!
//! Uses `thiserror` for public API error types with structured variants covering
//! configuration, backends, judges, the checkpoint store, and analysis.
//!
//! Only systemic conditions surface as errors past a record boundary. Per-record
//! failures (validation rejections, exhausted retries, evaluator disagreement) are
//! recorded as data on the record itself.

use std::path::PathBuf;

/// Top-level error type for the editbias core library.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Judge error: {0}")]
    Judge(#[from] JudgeError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from an image-editing backend call.
///
/// `RateLimited`, `Timeout`, `Connection` and `Server` are transient and retried.
/// `Terminal` is returned immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("Rate limited by backend, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Backend connection failed: {message}")]
    Connection { message: String },

    #[error("Backend server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Backend request failed: {message}")]
    Terminal { message: String },

    #[error("Backend not registered: {name}")]
    NotRegistered { name: String },
}

impl BackendError {
    /// Whether the failure is transient and worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::RateLimited { .. }
                | BackendError::Timeout { .. }
                | BackendError::Connection { .. }
                | BackendError::Server { .. }
        )
    }
}

/// Errors from a vision-language judge call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JudgeError {
    #[error("Judge '{name}' timed out after {timeout_secs}s")]
    Timeout { name: String, timeout_secs: u64 },

    #[error("Judge '{name}' request failed: {message}")]
    Request { name: String, message: String },

    #[error("Judge '{name}' returned an unparseable response: {message}")]
    Malformed { name: String, message: String },

    #[error("Judge not registered: {name}")]
    NotRegistered { name: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the checkpoint/result store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store at {path} is not writable: {message}")]
    Unwritable { path: PathBuf, message: String },

    #[error("Failed to load store file {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    #[error("Record {key} already has a stored refusal verdict")]
    VerdictImmutable { key: String },
}

/// Errors from the disparity and statistics engine.
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("Baseline validation failed: {diagnostic}")]
    BaselineValidationFailed { diagnostic: String },

    #[error("Cannot aggregate over {count} in-flight (non-terminal) records")]
    InFlightRecords { count: usize },

    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },
}

/// A type alias for results using the top-level `AuditError`.
pub type Result<T> = std::result::Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_backend() {
        let err = AuditError::Backend(BackendError::RateLimited {
            retry_after_secs: 30,
        });
        assert_eq!(
            err.to_string(),
            "Backend error: Rate limited by backend, retry after 30s"
        );
    }

    #[test]
    fn test_error_display_analysis() {
        let err = AuditError::Analysis(AnalysisError::BaselineValidationFailed {
            diagnostic: "neutral disparity 0.080 exceeds 0.030".into(),
        });
        assert_eq!(
            err.to_string(),
            "Analysis error: Baseline validation failed: neutral disparity 0.080 exceeds 0.030"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Timeout { timeout_secs: 5 }.is_transient());
        assert!(
            BackendError::Server {
                status: 503,
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(
            !BackendError::Terminal {
                message: "bad request".into()
            }
            .is_transient()
        );
        assert!(!BackendError::NotRegistered { name: "x".into() }.is_transient());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: AuditError = io_err.into();
        assert!(matches!(err, AuditError::Io(_)));
    }

    #[test]
    fn test_error_from_serde() {
        let serde_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: AuditError = serde_err.into();
        assert!(matches!(err, AuditError::Serialization(_)));
    }
}
