//! Report error types

use thiserror::Error;

/// Errors raised while recording results or writing artifacts
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Result type for report operations
pub type ReportResult<T> = Result<T, ReportError>;
