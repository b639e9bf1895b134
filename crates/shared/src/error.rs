//! Application-wide error types.
//!
//! [`AppError`] is the flattened, caller-facing form of every failure the
//! ledger can report. Each variant maps to one stable [`ErrorCode`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using `AppError`.
pub type AppResult<T> = Result<T, AppError>;

/// Stable machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed input or idempotency key reuse with another body.
    Validation,
    /// Duplicate business reference or ledger name.
    Conflict,
    /// A balance would go negative.
    InsufficientFund,
    /// The transaction was already reverted.
    AlreadyRevert,
    /// Unknown ledger, transaction or account.
    NotFound,
    /// Script compilation or interpretation failed.
    CompilationFailed,
    /// Script metadata collides with caller metadata.
    MetadataOverride,
    /// The request resolved to zero postings.
    NoPostings,
    /// Bulk request larger than the configured maximum.
    BulkSizeExceeded,
    /// Import rejected.
    Import,
    /// Response budget exceeded or lock wait timed out.
    Timeout,
    /// Storage unreachable or service shutting down.
    Unavailable,
    /// Unexpected failure.
    Internal,
}

impl ErrorCode {
    /// Returns the wire representation of this code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::Conflict => "CONFLICT",
            Self::InsufficientFund => "INSUFFICIENT_FUND",
            Self::AlreadyRevert => "ALREADY_REVERT",
            Self::NotFound => "NOT_FOUND",
            Self::CompilationFailed => "COMPILATION_FAILED",
            Self::MetadataOverride => "METADATA_OVERRIDE",
            Self::NoPostings => "NO_POSTINGS",
            Self::BulkSizeExceeded => "BULK_SIZE_EXCEEDED",
            Self::Import => "IMPORT",
            Self::Timeout => "TIMEOUT",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether a caller may retry (with the same idempotency key).
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application error: a code plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct AppError {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl AppError {
    /// Creates a new error.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// Shorthand for a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// Shorthand for an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Returns the error code for API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        self.code.as_str()
    }

    /// Whether the failed call may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::validation("x").error_code(), "VALIDATION");
        assert_eq!(AppError::not_found("x").error_code(), "NOT_FOUND");
        assert_eq!(AppError::internal("x").error_code(), "INTERNAL");
        assert_eq!(
            AppError::new(ErrorCode::AlreadyRevert, "x").error_code(),
            "ALREADY_REVERT"
        );
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::Unavailable.is_retryable());
        assert!(!ErrorCode::InsufficientFund.is_retryable());
        assert!(!ErrorCode::Conflict.is_retryable());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            AppError::validation("bad address").to_string(),
            "VALIDATION: bad address"
        );
    }

    #[test]
    fn test_code_serializes_screaming_snake() {
        let json = serde_json::to_string(&ErrorCode::InsufficientFund).unwrap();
        assert_eq!(json, "\"INSUFFICIENT_FUND\"");
    }
}
