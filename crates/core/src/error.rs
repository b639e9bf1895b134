//! Ledger error types.
//!
//! Every failure of the commit pipeline is a [`LedgerError`]. Variants carry
//! enough context to be reported verbatim; [`LedgerError::error_code`] gives the
//! stable code and [`LedgerError::is_retryable`] tells transient failures apart.

use tally_shared::types::{LogId, TransactionId};
use tally_shared::{AppError, ErrorCode};
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    // ========== Validation Errors ==========
    /// Malformed input.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An idempotency key was reused with a different request body.
    #[error("Idempotency key {key} was already used with a different request")]
    IdempotencyKeyConflict {
        /// The reused key.
        key: String,
    },

    /// The request resolved to zero postings.
    #[error("Transaction has no postings")]
    NoPostings,

    /// Caller metadata and script metadata both set the same key.
    #[error("Metadata key {key} is already set by the script")]
    MetadataOverride {
        /// The colliding key.
        key: String,
    },

    /// Bulk request larger than allowed.
    #[error("Bulk of {size} elements exceeds the maximum of {max}")]
    BulkSizeExceeded {
        /// Number of elements received.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    // ========== Script Errors ==========
    /// The script could not be compiled.
    #[error("Compilation failed: {0}")]
    CompilationFailed(String),

    /// The script failed while executing.
    #[error("Script execution failed: {0}")]
    Interpreter(String),

    // ========== Business Rule Errors ==========
    /// A balance would go negative.
    #[error("Insufficient funds on account {account} for asset {asset}")]
    InsufficientFund {
        /// The offending account.
        account: String,
        /// The asset that would go negative.
        asset: String,
    },

    /// The transaction reference is already used in this ledger.
    #[error("Transaction reference {reference} already exists")]
    Conflict {
        /// The duplicated reference.
        reference: String,
    },

    /// A ledger with this name already exists.
    #[error("Ledger {0} already exists")]
    LedgerExists(String),

    /// The transaction was already reverted.
    #[error("Transaction {0} is already reverted")]
    AlreadyReverted(TransactionId),

    // ========== Lookup Errors ==========
    /// Unknown ledger, transaction, account or metadata key.
    #[error("Not found: {0}")]
    NotFound(String),

    // ========== Import Errors ==========
    /// Import rejected.
    #[error("Import failed: {0}")]
    Import(String),

    /// An imported log entry does not chain onto its predecessor.
    #[error("Import failed: hash mismatch on log {log_id}")]
    InvalidHash {
        /// The first entry whose hash does not match.
        log_id: LogId,
    },

    // ========== Transient Errors ==========
    /// The response budget was exceeded; the commit may still complete.
    #[error("Operation timed out")]
    Timeout,

    /// A lock could not be acquired in time.
    #[error("Lock acquisition timed out: {0}")]
    LockTimeout(String),

    /// Storage is unreachable.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// The service is draining and refuses new work.
    #[error("Service is shutting down")]
    ShuttingDown,

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Shorthand for [`LedgerError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Shorthand for [`LedgerError::NotFound`].
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Returns the stable error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) | Self::IdempotencyKeyConflict { .. } => ErrorCode::Validation,
            Self::NoPostings => ErrorCode::NoPostings,
            Self::MetadataOverride { .. } => ErrorCode::MetadataOverride,
            Self::BulkSizeExceeded { .. } => ErrorCode::BulkSizeExceeded,
            Self::CompilationFailed(_) | Self::Interpreter(_) => ErrorCode::CompilationFailed,
            Self::InsufficientFund { .. } => ErrorCode::InsufficientFund,
            Self::Conflict { .. } | Self::LedgerExists(_) => ErrorCode::Conflict,
            Self::AlreadyReverted(_) => ErrorCode::AlreadyRevert,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Import(_) | Self::InvalidHash { .. } => ErrorCode::Import,
            Self::Timeout | Self::LockTimeout(_) => ErrorCode::Timeout,
            Self::Unavailable(_) | Self::ShuttingDown => ErrorCode::Unavailable,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Returns the error code for API responses.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        self.code().as_str()
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::LockTimeout(_) | Self::Unavailable(_) | Self::ShuttingDown
        )
    }

    /// Whether the Concurrency Controller may retry the lock acquisition that
    /// produced this error.
    #[must_use]
    pub const fn is_lock_contention(&self) -> bool {
        matches!(self, Self::LockTimeout(_) | Self::Unavailable(_))
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("serialization: {err}"))
    }
}
