//! Conversion of `SeaORM` errors into ledger errors.
//!
//! Every storage failure crosses into the commit pipeline through [`db_err`],
//! so retry decisions only depend on [`LedgerError::is_retryable`].

use sea_orm::{DbErr, RuntimeErr};
use tally_core::LedgerError;

/// `unique_violation`.
pub const UNIQUE_VIOLATION: &str = "23505";
/// `lock_not_available`, raised when `lock_timeout` expires.
pub const LOCK_NOT_AVAILABLE: &str = "55P03";
/// `deadlock_detected`.
pub const DEADLOCK_DETECTED: &str = "40P01";
/// `query_canceled`, raised when `statement_timeout` expires.
pub const QUERY_CANCELED: &str = "57014";

/// SQLSTATE of a database error, if the server sent one.
#[must_use]
pub fn sql_state(err: &DbErr) -> Option<String> {
    match err {
        DbErr::Exec(RuntimeErr::SqlxError(inner))
        | DbErr::Query(RuntimeErr::SqlxError(inner))
        | DbErr::Conn(RuntimeErr::SqlxError(inner)) => inner
            .as_database_error()
            .and_then(|db| db.code())
            .map(|code| code.into_owned()),
        _ => None,
    }
}

/// Name of the constraint a database error refers to.
#[must_use]
pub fn constraint(err: &DbErr) -> Option<String> {
    match err {
        DbErr::Exec(RuntimeErr::SqlxError(inner)) | DbErr::Query(RuntimeErr::SqlxError(inner)) => {
            inner
                .as_database_error()
                .and_then(|db| db.constraint())
                .map(str::to_string)
        }
        _ => None,
    }
}

/// Whether `err` is a unique constraint violation.
#[must_use]
pub fn is_unique_violation(err: &DbErr) -> bool {
    sql_state(err).as_deref() == Some(UNIQUE_VIOLATION)
}

/// Maps a database error onto the ledger error taxonomy.
#[must_use]
#[allow(clippy::needless_pass_by_value)]
pub fn db_err(err: DbErr) -> LedgerError {
    match sql_state(&err).as_deref() {
        Some(LOCK_NOT_AVAILABLE | DEADLOCK_DETECTED | QUERY_CANCELED) => {
            return LedgerError::LockTimeout(err.to_string());
        }
        Some(_) => return LedgerError::Internal(err.to_string()),
        None => {}
    }
    match err {
        DbErr::ConnectionAcquire(_) | DbErr::Conn(_) => LedgerError::Unavailable(err.to_string()),
        other => LedgerError::Internal(other.to_string()),
    }
}
