//! Idempotency manager.
//!
//! A caller-supplied key binds one logical operation on one target to the
//! first request body it was seen with. The record is written in the same
//! storage transaction as the commit it belongs to, so it exists if and only
//! if the commit does.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tally_shared::types::LogId;

use crate::error::LedgerError;

/// Logical operation an idempotency key is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create a transaction.
    CreateTransaction,
    /// Revert a transaction.
    RevertTransaction,
    /// Set metadata on a transaction or account.
    AddMetadata,
    /// Delete a metadata key.
    DeleteMetadata,
}

impl Operation {
    /// Stable name used in storage keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateTransaction => "create_transaction",
            Self::RevertTransaction => "revert_transaction",
            Self::AddMetadata => "add_metadata",
            Self::DeleteMetadata => "delete_metadata",
        }
    }
}

/// Operation plus target: the namespace of an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyScope {
    /// The operation.
    pub operation: Operation,
    /// Transaction ID, account address, or empty for ledger-wide creation.
    pub target: String,
}

impl IdempotencyScope {
    /// Creates a scope.
    pub fn new(operation: Operation, target: impl Into<String>) -> Self {
        Self {
            operation,
            target: target.into(),
        }
    }
}

impl fmt::Display for IdempotencyScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.target.is_empty() {
            f.write_str(self.operation.as_str())
        } else {
            write!(f, "{}/{}", self.operation.as_str(), self.target)
        }
    }
}

/// A stored idempotency binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Caller-supplied key.
    pub key: String,
    /// Rendered [`IdempotencyScope`].
    pub scope: String,
    /// Fingerprint of the normalized request body.
    pub fingerprint: String,
    /// Response returned by the first execution.
    pub response: serde_json::Value,
    /// Log entry produced by the first execution.
    pub log_id: Option<LogId>,
    /// When the key was first used.
    pub created_at: DateTime<Utc>,
}

/// Outcome of looking a key up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    /// First use of the key: execute normally.
    Miss,
    /// Same key, same body: return the stored response.
    Hit(IdempotencyRecord),
}

/// SHA-256 fingerprint of a normalized request body, hex encoded.
///
/// The body is serialized through `serde_json::Value`, whose maps are
/// ordered, so field order in the caller's input does not matter.
pub fn fingerprint<T: Serialize>(body: &T) -> Result<String, LedgerError> {
    let value = serde_json::to_value(body)?;
    let bytes = serde_json::to_vec(&value)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Decides what to do with a request given the record stored for its key.
pub fn check(
    existing: Option<IdempotencyRecord>,
    key: &str,
    fingerprint: &str,
) -> Result<Replay, LedgerError> {
    match existing {
        None => Ok(Replay::Miss),
        Some(record) if record.fingerprint == fingerprint => Ok(Replay::Hit(record)),
        Some(_) => Err(LedgerError::IdempotencyKeyConflict {
            key: key.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(fingerprint: &str) -> IdempotencyRecord {
        IdempotencyRecord {
            key: "ik".into(),
            scope: IdempotencyScope::new(Operation::CreateTransaction, "").to_string(),
            fingerprint: fingerprint.into(),
            response: serde_json::json!({"ok": true}),
            log_id: Some(LogId(1)),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_fingerprint_ignores_field_order() {
        let a: HashMap<&str, i32> = HashMap::from([("a", 1), ("b", 2), ("c", 3)]);
        let b: HashMap<&str, i32> = HashMap::from([("c", 3), ("a", 1), ("b", 2)]);
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
        assert_eq!(fingerprint(&a).unwrap().len(), 64);
    }

    #[test]
    fn test_fingerprint_differs_on_body() {
        let a = serde_json::json!({"amount": "100"});
        let b = serde_json::json!({"amount": "101"});
        assert_ne!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn test_check_outcomes() {
        assert_eq!(check(None, "ik", "f1").unwrap(), Replay::Miss);
        assert!(matches!(
            check(Some(record("f1")), "ik", "f1").unwrap(),
            Replay::Hit(_)
        ));
        assert_eq!(
            check(Some(record("f1")), "ik", "f2").unwrap_err(),
            LedgerError::IdempotencyKeyConflict { key: "ik".into() }
        );
    }

    #[test]
    fn test_scope_rendering() {
        assert_eq!(
            IdempotencyScope::new(Operation::CreateTransaction, "").to_string(),
            "create_transaction"
        );
        assert_eq!(
            IdempotencyScope::new(Operation::AddMetadata, "account:alice").to_string(),
            "add_metadata/account:alice"
        );
    }
}
