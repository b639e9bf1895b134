//! Ledgers: named tenants grouped into storage buckets.
//!
//! A ledger is created explicitly, soft-deleted (hidden and closed to writes),
//! then hard-deleted with all its data once the retention period has passed.
//! A bucket disappears once its last ledger is gone.

pub mod features;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tally_shared::types::Metadata;

use crate::error::LedgerError;

pub use features::{
    Backdating, Features, MetadataHistory, FEATURE_ACCOUNT_METADATA_HISTORY, FEATURE_BACKDATING,
    FEATURE_TRANSACTION_METADATA_HISTORY,
};

/// Bucket used when a ledger is created without one.
pub const DEFAULT_BUCKET: &str = "_default";

static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-zA-Z_-]{1,63}$").expect("ledger name pattern compiles"));

/// A ledger definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    /// Unique name.
    pub name: String,
    /// Storage bucket.
    pub bucket: String,
    /// Feature flags.
    pub features: Features,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Soft deletion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Ledger {
    /// Whether the ledger was soft-deleted.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Input of [`LedgerRegistry::create_ledger`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLedger {
    /// Unique name.
    pub name: String,
    /// Storage bucket, [`DEFAULT_BUCKET`] when absent.
    #[serde(default)]
    pub bucket: Option<String>,
    /// Feature flags.
    #[serde(default)]
    pub features: Features,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
}

impl CreateLedger {
    /// Input for a ledger with default settings.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Validates names and features and builds the definition.
    pub fn into_ledger(self, now: DateTime<Utc>) -> Result<Ledger, LedgerError> {
        validate_name("ledger", &self.name)?;
        let bucket = self.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_string());
        validate_name("bucket", &bucket)?;
        Ok(Ledger {
            name: self.name,
            bucket,
            features: self.features.normalized()?,
            metadata: self.metadata,
            created_at: crate::time::normalize(now),
            deleted_at: None,
        })
    }
}

fn validate_name(kind: &str, name: &str) -> Result<(), LedgerError> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(LedgerError::validation(format!("invalid {kind} name {name:?}")))
    }
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Hard-deleted ledgers.
    pub ledgers: Vec<String>,
    /// Buckets left empty and deleted.
    pub buckets: Vec<String>,
}

/// Storage of ledger definitions.
#[async_trait]
pub trait LedgerRegistry: Send + Sync {
    /// Creates a ledger; [`LedgerError::LedgerExists`] if the name is taken.
    async fn create_ledger(&self, input: CreateLedger) -> Result<Ledger, LedgerError>;

    /// Looks a ledger up by name, soft-deleted ones included.
    async fn get_ledger(&self, name: &str) -> Result<Option<Ledger>, LedgerError>;

    /// Lists ledgers by name.
    async fn list_ledgers(&self, include_deleted: bool) -> Result<Vec<Ledger>, LedgerError>;

    /// Soft-deletes a ledger; [`LedgerError::NotFound`] if unknown or already deleted.
    async fn delete_ledger(&self, name: &str) -> Result<(), LedgerError>;

    /// Hard-deletes ledgers soft-deleted before `cutoff`, then empty buckets.
    async fn purge_deleted(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("main")]
    #[case("tenant_01")]
    #[case("eu-west")]
    fn test_valid_names(#[case] name: &str) {
        assert!(CreateLedger::named(name).into_ledger(Utc::now()).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("with space")]
    #[case("a:b")]
    fn test_invalid_names(#[case] name: &str) {
        let err = CreateLedger::named(name).into_ledger(Utc::now()).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION");
    }

    #[test]
    fn test_name_length_limit() {
        assert!(CreateLedger::named("a".repeat(63)).into_ledger(Utc::now()).is_ok());
        assert!(CreateLedger::named("a".repeat(64)).into_ledger(Utc::now()).is_err());
    }

    #[test]
    fn test_default_bucket_and_features() {
        let ledger = CreateLedger::named("main").into_ledger(Utc::now()).unwrap();
        assert_eq!(ledger.bucket, DEFAULT_BUCKET);
        assert_eq!(ledger.features.backdating(), Backdating::Allow);
        assert!(!ledger.is_deleted());
    }
}
