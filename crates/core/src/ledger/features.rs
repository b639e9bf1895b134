//! Per-ledger feature flags.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::log::MetadataTarget;

/// Feature controlling whether transactions may be dated before the ledger's
/// latest effective timestamp.
pub const FEATURE_BACKDATING: &str = "BACKDATING";

/// Feature keeping every revision of account metadata.
pub const FEATURE_ACCOUNT_METADATA_HISTORY: &str = "ACCOUNT_METADATA_HISTORY";

/// Feature keeping every revision of transaction metadata.
pub const FEATURE_TRANSACTION_METADATA_HISTORY: &str = "TRANSACTION_METADATA_HISTORY";

/// Backdating policy of a ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Backdating {
    /// Any business timestamp is accepted.
    #[default]
    Allow,
    /// Timestamps older than the latest effective timestamp are rejected.
    Deny,
}

/// Whether metadata revisions are recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataHistory {
    /// A revision is written with every change, in the same commit.
    #[default]
    Sync,
    /// Only the current metadata is kept.
    Disabled,
}

/// Accepted values and default of every known feature.
const KNOWN: [(&str, &[&str], &str); 3] = [
    (FEATURE_BACKDATING, &["ALLOW", "DENY"], "ALLOW"),
    (FEATURE_ACCOUNT_METADATA_HISTORY, &["SYNC", "DISABLED"], "SYNC"),
    (FEATURE_TRANSACTION_METADATA_HISTORY, &["SYNC", "DISABLED"], "SYNC"),
];

/// Feature flags of a ledger, as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Features(pub BTreeMap<String, String>);

impl Features {
    /// Fills defaults and rejects unknown features or values.
    pub fn normalized(mut self) -> Result<Self, LedgerError> {
        for (key, value) in &self.0 {
            let Some((_, accepted, _)) = KNOWN.iter().find(|(name, ..)| *name == key.as_str())
            else {
                return Err(LedgerError::validation(format!("unknown feature {key}")));
            };
            if !accepted.contains(&value.as_str()) {
                return Err(LedgerError::validation(format!(
                    "feature {key} accepts {}, got {value:?}",
                    accepted.join(" or ")
                )));
            }
        }
        for (name, _, default) in KNOWN {
            self.0
                .entry(name.to_string())
                .or_insert_with(|| default.to_string());
        }
        Ok(self)
    }

    /// Sets one feature.
    #[must_use]
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    /// Backdating policy; `Allow` when unset.
    #[must_use]
    pub fn backdating(&self) -> Backdating {
        match self.0.get(FEATURE_BACKDATING).map(String::as_str) {
            Some("DENY") => Backdating::Deny,
            _ => Backdating::Allow,
        }
    }

    /// History policy of account metadata; `Sync` when unset.
    #[must_use]
    pub fn account_metadata_history(&self) -> MetadataHistory {
        self.history(FEATURE_ACCOUNT_METADATA_HISTORY)
    }

    /// History policy of transaction metadata; `Sync` when unset.
    #[must_use]
    pub fn transaction_metadata_history(&self) -> MetadataHistory {
        self.history(FEATURE_TRANSACTION_METADATA_HISTORY)
    }

    /// Whether revisions of `target`'s metadata are recorded.
    #[must_use]
    pub fn keeps_history(&self, target: &MetadataTarget) -> bool {
        let policy = match target {
            MetadataTarget::Account(_) => self.account_metadata_history(),
            MetadataTarget::Transaction(_) => self.transaction_metadata_history(),
        };
        policy == MetadataHistory::Sync
    }

    fn history(&self, feature: &str) -> MetadataHistory {
        match self.0.get(feature).map(String::as_str) {
            Some("DISABLED") => MetadataHistory::Disabled,
            _ => MetadataHistory::Sync,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_filled() {
        let features = Features::default().normalized().unwrap();
        assert_eq!(features.0[FEATURE_BACKDATING], "ALLOW");
        assert_eq!(features.0[FEATURE_ACCOUNT_METADATA_HISTORY], "SYNC");
        assert_eq!(features.0[FEATURE_TRANSACTION_METADATA_HISTORY], "SYNC");
        assert_eq!(features.backdating(), Backdating::Allow);
        assert!(features.keeps_history(&MetadataTarget::Account("alice".into())));
    }

    #[test]
    fn test_disable_account_history_only() {
        let features = Features::default()
            .with(FEATURE_ACCOUNT_METADATA_HISTORY, "DISABLED")
            .normalized()
            .unwrap();
        assert_eq!(features.account_metadata_history(), MetadataHistory::Disabled);
        assert_eq!(features.transaction_metadata_history(), MetadataHistory::Sync);
        assert!(!features.keeps_history(&MetadataTarget::Account("alice".into())));
        assert!(features.keeps_history(&MetadataTarget::Transaction(
            tally_shared::types::TransactionId(1)
        )));
    }

    #[test]
    fn test_deny_backdating() {
        let features = Features::default()
            .with(FEATURE_BACKDATING, "DENY")
            .normalized()
            .unwrap();
        assert_eq!(features.backdating(), Backdating::Deny);
    }

    #[test]
    fn test_unknown_feature_rejected() {
        assert!(Features::default().with("TURBO", "ON").normalized().is_err());
        assert!(
            Features::default()
                .with(FEATURE_BACKDATING, "MAYBE")
                .normalized()
                .is_err()
        );
        assert!(
            Features::default()
                .with(FEATURE_TRANSACTION_METADATA_HISTORY, "ASYNC")
                .normalized()
                .is_err()
        );
    }
}
