//! Committed transactions and accounts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_shared::types::{Metadata, TransactionId};

use crate::log::MetadataTarget;
use crate::posting::Postings;
use crate::volumes::{AccountVolumes, VolumesByAsset};

/// Metadata key tagging a revert with the ID of the transaction it undoes.
pub const REVERTS_METADATA_KEY: &str = "tally/reverts";

/// A committed transaction.
///
/// Immutable after commit except for `metadata` and `reverted_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Per-ledger sequence number.
    pub id: TransactionId,
    /// Ordered postings.
    pub postings: Postings,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Business timestamp.
    pub timestamp: DateTime<Utc>,
    /// Commit time.
    pub inserted_at: DateTime<Utc>,
    /// Optional business reference, unique per ledger.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// When the transaction was reverted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverted_at: Option<DateTime<Utc>>,
    /// Insertion volumes right after commit, per involved pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_commit_volumes: Option<AccountVolumes>,
    /// Effective volumes right after the transaction in business order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_commit_effective_volumes: Option<AccountVolumes>,
}

impl Transaction {
    /// Whether a revert of this transaction was committed.
    #[must_use]
    pub const fn reverted(&self) -> bool {
        self.reverted_at.is_some()
    }

    /// Insertion volumes right before commit, derived from the post snapshot.
    #[must_use]
    pub fn pre_commit_volumes(&self) -> Option<AccountVolumes> {
        self.post_commit_volumes
            .as_ref()
            .and_then(|post| post.minus(&AccountVolumes::from_postings(&self.postings)))
    }

    /// Effective volumes right before the transaction in business order.
    #[must_use]
    pub fn pre_commit_effective_volumes(&self) -> Option<AccountVolumes> {
        self.post_commit_effective_volumes
            .as_ref()
            .and_then(|post| post.minus(&AccountVolumes::from_postings(&self.postings)))
    }

    /// The transaction without derived volume snapshots.
    #[must_use]
    pub fn without_volumes(mut self) -> Self {
        self.post_commit_volumes = None;
        self.post_commit_effective_volumes = None;
        self
    }
}

/// An account as exposed by reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Address.
    pub address: String,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// First time the account was referenced or written.
    pub first_usage: DateTime<Utc>,
    /// Commit time of its creation.
    pub inserted_at: DateTime<Utc>,
    /// Last metadata or volume change.
    pub updated_at: DateTime<Utc>,
    /// Volumes keyed by asset, as of the requested point in time.
    #[serde(default)]
    pub volumes: VolumesByAsset,
}

/// The full metadata of a transaction or account after one change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRevision {
    /// Transaction or account.
    pub target: MetadataTarget,
    /// Per-target sequence, starting at 1.
    pub revision: u64,
    /// Metadata after the change.
    pub metadata: Metadata,
    /// Commit time of the change.
    pub date: DateTime<Utc>,
}

/// Metadata in force at `pit` given a target's ascending revisions.
///
/// Empty before the first revision.
#[must_use]
pub fn metadata_at(revisions: &[MetadataRevision], pit: DateTime<Utc>) -> Metadata {
    revisions
        .iter()
        .rev()
        .find(|revision| revision.date <= pit)
        .map(|revision| revision.metadata.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::Posting;
    use crate::volumes::Volumes;

    fn sample() -> Transaction {
        let now = Utc::now();
        let postings = Postings(vec![Posting::new("world", "alice", "USD", 100)]);
        let mut post = AccountVolumes::default();
        post.set("world", "USD", Volumes::new(0, 300));
        post.set("alice", "USD", Volumes::new(150, 0));
        Transaction {
            id: TransactionId(3),
            postings,
            metadata: Metadata::new(),
            timestamp: now,
            inserted_at: now,
            reference: None,
            reverted_at: None,
            post_commit_volumes: Some(post),
            post_commit_effective_volumes: None,
        }
    }

    #[test]
    fn test_pre_commit_volumes_derived() {
        let pre = sample().pre_commit_volumes().unwrap();
        assert_eq!(pre.get("alice", "USD"), Volumes::new(50, 0));
        assert_eq!(pre.get("world", "USD"), Volumes::new(0, 200));
        assert!(sample().pre_commit_effective_volumes().is_none());
    }

    #[test]
    fn test_json_shape() {
        let tx = sample().without_volumes();
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["postings"][0]["amount"], "100");
        assert!(json.get("reference").is_none());
        assert!(json.get("post_commit_volumes").is_none());
        assert!(!tx.reverted());
    }

    #[test]
    fn test_metadata_at_picks_last_revision_before_pit() {
        let start = Utc::now();
        let revision = |n: u64, tier: &str| MetadataRevision {
            target: MetadataTarget::Account("alice".into()),
            revision: n,
            metadata: Metadata::from([("tier".to_string(), tier.to_string())]),
            date: start + chrono::Duration::seconds(i64::try_from(n).unwrap() * 10),
        };
        let revisions = vec![revision(1, "gold"), revision(2, "silver")];

        assert!(metadata_at(&revisions, start).is_empty());
        assert_eq!(metadata_at(&revisions, revisions[0].date)["tier"], "gold");
        assert_eq!(
            metadata_at(&revisions, start + chrono::Duration::seconds(15))["tier"],
            "gold"
        );
        assert_eq!(metadata_at(&revisions, revisions[1].date)["tier"], "silver");
    }
}
