//! Commit notifications.
//!
//! Published after the storage transaction commits, never before. A
//! publisher failing does not undo or fail the commit.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tally_shared::types::{LogId, Metadata, TransactionId};
use tokio::sync::mpsc;

use crate::log::{Log, LogPayload, MetadataTarget};
use crate::transaction::Transaction;

/// Something that happened on a ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerEvent {
    /// A transaction was committed.
    CommittedTransactions {
        /// Ledger name.
        ledger: String,
        /// Log entry of the commit.
        log_id: LogId,
        /// The transaction.
        transaction: Transaction,
        /// Account metadata written with it.
        account_metadata: BTreeMap<String, Metadata>,
    },
    /// Metadata was set.
    SavedMetadata {
        /// Ledger name.
        ledger: String,
        /// Log entry of the write.
        log_id: LogId,
        /// Transaction or account.
        target: MetadataTarget,
        /// Keys written.
        metadata: Metadata,
    },
    /// A metadata key was removed.
    DeletedMetadata {
        /// Ledger name.
        ledger: String,
        /// Log entry of the write.
        log_id: LogId,
        /// Transaction or account.
        target: MetadataTarget,
        /// Key removed.
        key: String,
    },
    /// A transaction was reverted.
    RevertedTransaction {
        /// Ledger name.
        ledger: String,
        /// Log entry of the revert.
        log_id: LogId,
        /// The reverted transaction.
        reverted_transaction_id: TransactionId,
        /// The inverse transaction.
        revert_transaction: Transaction,
    },
}

impl LedgerEvent {
    /// Event announcing a committed log entry.
    #[must_use]
    pub fn from_log(ledger: &str, log: &Log) -> Self {
        let ledger = ledger.to_string();
        let log_id = log.id;
        match log.payload.clone() {
            LogPayload::NewTransaction {
                transaction,
                account_metadata,
            } => Self::CommittedTransactions {
                ledger,
                log_id,
                transaction,
                account_metadata,
            },
            LogPayload::SetMetadata { target, metadata } => Self::SavedMetadata {
                ledger,
                log_id,
                target,
                metadata,
            },
            LogPayload::DeleteMetadata { target, key } => Self::DeletedMetadata {
                ledger,
                log_id,
                target,
                key,
            },
            LogPayload::RevertedTransaction {
                reverted_transaction_id,
                transaction,
            } => Self::RevertedTransaction {
                ledger,
                log_id,
                reverted_transaction_id,
                revert_transaction: transaction,
            },
        }
    }

    /// Log entry the event belongs to.
    #[must_use]
    pub const fn log_id(&self) -> LogId {
        match self {
            Self::CommittedTransactions { log_id, .. }
            | Self::SavedMetadata { log_id, .. }
            | Self::DeletedMetadata { log_id, .. }
            | Self::RevertedTransaction { log_id, .. } => *log_id,
        }
    }
}

/// Error returned by a publisher.
#[derive(Debug, thiserror::Error)]
#[error("event publication failed: {0}")]
pub struct PublishError(pub String);

/// Sink of ledger events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync + std::fmt::Debug {
    /// Publishes one event.
    async fn publish(&self, event: LedgerEvent) -> Result<(), PublishError>;
}

/// Publisher dropping every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, _event: LedgerEvent) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Publisher forwarding events to an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: mpsc::UnboundedSender<LedgerEvent>,
}

impl ChannelPublisher {
    /// Creates a publisher and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LedgerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventPublisher for ChannelPublisher {
    async fn publish(&self, event: LedgerEvent) -> Result<(), PublishError> {
        self.sender
            .send(event)
            .map_err(|_| PublishError("receiver dropped".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_channel_publisher_delivers_in_order() {
        let (publisher, mut receiver) = ChannelPublisher::new();
        let first = Log::chained(
            None,
            LogPayload::SetMetadata {
                target: MetadataTarget::Account("alice".into()),
                metadata: Metadata::from([("k".into(), "v".into())]),
            },
            Utc::now(),
            None,
        )
        .unwrap();
        let second = Log::chained(
            Some(&first),
            LogPayload::DeleteMetadata {
                target: MetadataTarget::Account("alice".into()),
                key: "k".into(),
            },
            Utc::now(),
            None,
        )
        .unwrap();
        for log in [&first, &second] {
            publisher
                .publish(LedgerEvent::from_log("main", log))
                .await
                .unwrap();
        }
        assert_eq!(receiver.recv().await.unwrap().log_id(), LogId(1));
        let event = receiver.recv().await.unwrap();
        assert!(matches!(event, LedgerEvent::DeletedMetadata { ref key, .. } if key == "k"));
    }

    #[tokio::test]
    async fn test_channel_publisher_fails_without_receiver() {
        let (publisher, receiver) = ChannelPublisher::new();
        drop(receiver);
        let log = Log::chained(
            None,
            LogPayload::DeleteMetadata {
                target: MetadataTarget::Transaction(TransactionId(1)),
                key: "k".into(),
            },
            Utc::now(),
            None,
        )
        .unwrap();
        assert!(publisher
            .publish(LedgerEvent::from_log("main", &log))
            .await
            .is_err());
    }
}
