//! The append-only, hash-chained ledger log.
//!
//! One entry per accepted mutation. Entries are immutable once written; the
//! hash of each covers its predecessor's hash, so any rewrite of history is
//! detectable by recomputing the chain ([`verify_chain`]) or, more cheaply,
//! by checking sealed [`LogBlock`]s.

pub mod block;
pub mod hash;

#[cfg(test)]
mod hash_props;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_shared::types::{LogId, Metadata, TransactionId};

use crate::error::LedgerError;
use crate::transaction::Transaction;

pub use block::{merkle_root, verify_block, verify_block_chain, LogBlock};
pub use hash::{canonical_bytes, chain_hash, verify_chain, LogHash, CANONICAL_VERSION};

/// Kind of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogType {
    /// A transaction was committed.
    NewTransaction,
    /// Metadata was set on a transaction or account.
    SetMetadata,
    /// A metadata key was removed.
    DeleteMetadata,
    /// A transaction was reverted.
    RevertedTransaction,
}

impl LogType {
    /// Wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewTransaction => "NEW_TRANSACTION",
            Self::SetMetadata => "SET_METADATA",
            Self::DeleteMetadata => "DELETE_METADATA",
            Self::RevertedTransaction => "REVERTED_TRANSACTION",
        }
    }
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW_TRANSACTION" => Ok(Self::NewTransaction),
            "SET_METADATA" => Ok(Self::SetMetadata),
            "DELETE_METADATA" => Ok(Self::DeleteMetadata),
            "REVERTED_TRANSACTION" => Ok(Self::RevertedTransaction),
            other => Err(format!("unknown log type {other}")),
        }
    }
}

/// What a metadata operation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataTarget {
    /// A transaction of the ledger.
    Transaction(TransactionId),
    /// An account of the ledger.
    Account(String),
}

impl fmt::Display for MetadataTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transaction(id) => write!(f, "transaction:{id}"),
            Self::Account(address) => write!(f, "account:{address}"),
        }
    }
}

/// Body of a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogPayload {
    /// A committed transaction and the account metadata written with it.
    NewTransaction {
        /// The transaction, without volume snapshots.
        transaction: Transaction,
        /// Metadata written on accounts by the script.
        #[serde(default)]
        account_metadata: BTreeMap<String, Metadata>,
    },
    /// Metadata merged into a target.
    SetMetadata {
        /// Transaction or account.
        target: MetadataTarget,
        /// Keys written.
        metadata: Metadata,
    },
    /// Metadata key removed from a target.
    DeleteMetadata {
        /// Transaction or account.
        target: MetadataTarget,
        /// Key removed.
        key: String,
    },
    /// A transaction was reverted by a new, inverse one.
    RevertedTransaction {
        /// The reverted transaction.
        reverted_transaction_id: TransactionId,
        /// The inverse transaction.
        transaction: Transaction,
    },
}

impl LogPayload {
    /// Transactions and accounts whose metadata the entry changed.
    #[must_use]
    pub fn metadata_targets(&self) -> Vec<MetadataTarget> {
        match self {
            Self::NewTransaction {
                transaction,
                account_metadata,
            } => std::iter::once(MetadataTarget::Transaction(transaction.id))
                .chain(account_metadata.keys().cloned().map(MetadataTarget::Account))
                .collect(),
            Self::RevertedTransaction { transaction, .. } => {
                vec![MetadataTarget::Transaction(transaction.id)]
            }
            Self::SetMetadata { target, .. } | Self::DeleteMetadata { target, .. } => {
                vec![target.clone()]
            }
        }
    }

    /// Type of the entry this payload belongs to.
    #[must_use]
    pub const fn log_type(&self) -> LogType {
        match self {
            Self::NewTransaction { .. } => LogType::NewTransaction,
            Self::SetMetadata { .. } => LogType::SetMetadata,
            Self::DeleteMetadata { .. } => LogType::DeleteMetadata,
            Self::RevertedTransaction { .. } => LogType::RevertedTransaction,
        }
    }

    /// Strips derived volume snapshots from embedded transactions.
    #[must_use]
    pub fn without_volumes(self) -> Self {
        match self {
            Self::NewTransaction {
                transaction,
                account_metadata,
            } => Self::NewTransaction {
                transaction: transaction.without_volumes(),
                account_metadata,
            },
            Self::RevertedTransaction {
                reverted_transaction_id,
                transaction,
            } => Self::RevertedTransaction {
                reverted_transaction_id,
                transaction: transaction.without_volumes(),
            },
            other => other,
        }
    }
}

/// A committed log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    /// Gapless per-ledger sequence number.
    pub id: LogId,
    /// Typed body.
    #[serde(flatten)]
    pub payload: LogPayload,
    /// Commit time, strictly increasing within a ledger.
    pub date: DateTime<Utc>,
    /// Idempotency key of the request that produced the entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Chain hash.
    pub hash: LogHash,
}

impl Log {
    /// Builds an entry chained onto `previous`.
    ///
    /// `previous` is `None` for the first entry of a ledger.
    pub fn chained(
        previous: Option<&Log>,
        payload: LogPayload,
        date: DateTime<Utc>,
        idempotency_key: Option<String>,
    ) -> Result<Self, LedgerError> {
        let id = previous.map_or(LogId::FIRST, |log| log.id.next());
        let mut log = Self {
            id,
            payload: payload.without_volumes(),
            date: crate::time::normalize(date),
            idempotency_key,
            hash: LogHash::SEED,
        };
        log.hash = chain_hash(previous.map(|log| &log.hash), &log)?;
        Ok(log)
    }

    /// Type of this entry.
    #[must_use]
    pub const fn log_type(&self) -> LogType {
        self.payload.log_type()
    }
}
