//! Storage abstraction of the commit pipeline.
//!
//! [`Store`] is the read side plus a factory of [`StoreTx`], one storage
//! transaction holding the locks and buffered writes of one commit. Nothing a
//! `StoreTx` writes is visible to others before [`StoreTx::commit`]; dropping
//! it or calling [`StoreTx::rollback`] discards everything.

pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use tally_shared::types::{BlockId, LogCursor, Metadata, TransactionId};

use crate::concurrency::LedgerLockMode;
use crate::error::LedgerError;
use crate::idempotency::IdempotencyRecord;
use crate::log::{Log, LogBlock, MetadataTarget};
use crate::transaction::{Account, MetadataRevision, Transaction};
use crate::volumes::{AccountVolumes, Move, TimeAxis};

pub use memory::MemoryStore;

/// `(account, asset)` pairs.
pub type VolumePairs = BTreeSet<(String, String)>;

/// Point-in-time selector of volume reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumesQuery {
    /// Instant to read at; current state when absent.
    #[serde(default)]
    pub pit: Option<DateTime<Utc>>,
    /// Clock `pit` refers to.
    #[serde(default)]
    pub axis: TimeAxis,
}

impl VolumesQuery {
    /// Volumes as of `pit` in business time.
    #[must_use]
    pub const fn effective_at(pit: DateTime<Utc>) -> Self {
        Self {
            pit: Some(pit),
            axis: TimeAxis::Effective,
        }
    }

    /// Volumes as of `pit` in commit time.
    #[must_use]
    pub const fn inserted_at(pit: DateTime<Utc>) -> Self {
        Self {
            pit: Some(pit),
            axis: TimeAxis::Insertion,
        }
    }
}

/// Accounts selected by an aggregated balance read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFilter {
    /// Exactly these addresses.
    Exact(Vec<String>),
    /// Every address starting with this prefix.
    Prefix(String),
}

impl AddressFilter {
    /// Whether `address` is selected.
    #[must_use]
    pub fn matches(&self, address: &str) -> bool {
        match self {
            Self::Exact(addresses) => addresses.iter().any(|a| a == address),
            Self::Prefix(prefix) => address.starts_with(prefix.as_str()),
        }
    }
}

/// Aggregated balance read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancesQuery {
    /// Selected accounts.
    pub addresses: AddressFilter,
    /// Point in time.
    #[serde(default)]
    pub at: VolumesQuery,
}

/// Balances keyed by asset.
pub type Balances = BTreeMap<String, BigInt>;

/// Read side and transaction factory of a ledger store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Storage transaction type.
    type Tx: StoreTx + 'static;

    /// Opens a storage transaction on `ledger`.
    async fn begin(&self, ledger: &str) -> Result<Self::Tx, LedgerError>;

    /// A transaction with both volume snapshots filled.
    async fn get_transaction(
        &self,
        ledger: &str,
        id: TransactionId,
    ) -> Result<Option<Transaction>, LedgerError>;

    /// An account with its volumes at the requested point in time.
    ///
    /// With a point in time, metadata comes from the account's latest revision
    /// committed at or before it, or is the current metadata when the account
    /// has no revisions.
    async fn get_account(
        &self,
        ledger: &str,
        address: &str,
        query: VolumesQuery,
    ) -> Result<Option<Account>, LedgerError>;

    /// Balances summed per asset over the selected accounts.
    async fn aggregated_balances(
        &self,
        ledger: &str,
        query: &BalancesQuery,
    ) -> Result<Balances, LedgerError>;

    /// Metadata revisions of `target`, oldest first.
    async fn metadata_history(
        &self,
        ledger: &str,
        target: &MetadataTarget,
    ) -> Result<Vec<MetadataRevision>, LedgerError>;

    /// Log entries after the cursor, ascending, at most `cursor.limit()`.
    async fn list_logs(&self, ledger: &str, cursor: &LogCursor) -> Result<Vec<Log>, LedgerError>;

    /// Idempotency record of `key` in `scope`, outside any transaction.
    async fn find_idempotency_record(
        &self,
        ledger: &str,
        scope: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, LedgerError>;

    /// Most recently sealed block.
    async fn last_block(&self, ledger: &str) -> Result<Option<LogBlock>, LedgerError>;

    /// Sealed blocks after `after`, ascending.
    async fn list_blocks(
        &self,
        ledger: &str,
        after: Option<BlockId>,
        limit: u64,
    ) -> Result<Vec<LogBlock>, LedgerError>;

    /// Stores a sealed block.
    async fn insert_block(&self, ledger: &str, block: &LogBlock) -> Result<(), LedgerError>;
}

/// One storage transaction on one ledger.
#[async_trait]
pub trait StoreTx: Send {
    /// Acquires the ledger-scope token, waiting at most `timeout`.
    async fn lock_ledger(
        &mut self,
        mode: LedgerLockMode,
        timeout: Duration,
    ) -> Result<(), LedgerError>;

    /// Acquires `keys` in the given (sorted) order, waiting at most `timeout`
    /// for each. Keys already held by this transaction are skipped.
    async fn lock_keys(&mut self, keys: &[String], timeout: Duration) -> Result<(), LedgerError>;

    /// Current insertion volumes of `pairs`.
    async fn volumes(&mut self, pairs: &VolumePairs) -> Result<AccountVolumes, LedgerError>;

    /// Effective volumes of `pairs` over moves dated at or before `at`.
    async fn effective_volumes(
        &mut self,
        pairs: &VolumePairs,
        at: DateTime<Utc>,
    ) -> Result<AccountVolumes, LedgerError>;

    /// Latest business timestamp of any move.
    async fn last_effective_date(&mut self) -> Result<Option<DateTime<Utc>>, LedgerError>;

    /// A transaction, without effective volumes.
    async fn transaction(&mut self, id: TransactionId)
    -> Result<Option<Transaction>, LedgerError>;

    /// Transaction carrying `reference`.
    async fn transaction_by_reference(
        &mut self,
        reference: &str,
    ) -> Result<Option<TransactionId>, LedgerError>;

    /// Highest transaction ID.
    async fn last_transaction_id(&mut self) -> Result<Option<TransactionId>, LedgerError>;

    /// An account, without volumes.
    async fn account(&mut self, address: &str) -> Result<Option<Account>, LedgerError>;

    /// Latest log entry.
    async fn last_log(&mut self) -> Result<Option<Log>, LedgerError>;

    /// Idempotency record of `key` in `scope`.
    async fn idempotency_record(
        &mut self,
        scope: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, LedgerError>;

    /// Inserts a transaction; [`LedgerError::Conflict`] on a reused reference.
    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), LedgerError>;

    /// Flags a transaction reverted; `false` if it already was.
    async fn mark_reverted(
        &mut self,
        id: TransactionId,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Merges metadata into a transaction; `false` if it does not exist.
    async fn save_transaction_metadata(
        &mut self,
        id: TransactionId,
        metadata: &Metadata,
    ) -> Result<bool, LedgerError>;

    /// Removes a metadata key; `false` if the transaction or key does not exist.
    async fn delete_transaction_metadata(
        &mut self,
        id: TransactionId,
        key: &str,
    ) -> Result<bool, LedgerError>;

    /// Creates missing accounts and moves `first_usage` back if needed.
    async fn upsert_accounts(
        &mut self,
        addresses: &BTreeSet<String>,
        first_usage: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// Merges metadata into an account, creating it if needed.
    async fn save_account_metadata(
        &mut self,
        address: &str,
        metadata: &Metadata,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// Removes a metadata key; `false` if the account or key does not exist.
    async fn delete_account_metadata(
        &mut self,
        address: &str,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Records `metadata` as the next revision of `target`.
    async fn insert_metadata_revision(
        &mut self,
        target: &MetadataTarget,
        metadata: &Metadata,
        date: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// Adds counters to the insertion volumes.
    async fn apply_volume_deltas(&mut self, deltas: &AccountVolumes) -> Result<(), LedgerError>;

    /// Records moves for the effective projection.
    async fn insert_moves(&mut self, moves: &[Move]) -> Result<(), LedgerError>;

    /// Appends a log entry.
    async fn insert_log(&mut self, log: &Log) -> Result<(), LedgerError>;

    /// Stores an idempotency record.
    async fn insert_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<(), LedgerError>;

    /// Makes every write visible and releases every lock.
    async fn commit(self) -> Result<(), LedgerError>
    where
        Self: Sized;

    /// Discards every write and releases every lock.
    async fn rollback(self) -> Result<(), LedgerError>
    where
        Self: Sized;
}
