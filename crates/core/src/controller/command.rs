//! Mutating operations and their results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_shared::types::{Metadata, TransactionId};

use crate::error::LedgerError;
use crate::idempotency::{IdempotencyScope, Operation};
use crate::log::{Log, MetadataTarget};
use crate::resolver::TransactionSource;
use crate::transaction::Transaction;

/// Input of a transaction creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransaction {
    /// Explicit postings or a script.
    pub source: TransactionSource,
    /// Caller metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Business timestamp; commit time when absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Business reference, unique per ledger.
    #[serde(default)]
    pub reference: Option<String>,
    /// Skip the funds check.
    #[serde(default)]
    pub force: bool,
}

impl CreateTransaction {
    /// Input with defaults for everything but the source.
    #[must_use]
    pub fn new(source: TransactionSource) -> Self {
        Self {
            source,
            metadata: Metadata::new(),
            timestamp: None,
            reference: None,
            force: false,
        }
    }
}

/// Input of a revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertTransaction {
    /// Transaction to revert.
    pub id: TransactionId,
    /// Skip the funds check.
    #[serde(default)]
    pub force: bool,
    /// Reuse the original business timestamp.
    #[serde(default)]
    pub at_effective_date: bool,
}

/// Input of a metadata write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveMetadata {
    /// Transaction or account.
    pub target: MetadataTarget,
    /// Keys to write.
    pub metadata: Metadata,
}

/// Input of a metadata key removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMetadata {
    /// Transaction or account.
    pub target: MetadataTarget,
    /// Key to remove.
    pub key: String,
}

/// Any mutating operation; also the element type of bulk batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    /// Create a transaction.
    CreateTransaction(CreateTransaction),
    /// Revert a transaction.
    RevertTransaction(RevertTransaction),
    /// Set metadata.
    AddMetadata(SaveMetadata),
    /// Remove a metadata key.
    DeleteMetadata(DeleteMetadata),
}

impl Command {
    /// Namespace of idempotency keys sent with this command.
    #[must_use]
    pub fn scope(&self) -> IdempotencyScope {
        match self {
            Self::CreateTransaction(_) => IdempotencyScope::new(Operation::CreateTransaction, ""),
            Self::RevertTransaction(input) => {
                IdempotencyScope::new(Operation::RevertTransaction, input.id.to_string())
            }
            Self::AddMetadata(input) => {
                IdempotencyScope::new(Operation::AddMetadata, input.target.to_string())
            }
            Self::DeleteMetadata(input) => IdempotencyScope::new(
                Operation::DeleteMetadata,
                format!("{}/{}", input.target, input.key),
            ),
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateTransaction(_) => "create_transaction",
            Self::RevertTransaction(_) => "revert_transaction",
            Self::AddMetadata(_) => "add_metadata",
            Self::DeleteMetadata(_) => "delete_metadata",
        }
    }
}

impl From<CreateTransaction> for Command {
    fn from(input: CreateTransaction) -> Self {
        Self::CreateTransaction(input)
    }
}

impl From<RevertTransaction> for Command {
    fn from(input: RevertTransaction) -> Self {
        Self::RevertTransaction(input)
    }
}

impl From<SaveMetadata> for Command {
    fn from(input: SaveMetadata) -> Self {
        Self::AddMetadata(input)
    }
}

impl From<DeleteMetadata> for Command {
    fn from(input: DeleteMetadata) -> Self {
        Self::DeleteMetadata(input)
    }
}

/// Data returned by a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OperationResult {
    /// The created or revert transaction, with volume snapshots.
    Transaction(Box<Transaction>),
    /// Metadata was written or removed.
    Metadata(MetadataTarget),
}

impl OperationResult {
    /// The transaction of a create or revert.
    pub fn into_transaction(self) -> Result<Transaction, LedgerError> {
        match self {
            Self::Transaction(transaction) => Ok(*transaction),
            Self::Metadata(target) => Err(LedgerError::Internal(format!(
                "expected a transaction result, got metadata on {target}"
            ))),
        }
    }
}

/// Caller parameters of a mutating call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters<I> {
    /// Run every check but commit nothing.
    pub dry_run: bool,
    /// Caller idempotency key.
    pub idempotency_key: Option<String>,
    /// Operation input.
    pub input: I,
}

impl<I> Parameters<I> {
    /// Parameters of a plain call.
    pub const fn new(input: I) -> Self {
        Self {
            dry_run: false,
            idempotency_key: None,
            input,
        }
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Turns the call into a dry run.
    #[must_use]
    pub const fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Result of a mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<T> {
    /// Log entry written; absent for dry runs.
    pub log: Option<Log>,
    /// Operation data.
    pub data: T,
    /// Replayed from an idempotency record.
    pub idempotency_hit: bool,
}

impl<T> Outcome<T> {
    /// Converts the data, keeping log and hit marker.
    pub fn try_map<U>(
        self,
        f: impl FnOnce(T) -> Result<U, LedgerError>,
    ) -> Result<Outcome<U>, LedgerError> {
        Ok(Outcome {
            log: self.log,
            data: f(self.data)?,
            idempotency_hit: self.idempotency_hit,
        })
    }
}

/// Response stored in idempotency records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredResponse {
    pub log: Option<Log>,
    pub result: OperationResult,
}

impl StoredResponse {
    pub fn into_outcome(self) -> Outcome<OperationResult> {
        Outcome {
            log: self.log,
            data: self.result,
            idempotency_hit: true,
        }
    }
}
