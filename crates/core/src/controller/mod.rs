//! Transaction commit orchestrator.
//!
//! [`LedgerController`] is the entry point of every operation on one ledger.
//! A mutating call runs on its own tokio task: the caller waits at most the
//! response timeout and gets [`LedgerError::Timeout`] on expiry, while the
//! task keeps going and commits if it can. Shutdown waits for those tasks
//! through the [`DrainGate`](crate::concurrency::DrainGate).

pub mod bulk;
pub mod command;
pub mod pipeline;
pub mod query;
pub mod transfer;


use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tally_shared::config::LedgerConfig;
use tracing::{debug, instrument, warn};

use crate::concurrency::ConcurrencyController;
use crate::error::LedgerError;
use crate::events::{EventPublisher, LedgerEvent};
use crate::idempotency::{self, Replay};
use crate::ledger::Ledger;
use crate::log::Log;
use crate::resolver::PostingSetResolver;
use crate::store::{Store, StoreTx};
use crate::time::SharedClock;
use crate::transaction::Transaction;

pub use bulk::{BulkElement, BulkOptions, BulkResult};
pub use command::{
    Command, CreateTransaction, DeleteMetadata, OperationResult, Outcome, Parameters,
    RevertTransaction, SaveMetadata,
};
pub use query::VerifyReport;
pub use transfer::LogSink;

/// Limits applied by a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// How long a caller waits for a mutating call.
    pub response_timeout: Duration,
    /// Largest accepted bulk.
    pub bulk_max_size: usize,
    /// Concurrency of non-atomic parallel bulks.
    pub bulk_parallelism: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&LedgerConfig::default())
    }
}

impl From<&LedgerConfig> for ControllerSettings {
    fn from(config: &LedgerConfig) -> Self {
        Self {
            response_timeout: config.response_timeout(),
            bulk_max_size: config.bulk_max_size,
            bulk_parallelism: config.bulk_parallelism.max(1),
        }
    }
}

/// Collaborators shared by every controller of a process.
#[derive(Debug)]
pub struct ControllerDeps<S> {
    /// Storage.
    pub store: Arc<S>,
    /// Posting resolution.
    pub resolver: Arc<PostingSetResolver>,
    /// Lock policy and drain gate.
    pub concurrency: ConcurrencyController,
    /// Event sink.
    pub publisher: Arc<dyn EventPublisher>,
    /// Wall clock.
    pub clock: SharedClock,
    /// Limits.
    pub settings: ControllerSettings,
}

impl<S> Clone for ControllerDeps<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            resolver: Arc::clone(&self.resolver),
            concurrency: self.concurrency.clone(),
            publisher: Arc::clone(&self.publisher),
            clock: Arc::clone(&self.clock),
            settings: self.settings,
        }
    }
}

/// Operations on one ledger.
#[derive(Debug)]
pub struct LedgerController<S> {
    ledger: Arc<Ledger>,
    store: Arc<S>,
    resolver: Arc<PostingSetResolver>,
    concurrency: ConcurrencyController,
    publisher: Arc<dyn EventPublisher>,
    clock: SharedClock,
    settings: ControllerSettings,
}

impl<S> Clone for LedgerController<S> {
    fn clone(&self) -> Self {
        Self {
            ledger: Arc::clone(&self.ledger),
            store: Arc::clone(&self.store),
            resolver: Arc::clone(&self.resolver),
            concurrency: self.concurrency.clone(),
            publisher: Arc::clone(&self.publisher),
            clock: Arc::clone(&self.clock),
            settings: self.settings,
        }
    }
}

impl<S: Store> LedgerController<S> {
    /// Creates a controller for `ledger`.
    #[must_use]
    pub fn new(ledger: Ledger, deps: ControllerDeps<S>) -> Self {
        Self {
            ledger: Arc::new(ledger),
            store: deps.store,
            resolver: deps.resolver,
            concurrency: deps.concurrency,
            publisher: deps.publisher,
            clock: deps.clock,
            settings: deps.settings,
        }
    }

    /// The ledger this controller operates on.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Commits a transaction.
    pub async fn create_transaction(
        &self,
        params: Parameters<CreateTransaction>,
    ) -> Result<Outcome<Transaction>, LedgerError> {
        self.submit(params.input.into(), params.idempotency_key, params.dry_run)
            .await?
            .try_map(OperationResult::into_transaction)
    }

    /// Commits the inverse of a transaction and flags the original reverted.
    pub async fn revert_transaction(
        &self,
        params: Parameters<RevertTransaction>,
    ) -> Result<Outcome<Transaction>, LedgerError> {
        self.submit(params.input.into(), params.idempotency_key, params.dry_run)
            .await?
            .try_map(OperationResult::into_transaction)
    }

    /// Merges metadata into a transaction or account.
    pub async fn save_metadata(
        &self,
        params: Parameters<SaveMetadata>,
    ) -> Result<Outcome<()>, LedgerError> {
        self.submit(params.input.into(), params.idempotency_key, params.dry_run)
            .await?
            .try_map(|_| Ok(()))
    }

    /// Removes a metadata key from a transaction or account.
    pub async fn delete_metadata(
        &self,
        params: Parameters<DeleteMetadata>,
    ) -> Result<Outcome<()>, LedgerError> {
        self.submit(params.input.into(), params.idempotency_key, params.dry_run)
            .await?
            .try_map(|_| Ok(()))
    }

    async fn submit(
        &self,
        command: Command,
        idempotency_key: Option<String>,
        dry_run: bool,
    ) -> Result<Outcome<OperationResult>, LedgerError> {
        let this = self.clone();
        self.detached(async move { this.process(command, idempotency_key, dry_run).await })
            .await
    }

    /// Runs `operation` on its own task, holding a drain ticket, and waits for
    /// it at most the response timeout.
    async fn detached<T>(
        &self,
        operation: impl Future<Output = Result<T, LedgerError>> + Send + 'static,
    ) -> Result<T, LedgerError>
    where
        T: Send + 'static,
    {
        let ticket = self.concurrency.enter()?;
        let handle = tokio::spawn(async move {
            let result = operation.await;
            drop(ticket);
            result
        });
        match tokio::time::timeout(self.settings.response_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => Err(LedgerError::Internal(format!("operation task failed: {err}"))),
            Err(_) => {
                warn!(
                    ledger = %self.ledger.name,
                    timeout = ?self.settings.response_timeout,
                    "response timeout reached, operation continues in background"
                );
                Err(LedgerError::Timeout)
            }
        }
    }

    /// One command in its own storage transaction.
    #[instrument(skip_all, fields(ledger = %self.ledger.name, command = command.name(), dry_run = dry_run))]
    async fn process(
        &self,
        command: Command,
        idempotency_key: Option<String>,
        dry_run: bool,
    ) -> Result<Outcome<OperationResult>, LedgerError> {
        if let Some(key) = idempotency_key.as_deref().filter(|_| !dry_run) {
            let scope = command.scope().to_string();
            let existing = self
                .store
                .find_idempotency_record(&self.ledger.name, &scope, key)
                .await?;
            if let Replay::Hit(record) =
                idempotency::check(existing, key, &idempotency::fingerprint(&command)?)?
            {
                debug!(key, "idempotency hit");
                return pipeline::replay(record);
            }
        }

        let mut tx = self.store.begin(&self.ledger.name).await?;
        let step = match self
            .execute(&mut tx, &command, idempotency_key.as_deref(), dry_run)
            .await
        {
            Ok(step) => step,
            Err(err) => {
                self.discard(tx).await;
                debug!(error = %err, "command rejected");
                return Err(err);
            }
        };

        let outcome = step.into_outcome();
        if dry_run || outcome.idempotency_hit {
            self.discard(tx).await;
            return Ok(outcome);
        }
        tx.commit().await?;
        if let Some(log) = &outcome.log {
            self.publish(std::slice::from_ref(log)).await;
        }
        Ok(outcome)
    }

    async fn discard(&self, tx: S::Tx) {
        if let Err(err) = tx.rollback().await {
            warn!(ledger = %self.ledger.name, error = %err, "rollback failed");
        }
    }

    /// Announces committed entries, in order.
    async fn publish(&self, logs: &[Log]) {
        for log in logs {
            let event = LedgerEvent::from_log(&self.ledger.name, log);
            if let Err(err) = self.publisher.publish(event).await {
                warn!(
                    ledger = %self.ledger.name,
                    log_id = %log.id,
                    error = %err,
                    "event publication failed"
                );
            }
        }
    }
}
