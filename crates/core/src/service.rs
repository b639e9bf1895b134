//! Process-wide entry point: ledger lifecycle plus per-ledger controllers.

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use tally_shared::config::LedgerConfig;
use tracing::info;

use crate::concurrency::ConcurrencyController;
use crate::controller::{ControllerDeps, ControllerSettings, LedgerController};
use crate::error::LedgerError;
use crate::events::{EventPublisher, NoopPublisher};
use crate::ledger::{CreateLedger, Ledger, LedgerRegistry, PurgeReport};
use crate::resolver::{CompilerRegistry, PostingSetResolver};
use crate::store::Store;
use crate::time::{SharedClock, SystemClock};

/// Ledger lifecycle and access to ledger controllers.
#[derive(Debug)]
pub struct LedgerService<S, R> {
    registry: Arc<R>,
    deps: ControllerDeps<S>,
}

impl<S, R> Clone for LedgerService<S, R> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            deps: self.deps.clone(),
        }
    }
}

impl<S: Store, R: LedgerRegistry> LedgerService<S, R> {
    /// Creates a service with no script compiler, no event sink and the
    /// system clock.
    pub fn new(store: Arc<S>, registry: Arc<R>, config: &LedgerConfig) -> Self {
        Self {
            registry,
            deps: ControllerDeps {
                store,
                resolver: Arc::new(PostingSetResolver::default()),
                concurrency: ConcurrencyController::new(config),
                publisher: Arc::new(NoopPublisher),
                clock: Arc::new(SystemClock),
                settings: ControllerSettings::from(config),
            },
        }
    }

    /// Publishes committed logs to `publisher`.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.deps.publisher = publisher;
        self
    }

    /// Compiles scripts with `compilers`.
    #[must_use]
    pub fn with_compilers(mut self, compilers: CompilerRegistry) -> Self {
        self.deps.resolver = Arc::new(PostingSetResolver::new(compilers));
        self
    }

    /// Uses `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.deps.clock = clock;
        self
    }

    /// The storage backend.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.deps.store
    }

    /// The ledger registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// The clock shared with controllers.
    #[must_use]
    pub fn clock(&self) -> &SharedClock {
        &self.deps.clock
    }

    /// Creates a ledger.
    pub async fn create_ledger(&self, input: CreateLedger) -> Result<Ledger, LedgerError> {
        let ledger = self.registry.create_ledger(input).await?;
        info!(ledger = %ledger.name, bucket = %ledger.bucket, "ledger created");
        Ok(ledger)
    }

    /// Looks a live ledger up.
    pub async fn get_ledger(&self, name: &str) -> Result<Ledger, LedgerError> {
        match self.registry.get_ledger(name).await? {
            Some(ledger) if !ledger.is_deleted() => Ok(ledger),
            _ => Err(LedgerError::not_found(format!("ledger {name}"))),
        }
    }

    /// Lists ledgers.
    pub async fn list_ledgers(&self, include_deleted: bool) -> Result<Vec<Ledger>, LedgerError> {
        self.registry.list_ledgers(include_deleted).await
    }

    /// Soft-deletes a ledger.
    pub async fn delete_ledger(&self, name: &str) -> Result<(), LedgerError> {
        self.registry.delete_ledger(name).await?;
        info!(ledger = name, "ledger soft-deleted");
        Ok(())
    }

    /// Hard-deletes ledgers soft-deleted before `cutoff`.
    pub async fn purge_deleted(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, LedgerError> {
        self.registry.purge_deleted(cutoff).await
    }

    /// Controller of a live ledger.
    ///
    /// Soft-deleted and unknown ledgers are [`LedgerError::NotFound`].
    pub async fn controller(&self, name: &str) -> Result<LedgerController<S>, LedgerError> {
        if self.deps.concurrency.gate().is_closed() {
            return Err(LedgerError::ShuttingDown);
        }
        let ledger = self.get_ledger(name).await?;
        Ok(LedgerController::new(ledger, self.deps.clone()))
    }

    /// Refuses new operations and waits for in-flight commits.
    pub async fn shutdown(&self) {
        self.deps.concurrency.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{CreateTransaction, Parameters};
    use crate::posting::{Posting, Postings};
    use crate::resolver::TransactionSource;
    use crate::store::MemoryStore;

    fn service() -> LedgerService<MemoryStore, MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        LedgerService::new(Arc::clone(&store), store, &LedgerConfig::default())
    }

    fn deposit() -> Parameters<CreateTransaction> {
        Parameters::new(CreateTransaction::new(TransactionSource::Postings(Postings(
            vec![Posting::new("world", "alice", "USD", 10)],
        ))))
    }

    #[tokio::test]
    async fn test_controller_of_live_ledger() {
        let service = service();
        service.create_ledger(CreateLedger::named("main")).await.unwrap();
        let controller = service.controller("main").await.unwrap();
        assert_eq!(controller.ledger().name, "main");
        controller.create_transaction(deposit()).await.unwrap();
    }

    #[tokio::test]
    async fn test_deleted_ledger_is_not_found() {
        let service = service();
        service.create_ledger(CreateLedger::named("main")).await.unwrap();
        service.delete_ledger("main").await.unwrap();

        let err = service.controller("main").await.unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
        assert_eq!(service.list_ledgers(false).await.unwrap().len(), 0);
        assert_eq!(service.list_ledgers(true).await.unwrap().len(), 1);
        assert_eq!(service.delete_ledger("main").await.unwrap_err().error_code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_duplicate_ledger_conflicts() {
        let service = service();
        service.create_ledger(CreateLedger::named("main")).await.unwrap();
        let err = service
            .create_ledger(CreateLedger::named("main"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_controller() {
        let service = service();
        service.create_ledger(CreateLedger::named("main")).await.unwrap();
        let controller = service.controller("main").await.unwrap();

        service.shutdown().await;
        assert_eq!(
            controller.create_transaction(deposit()).await.unwrap_err(),
            LedgerError::ShuttingDown
        );
        assert_eq!(
            service.controller("main").await.unwrap_err(),
            LedgerError::ShuttingDown
        );
    }
}
