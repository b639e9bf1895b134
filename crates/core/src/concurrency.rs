//! Concurrency controller.
//!
//! Mutating operations acquire, inside their storage transaction:
//! 1. the ledger-scope token, shared for ordinary writes and exclusive for import
//! 2. one lock per touched account, in lexicographic order
//! 3. the log tail, right before the entry ID is assigned
//!
//! All of them are released when the storage transaction ends. The storage
//! backend provides the primitive; this module decides keys, order, timeouts
//! and bounded retries, and tracks in-flight operations so that shutdown can
//! drain them.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tally_shared::config::LedgerConfig;
use tally_shared::types::TransactionId;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::idempotency::IdempotencyScope;
use crate::store::StoreTx;

/// Mode of the ledger-scope token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerLockMode {
    /// Ordinary writes; many holders at once.
    Shared,
    /// Import; excludes every other writer.
    Exclusive,
}

/// Lock key of the ledger-scope token, for backends that key every lock by string.
#[must_use]
pub fn ledger_scope_key(ledger: &str) -> String {
    format!("{ledger}/scope")
}

/// Lock key of an account.
#[must_use]
pub fn account_key(ledger: &str, address: &str) -> String {
    format!("{ledger}/account/{address}")
}

/// Lock key of a transaction's mutable state (metadata, revert flag).
#[must_use]
pub fn transaction_key(ledger: &str, id: TransactionId) -> String {
    format!("{ledger}/transaction/{id}")
}

/// Lock key of an idempotency key.
#[must_use]
pub fn idempotency_key(ledger: &str, scope: &IdempotencyScope, key: &str) -> String {
    format!("{ledger}/idempotency/{scope}/{key}")
}

/// Lock key of the log tail.
#[must_use]
pub fn log_tail_key(ledger: &str) -> String {
    format!("{ledger}/log")
}

/// Tracks in-flight operations and refuses new ones once closed.
#[derive(Debug, Default)]
pub struct DrainGate {
    closed: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

impl DrainGate {
    /// Registers one in-flight operation.
    ///
    /// Fails with [`LedgerError::ShuttingDown`] once [`DrainGate::drain`] started.
    pub fn enter(self: &Arc<Self>) -> Result<InFlight, LedgerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LedgerError::ShuttingDown);
        }
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let ticket = InFlight {
            gate: Arc::clone(self),
        };
        // Closed between the check and the increment: back out.
        if self.closed.load(Ordering::Acquire) {
            drop(ticket);
            return Err(LedgerError::ShuttingDown);
        }
        Ok(ticket)
    }

    /// Number of operations currently holding a ticket.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether the gate refuses new operations.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the gate and waits until every ticket is dropped.
    pub async fn drain(&self) {
        self.closed.store(true, Ordering::Release);
        loop {
            let notified = self.drained.notified();
            let remaining = self.in_flight();
            if remaining == 0 {
                break;
            }
            debug!(remaining, "waiting for in-flight operations");
            notified.await;
        }
    }
}

/// Ticket of one in-flight operation; dropping it releases the slot.
#[derive(Debug)]
pub struct InFlight {
    gate: Arc<DrainGate>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.gate.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.gate.drained.notify_waiters();
        }
    }
}

/// Lock acquisition policy shared by every controller of a process.
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    gate: Arc<DrainGate>,
    lock_timeout: Duration,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new(&LedgerConfig::default())
    }
}

impl ConcurrencyController {
    /// Creates a controller from configuration.
    #[must_use]
    pub fn new(config: &LedgerConfig) -> Self {
        Self {
            gate: Arc::new(DrainGate::default()),
            lock_timeout: config.lock_timeout(),
            retry_attempts: config.lock_retry_attempts,
            retry_backoff: config.lock_retry_backoff(),
        }
    }

    /// The drain gate.
    #[must_use]
    pub fn gate(&self) -> &Arc<DrainGate> {
        &self.gate
    }

    /// Registers an in-flight operation.
    pub fn enter(&self) -> Result<InFlight, LedgerError> {
        self.gate.enter()
    }

    /// Refuses new operations and waits for in-flight ones.
    pub async fn shutdown(&self) {
        info!(in_flight = self.gate.in_flight(), "draining in-flight operations");
        self.gate.drain().await;
        info!("all in-flight operations finished");
    }

    /// Acquires the ledger-scope token.
    pub async fn lock_ledger<T: StoreTx + ?Sized>(
        &self,
        tx: &mut T,
        mode: LedgerLockMode,
    ) -> Result<(), LedgerError> {
        let mut attempt = 0;
        loop {
            match tx.lock_ledger(mode, self.lock_timeout).await {
                Err(err) if err.is_lock_contention() && attempt < self.retry_attempts => {
                    attempt += 1;
                    warn!(attempt, ?mode, error = %err, "retrying ledger lock");
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                other => return other,
            }
        }
    }

    /// Acquires one lock per account, in lexicographic order.
    pub async fn lock_accounts<'a, T: StoreTx + ?Sized>(
        &self,
        tx: &mut T,
        ledger: &str,
        accounts: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), LedgerError> {
        let keys: Vec<String> = accounts
            .into_iter()
            .map(|address| account_key(ledger, address))
            .collect();
        self.lock_keys(tx, keys).await
    }

    /// Acquires arbitrary keys, sorted and deduplicated first.
    pub async fn lock_keys<T: StoreTx + ?Sized>(
        &self,
        tx: &mut T,
        keys: impl IntoIterator<Item = String>,
    ) -> Result<(), LedgerError> {
        let keys: Vec<String> = keys.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        if keys.is_empty() {
            return Ok(());
        }
        let mut attempt = 0;
        loop {
            match tx.lock_keys(&keys, self.lock_timeout).await {
                Err(err) if err.is_lock_contention() && attempt < self.retry_attempts => {
                    attempt += 1;
                    warn!(attempt, keys = keys.len(), error = %err, "retrying lock acquisition");
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
                other => return other,
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(account_key("main", "users:1"), "main/account/users:1");
        assert_eq!(transaction_key("main", TransactionId(4)), "main/transaction/4");
        assert_eq!(log_tail_key("main"), "main/log");
        assert_eq!(ledger_scope_key("main"), "main/scope");
        let scope = IdempotencyScope::new(crate::idempotency::Operation::CreateTransaction, "");
        assert_eq!(
            idempotency_key("main", &scope, "abc"),
            "main/idempotency/create_transaction/abc"
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let controller = ConcurrencyController::default();
        assert_eq!(controller.backoff(1), Duration::from_millis(50));
        assert_eq!(controller.backoff(2), Duration::from_millis(100));
        assert_eq!(controller.backoff(3), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_gate_refuses_after_drain() {
        let gate = Arc::new(DrainGate::default());
        let ticket = gate.enter().unwrap();
        assert_eq!(gate.in_flight(), 1);

        let draining = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.drain().await })
        };
        tokio::task::yield_now().await;
        while !gate.is_closed() {
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.enter().unwrap_err(), LedgerError::ShuttingDown);
        assert!(!draining.is_finished());

        drop(ticket);
        draining.await.unwrap();
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_with_nothing_in_flight() {
        let gate = Arc::new(DrainGate::default());
        gate.drain().await;
        assert!(gate.is_closed());
    }
}
