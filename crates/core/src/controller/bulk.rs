//! Batches of heterogeneous commands.
//!
//! Atomic batches share one storage transaction: every element is planned,
//! the union of their keys is locked once, then elements apply in input
//! order, each seeing the writes of the previous ones. Any failure rolls the
//! whole batch back and nothing is published. Non-atomic batches run each
//! element as an independent operation, optionally several at a time; results
//! always come back in input order.

use std::collections::BTreeSet;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tally_shared::types::TransactionId;
use tracing::{info, instrument, warn};

use super::command::{Command, OperationResult, Outcome};
use super::LedgerController;
use crate::concurrency::LedgerLockMode;
use crate::error::LedgerError;
use crate::log::Log;
use crate::store::{Store, StoreTx};

/// One element of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkElement {
    /// The command.
    #[serde(flatten)]
    pub command: Command,
    /// Idempotency key of this element.
    #[serde(default, rename = "ik")]
    pub idempotency_key: Option<String>,
}

impl BulkElement {
    /// Element without idempotency key.
    pub fn new(command: impl Into<Command>) -> Self {
        Self {
            command: command.into(),
            idempotency_key: None,
        }
    }
}

/// How a batch runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOptions {
    /// All or nothing.
    #[serde(default)]
    pub atomic: bool,
    /// Run independent elements concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Run every check but commit nothing.
    #[serde(default)]
    pub dry_run: bool,
}

/// Result of one element.
pub type BulkResult = Result<Outcome<OperationResult>, LedgerError>;

impl<S: Store> LedgerController<S> {
    /// Runs a batch.
    ///
    /// Fails with [`LedgerError::BulkSizeExceeded`] before running anything if
    /// the batch is larger than allowed. Otherwise returns one result per
    /// element; in a failed atomic batch every element carries the error.
    pub async fn bulk(
        &self,
        elements: Vec<BulkElement>,
        options: BulkOptions,
    ) -> Result<Vec<BulkResult>, LedgerError> {
        if elements.len() > self.settings.bulk_max_size {
            return Err(LedgerError::BulkSizeExceeded {
                size: elements.len(),
                max: self.settings.bulk_max_size,
            });
        }
        if elements.is_empty() {
            return Ok(Vec::new());
        }
        let this = self.clone();
        self.detached(async move {
            if options.atomic {
                this.bulk_atomic(elements, options.dry_run).await
            } else {
                Ok(this
                    .bulk_independent(elements, options.parallel, options.dry_run)
                    .await)
            }
        })
        .await
    }

    #[instrument(skip_all, fields(ledger = %self.ledger.name, size = elements.len()))]
    async fn bulk_atomic(
        &self,
        elements: Vec<BulkElement>,
        dry_run: bool,
    ) -> Result<Vec<BulkResult>, LedgerError> {
        let size = elements.len();
        let mut tx = self.store.begin(&self.ledger.name).await?;
        let outcomes = match self.apply_all(&mut tx, &elements, dry_run).await {
            Ok(outcomes) => outcomes,
            Err((index, err)) => {
                self.discard(tx).await;
                warn!(index, error = %err, "atomic bulk rolled back");
                return Ok(failed(size, &err));
            }
        };

        if dry_run {
            self.discard(tx).await;
            return Ok(outcomes.into_iter().map(Ok).collect());
        }
        if let Err(err) = tx.commit().await {
            warn!(error = %err, "atomic bulk commit failed");
            return Ok(failed(size, &err));
        }

        let logs: Vec<Log> = outcomes
            .iter()
            .filter(|outcome| !outcome.idempotency_hit)
            .filter_map(|outcome| outcome.log.clone())
            .collect();
        info!(entries = logs.len(), "atomic bulk committed");
        self.publish(&logs).await;
        Ok(outcomes.into_iter().map(Ok).collect())
    }

    async fn apply_all(
        &self,
        tx: &mut S::Tx,
        elements: &[BulkElement],
        dry_run: bool,
    ) -> Result<Vec<Outcome<OperationResult>>, (usize, LedgerError)> {
        self.concurrency
            .lock_ledger(tx, LedgerLockMode::Shared)
            .await
            .map_err(|err| (0, err))?;

        // Reverts may target transactions written earlier in the batch, which
        // take the IDs right after the current last one.
        let first_free = tx
            .last_transaction_id()
            .await
            .map_err(|err| (0, err))?
            .map_or(TransactionId::FIRST, TransactionId::next);
        let mut created = 0u64;

        let mut plans = Vec::with_capacity(elements.len());
        let mut keys = BTreeSet::new();
        for (index, element) in elements.iter().enumerate() {
            let plan = self
                .plan(
                    tx,
                    &element.command,
                    element.idempotency_key.as_deref(),
                    dry_run,
                )
                .await
                .map_err(|err| (index, err))?;
            if let Some(id) = plan.unplanned_revert() {
                if !(first_free.0..first_free.0 + created).contains(&id.0) {
                    return Err((index, LedgerError::not_found(format!("transaction {id}"))));
                }
            }
            if plan.creates_transaction() {
                created += 1;
            }
            keys.extend(plan.keys.iter().cloned());
            plans.push(plan);
        }
        self.concurrency
            .lock_keys(tx, keys.clone())
            .await
            .map_err(|err| (0, err))?;

        let mut outcomes = Vec::with_capacity(elements.len());
        for (index, (element, plan)) in elements.iter().zip(plans).enumerate() {
            let step = self
                .apply(tx, &element.command, plan, Some(&keys), dry_run)
                .await
                .map_err(|err| (index, err))?;
            outcomes.push(step.into_outcome());
        }
        Ok(outcomes)
    }

    async fn bulk_independent(
        &self,
        elements: Vec<BulkElement>,
        parallel: bool,
        dry_run: bool,
    ) -> Vec<BulkResult> {
        let runs = elements.into_iter().map(|element| {
            let this = self.clone();
            async move {
                this.process(element.command, element.idempotency_key, dry_run)
                    .await
            }
        });
        if parallel {
            stream::iter(runs)
                .buffered(self.settings.bulk_parallelism)
                .collect()
                .await
        } else {
            let mut results = Vec::new();
            for run in runs {
                results.push(run.await);
            }
            results
        }
    }
}

fn failed(size: usize, err: &LedgerError) -> Vec<BulkResult> {
    (0..size).map(|_| Err(err.clone())).collect()
}
