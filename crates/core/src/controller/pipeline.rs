//! The commit pipeline of one command inside one storage transaction.
//!
//! An operation first *plans*: it resolves its postings and computes every
//! lock key it will need, then acquires them in one sorted batch. Only the
//! log tail is taken later, right before IDs are assigned, and it is always
//! the last lock an operation waits for. Atomic bulks plan every element
//! before locking the union, so no operation ever waits for a key while
//! holding the tail.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tally_shared::types::{Metadata, TransactionId};
use tracing::debug;

use super::command::{
    Command, CreateTransaction, DeleteMetadata, OperationResult, Outcome, RevertTransaction,
    SaveMetadata, StoredResponse,
};
use super::LedgerController;
use crate::concurrency::{self, account_key, log_tail_key, transaction_key, LedgerLockMode};
use crate::error::LedgerError;
use crate::idempotency::{self, IdempotencyRecord, Replay};
use crate::ledger::{Backdating, Features};
use crate::log::{Log, LogPayload, MetadataTarget};
use crate::posting::{is_valid_address, Postings};
use crate::resolver::ResolvedTransaction;
use crate::store::{Store, StoreTx};
use crate::time;
use crate::transaction::{Transaction, REVERTS_METADATA_KEY};
use crate::volumes::{AccountVolumes, Move, VolumeEngine};

/// Idempotency binding of a planned command.
#[derive(Debug, Clone)]
pub(super) struct Binding {
    key: String,
    scope: String,
    fingerprint: String,
}

#[derive(Debug)]
enum Prepared {
    Create(ResolvedTransaction),
    /// `known` is false when the target did not exist at planning time.
    Revert {
        id: TransactionId,
        known: bool,
    },
    Metadata,
}

/// Keys and pre-computed inputs of a command.
#[derive(Debug)]
pub(super) struct Plan {
    pub keys: BTreeSet<String>,
    binding: Option<Binding>,
    prepared: Prepared,
}

impl Plan {
    /// Whether applying the command writes a new transaction.
    pub fn creates_transaction(&self) -> bool {
        matches!(
            self.prepared,
            Prepared::Create(_) | Prepared::Revert { .. }
        )
    }

    /// Target of a revert whose accounts could not be planned.
    pub fn unplanned_revert(&self) -> Option<TransactionId> {
        match self.prepared {
            Prepared::Revert { id, known: false } => Some(id),
            _ => None,
        }
    }
}

/// What running a command produced.
#[derive(Debug)]
pub(super) enum Step {
    /// The idempotency key was already bound to this request.
    Replayed(Outcome<OperationResult>),
    /// The command ran; `log` is absent for dry runs.
    Executed {
        log: Option<Log>,
        result: OperationResult,
    },
}

impl Step {
    pub fn into_outcome(self) -> Outcome<OperationResult> {
        match self {
            Self::Replayed(outcome) => outcome,
            Self::Executed { log, result } => Outcome {
                log,
                data: result,
                idempotency_hit: false,
            },
        }
    }
}

/// The log position claimed by an operation.
#[derive(Debug)]
struct Tail {
    previous: Option<Log>,
    date: DateTime<Utc>,
}

struct Effect {
    result: OperationResult,
    entry: Option<(Tail, LogPayload)>,
}

impl Effect {
    fn preview(result: OperationResult) -> Self {
        Self {
            result,
            entry: None,
        }
    }

    fn logged(result: OperationResult, tail: Tail, payload: LogPayload) -> Self {
        Self {
            result,
            entry: Some((tail, payload)),
        }
    }
}

/// Transaction content before IDs and commit time are assigned.
struct Draft {
    postings: Postings,
    metadata: Metadata,
    timestamp: DateTime<Utc>,
    reference: Option<String>,
    force: bool,
}

pub(super) fn replay(record: IdempotencyRecord) -> Result<Outcome<OperationResult>, LedgerError> {
    let stored: StoredResponse = serde_json::from_value(record.response)?;
    Ok(stored.into_outcome())
}

impl<S: Store> LedgerController<S> {
    /// Plans, locks and applies one command.
    pub(super) async fn execute(
        &self,
        tx: &mut S::Tx,
        command: &Command,
        idempotency_key: Option<&str>,
        dry_run: bool,
    ) -> Result<Step, LedgerError> {
        self.concurrency
            .lock_ledger(tx, LedgerLockMode::Shared)
            .await?;
        let plan = self.plan(tx, command, idempotency_key, dry_run).await?;
        self.concurrency.lock_keys(tx, plan.keys.clone()).await?;
        self.apply(tx, command, plan, None, dry_run).await
    }

    /// Resolves the command and lists the keys it needs.
    pub(super) async fn plan(
        &self,
        tx: &mut S::Tx,
        command: &Command,
        idempotency_key: Option<&str>,
        dry_run: bool,
    ) -> Result<Plan, LedgerError> {
        let ledger = self.ledger.name.as_str();
        let mut keys = BTreeSet::new();

        let binding = match idempotency_key.filter(|_| !dry_run) {
            Some(key) => {
                let scope = command.scope();
                keys.insert(concurrency::idempotency_key(ledger, &scope, key));
                Some(Binding {
                    key: key.to_string(),
                    scope: scope.to_string(),
                    fingerprint: idempotency::fingerprint(command)?,
                })
            }
            None => None,
        };

        let prepared = match command {
            Command::CreateTransaction(input) => {
                let resolved = self.resolver.resolve(&input.source, &input.metadata)?;
                keys.extend(
                    resolved
                        .postings
                        .involved_accounts()
                        .iter()
                        .chain(resolved.account_metadata.keys())
                        .map(|address| account_key(ledger, address)),
                );
                Prepared::Create(resolved)
            }
            Command::RevertTransaction(input) => {
                keys.insert(transaction_key(ledger, input.id));
                // Postings never change, so reading them unlocked is enough to
                // know which accounts to lock.
                let original = tx.transaction(input.id).await?;
                if let Some(original) = &original {
                    keys.extend(
                        original
                            .postings
                            .involved_accounts()
                            .iter()
                            .map(|address| account_key(ledger, address)),
                    );
                }
                Prepared::Revert {
                    id: input.id,
                    known: original.is_some(),
                }
            }
            Command::AddMetadata(SaveMetadata { target, .. })
            | Command::DeleteMetadata(DeleteMetadata { target, .. }) => {
                keys.insert(target_key(ledger, target)?);
                Prepared::Metadata
            }
        };

        Ok(Plan {
            keys,
            binding,
            prepared,
        })
    }

    /// Runs a planned command whose keys are held.
    ///
    /// `frozen` is the complete lock set of a batch that may already hold the
    /// log tail: no other account lock may be taken.
    pub(super) async fn apply(
        &self,
        tx: &mut S::Tx,
        command: &Command,
        plan: Plan,
        frozen: Option<&BTreeSet<String>>,
        dry_run: bool,
    ) -> Result<Step, LedgerError> {
        // 1. Idempotency key, checked again now that it is locked
        if let Some(binding) = &plan.binding {
            let existing = tx.idempotency_record(&binding.scope, &binding.key).await?;
            if let Replay::Hit(record) =
                idempotency::check(existing, &binding.key, &binding.fingerprint)?
            {
                debug!(key = %binding.key, "idempotency hit under lock");
                return Ok(Step::Replayed(replay(record)?));
            }
        }

        // 2. The operation itself
        let effect = match (command, plan.prepared) {
            (Command::CreateTransaction(input), Prepared::Create(resolved)) => {
                self.create(tx, input, resolved, dry_run).await?
            }
            (Command::RevertTransaction(input), Prepared::Revert { .. }) => {
                self.revert(tx, input, frozen, dry_run).await?
            }
            (Command::AddMetadata(input), Prepared::Metadata) => {
                self.apply_save_metadata(tx, input, dry_run).await?
            }
            (Command::DeleteMetadata(input), Prepared::Metadata) => {
                self.apply_delete_metadata(tx, input, dry_run).await?
            }
            _ => return Err(LedgerError::Internal("plan does not match command".into())),
        };

        let Some((tail, payload)) = effect.entry else {
            return Ok(Step::Executed {
                log: None,
                result: effect.result,
            });
        };

        // 3. Log entry
        let log = Log::chained(
            tail.previous.as_ref(),
            payload,
            tail.date,
            plan.binding.as_ref().map(|binding| binding.key.clone()),
        )?;
        tx.insert_log(&log).await?;
        record_metadata_history(tx, &self.ledger.features, &log).await?;

        // 4. Idempotency record, committed with the entry
        if let Some(binding) = plan.binding {
            let response = serde_json::to_value(StoredResponse {
                log: Some(log.clone()),
                result: effect.result.clone(),
            })?;
            tx.insert_idempotency_record(&IdempotencyRecord {
                key: binding.key,
                scope: binding.scope,
                fingerprint: binding.fingerprint,
                response,
                log_id: Some(log.id),
                created_at: log.date,
            })
            .await?;
        }

        debug!(log_id = %log.id, log_type = %log.log_type(), "log entry appended");
        Ok(Step::Executed {
            log: Some(log),
            result: effect.result,
        })
    }

    async fn create(
        &self,
        tx: &mut S::Tx,
        input: &CreateTransaction,
        resolved: ResolvedTransaction,
        dry_run: bool,
    ) -> Result<Effect, LedgerError> {
        let timestamp = time::normalize(input.timestamp.unwrap_or_else(|| self.clock.now()));
        self.check_backdating(tx, timestamp).await?;

        if let Some(reference) = &input.reference {
            if tx.transaction_by_reference(reference).await?.is_some() {
                return Err(LedgerError::Conflict {
                    reference: reference.clone(),
                });
            }
        }

        let draft = Draft {
            postings: resolved.postings,
            metadata: resolved.metadata,
            timestamp,
            reference: input.reference.clone(),
            force: input.force,
        };
        let (transaction, tail) = self
            .record_transaction(tx, draft, &resolved.account_metadata, dry_run)
            .await?;

        let result = OperationResult::Transaction(Box::new(transaction.clone()));
        Ok(match tail {
            None => Effect::preview(result),
            Some(tail) => Effect::logged(
                result,
                tail,
                LogPayload::NewTransaction {
                    transaction,
                    account_metadata: resolved.account_metadata,
                },
            ),
        })
    }

    async fn revert(
        &self,
        tx: &mut S::Tx,
        input: &RevertTransaction,
        frozen: Option<&BTreeSet<String>>,
        dry_run: bool,
    ) -> Result<Effect, LedgerError> {
        let ledger = self.ledger.name.as_str();
        let original = tx
            .transaction(input.id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("transaction {}", input.id)))?;
        if original.reverted() {
            return Err(LedgerError::AlreadyReverted(input.id));
        }
        let accounts = original.postings.involved_accounts();
        match frozen {
            // Created by a concurrent writer after the batch was planned.
            Some(held) => {
                if let Some(missing) = accounts
                    .iter()
                    .map(|address| account_key(ledger, address))
                    .find(|key| !held.contains(key))
                {
                    return Err(LedgerError::LockTimeout(missing));
                }
            }
            // No-op when planned with the original at hand.
            None => {
                self.concurrency
                    .lock_accounts(tx, ledger, accounts.iter().map(String::as_str))
                    .await?;
            }
        }

        let timestamp = if input.at_effective_date {
            original.timestamp
        } else {
            let now = time::normalize(self.clock.now());
            self.check_backdating(tx, now).await?;
            now
        };

        let draft = Draft {
            postings: original.postings.reversed(),
            metadata: Metadata::from([(REVERTS_METADATA_KEY.to_string(), input.id.to_string())]),
            timestamp,
            reference: None,
            force: input.force,
        };
        let (transaction, tail) = self
            .record_transaction(tx, draft, &BTreeMap::new(), dry_run)
            .await?;
        let result = OperationResult::Transaction(Box::new(transaction.clone()));
        let Some(tail) = tail else {
            return Ok(Effect::preview(result));
        };

        if !tx.mark_reverted(input.id, tail.date).await? {
            return Err(LedgerError::AlreadyReverted(input.id));
        }
        Ok(Effect::logged(
            result,
            tail,
            LogPayload::RevertedTransaction {
                reverted_transaction_id: input.id,
                transaction,
            },
        ))
    }

    async fn apply_save_metadata(
        &self,
        tx: &mut S::Tx,
        input: &SaveMetadata,
        dry_run: bool,
    ) -> Result<Effect, LedgerError> {
        if input.metadata.is_empty() {
            return Err(LedgerError::validation("no metadata to save"));
        }
        if let MetadataTarget::Transaction(id) = &input.target {
            require_transaction(tx, *id).await?;
        }
        let result = OperationResult::Metadata(input.target.clone());
        if dry_run {
            return Ok(Effect::preview(result));
        }

        let tail = self.claim_tail(tx).await?;
        match &input.target {
            MetadataTarget::Transaction(id) => {
                tx.save_transaction_metadata(*id, &input.metadata).await?;
            }
            MetadataTarget::Account(address) => {
                tx.save_account_metadata(address, &input.metadata, tail.date)
                    .await?;
            }
        }
        Ok(Effect::logged(
            result,
            tail,
            LogPayload::SetMetadata {
                target: input.target.clone(),
                metadata: input.metadata.clone(),
            },
        ))
    }

    async fn apply_delete_metadata(
        &self,
        tx: &mut S::Tx,
        input: &DeleteMetadata,
        dry_run: bool,
    ) -> Result<Effect, LedgerError> {
        match &input.target {
            MetadataTarget::Transaction(id) => require_transaction(tx, *id).await?,
            MetadataTarget::Account(address) => {
                if tx.account(address).await?.is_none() {
                    return Err(LedgerError::not_found(format!("account {address}")));
                }
            }
        }
        let result = OperationResult::Metadata(input.target.clone());
        if dry_run {
            return Ok(Effect::preview(result));
        }

        let tail = self.claim_tail(tx).await?;
        match &input.target {
            MetadataTarget::Transaction(id) => {
                tx.delete_transaction_metadata(*id, &input.key).await?;
            }
            MetadataTarget::Account(address) => {
                tx.delete_account_metadata(address, &input.key, tail.date)
                    .await?;
            }
        }
        Ok(Effect::logged(
            result,
            tail,
            LogPayload::DeleteMetadata {
                target: input.target.clone(),
                key: input.key.clone(),
            },
        ))
    }

    /// Rejects timestamps older than the latest effective date on ledgers
    /// that deny backdating.
    async fn check_backdating(
        &self,
        tx: &mut S::Tx,
        timestamp: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if self.ledger.features.backdating() == Backdating::Allow {
            return Ok(());
        }
        match tx.last_effective_date().await? {
            Some(last) if timestamp < last => Err(LedgerError::validation(format!(
                "ledger {} denies backdating: {timestamp} is before {last}",
                self.ledger.name
            ))),
            _ => Ok(()),
        }
    }

    /// Computes volumes and, unless `dry_run`, claims the tail and writes the
    /// transaction. The tail is returned for the log entry.
    async fn record_transaction(
        &self,
        tx: &mut S::Tx,
        draft: Draft,
        account_metadata: &BTreeMap<String, Metadata>,
        dry_run: bool,
    ) -> Result<(Transaction, Option<Tail>), LedgerError> {
        let pairs = draft.postings.involved_volumes();
        let insertion = tx.volumes(&pairs).await?;
        let effective = tx.effective_volumes(&pairs, draft.timestamp).await?;
        let volumes =
            VolumeEngine::compute(&draft.postings, &insertion, &effective, draft.force)?;

        let mut transaction = Transaction {
            id: TransactionId::FIRST,
            postings: draft.postings,
            metadata: draft.metadata,
            timestamp: draft.timestamp,
            inserted_at: draft.timestamp,
            reference: draft.reference,
            reverted_at: None,
            post_commit_volumes: Some(volumes.post_commit),
            post_commit_effective_volumes: Some(volumes.post_commit_effective),
        };

        if dry_run {
            transaction.id = next_transaction_id(tx).await?;
            transaction.inserted_at = time::normalize(self.clock.now());
            return Ok((transaction, None));
        }

        // IDs are only stable under the tail lock.
        let tail = self.claim_tail(tx).await?;
        transaction.id = next_transaction_id(tx).await?;
        transaction.inserted_at = tail.date;
        write_transaction(tx, &transaction, account_metadata).await?;
        Ok((transaction, Some(tail)))
    }

    async fn claim_tail(&self, tx: &mut S::Tx) -> Result<Tail, LedgerError> {
        self.concurrency
            .lock_keys(tx, [log_tail_key(&self.ledger.name)])
            .await?;
        let previous = tx.last_log().await?;
        let date = time::next_insertion(self.clock.now(), previous.as_ref().map(|log| log.date));
        Ok(Tail { previous, date })
    }
}

/// Writes a transaction and everything derived from it.
pub(super) async fn write_transaction<T: StoreTx + ?Sized>(
    tx: &mut T,
    transaction: &Transaction,
    account_metadata: &BTreeMap<String, Metadata>,
) -> Result<(), LedgerError> {
    tx.insert_transaction(transaction).await?;
    tx.apply_volume_deltas(&AccountVolumes::from_postings(&transaction.postings))
        .await?;
    tx.insert_moves(&Move::from_postings(
        transaction.id,
        &transaction.postings,
        transaction.timestamp,
        transaction.inserted_at,
    ))
    .await?;
    tx.upsert_accounts(
        &transaction.postings.involved_accounts(),
        transaction.timestamp,
        transaction.inserted_at,
    )
    .await?;
    for (address, metadata) in account_metadata {
        tx.save_account_metadata(address, metadata, transaction.inserted_at)
            .await?;
    }
    Ok(())
}

/// Appends a metadata revision for every target `log` changed, on ledgers
/// keeping that history.
pub(super) async fn record_metadata_history<T: StoreTx + ?Sized>(
    tx: &mut T,
    features: &Features,
    log: &Log,
) -> Result<(), LedgerError> {
    for target in log.payload.metadata_targets() {
        if !features.keeps_history(&target) {
            continue;
        }
        let metadata = match &target {
            MetadataTarget::Transaction(id) => tx.transaction(*id).await?.map(|t| t.metadata),
            MetadataTarget::Account(address) => tx.account(address).await?.map(|a| a.metadata),
        }
        .ok_or_else(|| LedgerError::Internal(format!("{target} missing after log {}", log.id)))?;
        tx.insert_metadata_revision(&target, &metadata, log.date)
            .await?;
    }
    Ok(())
}

async fn next_transaction_id<T: StoreTx + ?Sized>(
    tx: &mut T,
) -> Result<TransactionId, LedgerError> {
    Ok(tx
        .last_transaction_id()
        .await?
        .map_or(TransactionId::FIRST, TransactionId::next))
}

async fn require_transaction<T: StoreTx + ?Sized>(
    tx: &mut T,
    id: TransactionId,
) -> Result<(), LedgerError> {
    match tx.transaction(id).await? {
        Some(_) => Ok(()),
        None => Err(LedgerError::not_found(format!("transaction {id}"))),
    }
}

fn target_key(ledger: &str, target: &MetadataTarget) -> Result<String, LedgerError> {
    match target {
        MetadataTarget::Transaction(id) => Ok(transaction_key(ledger, *id)),
        MetadataTarget::Account(address) if is_valid_address(address) => {
            Ok(account_key(ledger, address))
        }
        MetadataTarget::Account(address) => Err(LedgerError::validation(format!(
            "invalid account address {address:?}"
        ))),
    }
}
