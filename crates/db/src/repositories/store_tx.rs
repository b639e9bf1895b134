//! One PostgreSQL transaction of the commit pipeline.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseTransaction, DbBackend, EntityTrait, FromQueryResult,
    QueryFilter, QueryOrder, Statement, Value,
};
use tally_core::concurrency::{ledger_scope_key, LedgerLockMode};
use tally_core::idempotency::IdempotencyRecord;
use tally_core::log::{Log, MetadataTarget};
use tally_core::store::{StoreTx, VolumePairs};
use tally_core::transaction::{Account, Transaction};
use tally_core::volumes::{AccountVolumes, Move};
use tally_core::LedgerError;
use tally_shared::types::{LogId, Metadata, TransactionId};
use tracing::{debug, trace};

use super::rows::{
    account_from, db_time, from_db_id, idempotency_from, idempotency_model, log_from, log_model,
    metadata_json, to_db_id, transaction_from, transaction_model, utc,
};
use super::volumes::{self, MoveBound, Selection};
use crate::entities::{accounts, idempotency_keys, logs, transactions};
use crate::error::{constraint, db_err, is_unique_violation, sql_state, LOCK_NOT_AVAILABLE};

const REFERENCE_INDEX: &str = "idx_transactions_reference";

fn statement(sql: &str, values: Vec<Value>) -> Statement {
    Statement::from_sql_and_values(DbBackend::Postgres, sql, values)
}

#[derive(Debug, FromQueryResult)]
struct LastDate {
    last: Option<DateTimeWithTimeZone>,
}

#[derive(Debug, FromQueryResult)]
struct LastId {
    last: Option<i64>,
}

/// A storage transaction holding advisory locks and uncommitted writes.
///
/// Locks are `pg_advisory_xact_lock` on `hashtextextended(key, 0)`; each wait
/// runs in a savepoint under `SET LOCAL lock_timeout`, so a timeout leaves the
/// transaction usable for a retry.
#[derive(Debug)]
pub struct PgStoreTx {
    txn: DatabaseTransaction,
    ledger: String,
    ledger_lock: Option<LedgerLockMode>,
    held: HashSet<String>,
}

impl PgStoreTx {
    pub(crate) async fn start(
        txn: DatabaseTransaction,
        ledger: &str,
        statement_timeout: Option<Duration>,
    ) -> Result<Self, LedgerError> {
        if let Some(timeout) = statement_timeout {
            txn.execute_unprepared(&format!(
                "SET LOCAL statement_timeout = {}",
                timeout.as_millis().max(1)
            ))
            .await
            .map_err(db_err)?;
        }
        Ok(Self {
            txn,
            ledger: ledger.to_string(),
            ledger_lock: None,
            held: HashSet::new(),
        })
    }

    async fn advisory_lock(
        &self,
        function: &str,
        key: &str,
        timeout: Duration,
    ) -> Result<(), LedgerError> {
        self.txn
            .execute_unprepared("SAVEPOINT tally_lock")
            .await
            .map_err(db_err)?;
        self.txn
            .execute_unprepared(&format!(
                "SET LOCAL lock_timeout = {}",
                timeout.as_millis().max(1)
            ))
            .await
            .map_err(db_err)?;

        let acquired = self
            .txn
            .execute(statement(
                &format!("SELECT {function}(hashtextextended($1, 0))"),
                vec![key.into()],
            ))
            .await;
        match acquired {
            Ok(_) => {
                self.txn
                    .execute_unprepared("RELEASE SAVEPOINT tally_lock")
                    .await
                    .map_err(db_err)?;
                self.txn
                    .execute_unprepared("SET LOCAL lock_timeout TO DEFAULT")
                    .await
                    .map_err(db_err)?;
                trace!(key, function, "advisory lock acquired");
                Ok(())
            }
            Err(err) => {
                self.txn
                    .execute_unprepared("ROLLBACK TO SAVEPOINT tally_lock")
                    .await
                    .map_err(db_err)?;
                if sql_state(&err).as_deref() == Some(LOCK_NOT_AVAILABLE) {
                    Err(LedgerError::LockTimeout(key.to_string()))
                } else {
                    Err(db_err(err))
                }
            }
        }
    }

    async fn execute(&self, sql: &str, values: Vec<Value>) -> Result<u64, LedgerError> {
        self.txn
            .execute(statement(sql, values))
            .await
            .map(|result| result.rows_affected())
            .map_err(db_err)
    }
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn lock_ledger(
        &mut self,
        mode: LedgerLockMode,
        timeout: Duration,
    ) -> Result<(), LedgerError> {
        match (self.ledger_lock, mode) {
            (Some(LedgerLockMode::Exclusive), _)
            | (Some(LedgerLockMode::Shared), LedgerLockMode::Shared) => return Ok(()),
            (Some(LedgerLockMode::Shared), LedgerLockMode::Exclusive) => {
                return Err(LedgerError::Internal(
                    "cannot upgrade a shared ledger lock".into(),
                ));
            }
            (None, _) => {}
        }
        let function = match mode {
            LedgerLockMode::Shared => "pg_advisory_xact_lock_shared",
            LedgerLockMode::Exclusive => "pg_advisory_xact_lock",
        };
        self.advisory_lock(function, &ledger_scope_key(&self.ledger), timeout)
            .await?;
        self.ledger_lock = Some(mode);
        Ok(())
    }

    async fn lock_keys(&mut self, keys: &[String], timeout: Duration) -> Result<(), LedgerError> {
        for key in keys {
            if self.held.contains(key) {
                continue;
            }
            self.advisory_lock("pg_advisory_xact_lock", key, timeout)
                .await?;
            self.held.insert(key.clone());
        }
        Ok(())
    }

    async fn volumes(&mut self, pairs: &VolumePairs) -> Result<AccountVolumes, LedgerError> {
        volumes::current_volumes(&self.txn, &self.ledger, Selection::Pairs(pairs)).await
    }

    async fn effective_volumes(
        &mut self,
        pairs: &VolumePairs,
        at: DateTime<Utc>,
    ) -> Result<AccountVolumes, LedgerError> {
        volumes::volumes_from_moves(
            &self.txn,
            &self.ledger,
            Selection::Pairs(pairs),
            MoveBound::EffectiveAt(at),
        )
        .await
    }

    async fn last_effective_date(&mut self) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let row = LastDate::find_by_statement(statement(
            "SELECT MAX(effective_date) AS last FROM moves WHERE ledger = $1",
            vec![self.ledger.clone().into()],
        ))
        .one(&self.txn)
        .await
        .map_err(db_err)?;
        Ok(row.and_then(|row| row.last).map(utc))
    }

    async fn transaction(
        &mut self,
        id: TransactionId,
    ) -> Result<Option<Transaction>, LedgerError> {
        transactions::Entity::find_by_id((self.ledger.clone(), to_db_id(id.0)?))
            .one(&self.txn)
            .await
            .map_err(db_err)?
            .map(transaction_from)
            .transpose()
    }

    async fn transaction_by_reference(
        &mut self,
        reference: &str,
    ) -> Result<Option<TransactionId>, LedgerError> {
        transactions::Entity::find()
            .filter(transactions::Column::Ledger.eq(self.ledger.as_str()))
            .filter(transactions::Column::Reference.eq(reference))
            .one(&self.txn)
            .await
            .map_err(db_err)?
            .map(|model| from_db_id(model.id).map(TransactionId))
            .transpose()
    }

    async fn last_transaction_id(&mut self) -> Result<Option<TransactionId>, LedgerError> {
        let row = LastId::find_by_statement(statement(
            "SELECT MAX(id) AS last FROM transactions WHERE ledger = $1",
            vec![self.ledger.clone().into()],
        ))
        .one(&self.txn)
        .await
        .map_err(db_err)?;
        row.and_then(|row| row.last)
            .map(|id| from_db_id(id).map(TransactionId))
            .transpose()
    }

    async fn account(&mut self, address: &str) -> Result<Option<Account>, LedgerError> {
        accounts::Entity::find_by_id((self.ledger.clone(), address.to_string()))
            .one(&self.txn)
            .await
            .map_err(db_err)?
            .map(|model| account_from(model, Default::default()))
            .transpose()
    }

    async fn last_log(&mut self) -> Result<Option<Log>, LedgerError> {
        logs::Entity::find()
            .filter(logs::Column::Ledger.eq(self.ledger.as_str()))
            .order_by_desc(logs::Column::Id)
            .one(&self.txn)
            .await
            .map_err(db_err)?
            .map(log_from)
            .transpose()
    }

    async fn idempotency_record(
        &mut self,
        scope: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, LedgerError> {
        idempotency_keys::Entity::find_by_id((
            self.ledger.clone(),
            scope.to_string(),
            key.to_string(),
        ))
        .one(&self.txn)
        .await
        .map_err(db_err)?
        .map(idempotency_from)
        .transpose()
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), LedgerError> {
        let model = transaction_model(&self.ledger, transaction)?;
        transactions::Entity::insert(model)
            .exec_without_returning(&self.txn)
            .await
            .map_err(|err| match (&transaction.reference, constraint(&err)) {
                (Some(reference), Some(name)) if name == REFERENCE_INDEX => {
                    LedgerError::Conflict {
                        reference: reference.clone(),
                    }
                }
                _ => db_err(err),
            })?;
        Ok(())
    }

    async fn mark_reverted(
        &mut self,
        id: TransactionId,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let updated = self
            .execute(
                "UPDATE transactions SET reverted_at = $3 \
                 WHERE ledger = $1 AND id = $2 AND reverted_at IS NULL",
                vec![
                    self.ledger.clone().into(),
                    to_db_id(id.0)?.into(),
                    db_time(at).into(),
                ],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn save_transaction_metadata(
        &mut self,
        id: TransactionId,
        metadata: &Metadata,
    ) -> Result<bool, LedgerError> {
        let updated = self
            .execute(
                "UPDATE transactions SET metadata = metadata || $3 \
                 WHERE ledger = $1 AND id = $2",
                vec![
                    self.ledger.clone().into(),
                    to_db_id(id.0)?.into(),
                    metadata_json(metadata)?.into(),
                ],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn delete_transaction_metadata(
        &mut self,
        id: TransactionId,
        key: &str,
    ) -> Result<bool, LedgerError> {
        let updated = self
            .execute(
                "UPDATE transactions SET metadata = metadata - $3::text \
                 WHERE ledger = $1 AND id = $2 AND jsonb_exists(metadata, $3::text)",
                vec![
                    self.ledger.clone().into(),
                    to_db_id(id.0)?.into(),
                    key.into(),
                ],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn upsert_accounts(
        &mut self,
        addresses: &BTreeSet<String>,
        first_usage: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        for address in addresses {
            self.execute(
                "INSERT INTO accounts (ledger, address, metadata, first_usage, inserted_at, updated_at) \
                 VALUES ($1, $2, '{}'::jsonb, $3, $4, $4) \
                 ON CONFLICT (ledger, address) DO UPDATE SET \
                 first_usage = LEAST(accounts.first_usage, EXCLUDED.first_usage), \
                 updated_at = GREATEST(accounts.updated_at, EXCLUDED.updated_at)",
                vec![
                    self.ledger.clone().into(),
                    address.clone().into(),
                    db_time(first_usage).into(),
                    db_time(at).into(),
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn save_account_metadata(
        &mut self,
        address: &str,
        metadata: &Metadata,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.execute(
            "INSERT INTO accounts (ledger, address, metadata, first_usage, inserted_at, updated_at) \
             VALUES ($1, $2, $3, $4, $4, $4) \
             ON CONFLICT (ledger, address) DO UPDATE SET \
             metadata = accounts.metadata || EXCLUDED.metadata, \
             updated_at = GREATEST(accounts.updated_at, EXCLUDED.updated_at)",
            vec![
                self.ledger.clone().into(),
                address.into(),
                metadata_json(metadata)?.into(),
                db_time(at).into(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn delete_account_metadata(
        &mut self,
        address: &str,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let updated = self
            .execute(
                "UPDATE accounts SET metadata = metadata - $3::text, \
                 updated_at = GREATEST(updated_at, $4) \
                 WHERE ledger = $1 AND address = $2 AND jsonb_exists(metadata, $3::text)",
                vec![
                    self.ledger.clone().into(),
                    address.into(),
                    key.into(),
                    db_time(at).into(),
                ],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn insert_metadata_revision(
        &mut self,
        target: &MetadataTarget,
        metadata: &Metadata,
        date: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let (table, column, id): (&str, &str, Value) = match target {
            MetadataTarget::Account(address) => {
                ("account_metadata_history", "address", address.clone().into())
            }
            MetadataTarget::Transaction(id) => (
                "transaction_metadata_history",
                "transaction_id",
                to_db_id(id.0)?.into(),
            ),
        };
        self.execute(
            &format!(
                "INSERT INTO {table} (ledger, {column}, revision, metadata, date) \
                 SELECT $1, $2, COALESCE(MAX(revision), 0) + 1, $3, $4 \
                 FROM {table} WHERE ledger = $1 AND {column} = $2"
            ),
            vec![
                self.ledger.clone().into(),
                id,
                metadata_json(metadata)?.into(),
                db_time(date).into(),
            ],
        )
        .await?;
        Ok(())
    }

    async fn apply_volume_deltas(&mut self, deltas: &AccountVolumes) -> Result<(), LedgerError> {
        volumes::apply_deltas(&self.txn, &self.ledger, deltas).await
    }

    async fn insert_moves(&mut self, moves: &[Move]) -> Result<(), LedgerError> {
        volumes::insert_moves(&self.txn, &self.ledger, moves).await
    }

    async fn insert_log(&mut self, log: &Log) -> Result<(), LedgerError> {
        let expected = self
            .last_log()
            .await?
            .map_or(LogId::FIRST, |last| last.id.next());
        if log.id != expected {
            return Err(LedgerError::Internal(format!(
                "log {} does not follow the tail, expected {expected}",
                log.id
            )));
        }
        logs::Entity::insert(log_model(&self.ledger, log)?)
            .exec_without_returning(&self.txn)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn insert_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<(), LedgerError> {
        idempotency_keys::Entity::insert(idempotency_model(&self.ledger, record)?)
            .exec_without_returning(&self.txn)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    LedgerError::IdempotencyKeyConflict {
                        key: record.key.clone(),
                    }
                } else {
                    db_err(err)
                }
            })?;
        Ok(())
    }

    async fn commit(self) -> Result<(), LedgerError> {
        self.txn.commit().await.map_err(db_err)?;
        debug!(ledger = %self.ledger, locks = self.held.len(), "storage transaction committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        self.txn.rollback().await.map_err(db_err)
    }
}
