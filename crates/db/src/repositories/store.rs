//! PostgreSQL implementation of the ledger store.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, QuerySelect,
    TransactionTrait,
};
use tally_core::idempotency::IdempotencyRecord;
use tally_core::log::{Log, LogBlock, MetadataTarget};
use tally_core::store::{Balances, BalancesQuery, Store, VolumesQuery};
use tally_core::transaction::{Account, MetadataRevision, Transaction};
use tally_core::volumes::{AccountVolumes, TimeAxis, Volumes};
use tally_core::LedgerError;
use tally_shared::types::{BlockId, LogCursor, Metadata, TransactionId};
use tracing::debug;

use super::rows::{
    account_from, account_revision_from, block_from, block_model, db_time, idempotency_from,
    log_from, to_db_id, transaction_from, transaction_revision_from, utc,
};
use super::store_tx::PgStoreTx;
use super::volumes::{self, MoveBound, Selection};
use crate::entities::{
    account_metadata_history, accounts, idempotency_keys, log_blocks, logs,
    transaction_metadata_history, transactions,
};
use crate::error::{db_err, is_unique_violation};

/// Ledger store backed by PostgreSQL.
///
/// Locks are transaction-scoped advisory locks, so they are released by
/// commit, rollback, or a dropped connection alike.
#[derive(Debug, Clone)]
pub struct PgStore {
    db: DatabaseConnection,
    statement_timeout: Option<Duration>,
}

impl PgStore {
    /// Creates a store over a connection pool.
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            statement_timeout: None,
        }
    }

    /// Bounds every statement of a storage transaction.
    #[must_use]
    pub const fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// The underlying pool.
    #[must_use]
    pub const fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Account metadata in force at `pit`; `None` when the account has no
    /// recorded revision.
    async fn account_metadata_at(
        &self,
        ledger: &str,
        address: &str,
        pit: DateTime<Utc>,
    ) -> Result<Option<Metadata>, LedgerError> {
        let of_account = || {
            account_metadata_history::Entity::find()
                .filter(account_metadata_history::Column::Ledger.eq(ledger))
                .filter(account_metadata_history::Column::Address.eq(address))
        };
        let latest = of_account()
            .filter(account_metadata_history::Column::Date.lte(db_time(pit)))
            .order_by_desc(account_metadata_history::Column::Revision)
            .one(&self.db)
            .await
            .map_err(db_err)?;
        if let Some(model) = latest {
            return account_revision_from(model).map(|revision| Some(revision.metadata));
        }
        let recorded = of_account().one(&self.db).await.map_err(db_err)?.is_some();
        Ok(recorded.then(Metadata::new))
    }
}

#[async_trait]
impl Store for PgStore {
    type Tx = PgStoreTx;

    async fn begin(&self, ledger: &str) -> Result<PgStoreTx, LedgerError> {
        let txn = self.db.begin().await.map_err(db_err)?;
        PgStoreTx::start(txn, ledger, self.statement_timeout).await
    }

    async fn get_transaction(
        &self,
        ledger: &str,
        id: TransactionId,
    ) -> Result<Option<Transaction>, LedgerError> {
        let Some(model) = transactions::Entity::find_by_id((ledger.to_string(), to_db_id(id.0)?))
            .one(&self.db)
            .await
            .map_err(db_err)?
        else {
            return Ok(None);
        };
        let mut transaction = transaction_from(model)?;

        let pairs = transaction.postings.involved_volumes();
        let mut effective = AccountVolumes::default();
        for (account, asset) in &pairs {
            effective.set(account, asset, Volumes::default());
        }
        effective.merge(
            &volumes::volumes_from_moves(
                &self.db,
                ledger,
                Selection::Pairs(&pairs),
                MoveBound::EffectiveThrough(transaction.timestamp, transaction.id),
            )
            .await?,
        );
        transaction.post_commit_effective_volumes = Some(effective);
        Ok(Some(transaction))
    }

    async fn get_account(
        &self,
        ledger: &str,
        address: &str,
        query: VolumesQuery,
    ) -> Result<Option<Account>, LedgerError> {
        let Some(model) = accounts::Entity::find_by_id((ledger.to_string(), address.to_string()))
            .one(&self.db)
            .await
            .map_err(db_err)?
        else {
            return Ok(None);
        };
        let volumes = match query.pit {
            None => {
                volumes::current_volumes(&self.db, ledger, Selection::Account(address)).await?
            }
            Some(pit) => {
                let existed = match query.axis {
                    TimeAxis::Effective => utc(model.first_usage) <= pit,
                    TimeAxis::Insertion => utc(model.inserted_at) <= pit,
                };
                if !existed {
                    return Ok(None);
                }
                volumes::volumes_from_moves(
                    &self.db,
                    ledger,
                    Selection::Account(address),
                    MoveBound::at(pit, query.axis),
                )
                .await?
            }
        };
        let by_asset = volumes.0.get(address).cloned().unwrap_or_default();
        let mut account = account_from(model, by_asset)?;
        if let Some(pit) = query.pit {
            if let Some(metadata) = self.account_metadata_at(ledger, address, pit).await? {
                account.metadata = metadata;
            }
        }
        Ok(Some(account))
    }

    async fn aggregated_balances(
        &self,
        ledger: &str,
        query: &BalancesQuery,
    ) -> Result<Balances, LedgerError> {
        let bound = query.at.pit.map(|pit| MoveBound::at(pit, query.at.axis));
        volumes::balances(&self.db, ledger, &query.addresses, bound).await
    }

    async fn metadata_history(
        &self,
        ledger: &str,
        target: &MetadataTarget,
    ) -> Result<Vec<MetadataRevision>, LedgerError> {
        match target {
            MetadataTarget::Account(address) => account_metadata_history::Entity::find()
                .filter(account_metadata_history::Column::Ledger.eq(ledger))
                .filter(account_metadata_history::Column::Address.eq(address.as_str()))
                .order_by_asc(account_metadata_history::Column::Revision)
                .all(&self.db)
                .await
                .map_err(db_err)?
                .into_iter()
                .map(account_revision_from)
                .collect(),
            MetadataTarget::Transaction(id) => transaction_metadata_history::Entity::find()
                .filter(transaction_metadata_history::Column::Ledger.eq(ledger))
                .filter(transaction_metadata_history::Column::TransactionId.eq(to_db_id(id.0)?))
                .order_by_asc(transaction_metadata_history::Column::Revision)
                .all(&self.db)
                .await
                .map_err(db_err)?
                .into_iter()
                .map(transaction_revision_from)
                .collect(),
        }
    }

    async fn list_logs(&self, ledger: &str, cursor: &LogCursor) -> Result<Vec<Log>, LedgerError> {
        let mut select = logs::Entity::find().filter(logs::Column::Ledger.eq(ledger));
        if let Some(after) = cursor.after {
            select = select.filter(logs::Column::Id.gt(to_db_id(after.0)?));
        }
        select
            .order_by_asc(logs::Column::Id)
            .limit(cursor.limit())
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(log_from)
            .collect()
    }

    async fn find_idempotency_record(
        &self,
        ledger: &str,
        scope: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, LedgerError> {
        idempotency_keys::Entity::find_by_id((
            ledger.to_string(),
            scope.to_string(),
            key.to_string(),
        ))
        .one(&self.db)
        .await
        .map_err(db_err)?
        .map(idempotency_from)
        .transpose()
    }

    async fn last_block(&self, ledger: &str) -> Result<Option<LogBlock>, LedgerError> {
        log_blocks::Entity::find()
            .filter(log_blocks::Column::Ledger.eq(ledger))
            .order_by_desc(log_blocks::Column::Id)
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(block_from)
            .transpose()
    }

    async fn list_blocks(
        &self,
        ledger: &str,
        after: Option<BlockId>,
        limit: u64,
    ) -> Result<Vec<LogBlock>, LedgerError> {
        let mut select = log_blocks::Entity::find().filter(log_blocks::Column::Ledger.eq(ledger));
        if let Some(after) = after {
            select = select.filter(log_blocks::Column::Id.gt(to_db_id(after.0)?));
        }
        select
            .order_by_asc(log_blocks::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(block_from)
            .collect()
    }

    async fn insert_block(&self, ledger: &str, block: &LogBlock) -> Result<(), LedgerError> {
        let model = block_model(ledger, block)?;
        log_blocks::Entity::insert(model)
            .exec_without_returning(&self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    LedgerError::Internal(format!("block {} already sealed", block.id))
                } else {
                    db_err(err)
                }
            })?;
        debug!(ledger, block = %block.id, "log block stored");
        Ok(())
    }
}
