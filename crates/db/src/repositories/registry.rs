//! Ledger registry backed by the `ledgers` table.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Statement, TransactionTrait,
};
use tally_core::ledger::{CreateLedger, Ledger, LedgerRegistry, PurgeReport};
use tally_core::time::{SharedClock, SystemClock};
use tally_core::LedgerError;
use tracing::{debug, info};

use super::rows::{db_time, ledger_from, ledger_model};
use crate::entities::ledgers;
use crate::error::{db_err, is_unique_violation};

/// Default number of cached ledger definitions.
const DEFAULT_CACHE_CAPACITY: u64 = 1_000;

/// Tables holding per-ledger data, children first.
const LEDGER_TABLES: [&str; 9] = [
    "account_metadata_history",
    "transaction_metadata_history",
    "moves",
    "idempotency_keys",
    "log_blocks",
    "logs",
    "transactions",
    "volumes",
    "accounts",
];

/// Ledger definitions in PostgreSQL, with a read-through cache.
///
/// Cached entries expire after the configured TTL; writes through this
/// registry invalidate them immediately.
#[derive(Clone)]
pub struct PgLedgerRegistry {
    db: DatabaseConnection,
    cache: Cache<String, Arc<Ledger>>,
    clock: SharedClock,
}

impl std::fmt::Debug for PgLedgerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLedgerRegistry")
            .field("cached", &self.cache.entry_count())
            .finish_non_exhaustive()
    }
}

impl PgLedgerRegistry {
    /// Creates a registry whose cache entries live for `ttl`.
    #[must_use]
    pub fn new(db: DatabaseConnection, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(DEFAULT_CACHE_CAPACITY)
            .time_to_live(ttl)
            .build();
        Self {
            db,
            cache,
            clock: Arc::new(SystemClock),
        }
    }

    /// Uses `clock` for creation and deletion times.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    async fn load(&self, name: &str) -> Result<Option<Ledger>, LedgerError> {
        ledgers::Entity::find_by_id(name.to_string())
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(ledger_from)
            .transpose()
    }
}

#[async_trait]
impl LedgerRegistry for PgLedgerRegistry {
    async fn create_ledger(&self, input: CreateLedger) -> Result<Ledger, LedgerError> {
        let ledger = input.into_ledger(self.clock.now())?;
        ledgers::Entity::insert(ledger_model(&ledger)?)
            .exec_without_returning(&self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    LedgerError::LedgerExists(ledger.name.clone())
                } else {
                    db_err(err)
                }
            })?;
        self.cache.invalidate(&ledger.name).await;
        Ok(ledger)
    }

    async fn get_ledger(&self, name: &str) -> Result<Option<Ledger>, LedgerError> {
        if let Some(ledger) = self.cache.get(name).await {
            return Ok(Some((*ledger).clone()));
        }
        let Some(ledger) = self.load(name).await? else {
            return Ok(None);
        };
        self.cache
            .insert(name.to_string(), Arc::new(ledger.clone()))
            .await;
        Ok(Some(ledger))
    }

    async fn list_ledgers(&self, include_deleted: bool) -> Result<Vec<Ledger>, LedgerError> {
        let mut query = ledgers::Entity::find().order_by_asc(ledgers::Column::Name);
        if !include_deleted {
            query = query.filter(ledgers::Column::DeletedAt.is_null());
        }
        query
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(ledger_from)
            .collect()
    }

    async fn delete_ledger(&self, name: &str) -> Result<(), LedgerError> {
        let deleted_at = tally_core::time::normalize(self.clock.now());
        let result = ledgers::Entity::update_many()
            .col_expr(
                ledgers::Column::DeletedAt,
                sea_orm::sea_query::Expr::value(db_time(deleted_at)),
            )
            .filter(ledgers::Column::Name.eq(name))
            .filter(ledgers::Column::DeletedAt.is_null())
            .exec(&self.db)
            .await
            .map_err(db_err)?;
        self.cache.invalidate(name).await;
        if result.rows_affected == 0 {
            return Err(LedgerError::not_found(format!("ledger {name}")));
        }
        Ok(())
    }

    async fn purge_deleted(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, LedgerError> {
        let expired: Vec<(String, String)> = ledgers::Entity::find()
            .select_only()
            .column(ledgers::Column::Name)
            .column(ledgers::Column::Bucket)
            .filter(ledgers::Column::DeletedAt.lt(db_time(cutoff)))
            .order_by_asc(ledgers::Column::Name)
            .into_tuple()
            .all(&self.db)
            .await
            .map_err(db_err)?;
        if expired.is_empty() {
            return Ok(PurgeReport::default());
        }

        let txn = self.db.begin().await.map_err(db_err)?;
        let mut report = PurgeReport::default();
        for (name, _) in &expired {
            for table in LEDGER_TABLES {
                let removed = txn
                    .execute(Statement::from_sql_and_values(
                        DbBackend::Postgres,
                        format!("DELETE FROM {table} WHERE ledger = $1"),
                        [name.clone().into()],
                    ))
                    .await
                    .map_err(db_err)?;
                debug!(ledger = %name, table, rows = removed.rows_affected(), "purged ledger rows");
            }
            ledgers::Entity::delete_by_id(name.clone())
                .exec(&txn)
                .await
                .map_err(db_err)?;
            report.ledgers.push(name.clone());
        }

        let candidates: BTreeSet<String> =
            expired.into_iter().map(|(_, bucket)| bucket).collect();
        let live: Vec<String> = ledgers::Entity::find()
            .select_only()
            .column(ledgers::Column::Bucket)
            .filter(ledgers::Column::Bucket.is_in(candidates.iter().cloned()))
            .distinct()
            .into_tuple()
            .all(&txn)
            .await
            .map_err(db_err)?;
        report.buckets = candidates
            .into_iter()
            .filter(|bucket| !live.contains(bucket))
            .collect();
        txn.commit().await.map_err(db_err)?;

        for name in &report.ledgers {
            self.cache.invalidate(name).await;
        }
        info!(ledgers = ?report.ledgers, buckets = ?report.buckets, "purged deleted ledgers");
        Ok(report)
    }
}
