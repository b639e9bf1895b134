//! In-process store.
//!
//! Backs tests and embedded use. Committed state sits behind one mutex per
//! store; a [`MemoryTx`] buffers its writes in an overlay that reads consult
//! first and that is merged under the mutex on commit. Locks are tokio
//! primitives held as owned guards until the transaction ends.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tally_shared::types::{BlockId, LogCursor, LogId, Metadata, TransactionId};
use tokio::sync::{
    Mutex as AsyncMutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};
use tracing::{debug, info};

use super::{Balances, BalancesQuery, Store, StoreTx, VolumePairs, VolumesQuery};
use crate::concurrency::LedgerLockMode;
use crate::error::LedgerError;
use crate::idempotency::IdempotencyRecord;
use crate::ledger::{CreateLedger, Ledger, LedgerRegistry, PurgeReport};
use crate::log::{Log, LogBlock, MetadataTarget};
use crate::time::{SharedClock, SystemClock};
use crate::transaction::{metadata_at, Account, MetadataRevision, Transaction};
use crate::volumes::{volumes_at, AccountVolumes, Move, TimeAxis, Volumes};

#[derive(Debug, Clone)]
struct AccountRow {
    metadata: Metadata,
    first_usage: DateTime<Utc>,
    inserted_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AccountRow {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            metadata: Metadata::new(),
            first_usage: at,
            inserted_at: at,
            updated_at: at,
        }
    }

    fn into_account(self, address: &str, volumes: AccountVolumes) -> Account {
        Account {
            address: address.to_string(),
            metadata: self.metadata,
            first_usage: self.first_usage,
            inserted_at: self.inserted_at,
            updated_at: self.updated_at,
            volumes: volumes.0.get(address).cloned().unwrap_or_default(),
        }
    }
}

type RecordKey = (String, String);

#[derive(Debug, Default)]
struct LedgerData {
    accounts: BTreeMap<String, AccountRow>,
    volumes: AccountVolumes,
    moves: Vec<Move>,
    transactions: BTreeMap<TransactionId, Transaction>,
    references: HashMap<String, TransactionId>,
    logs: Vec<Log>,
    blocks: Vec<LogBlock>,
    idempotency: HashMap<RecordKey, IdempotencyRecord>,
    revisions: HashMap<MetadataTarget, Vec<MetadataRevision>>,
}

#[derive(Debug, Default)]
struct LockTable {
    ledgers: DashMap<String, Arc<RwLock<()>>>,
    keys: DashMap<String, Arc<AsyncMutex<()>>>,
}

#[derive(Debug)]
struct Shared {
    registry: Mutex<BTreeMap<String, Ledger>>,
    data: Mutex<HashMap<String, LedgerData>>,
    locks: LockTable,
    clock: SharedClock,
}

fn poisoned<T>(_: T) -> LedgerError {
    LedgerError::Internal("memory store mutex poisoned".into())
}

impl Shared {
    fn data(&self) -> Result<MutexGuard<'_, HashMap<String, LedgerData>>, LedgerError> {
        self.data.lock().map_err(poisoned)
    }

    fn registry(&self) -> Result<MutexGuard<'_, BTreeMap<String, Ledger>>, LedgerError> {
        self.registry.lock().map_err(poisoned)
    }

    fn read<R>(&self, ledger: &str, f: impl FnOnce(&LedgerData) -> R) -> Result<R, LedgerError> {
        let data = self.data()?;
        let empty = LedgerData::default();
        Ok(f(data.get(ledger).unwrap_or(&empty)))
    }
}

/// Store keeping everything in process memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store on `clock`.
    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(BTreeMap::new()),
                data: Mutex::new(HashMap::new()),
                locks: LockTable::default(),
                clock,
            }),
        }
    }
}

fn effective_snapshot(moves: &[Move], transaction: &Transaction) -> AccountVolumes {
    let position = (transaction.timestamp, transaction.id);
    let pairs = transaction.postings.involved_volumes();
    let mut volumes = AccountVolumes::default();
    for (account, asset) in &pairs {
        volumes.set(account, asset, Volumes::default());
    }
    moves
        .iter()
        .filter(|mv| mv.effective_key() <= position)
        .filter(|mv| pairs.contains(&(mv.account.clone(), mv.asset.clone())))
        .for_each(|mv| mv.apply_to(&mut volumes));
    volumes
}

#[async_trait]
impl Store for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self, ledger: &str) -> Result<MemoryTx, LedgerError> {
        Ok(MemoryTx {
            shared: Arc::clone(&self.shared),
            ledger: ledger.to_string(),
            ledger_lock: None,
            held: HashSet::new(),
            guards: Vec::new(),
            overlay: Overlay::default(),
        })
    }

    async fn get_transaction(
        &self,
        ledger: &str,
        id: TransactionId,
    ) -> Result<Option<Transaction>, LedgerError> {
        self.shared.read(ledger, |data| {
            data.transactions.get(&id).map(|transaction| {
                let mut transaction = transaction.clone();
                transaction.post_commit_effective_volumes =
                    Some(effective_snapshot(&data.moves, &transaction));
                transaction
            })
        })
    }

    async fn get_account(
        &self,
        ledger: &str,
        address: &str,
        query: VolumesQuery,
    ) -> Result<Option<Account>, LedgerError> {
        self.shared.read(ledger, |data| {
            let mut row = data.accounts.get(address)?.clone();
            if query.pit.is_some_and(|pit| match query.axis {
                TimeAxis::Effective => row.first_usage > pit,
                TimeAxis::Insertion => row.inserted_at > pit,
            }) {
                return None;
            }
            let volumes = match query.pit {
                None => data.volumes.clone(),
                Some(_) => volumes_at(
                    data.moves.iter().filter(|mv| mv.account == address),
                    query.pit,
                    query.axis,
                ),
            };
            let revisions = data
                .revisions
                .get(&MetadataTarget::Account(address.to_string()))
                .filter(|revisions| !revisions.is_empty());
            if let (Some(pit), Some(revisions)) = (query.pit, revisions) {
                row.metadata = metadata_at(revisions, pit);
            }
            Some(row.into_account(address, volumes))
        })
    }

    async fn aggregated_balances(
        &self,
        ledger: &str,
        query: &BalancesQuery,
    ) -> Result<Balances, LedgerError> {
        self.shared.read(ledger, |data| {
            let volumes = match query.at.pit {
                None => data.volumes.clone(),
                Some(_) => volumes_at(
                    data.moves
                        .iter()
                        .filter(|mv| query.addresses.matches(&mv.account)),
                    query.at.pit,
                    query.at.axis,
                ),
            };
            let selected = AccountVolumes(
                volumes
                    .0
                    .into_iter()
                    .filter(|(address, _)| query.addresses.matches(address))
                    .collect(),
            );
            selected.aggregated_balances()
        })
    }

    async fn metadata_history(
        &self,
        ledger: &str,
        target: &MetadataTarget,
    ) -> Result<Vec<MetadataRevision>, LedgerError> {
        self.shared.read(ledger, |data| {
            data.revisions.get(target).cloned().unwrap_or_default()
        })
    }

    async fn list_logs(&self, ledger: &str, cursor: &LogCursor) -> Result<Vec<Log>, LedgerError> {
        let limit = usize::try_from(cursor.limit()).unwrap_or(usize::MAX);
        self.shared.read(ledger, |data| {
            data.logs
                .iter()
                .filter(|log| cursor.after.is_none_or(|after| log.id > after))
                .take(limit)
                .cloned()
                .collect()
        })
    }

    async fn find_idempotency_record(
        &self,
        ledger: &str,
        scope: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, LedgerError> {
        self.shared.read(ledger, |data| {
            data.idempotency
                .get(&(scope.to_string(), key.to_string()))
                .cloned()
        })
    }

    async fn last_block(&self, ledger: &str) -> Result<Option<LogBlock>, LedgerError> {
        self.shared.read(ledger, |data| data.blocks.last().cloned())
    }

    async fn list_blocks(
        &self,
        ledger: &str,
        after: Option<BlockId>,
        limit: u64,
    ) -> Result<Vec<LogBlock>, LedgerError> {
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        self.shared.read(ledger, |data| {
            data.blocks
                .iter()
                .filter(|block| after.is_none_or(|after| block.id > after))
                .take(limit)
                .cloned()
                .collect()
        })
    }

    async fn insert_block(&self, ledger: &str, block: &LogBlock) -> Result<(), LedgerError> {
        let mut data = self.shared.data()?;
        let data = data.entry(ledger.to_string()).or_default();
        let expected = data.blocks.last().map_or(BlockId::FIRST, |last| last.id.next());
        if block.id != expected {
            return Err(LedgerError::Internal(format!(
                "block {} already sealed or out of order",
                block.id
            )));
        }
        data.blocks.push(block.clone());
        Ok(())
    }
}

#[async_trait]
impl LedgerRegistry for MemoryStore {
    async fn create_ledger(&self, input: CreateLedger) -> Result<Ledger, LedgerError> {
        let ledger = input.into_ledger(self.shared.clock.now())?;
        let mut registry = self.shared.registry()?;
        if registry.contains_key(&ledger.name) {
            return Err(LedgerError::LedgerExists(ledger.name));
        }
        registry.insert(ledger.name.clone(), ledger.clone());
        info!(ledger = %ledger.name, bucket = %ledger.bucket, "ledger created");
        Ok(ledger)
    }

    async fn get_ledger(&self, name: &str) -> Result<Option<Ledger>, LedgerError> {
        Ok(self.shared.registry()?.get(name).cloned())
    }

    async fn list_ledgers(&self, include_deleted: bool) -> Result<Vec<Ledger>, LedgerError> {
        Ok(self
            .shared
            .registry()?
            .values()
            .filter(|ledger| include_deleted || !ledger.is_deleted())
            .cloned()
            .collect())
    }

    async fn delete_ledger(&self, name: &str) -> Result<(), LedgerError> {
        let now = self.shared.clock.now();
        let mut registry = self.shared.registry()?;
        match registry.get_mut(name) {
            Some(ledger) if !ledger.is_deleted() => {
                ledger.deleted_at = Some(crate::time::normalize(now));
                info!(ledger = %name, "ledger soft-deleted");
                Ok(())
            }
            _ => Err(LedgerError::not_found(format!("ledger {name}"))),
        }
    }

    async fn purge_deleted(&self, cutoff: DateTime<Utc>) -> Result<PurgeReport, LedgerError> {
        let mut registry = self.shared.registry()?;
        let expired: Vec<Ledger> = registry
            .values()
            .filter(|ledger| ledger.deleted_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect();

        let mut report = PurgeReport::default();
        let mut data = self.shared.data()?;
        for ledger in &expired {
            registry.remove(&ledger.name);
            data.remove(&ledger.name);
            self.shared.locks.ledgers.remove(&ledger.name);
            report.ledgers.push(ledger.name.clone());
        }
        let live: BTreeSet<&str> = registry.values().map(|l| l.bucket.as_str()).collect();
        report.buckets = expired
            .iter()
            .map(|ledger| ledger.bucket.clone())
            .filter(|bucket| !live.contains(bucket.as_str()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !report.ledgers.is_empty() {
            info!(ledgers = ?report.ledgers, buckets = ?report.buckets, "purged deleted ledgers");
        }
        Ok(report)
    }
}

// Guards are only held, never read.
#[allow(dead_code)]
#[derive(Debug)]
enum Held {
    Shared(OwnedRwLockReadGuard<()>),
    Exclusive(OwnedRwLockWriteGuard<()>),
    Key(OwnedMutexGuard<()>),
}

#[derive(Debug, Default)]
struct Overlay {
    accounts: BTreeMap<String, AccountRow>,
    volume_deltas: AccountVolumes,
    moves: Vec<Move>,
    transactions: BTreeMap<TransactionId, Transaction>,
    references: HashMap<String, TransactionId>,
    logs: Vec<Log>,
    idempotency: HashMap<RecordKey, IdempotencyRecord>,
    revisions: Vec<MetadataRevision>,
}

/// Storage transaction of a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryTx {
    shared: Arc<Shared>,
    ledger: String,
    ledger_lock: Option<LedgerLockMode>,
    held: HashSet<String>,
    guards: Vec<Held>,
    overlay: Overlay,
}

impl MemoryTx {
    fn read<R>(&self, f: impl FnOnce(&LedgerData) -> R) -> Result<R, LedgerError> {
        self.shared.read(&self.ledger, f)
    }

    fn transaction_mut(
        &mut self,
        id: TransactionId,
    ) -> Result<Option<&mut Transaction>, LedgerError> {
        if !self.overlay.transactions.contains_key(&id) {
            let Some(committed) = self.read(|data| data.transactions.get(&id).cloned())? else {
                return Ok(None);
            };
            self.overlay.transactions.insert(id, committed);
        }
        Ok(self.overlay.transactions.get_mut(&id))
    }

    fn account_mut(&mut self, address: &str) -> Result<Option<&mut AccountRow>, LedgerError> {
        if !self.overlay.accounts.contains_key(address) {
            let Some(committed) = self.read(|data| data.accounts.get(address).cloned())? else {
                return Ok(None);
            };
            self.overlay.accounts.insert(address.to_string(), committed);
        }
        Ok(self.overlay.accounts.get_mut(address))
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
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
        let lock = Arc::clone(
            self.shared
                .locks
                .ledgers
                .entry(self.ledger.clone())
                .or_default()
                .value(),
        );
        let guard = match mode {
            LedgerLockMode::Shared => tokio::time::timeout(timeout, lock.read_owned())
                .await
                .map(Held::Shared),
            LedgerLockMode::Exclusive => tokio::time::timeout(timeout, lock.write_owned())
                .await
                .map(Held::Exclusive),
        }
        .map_err(|_| LedgerError::LockTimeout(format!("ledger {}", self.ledger)))?;
        self.guards.push(guard);
        self.ledger_lock = Some(mode);
        Ok(())
    }

    async fn lock_keys(&mut self, keys: &[String], timeout: Duration) -> Result<(), LedgerError> {
        for key in keys {
            if self.held.contains(key) {
                continue;
            }
            let lock = Arc::clone(self.shared.locks.keys.entry(key.clone()).or_default().value());
            let guard = tokio::time::timeout(timeout, lock.lock_owned())
                .await
                .map_err(|_| LedgerError::LockTimeout(key.clone()))?;
            debug!(key = %key, "lock acquired");
            self.guards.push(Held::Key(guard));
            self.held.insert(key.clone());
        }
        Ok(())
    }

    async fn volumes(&mut self, pairs: &VolumePairs) -> Result<AccountVolumes, LedgerError> {
        let mut volumes = self.read(|data| {
            let mut volumes = AccountVolumes::default();
            for (account, asset) in pairs {
                volumes.set(account, asset, data.volumes.get(account, asset));
            }
            volumes
        })?;
        for (account, asset) in pairs {
            volumes
                .entry(account, asset)
                .merge(&self.overlay.volume_deltas.get(account, asset));
        }
        Ok(volumes)
    }

    async fn effective_volumes(
        &mut self,
        pairs: &VolumePairs,
        at: DateTime<Utc>,
    ) -> Result<AccountVolumes, LedgerError> {
        let visible = |mv: &&Move| {
            mv.effective_date <= at && pairs.contains(&(mv.account.clone(), mv.asset.clone()))
        };
        let mut volumes = self.read(|data| {
            let mut volumes = AccountVolumes::default();
            data.moves
                .iter()
                .filter(visible)
                .for_each(|mv| mv.apply_to(&mut volumes));
            volumes
        })?;
        self.overlay
            .moves
            .iter()
            .filter(visible)
            .for_each(|mv| mv.apply_to(&mut volumes));
        Ok(volumes)
    }

    async fn last_effective_date(&mut self) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let committed = self.read(|data| data.moves.iter().map(|mv| mv.effective_date).max())?;
        let pending = self.overlay.moves.iter().map(|mv| mv.effective_date).max();
        Ok(committed.max(pending))
    }

    async fn transaction(
        &mut self,
        id: TransactionId,
    ) -> Result<Option<Transaction>, LedgerError> {
        if let Some(transaction) = self.overlay.transactions.get(&id) {
            return Ok(Some(transaction.clone()));
        }
        self.read(|data| data.transactions.get(&id).cloned())
    }

    async fn transaction_by_reference(
        &mut self,
        reference: &str,
    ) -> Result<Option<TransactionId>, LedgerError> {
        if let Some(id) = self.overlay.references.get(reference) {
            return Ok(Some(*id));
        }
        self.read(|data| data.references.get(reference).copied())
    }

    async fn last_transaction_id(&mut self) -> Result<Option<TransactionId>, LedgerError> {
        let committed = self.read(|data| data.transactions.keys().next_back().copied())?;
        let pending = self.overlay.transactions.keys().next_back().copied();
        Ok(committed.max(pending))
    }

    async fn account(&mut self, address: &str) -> Result<Option<Account>, LedgerError> {
        let row = match self.overlay.accounts.get(address) {
            Some(row) => Some(row.clone()),
            None => self.read(|data| data.accounts.get(address).cloned())?,
        };
        Ok(row.map(|row| row.into_account(address, AccountVolumes::default())))
    }

    async fn last_log(&mut self) -> Result<Option<Log>, LedgerError> {
        if let Some(log) = self.overlay.logs.last() {
            return Ok(Some(log.clone()));
        }
        self.read(|data| data.logs.last().cloned())
    }

    async fn idempotency_record(
        &mut self,
        scope: &str,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, LedgerError> {
        let record_key = (scope.to_string(), key.to_string());
        if let Some(record) = self.overlay.idempotency.get(&record_key) {
            return Ok(Some(record.clone()));
        }
        self.read(|data| data.idempotency.get(&record_key).cloned())
    }

    async fn insert_transaction(&mut self, transaction: &Transaction) -> Result<(), LedgerError> {
        if let Some(reference) = &transaction.reference {
            if self.transaction_by_reference(reference).await?.is_some() {
                return Err(LedgerError::Conflict {
                    reference: reference.clone(),
                });
            }
            self.overlay
                .references
                .insert(reference.clone(), transaction.id);
        }
        self.overlay
            .transactions
            .insert(transaction.id, transaction.clone());
        Ok(())
    }

    async fn mark_reverted(
        &mut self,
        id: TransactionId,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        match self.transaction_mut(id)? {
            Some(transaction) if transaction.reverted_at.is_none() => {
                transaction.reverted_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn save_transaction_metadata(
        &mut self,
        id: TransactionId,
        metadata: &Metadata,
    ) -> Result<bool, LedgerError> {
        Ok(self.transaction_mut(id)?.is_some_and(|transaction| {
            transaction.metadata.extend(metadata.clone());
            true
        }))
    }

    async fn delete_transaction_metadata(
        &mut self,
        id: TransactionId,
        key: &str,
    ) -> Result<bool, LedgerError> {
        Ok(self
            .transaction_mut(id)?
            .is_some_and(|transaction| transaction.metadata.remove(key).is_some()))
    }

    async fn upsert_accounts(
        &mut self,
        addresses: &BTreeSet<String>,
        first_usage: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        for address in addresses {
            match self.account_mut(address)? {
                Some(row) => {
                    row.first_usage = row.first_usage.min(first_usage);
                    row.updated_at = row.updated_at.max(at);
                }
                None => {
                    let mut row = AccountRow::new(at);
                    row.first_usage = first_usage;
                    self.overlay.accounts.insert(address.clone(), row);
                }
            }
        }
        Ok(())
    }

    async fn save_account_metadata(
        &mut self,
        address: &str,
        metadata: &Metadata,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if self.account_mut(address)?.is_none() {
            self.overlay
                .accounts
                .insert(address.to_string(), AccountRow::new(at));
        }
        if let Some(row) = self.overlay.accounts.get_mut(address) {
            row.metadata.extend(metadata.clone());
            row.updated_at = row.updated_at.max(at);
        }
        Ok(())
    }

    async fn delete_account_metadata(
        &mut self,
        address: &str,
        key: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        Ok(self.account_mut(address)?.is_some_and(|row| {
            let removed = row.metadata.remove(key).is_some();
            if removed {
                row.updated_at = row.updated_at.max(at);
            }
            removed
        }))
    }

    async fn insert_metadata_revision(
        &mut self,
        target: &MetadataTarget,
        metadata: &Metadata,
        date: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let committed = self.read(|data| data.revisions.get(target).map_or(0, Vec::len))?;
        let pending = self
            .overlay
            .revisions
            .iter()
            .filter(|revision| &revision.target == target)
            .count();
        self.overlay.revisions.push(MetadataRevision {
            target: target.clone(),
            revision: u64::try_from(committed + pending + 1).unwrap_or(u64::MAX),
            metadata: metadata.clone(),
            date,
        });
        Ok(())
    }

    async fn apply_volume_deltas(&mut self, deltas: &AccountVolumes) -> Result<(), LedgerError> {
        self.overlay.volume_deltas.merge(deltas);
        Ok(())
    }

    async fn insert_moves(&mut self, moves: &[Move]) -> Result<(), LedgerError> {
        self.overlay.moves.extend_from_slice(moves);
        Ok(())
    }

    async fn insert_log(&mut self, log: &Log) -> Result<(), LedgerError> {
        let last = self.last_log().await?;
        let expected = last.map_or(LogId::FIRST, |last| last.id.next());
        if log.id != expected {
            return Err(LedgerError::Internal(format!(
                "log {} does not follow the tail, expected {expected}",
                log.id
            )));
        }
        self.overlay.logs.push(log.clone());
        Ok(())
    }

    async fn insert_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<(), LedgerError> {
        let record_key = (record.scope.clone(), record.key.clone());
        if self.idempotency_record(&record.scope, &record.key).await?.is_some() {
            return Err(LedgerError::IdempotencyKeyConflict {
                key: record.key.clone(),
            });
        }
        self.overlay.idempotency.insert(record_key, record.clone());
        Ok(())
    }

    async fn commit(self) -> Result<(), LedgerError> {
        let Self {
            shared,
            ledger,
            overlay,
            guards,
            ..
        } = self;
        {
            let mut data = shared.data()?;
            let data = data.entry(ledger).or_default();
            data.accounts.extend(overlay.accounts);
            data.volumes.merge(&overlay.volume_deltas);
            data.moves.extend(overlay.moves);
            data.transactions.extend(overlay.transactions);
            data.references.extend(overlay.references);
            data.logs.extend(overlay.logs);
            data.idempotency.extend(overlay.idempotency);
            for revision in overlay.revisions {
                data.revisions
                    .entry(revision.target.clone())
                    .or_default()
                    .push(revision);
            }
        }
        drop(guards);
        Ok(())
    }

    async fn rollback(self) -> Result<(), LedgerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::{Posting, Postings};
    use crate::store::AddressFilter;
    use chrono::TimeZone;

    const TIMEOUT: Duration = Duration::from_millis(50);

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap()
    }

    async fn write_transaction(store: &MemoryStore, id: u64, timestamp: DateTime<Utc>) {
        let postings = Postings(vec![Posting::new("world", "alice", "USD", 10)]);
        let mut tx = store.begin("main").await.unwrap();
        let transaction = Transaction {
            id: TransactionId(id),
            postings: postings.clone(),
            metadata: Metadata::new(),
            timestamp,
            inserted_at: at(20),
            reference: Some(format!("ref-{id}")),
            reverted_at: None,
            post_commit_volumes: None,
            post_commit_effective_volumes: None,
        };
        tx.insert_transaction(&transaction).await.unwrap();
        tx.apply_volume_deltas(&AccountVolumes::from_postings(&postings))
            .await
            .unwrap();
        tx.insert_moves(&Move::from_postings(transaction.id, &postings, timestamp, at(20)))
            .await
            .unwrap();
        tx.upsert_accounts(&postings.involved_accounts(), timestamp, at(20))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin("main").await.unwrap();
        tx.apply_volume_deltas(&AccountVolumes::from_postings(&Postings(vec![
            Posting::new("world", "alice", "USD", 10),
        ])))
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        let balances = store
            .aggregated_balances(
                "main",
                &BalancesQuery {
                    addresses: AddressFilter::Exact(vec!["alice".into()]),
                    at: VolumesQuery::default(),
                },
            )
            .await
            .unwrap();
        assert!(balances.is_empty());
    }

    #[tokio::test]
    async fn test_reference_conflict_across_transactions() {
        let store = MemoryStore::new();
        write_transaction(&store, 1, at(10)).await;
        let mut tx = store.begin("main").await.unwrap();
        let mut duplicate = store
            .get_transaction("main", TransactionId(1))
            .await
            .unwrap()
            .unwrap();
        duplicate.id = TransactionId(2);
        let err = tx.insert_transaction(&duplicate).await.unwrap_err();
        assert_eq!(err, LedgerError::Conflict { reference: "ref-1".into() });
    }

    #[tokio::test]
    async fn test_effective_snapshot_follows_business_order() {
        let store = MemoryStore::new();
        write_transaction(&store, 1, at(10)).await;
        // Backdated: lands before the first one in business order.
        write_transaction(&store, 2, at(8)).await;

        let first = store
            .get_transaction("main", TransactionId(1))
            .await
            .unwrap()
            .unwrap();
        let second = store
            .get_transaction("main", TransactionId(2))
            .await
            .unwrap()
            .unwrap();
        let alice = |tx: &Transaction| {
            tx.post_commit_effective_volumes
                .as_ref()
                .unwrap()
                .get("alice", "USD")
        };
        assert_eq!(alice(&second), Volumes::new(10, 0));
        assert_eq!(alice(&first), Volumes::new(20, 0));

        let account = store
            .get_account("main", "alice", VolumesQuery::effective_at(at(9)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.volumes["USD"], Volumes::new(10, 0));
    }

    #[tokio::test]
    async fn test_key_lock_times_out_while_held() {
        let store = MemoryStore::new();
        let keys = vec!["main/account/alice".to_string()];
        let mut first = store.begin("main").await.unwrap();
        first.lock_keys(&keys, TIMEOUT).await.unwrap();
        // Reentrant within the same transaction.
        first.lock_keys(&keys, TIMEOUT).await.unwrap();

        let mut second = store.begin("main").await.unwrap();
        let err = second.lock_keys(&keys, TIMEOUT).await.unwrap_err();
        assert!(matches!(err, LedgerError::LockTimeout(_)));

        first.commit().await.unwrap();
        second.lock_keys(&keys, TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn test_exclusive_ledger_lock_excludes_writers() {
        let store = MemoryStore::new();
        let mut importer = store.begin("main").await.unwrap();
        importer
            .lock_ledger(LedgerLockMode::Exclusive, TIMEOUT)
            .await
            .unwrap();
        let mut writer = store.begin("main").await.unwrap();
        assert!(writer
            .lock_ledger(LedgerLockMode::Shared, TIMEOUT)
            .await
            .is_err());
        importer.rollback().await.unwrap();
        writer
            .lock_ledger(LedgerLockMode::Shared, TIMEOUT)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_purge_removes_expired_ledgers_and_buckets() {
        let store = MemoryStore::new();
        store.create_ledger(CreateLedger::named("old")).await.unwrap();
        let mut keep = CreateLedger::named("keep");
        keep.bucket = Some("other".into());
        store.create_ledger(keep).await.unwrap();
        store.delete_ledger("old").await.unwrap();
        assert!(store.delete_ledger("old").await.is_err());

        let report = store
            .purge_deleted(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(report.ledgers, vec!["old".to_string()]);
        assert_eq!(report.buckets, vec!["_default".to_string()]);
        assert_eq!(store.list_ledgers(true).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_ledger_rejected() {
        let store = MemoryStore::new();
        store.create_ledger(CreateLedger::named("main")).await.unwrap();
        let err = store
            .create_ledger(CreateLedger::named("main"))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::LedgerExists("main".into()));
    }
}
