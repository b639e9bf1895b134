//! Raw log import and export.
//!
//! Export dumps every entry in ID order. Import seeds a ledger that has
//! never been written to from such a dump: it holds the ledger-scope token
//! exclusively, checks each entry against the running hash chain and replays
//! its payload, all in one storage transaction.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tally_shared::types::{LogCursor, LogId};
use tracing::{info, instrument};

use super::pipeline::{record_metadata_history, write_transaction};
use super::LedgerController;
use crate::concurrency::LedgerLockMode;
use crate::error::LedgerError;
use crate::log::{chain_hash, Log, LogPayload, MetadataTarget};
use crate::store::{Store, StoreTx};
use crate::transaction::Transaction;
use crate::volumes::AccountVolumes;

/// Page size of exports.
pub const EXPORT_PAGE_SIZE: u64 = 100;

/// Destination of an export.
#[async_trait]
pub trait LogSink: Send {
    /// Receives the next entry.
    async fn write(&mut self, log: &Log) -> Result<(), LedgerError>;
}

#[async_trait]
impl LogSink for Vec<Log> {
    async fn write(&mut self, log: &Log) -> Result<(), LedgerError> {
        self.push(log.clone());
        Ok(())
    }
}

impl<S: Store> LedgerController<S> {
    /// Writes every entry to `sink`, ascending; returns how many.
    #[instrument(skip_all, fields(ledger = %self.ledger.name))]
    pub async fn export(&self, sink: &mut dyn LogSink) -> Result<u64, LedgerError> {
        let mut cursor = LogCursor {
            after: None,
            page_size: EXPORT_PAGE_SIZE,
        };
        let mut exported = 0;
        loop {
            let page = self.list_logs(&cursor).await?;
            for log in &page.data {
                sink.write(log).await?;
                exported += 1;
            }
            match page.next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        info!(exported, "log exported");
        Ok(exported)
    }

    /// Seeds an unused ledger from an exported log; returns how many entries.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::Import`] if the ledger already has entries, or on a
    ///   gap or a payload that cannot be replayed
    /// - [`LedgerError::InvalidHash`] if an entry does not chain
    #[instrument(skip_all, fields(ledger = %self.ledger.name))]
    pub async fn import<L>(&self, logs: L) -> Result<u64, LedgerError>
    where
        L: Stream<Item = Log> + Send + Unpin,
    {
        let _ticket = self.concurrency.enter()?;
        let mut tx = self.store.begin(&self.ledger.name).await?;
        match self.import_into(&mut tx, logs).await {
            Ok(imported) => {
                tx.commit().await?;
                info!(imported, "log imported");
                Ok(imported)
            }
            Err(err) => {
                self.discard(tx).await;
                Err(err)
            }
        }
    }

    async fn import_into<L>(&self, tx: &mut S::Tx, mut logs: L) -> Result<u64, LedgerError>
    where
        L: Stream<Item = Log> + Send + Unpin,
    {
        self.concurrency
            .lock_ledger(tx, LedgerLockMode::Exclusive)
            .await?;
        if tx.last_log().await?.is_some() {
            return Err(LedgerError::Import(format!(
                "ledger {} already has log entries",
                self.ledger.name
            )));
        }

        let mut previous: Option<Log> = None;
        let mut imported = 0;
        while let Some(log) = logs.next().await {
            let expected = previous.as_ref().map_or(LogId::FIRST, |p| p.id.next());
            if log.id != expected {
                return Err(LedgerError::Import(format!(
                    "expected log {expected}, got {}",
                    log.id
                )));
            }
            if chain_hash(previous.as_ref().map(|p| &p.hash), &log)? != log.hash {
                return Err(LedgerError::InvalidHash { log_id: log.id });
            }
            let log = Log {
                payload: log.payload.without_volumes(),
                ..log
            };
            replay_payload(tx, &log).await?;
            tx.insert_log(&log).await?;
            record_metadata_history(tx, &self.ledger.features, &log).await?;
            imported += 1;
            previous = Some(log);
        }
        Ok(imported)
    }
}

async fn replay_payload<T: StoreTx + ?Sized>(tx: &mut T, log: &Log) -> Result<(), LedgerError> {
    match &log.payload {
        LogPayload::NewTransaction {
            transaction,
            account_metadata,
        } => {
            let transaction = with_insertion_volumes(tx, transaction).await?;
            write_transaction(tx, &transaction, account_metadata).await
        }
        LogPayload::RevertedTransaction {
            reverted_transaction_id,
            transaction,
        } => {
            let transaction = with_insertion_volumes(tx, transaction).await?;
            write_transaction(tx, &transaction, &Default::default()).await?;
            if tx.mark_reverted(*reverted_transaction_id, log.date).await? {
                Ok(())
            } else {
                Err(LedgerError::Import(format!(
                    "log {} reverts unknown or already reverted transaction {reverted_transaction_id}",
                    log.id
                )))
            }
        }
        LogPayload::SetMetadata { target, metadata } => match target {
            MetadataTarget::Transaction(id) => {
                if tx.save_transaction_metadata(*id, metadata).await? {
                    Ok(())
                } else {
                    Err(unknown_transaction(log, *id))
                }
            }
            MetadataTarget::Account(address) => {
                tx.save_account_metadata(address, metadata, log.date).await
            }
        },
        LogPayload::DeleteMetadata { target, key } => {
            match target {
                MetadataTarget::Transaction(id) => {
                    if tx.transaction(*id).await?.is_none() {
                        return Err(unknown_transaction(log, *id));
                    }
                    tx.delete_transaction_metadata(*id, key).await?;
                }
                MetadataTarget::Account(address) => {
                    tx.delete_account_metadata(address, key, log.date).await?;
                }
            }
            Ok(())
        }
    }
}

/// The transaction with the insertion volumes it ends at in replay order.
async fn with_insertion_volumes<T: StoreTx + ?Sized>(
    tx: &mut T,
    transaction: &Transaction,
) -> Result<Transaction, LedgerError> {
    if tx.transaction(transaction.id).await?.is_some() {
        return Err(LedgerError::Import(format!(
            "transaction {} imported twice",
            transaction.id
        )));
    }
    let mut post = tx.volumes(&transaction.postings.involved_volumes()).await?;
    post.merge(&AccountVolumes::from_postings(&transaction.postings));
    let mut transaction = transaction.clone();
    transaction.reverted_at = None;
    transaction.post_commit_volumes = Some(post);
    Ok(transaction)
}

fn unknown_transaction(log: &Log, id: tally_shared::types::TransactionId) -> LedgerError {
    LedgerError::Import(format!("log {} targets unknown transaction {id}", log.id))
}
