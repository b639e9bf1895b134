//! Read side of a ledger.

use serde::{Deserialize, Serialize};
use tally_shared::types::{BlockId, LogCursor, Page, TransactionId, MAX_PAGE_SIZE};
use tracing::info;

use super::LedgerController;
use crate::error::LedgerError;
use crate::log::{verify_block, verify_block_chain, verify_chain, Log, LogBlock, MetadataTarget};
use crate::store::{Balances, BalancesQuery, Store, VolumesQuery};
use crate::transaction::{Account, MetadataRevision, Transaction};

/// What a full log verification covered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Entries whose hash was recomputed.
    pub entries: u64,
    /// Sealed blocks checked against their members.
    pub blocks: u64,
}

impl<S: Store> LedgerController<S> {
    /// A transaction with its volume snapshots.
    pub async fn get_transaction(&self, id: TransactionId) -> Result<Transaction, LedgerError> {
        self.store
            .get_transaction(&self.ledger.name, id)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("transaction {id}")))
    }

    /// An account with its volumes, current or at a point in time.
    pub async fn get_account(
        &self,
        address: &str,
        query: VolumesQuery,
    ) -> Result<Account, LedgerError> {
        self.store
            .get_account(&self.ledger.name, address, query)
            .await?
            .ok_or_else(|| LedgerError::not_found(format!("account {address}")))
    }

    /// Every recorded state of a target's metadata, oldest first.
    ///
    /// Empty on ledgers whose history feature for the target kind is disabled.
    pub async fn metadata_history(
        &self,
        target: &MetadataTarget,
    ) -> Result<Vec<MetadataRevision>, LedgerError> {
        self.store
            .metadata_history(&self.ledger.name, target)
            .await
    }

    /// Balances per asset summed over the selected accounts.
    pub async fn aggregated_balances(
        &self,
        query: &BalancesQuery,
    ) -> Result<Balances, LedgerError> {
        self.store.aggregated_balances(&self.ledger.name, query).await
    }

    /// One page of the log, ascending.
    pub async fn list_logs(&self, cursor: &LogCursor) -> Result<Page<Log>, LedgerError> {
        let logs = self.store.list_logs(&self.ledger.name, cursor).await?;
        Ok(Page::new(logs, cursor, |log| log.id))
    }

    /// Sealed blocks after `after`, ascending.
    pub async fn list_blocks(
        &self,
        after: Option<BlockId>,
        limit: u64,
    ) -> Result<Vec<LogBlock>, LedgerError> {
        self.store
            .list_blocks(&self.ledger.name, after, limit.clamp(1, MAX_PAGE_SIZE))
            .await
    }

    /// Recomputes the whole hash chain and checks every sealed block.
    ///
    /// Fails with [`LedgerError::InvalidHash`] at the first entry or block that
    /// does not match.
    pub async fn verify_log(&self) -> Result<VerifyReport, LedgerError> {
        let blocks = self.all_blocks().await?;
        verify_block_chain(&blocks)?;

        let mut report = VerifyReport::default();
        let mut pending = blocks.iter().peekable();
        let mut members: Vec<Log> = Vec::new();
        let mut last: Option<Log> = None;
        let mut cursor = LogCursor {
            after: None,
            page_size: MAX_PAGE_SIZE,
        };
        loop {
            let page = self.list_logs(&cursor).await?;
            verify_chain(last.as_ref(), &page.data)?;
            report.entries += page.data.len() as u64;
            for log in &page.data {
                if let Some(block) = pending.peek() {
                    if block.contains(log.id) {
                        members.push(log.clone());
                    }
                    if block.last_log_id == log.id {
                        verify_block(block, &members)?;
                        members.clear();
                        report.blocks += 1;
                        pending.next();
                    }
                }
            }
            last = page.data.last().cloned().or(last);
            match page.next {
                Some(next) => cursor = next,
                None => break,
            }
        }

        if let Some(block) = pending.next() {
            return Err(LedgerError::InvalidHash {
                log_id: block.first_log_id,
            });
        }
        info!(
            ledger = %self.ledger.name,
            entries = report.entries,
            blocks = report.blocks,
            "log verified"
        );
        Ok(report)
    }

    async fn all_blocks(&self) -> Result<Vec<LogBlock>, LedgerError> {
        let mut blocks: Vec<LogBlock> = Vec::new();
        loop {
            let after = blocks.last().map(|block| block.id);
            let page = self
                .store
                .list_blocks(&self.ledger.name, after, MAX_PAGE_SIZE)
                .await?;
            let full = page.len() as u64 >= MAX_PAGE_SIZE;
            blocks.extend(page);
            if !full {
                return Ok(blocks);
            }
        }
    }
}
