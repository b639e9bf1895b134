//! Log block sealing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_shared::config::LogBlockConfig;
use tally_shared::types::{LogCursor, LogId, MAX_PAGE_SIZE};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::error::LedgerError;
use crate::ledger::LedgerRegistry;
use crate::log::{Log, LogBlock};
use crate::store::Store;
use crate::time::SharedClock;

/// Seals every complete block of `max_size` entries after the last sealed one.
///
/// Trailing entries that do not fill a block wait for the next pass.
pub async fn seal_pending<S: Store + ?Sized>(
    store: &S,
    ledger: &str,
    max_size: u64,
    now: DateTime<Utc>,
) -> Result<Vec<LogBlock>, LedgerError> {
    if max_size == 0 {
        return Err(LedgerError::validation("block size must be greater than zero"));
    }
    let mut previous = store.last_block(ledger).await?;
    let mut sealed = Vec::new();
    loop {
        let after = previous.as_ref().map(|block| block.last_log_id);
        let members = next_members(store, ledger, after, max_size).await?;
        if (members.len() as u64) < max_size {
            break;
        }
        let block = LogBlock::seal(previous.as_ref(), &members, now)?;
        store.insert_block(ledger, &block).await?;
        info!(
            ledger,
            block = %block.id,
            first = %block.first_log_id,
            last = %block.last_log_id,
            "log block sealed"
        );
        previous = Some(block.clone());
        sealed.push(block);
    }
    Ok(sealed)
}

async fn next_members<S: Store + ?Sized>(
    store: &S,
    ledger: &str,
    mut after: Option<LogId>,
    wanted: u64,
) -> Result<Vec<Log>, LedgerError> {
    let mut members: Vec<Log> = Vec::new();
    while (members.len() as u64) < wanted {
        let page_size = (wanted - members.len() as u64).min(MAX_PAGE_SIZE);
        let page = store
            .list_logs(ledger, &LogCursor { after, page_size })
            .await?;
        let exhausted = (page.len() as u64) < page_size;
        after = page.last().map(|log| log.id).or(after);
        members.extend(page);
        if exhausted {
            break;
        }
    }
    Ok(members)
}

/// Periodically seals log blocks on every live ledger.
#[derive(Debug)]
pub struct BlockSealer<S, R> {
    store: Arc<S>,
    registry: Arc<R>,
    config: LogBlockConfig,
    clock: SharedClock,
}

impl<S: Store, R: LedgerRegistry + 'static> BlockSealer<S, R> {
    /// Creates a sealer.
    pub fn new(store: Arc<S>, registry: Arc<R>, config: LogBlockConfig, clock: SharedClock) -> Self {
        Self {
            store,
            registry,
            config,
            clock,
        }
    }

    /// One pass over all ledgers; returns the number of blocks sealed.
    ///
    /// A ledger that fails is logged and skipped.
    #[instrument(skip(self))]
    pub async fn seal_all(&self) -> Result<usize, LedgerError> {
        let mut total = 0;
        for ledger in self.registry.list_ledgers(false).await? {
            match seal_pending(
                self.store.as_ref(),
                &ledger.name,
                self.config.max_size,
                self.clock.now(),
            )
            .await
            {
                Ok(sealed) => total += sealed.len(),
                Err(err) => warn!(ledger = %ledger.name, error = %err, "sealing failed"),
            }
        }
        Ok(total)
    }

    /// Runs until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.config.interval();
        super::run_every("log-blocks", interval, cancel, || async {
            self.seal_all().await.map(|_| ())
        })
        .await;
    }
}
