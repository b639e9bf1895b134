//! Hard deletion of soft-deleted ledgers and their empty buckets.

use std::sync::Arc;

use chrono::TimeDelta;
use tally_shared::config::BucketCleanupConfig;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::error::LedgerError;
use crate::ledger::{LedgerRegistry, PurgeReport};
use crate::time::SharedClock;

/// Periodically purges ledgers whose retention period has passed.
#[derive(Debug)]
pub struct BucketCleaner<R> {
    registry: Arc<R>,
    config: BucketCleanupConfig,
    clock: SharedClock,
}

impl<R: LedgerRegistry + 'static> BucketCleaner<R> {
    /// Creates a cleaner.
    pub fn new(registry: Arc<R>, config: BucketCleanupConfig, clock: SharedClock) -> Self {
        Self {
            registry,
            config,
            clock,
        }
    }

    /// One pass: purges ledgers soft-deleted before `now - retention`.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<PurgeReport, LedgerError> {
        let retention = TimeDelta::from_std(self.config.retention())
            .map_err(|err| LedgerError::Internal(format!("invalid retention: {err}")))?;
        let cutoff = self.clock.now() - retention;
        self.registry.purge_deleted(cutoff).await
    }

    /// Runs until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.config.interval();
        super::run_every("bucket-cleanup", interval, cancel, || async {
            self.run_once().await.map(|_| ())
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::CreateLedger;
    use crate::store::MemoryStore;
    use crate::time::Clock;
    use chrono::{DateTime, TimeZone, Utc};

    #[derive(Debug)]
    struct At(DateTime<Utc>);

    impl Clock for At {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, 0, 0, 0).unwrap()
    }

    fn cleaner(store: &Arc<MemoryStore>, now: DateTime<Utc>) -> BucketCleaner<MemoryStore> {
        BucketCleaner::new(
            Arc::clone(store),
            BucketCleanupConfig {
                retention_secs: 7 * 24 * 3600,
                ..BucketCleanupConfig::default()
            },
            Arc::new(At(now)),
        )
    }

    #[tokio::test]
    async fn test_purges_after_retention_only() {
        let store = Arc::new(MemoryStore::with_clock(Arc::new(At(day(1)))));
        store
            .create_ledger(CreateLedger {
                bucket: Some("archive".into()),
                ..CreateLedger::named("old")
            })
            .await
            .unwrap();
        store.create_ledger(CreateLedger::named("kept")).await.unwrap();
        store.delete_ledger("old").await.unwrap();

        let report = cleaner(&store, day(5)).run_once().await.unwrap();
        assert!(report.ledgers.is_empty());
        assert!(store.get_ledger("old").await.unwrap().is_some());

        let report = cleaner(&store, day(9)).run_once().await.unwrap();
        assert_eq!(report.ledgers, vec!["old".to_string()]);
        assert_eq!(report.buckets, vec!["archive".to_string()]);
        assert!(store.get_ledger("old").await.unwrap().is_none());
        assert!(store.get_ledger("kept").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_shared_bucket_survives() {
        let store = Arc::new(MemoryStore::with_clock(Arc::new(At(day(1)))));
        store.create_ledger(CreateLedger::named("a")).await.unwrap();
        store.create_ledger(CreateLedger::named("b")).await.unwrap();
        store.delete_ledger("a").await.unwrap();

        let report = cleaner(&store, day(20)).run_once().await.unwrap();
        assert_eq!(report.ledgers, vec!["a".to_string()]);
        assert!(report.buckets.is_empty());
    }
}
