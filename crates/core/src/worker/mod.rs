//! Background runners.
//!
//! Each runner wakes up on a fixed interval, does one pass, and stops when
//! its cancellation token fires. A failed pass is logged and retried on the
//! next tick.

pub mod blocks;
pub mod cleanup;

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::LedgerError;

pub use blocks::{seal_pending, BlockSealer};
pub use cleanup::BucketCleaner;

/// Calls `pass` every `interval` until `cancel` fires.
///
/// The first pass runs immediately.
pub async fn run_every<F, Fut>(
    name: &'static str,
    interval: Duration,
    cancel: CancellationToken,
    mut pass: F,
) where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<(), LedgerError>> + Send,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(runner = name, ?interval, "runner started");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                debug!(runner = name, "runner pass");
                if let Err(err) = pass().await {
                    error!(runner = name, error = %err, "runner pass failed");
                }
            }
        }
    }
    info!(runner = name, "runner stopped");
}
