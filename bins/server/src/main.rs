//! Tally ledger server
//!
//! Main entry point: storage, background workers and graceful shutdown.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use tally_core::LedgerService;
use tally_core::events::{ChannelPublisher, LedgerEvent};
use tally_core::time::{SharedClock, SystemClock};
use tally_core::worker::{BlockSealer, BucketCleaner};
use tally_db::migration::MigratorTrait;
use tally_db::{Migrator, PgLedgerRegistry, PgStore, connect};
use tally_shared::AppConfig;
use tally_shared::config::TelemetryConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config.telemetry);

    // Connect and migrate
    let db = connect(&config.database)
        .await
        .context("failed to connect to database")?;
    info!("Connected to database");
    Migrator::up(&db, None)
        .await
        .context("failed to run migrations")?;
    info!("Migrations applied");

    // Assemble the service
    let clock: SharedClock = Arc::new(SystemClock);
    let store = Arc::new(PgStore::new(db.clone()));
    let registry = Arc::new(
        PgLedgerRegistry::new(db.clone(), config.ledger.registry_cache_ttl())
            .with_clock(Arc::clone(&clock)),
    );
    let (publisher, events) = ChannelPublisher::new();
    let service = LedgerService::new(Arc::clone(&store), Arc::clone(&registry), &config.ledger)
        .with_publisher(Arc::new(publisher))
        .with_clock(Arc::clone(&clock));
    let ledgers = service.list_ledgers(false).await?;
    info!(ledgers = ledgers.len(), "Ledger service ready");

    // Background workers
    let cancel = CancellationToken::new();
    let mut workers: Vec<JoinHandle<()>> = vec![tokio::spawn(forward_events(events))];
    if config.log_blocks.enabled {
        let sealer = BlockSealer::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.log_blocks.clone(),
            Arc::clone(&clock),
        );
        workers.push(tokio::spawn(sealer.run(cancel.child_token())));
    }
    if config.bucket_cleanup.enabled {
        let cleaner = BucketCleaner::new(
            Arc::clone(&registry),
            config.bucket_cleanup.clone(),
            Arc::clone(&clock),
        );
        workers.push(tokio::spawn(cleaner.run(cancel.child_token())));
    }

    shutdown_signal().await;
    info!("Shutdown signal received");

    // Drain in-flight commits before closing storage
    cancel.cancel();
    service.shutdown().await;
    drop(service);
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }
    db.close().await.context("failed to close database pool")?;
    info!("Shutdown complete");

    Ok(())
}

fn init_tracing(telemetry: &TelemetryConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&telemetry.filter));
    let registry = tracing_subscriber::registry().with(filter);
    if telemetry.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Logs committed events until every publisher is dropped.
async fn forward_events(mut events: UnboundedReceiver<LedgerEvent>) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(payload) => debug!(log_id = %event.log_id(), %payload, "Ledger event"),
            Err(e) => warn!(error = %e, "Unserializable ledger event"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
