//! PostgreSQL storage for Tally.
//!
//! This crate provides:
//! - `SeaORM` entity definitions
//! - [`PgStore`], the commit pipeline's storage backend
//! - [`PgLedgerRegistry`], ledger definitions with a read-through cache
//! - Database migrations

pub mod entities;
pub mod error;
pub mod migration;
pub mod repositories;

pub use migration::Migrator;
pub use repositories::{PgLedgerRegistry, PgStore, PgStoreTx};

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbErr};
use tally_shared::config::DatabaseConfig;

/// Opens a connection pool.
///
/// # Errors
///
/// Returns an error if the connection cannot be established.
pub async fn connect(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let mut options = ConnectOptions::new(config.url.clone());
    options
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .sqlx_logging(false);
    Database::connect(options).await
}
