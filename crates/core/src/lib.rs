//! Commit pipeline for Tally.
//!
//! This crate holds the ledger semantics with ZERO web or database dependencies.
//! Storage is reached through the [`store::Store`] trait; `tally-db` provides
//! the PostgreSQL implementation and [`store::MemoryStore`] an in-process one.
//!
//! # Modules
//!
//! - `posting` - Postings and address/asset syntax
//! - `volumes` - Volume snapshots and the balance engine
//! - `resolver` - Posting set resolution from postings or scripts
//! - `log` - Hash-chained log entries and log blocks
//! - `idempotency` - Request fingerprints and replay decisions
//! - `concurrency` - Lock keys, ordering and the shutdown drain gate
//! - `controller` - The commit orchestrator of one ledger
//! - `worker` - Log block sealing and bucket cleanup runners
//! - `service` - Ledger lifecycle and controller lookup

pub mod concurrency;
pub mod controller;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod ledger;
pub mod log;
pub mod posting;
pub mod resolver;
pub mod service;
pub mod store;
pub mod time;
pub mod transaction;
pub mod volumes;
pub mod worker;

pub use controller::LedgerController;
pub use error::LedgerError;
pub use service::LedgerService;
