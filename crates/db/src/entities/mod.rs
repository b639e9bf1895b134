//! `SeaORM` entities of the ledger schema.

pub mod account_metadata_history;
pub mod accounts;
pub mod idempotency_keys;
pub mod ledgers;
pub mod log_blocks;
pub mod logs;
pub mod transaction_metadata_history;
pub mod transactions;
