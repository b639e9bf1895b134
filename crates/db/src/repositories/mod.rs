//! PostgreSQL implementations of the core storage traits.

mod registry;
mod rows;
mod store;
mod store_tx;
mod volumes;

pub use registry::PgLedgerRegistry;
pub use store::PgStore;
pub use store_tx::PgStoreTx;
