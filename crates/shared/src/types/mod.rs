//! Common types used across the application.

pub mod amount;
pub mod id;
pub mod metadata;
pub mod pagination;

pub use amount::Amount;
pub use id::*;
pub use metadata::Metadata;
pub use pagination::{LogCursor, Page, MAX_PAGE_SIZE};
