//! Shared types, errors, and configuration for Tally.
//!
//! This crate provides common types used across all other crates:
//! - Unbounded integer amounts for postings and volumes
//! - Typed IDs for transactions and log entries
//! - Cursor pagination over the ledger log
//! - The outward error type with stable machine-readable codes
//! - Configuration management

pub mod config;
pub mod error;
pub mod types;

pub use config::AppConfig;
pub use error::{AppError, AppResult, ErrorCode};
