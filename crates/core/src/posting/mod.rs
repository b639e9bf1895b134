//! Postings: directed movements of one asset between two accounts.
//!
//! This module owns the syntax rules every posting must satisfy before it
//! reaches the balance engine:
//! - account addresses are colon-separated segments of `[a-zA-Z0-9_-]`
//! - asset codes are upper-case, optionally suffixed with `/precision`
//! - amounts are non-negative (enforced by [`Amount`] itself)

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tally_shared::types::Amount;

use crate::error::LedgerError;

#[cfg(test)]
mod validation_props;

/// Conventional unbounded source account.
pub const WORLD: &str = "world";

/// Maximum length of an account address.
pub const MAX_ADDRESS_LENGTH: usize = 256;

static ADDRESS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_-]+(:[a-zA-Z0-9_-]+)*$").expect("address pattern compiles")
});

static ASSET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z][A-Z0-9]{0,16}(_[A-Z]{1,16})?(/[0-9]{1,6})?$").expect("asset pattern compiles")
});

/// Whether `address` is a syntactically valid account address.
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    address.len() <= MAX_ADDRESS_LENGTH && ADDRESS_PATTERN.is_match(address)
}

/// Whether `asset` is a syntactically valid asset code.
#[must_use]
pub fn is_valid_asset(asset: &str) -> bool {
    ASSET_PATTERN.is_match(asset)
}

/// A single movement of `amount` units of `asset` from `source` to `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Posting {
    /// Debited account.
    pub source: String,
    /// Credited account.
    pub destination: String,
    /// Moved amount, possibly zero.
    pub amount: Amount,
    /// Asset code.
    pub asset: String,
}

impl Posting {
    /// Creates a posting.
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        asset: impl Into<String>,
        amount: impl Into<Amount>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            amount: amount.into(),
            asset: asset.into(),
        }
    }

    /// Checks address and asset syntax.
    pub fn validate(&self) -> Result<(), LedgerError> {
        for address in [&self.source, &self.destination] {
            if !is_valid_address(address) {
                return Err(LedgerError::validation(format!(
                    "invalid account address {address:?}"
                )));
            }
        }
        if !is_valid_asset(&self.asset) {
            return Err(LedgerError::validation(format!(
                "invalid asset {:?}",
                self.asset
            )));
        }
        Ok(())
    }

    /// The same movement in the opposite direction.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            source: self.destination.clone(),
            destination: self.source.clone(),
            amount: self.amount.clone(),
            asset: self.asset.clone(),
        }
    }
}

/// Ordered list of postings of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Postings(pub Vec<Posting>);

impl Postings {
    /// Validates every posting and requires at least one.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.0.is_empty() {
            return Err(LedgerError::NoPostings);
        }
        self.0.iter().try_for_each(Posting::validate)
    }

    /// Inverse postings: each one swapped, in reverse order.
    ///
    /// Applying the reverse after the original restores every balance, and the
    /// reverse order keeps intermediate accounts from dipping below zero.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self(self.0.iter().rev().map(Posting::reversed).collect())
    }

    /// Every account address referenced, sorted and deduplicated.
    #[must_use]
    pub fn involved_accounts(&self) -> BTreeSet<String> {
        self.0
            .iter()
            .flat_map(|p| [p.source.clone(), p.destination.clone()])
            .collect()
    }

    /// Every `(account, asset)` pair touched, sorted and deduplicated.
    #[must_use]
    pub fn involved_volumes(&self) -> BTreeSet<(String, String)> {
        self.0
            .iter()
            .flat_map(|p| {
                [
                    (p.source.clone(), p.asset.clone()),
                    (p.destination.clone(), p.asset.clone()),
                ]
            })
            .collect()
    }

    /// Iterates over the postings.
    pub fn iter(&self) -> std::slice::Iter<'_, Posting> {
        self.0.iter()
    }

    /// Number of postings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no postings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Posting>> for Postings {
    fn from(postings: Vec<Posting>) -> Self {
        Self(postings)
    }
}

impl<'a> IntoIterator for &'a Postings {
    type Item = &'a Posting;
    type IntoIter = std::slice::Iter<'a, Posting>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
