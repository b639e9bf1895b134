//! Account volumes and their two projections.
//!
//! Every `(account, asset)` pair carries cumulative `input` and `output`
//! counters, `balance = input - output`. They are tracked twice:
//! - insertion volumes follow commit order
//! - effective volumes follow the business timestamp of each transaction
//!
//! Effective volumes are derived from [`Move`]s, one per posting side, so that
//! a backdated transaction can be slotted into the history after the fact.

pub mod engine;

#[cfg(test)]
mod engine_props;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use tally_shared::types::{Amount, TransactionId};

use crate::posting::{Posting, Postings};

pub use engine::{check_funds, CommitVolumes, VolumeEngine};

/// Cumulative counters of one account for one asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volumes {
    /// Total received.
    pub input: Amount,
    /// Total sent.
    pub output: Amount,
}

impl Volumes {
    /// Creates volumes from raw counters.
    pub fn new(input: impl Into<Amount>, output: impl Into<Amount>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }

    /// `input - output`.
    #[must_use]
    pub fn balance(&self) -> BigInt {
        self.input.to_bigint() - self.output.to_bigint()
    }

    /// Records an incoming amount.
    pub fn credit(&mut self, amount: &Amount) {
        self.input += amount;
    }

    /// Records an outgoing amount.
    pub fn debit(&mut self, amount: &Amount) {
        self.output += amount;
    }

    /// Adds another set of counters to this one.
    pub fn merge(&mut self, other: &Self) {
        self.input += &other.input;
        self.output += &other.output;
    }

    /// Whether both counters are zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.input.is_zero() && self.output.is_zero()
    }
}

/// Volumes of one account, keyed by asset.
pub type VolumesByAsset = BTreeMap<String, Volumes>;

/// Volumes keyed by account, then asset.
///
/// Used both for stored post-commit snapshots and for deltas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountVolumes(pub BTreeMap<String, VolumesByAsset>);

impl AccountVolumes {
    /// Volumes of `(account, asset)`, zero when absent.
    #[must_use]
    pub fn get(&self, account: &str, asset: &str) -> Volumes {
        self.0
            .get(account)
            .and_then(|assets| assets.get(asset))
            .cloned()
            .unwrap_or_default()
    }

    /// Mutable access to `(account, asset)`, inserting zero volumes.
    pub fn entry(&mut self, account: &str, asset: &str) -> &mut Volumes {
        self.0
            .entry(account.to_string())
            .or_default()
            .entry(asset.to_string())
            .or_default()
    }

    /// Sets the volumes of `(account, asset)`.
    pub fn set(&mut self, account: &str, asset: &str, volumes: Volumes) {
        *self.entry(account, asset) = volumes;
    }

    /// Applies one posting: debit the source, credit the destination.
    pub fn apply(&mut self, posting: &Posting) {
        self.entry(&posting.source, &posting.asset)
            .debit(&posting.amount);
        self.entry(&posting.destination, &posting.asset)
            .credit(&posting.amount);
    }

    /// Counters accumulated by a whole posting list, starting from zero.
    #[must_use]
    pub fn from_postings(postings: &Postings) -> Self {
        let mut deltas = Self::default();
        for posting in postings {
            deltas.apply(posting);
        }
        deltas
    }

    /// Adds every counter of `other` into `self`.
    pub fn merge(&mut self, other: &Self) {
        for (account, assets) in &other.0 {
            for (asset, volumes) in assets {
                self.entry(account, asset).merge(volumes);
            }
        }
    }

    /// Iterates over `(account, asset, volumes)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &Volumes)> {
        self.0.iter().flat_map(|(account, assets)| {
            assets
                .iter()
                .map(move |(asset, volumes)| (account.as_str(), asset.as_str(), volumes))
        })
    }

    /// Balances keyed by asset, summed over every account present.
    #[must_use]
    pub fn aggregated_balances(&self) -> BTreeMap<String, BigInt> {
        let mut balances: BTreeMap<String, BigInt> = BTreeMap::new();
        for (_, asset, volumes) in self.iter() {
            *balances.entry(asset.to_string()).or_default() += volumes.balance();
        }
        balances
    }

    /// Subtracts `deltas` from every counter; `None` if a counter would underflow.
    #[must_use]
    pub fn minus(&self, deltas: &Self) -> Option<Self> {
        let mut result = self.clone();
        for (account, asset, delta) in deltas.iter() {
            let current = result.get(account, asset);
            let input = Amount::from_bigint(&(current.input.to_bigint() - delta.input.to_bigint()))?;
            let output =
                Amount::from_bigint(&(current.output.to_bigint() - delta.output.to_bigint()))?;
            result.set(account, asset, Volumes { input, output });
        }
        Some(result)
    }
}

/// One side of a posting, kept to rebuild effective volumes at any date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Move {
    /// Transaction that produced the move.
    pub transaction_id: TransactionId,
    /// Index of the posting within its transaction.
    pub posting_index: u32,
    /// Affected account.
    pub account: String,
    /// Moved asset.
    pub asset: String,
    /// Moved amount.
    pub amount: Amount,
    /// `true` when the account is the posting source.
    pub is_source: bool,
    /// Business timestamp of the transaction.
    pub effective_date: DateTime<Utc>,
    /// Commit time of the transaction.
    pub inserted_at: DateTime<Utc>,
}

impl Move {
    /// Both moves of every posting of a transaction.
    #[must_use]
    pub fn from_postings(
        transaction_id: TransactionId,
        postings: &Postings,
        effective_date: DateTime<Utc>,
        inserted_at: DateTime<Utc>,
    ) -> Vec<Self> {
        postings
            .iter()
            .zip(0u32..)
            .flat_map(|(posting, index)| {
                [(posting.source.clone(), true), (posting.destination.clone(), false)]
                    .into_iter()
                    .map(move |(account, is_source)| Self {
                        transaction_id,
                        posting_index: index,
                        account,
                        asset: posting.asset.clone(),
                        amount: posting.amount.clone(),
                        is_source,
                        effective_date,
                        inserted_at,
                    })
            })
            .collect()
    }

    /// Applies this move to `volumes`.
    pub fn apply_to(&self, volumes: &mut AccountVolumes) {
        let entry = volumes.entry(&self.account, &self.asset);
        if self.is_source {
            entry.debit(&self.amount);
        } else {
            entry.credit(&self.amount);
        }
    }

    /// Position of the move in effective order.
    #[must_use]
    pub fn effective_key(&self) -> (DateTime<Utc>, TransactionId) {
        (self.effective_date, self.transaction_id)
    }
}

/// Which clock a point-in-time read follows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeAxis {
    /// Business timestamps.
    #[default]
    Effective,
    /// Commit times.
    Insertion,
}

/// Folds moves into volumes, keeping only those visible at `pit` on `axis`.
pub fn volumes_at<'a>(
    moves: impl IntoIterator<Item = &'a Move>,
    pit: Option<DateTime<Utc>>,
    axis: TimeAxis,
) -> AccountVolumes {
    let mut volumes = AccountVolumes::default();
    for mv in moves {
        let visible = match (pit, axis) {
            (None, _) => true,
            (Some(pit), TimeAxis::Effective) => mv.effective_date <= pit,
            (Some(pit), TimeAxis::Insertion) => mv.inserted_at <= pit,
        };
        if visible {
            mv.apply_to(&mut volumes);
        }
    }
    volumes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_balance_can_be_negative() {
        let volumes = Volumes::new(10, 25);
        assert_eq!(volumes.balance(), BigInt::from(-15));
    }

    #[test]
    fn test_apply_posting() {
        let mut volumes = AccountVolumes::default();
        volumes.apply(&Posting::new("world", "alice", "USD", 100));
        assert_eq!(volumes.get("alice", "USD"), Volumes::new(100, 0));
        assert_eq!(volumes.get("world", "USD"), Volumes::new(0, 100));
        assert_eq!(volumes.get("bob", "USD"), Volumes::default());
    }

    #[test]
    fn test_minus_reverses_merge() {
        let mut base = AccountVolumes::default();
        base.set("alice", "USD", Volumes::new(50, 10));
        let deltas = AccountVolumes::from_postings(&Postings(vec![Posting::new(
            "alice", "bob", "USD", 5,
        )]));
        let mut after = base.clone();
        after.merge(&deltas);
        assert_eq!(after.minus(&deltas).unwrap().get("alice", "USD"), Volumes::new(50, 10));
        assert!(AccountVolumes::default().minus(&deltas).is_none());
    }

    #[test]
    fn test_aggregated_balances_cancel_out() {
        let volumes = AccountVolumes::from_postings(&Postings(vec![
            Posting::new("world", "alice", "USD", 100),
            Posting::new("alice", "bob", "USD", 30),
        ]));
        let balances = volumes.aggregated_balances();
        assert_eq!(balances["USD"], BigInt::from(0));
    }

    #[test]
    fn test_volumes_at_follows_axis() {
        let postings = Postings(vec![Posting::new("world", "alice", "USD", 10)]);
        // Business date 08:00, committed at 12:00.
        let moves = Move::from_postings(TransactionId(1), &postings, at(8), at(12));
        assert_eq!(moves.len(), 2);

        let effective = volumes_at(&moves, Some(at(9)), TimeAxis::Effective);
        assert_eq!(effective.get("alice", "USD"), Volumes::new(10, 0));

        let inserted = volumes_at(&moves, Some(at(9)), TimeAxis::Insertion);
        assert_eq!(inserted.get("alice", "USD"), Volumes::default());

        let all = volumes_at(&moves, None, TimeAxis::Insertion);
        assert_eq!(all.get("world", "USD"), Volumes::new(0, 10));
    }
}
