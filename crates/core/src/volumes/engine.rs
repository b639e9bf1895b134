//! Balance & volume engine.
//!
//! Pure computation: given the postings of one transaction and the volumes of
//! every involved `(account, asset)` pair right before it, in both projections,
//! produce the pre/post snapshots and reject the whole transaction if any
//! balance it lowers ends up negative.

use num_traits::Signed;
use tracing::debug;

use super::AccountVolumes;
use crate::error::LedgerError;
use crate::posting::{Postings, WORLD};

/// Pre and post snapshots in both projections, restricted to involved pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitVolumes {
    /// Insertion volumes right before the transaction.
    pub pre_commit: AccountVolumes,
    /// Insertion volumes right after the transaction.
    pub post_commit: AccountVolumes,
    /// Effective volumes at the transaction timestamp, before it.
    pub pre_commit_effective: AccountVolumes,
    /// Effective volumes at the transaction timestamp, after it.
    pub post_commit_effective: AccountVolumes,
}

/// Computes commit snapshots.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeEngine;

impl VolumeEngine {
    /// Applies `postings` on top of the given prior volumes.
    ///
    /// `insertion` and `effective` may hold more or fewer pairs than the
    /// postings touch; missing pairs count as zero and extra ones are ignored.
    /// Unless `force` is set, fails with [`LedgerError::InsufficientFund`] and
    /// applies nothing when a lowered balance would end negative.
    pub fn compute(
        postings: &Postings,
        insertion: &AccountVolumes,
        effective: &AccountVolumes,
        force: bool,
    ) -> Result<CommitVolumes, LedgerError> {
        let deltas = AccountVolumes::from_postings(postings);

        let pre_commit = restrict(postings, insertion);
        let mut post_commit = pre_commit.clone();
        post_commit.merge(&deltas);

        if !force {
            check_funds(postings, &pre_commit, &post_commit)?;
        }

        let pre_commit_effective = restrict(postings, effective);
        let mut post_commit_effective = pre_commit_effective.clone();
        post_commit_effective.merge(&deltas);

        debug!(
            postings = postings.len(),
            pairs = deltas.iter().count(),
            force,
            "computed commit volumes"
        );

        Ok(CommitVolumes {
            pre_commit,
            post_commit,
            pre_commit_effective,
            post_commit_effective,
        })
    }
}

fn restrict(postings: &Postings, volumes: &AccountVolumes) -> AccountVolumes {
    let mut restricted = AccountVolumes::default();
    for (account, asset) in postings.involved_volumes() {
        restricted.set(&account, &asset, volumes.get(&account, &asset));
    }
    restricted
}

/// Rejects the transaction if it lowers any bounded balance below zero.
///
/// `world` is unbounded. Accounts already negative (after a forced
/// transaction) may still receive funds.
pub fn check_funds(
    postings: &Postings,
    pre: &AccountVolumes,
    post: &AccountVolumes,
) -> Result<(), LedgerError> {
    for (account, asset) in postings.involved_volumes() {
        if account == WORLD {
            continue;
        }
        let after = post.get(&account, &asset).balance();
        if !after.is_negative() {
            continue;
        }
        let before = pre.get(&account, &asset).balance();
        if after < before {
            return Err(LedgerError::InsufficientFund { account, asset });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::Posting;
    use crate::volumes::Volumes;
    use num_bigint::BigInt;

    fn postings(list: &[(&str, &str, &str, u64)]) -> Postings {
        Postings(
            list.iter()
                .map(|(s, d, a, n)| Posting::new(*s, *d, *a, *n))
                .collect(),
        )
    }

    #[test]
    fn test_world_is_unbounded() {
        let result = VolumeEngine::compute(
            &postings(&[("world", "alice", "USD", 100)]),
            &AccountVolumes::default(),
            &AccountVolumes::default(),
            false,
        )
        .unwrap();
        assert_eq!(result.post_commit.get("alice", "USD").balance(), BigInt::from(100));
        assert_eq!(result.post_commit.get("world", "USD").balance(), BigInt::from(-100));
        assert!(result.pre_commit.get("alice", "USD").is_zero());
    }

    #[test]
    fn test_insufficient_fund_rejects_whole_transaction() {
        let mut current = AccountVolumes::default();
        current.set("alice", "USD", Volumes::new(50, 0));
        let err = VolumeEngine::compute(
            &postings(&[("alice", "bob", "USD", 30), ("alice", "carol", "USD", 30)]),
            &current,
            &current,
            false,
        )
        .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientFund {
                account: "alice".into(),
                asset: "USD".into(),
            }
        );
    }

    #[test]
    fn test_force_overrides_check() {
        let result = VolumeEngine::compute(
            &postings(&[("alice", "bob", "USD", 30)]),
            &AccountVolumes::default(),
            &AccountVolumes::default(),
            true,
        )
        .unwrap();
        assert_eq!(result.post_commit.get("alice", "USD").balance(), BigInt::from(-30));
    }

    #[test]
    fn test_chained_postings_within_transaction() {
        // bank receives from world then forwards: never observed negative at the end.
        let result = VolumeEngine::compute(
            &postings(&[("world", "bank", "USD", 10), ("bank", "alice", "USD", 10)]),
            &AccountVolumes::default(),
            &AccountVolumes::default(),
            false,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn test_negative_account_may_receive() {
        let mut current = AccountVolumes::default();
        current.set("alice", "USD", Volumes::new(0, 40));
        let result = VolumeEngine::compute(
            &postings(&[("world", "alice", "USD", 10)]),
            &current,
            &current,
            false,
        )
        .unwrap();
        assert_eq!(result.post_commit.get("alice", "USD").balance(), BigInt::from(-30));
    }

    #[test]
    fn test_effective_and_insertion_diverge() {
        let mut insertion = AccountVolumes::default();
        insertion.set("alice", "USD", Volumes::new(100, 0));
        let mut effective = AccountVolumes::default();
        effective.set("alice", "USD", Volumes::new(20, 0));
        let result = VolumeEngine::compute(
            &postings(&[("alice", "bob", "USD", 50)]),
            &insertion,
            &effective,
            false,
        )
        .unwrap();
        assert_eq!(result.post_commit.get("alice", "USD"), Volumes::new(100, 50));
        assert_eq!(result.post_commit_effective.get("alice", "USD"), Volumes::new(20, 50));
    }
}
