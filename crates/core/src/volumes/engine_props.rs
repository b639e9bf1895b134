//! Property-based tests for the balance & volume engine.
//!
//! Property 1: Double-entry conservation per asset
//! Property 2: Bounded balances never go negative without force
//! Property 3: post = pre + deltas in both projections

use num_bigint::BigInt;
use num_traits::Signed;
use proptest::prelude::*;

use super::engine::VolumeEngine;
use super::{AccountVolumes, Volumes};
use crate::error::LedgerError;
use crate::posting::{Posting, Postings, WORLD};

const ACCOUNTS: [&str; 5] = [WORLD, "alice", "bob", "carol", "bank:main"];
const ASSETS: [&str; 2] = ["USD/2", "EUR"];

/// Strategy for one posting between the fixed accounts.
fn posting() -> impl Strategy<Value = Posting> {
    (
        prop::sample::select(ACCOUNTS.to_vec()),
        prop::sample::select(ACCOUNTS.to_vec()),
        prop::sample::select(ASSETS.to_vec()),
        0u64..500,
    )
        .prop_map(|(source, destination, asset, amount)| {
            Posting::new(source, destination, asset, amount)
        })
}

/// Strategy for a batch of transactions.
fn transactions() -> impl Strategy<Value = Vec<Vec<Posting>>> {
    prop::collection::vec(prop::collection::vec(posting(), 1..4), 1..30)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property 1: Across any sequence of accepted transactions, the sum of
    /// balances of every asset stays zero.
    #[test]
    fn prop_double_entry_conservation(batch in transactions(), force in any::<bool>()) {
        let mut state = AccountVolumes::default();
        for postings in batch {
            let postings = Postings(postings);
            if let Ok(result) = VolumeEngine::compute(&postings, &state, &state, force) {
                for (account, asset, volumes) in result.post_commit.iter() {
                    state.set(account, asset, volumes.clone());
                }
            }
        }
        for (_, balance) in state.aggregated_balances() {
            prop_assert_eq!(balance, BigInt::from(0));
        }
    }

    /// Property 2: Without force, no bounded account ever ends negative, and a
    /// rejected transaction leaves the state untouched.
    #[test]
    fn prop_bounded_balances_stay_non_negative(batch in transactions()) {
        let mut state = AccountVolumes::default();
        for postings in batch {
            let postings = Postings(postings);
            let before = state.clone();
            match VolumeEngine::compute(&postings, &state, &state, false) {
                Ok(result) => {
                    for (account, asset, volumes) in result.post_commit.iter() {
                        state.set(account, asset, volumes.clone());
                    }
                }
                Err(LedgerError::InsufficientFund { .. }) => prop_assert_eq!(&state, &before),
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
            for (account, _, volumes) in state.iter() {
                if account != WORLD {
                    prop_assert!(!volumes.balance().is_negative());
                }
            }
        }
    }

    /// Property 3: For every involved pair, post = pre + Σin − Σout.
    #[test]
    fn prop_post_equals_pre_plus_deltas(postings in prop::collection::vec(posting(), 1..6)) {
        let postings = Postings(postings);
        let mut prior = AccountVolumes::default();
        for account in ACCOUNTS {
            for asset in ASSETS {
                prior.set(account, asset, Volumes::new(1_000u64, 0u64));
            }
        }
        let result = VolumeEngine::compute(&postings, &prior, &prior, true).unwrap();
        for (account, asset) in postings.involved_volumes() {
            let credited: u64 = postings.iter()
                .filter(|p| p.destination == account && p.asset == asset)
                .map(|p| p.amount.to_string().parse::<u64>().unwrap())
                .sum();
            let debited: u64 = postings.iter()
                .filter(|p| p.source == account && p.asset == asset)
                .map(|p| p.amount.to_string().parse::<u64>().unwrap())
                .sum();
            let pre = result.pre_commit.get(&account, &asset).balance();
            let post = result.post_commit.get(&account, &asset).balance();
            prop_assert_eq!(post.clone(), pre + BigInt::from(credited) - BigInt::from(debited));
            prop_assert_eq!(result.post_commit_effective.get(&account, &asset).balance(), post);
        }
    }
}
