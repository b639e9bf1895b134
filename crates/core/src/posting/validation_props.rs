//! Property-based tests for posting syntax and reversal.

use proptest::prelude::*;

use super::{is_valid_address, Posting, Postings};

/// Strategy for one address segment.
fn segment() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-]{1,12}"
}

/// Strategy for a valid colon-separated address.
fn address() -> impl Strategy<Value = String> {
    prop::collection::vec(segment(), 1..5).prop_map(|segments| segments.join(":"))
}

/// Strategy for a valid posting.
fn posting() -> impl Strategy<Value = Posting> {
    (address(), address(), "[A-Z]{3}", 0u64..1_000_000)
        .prop_map(|(source, destination, asset, amount)| Posting::new(source, destination, asset, amount))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property 1: Generated addresses are accepted.
    #[test]
    fn prop_segmented_addresses_accepted(address in address()) {
        prop_assert!(is_valid_address(&address));
    }

    /// Property 2: A disallowed character anywhere invalidates the address.
    #[test]
    fn prop_disallowed_character_rejected(
        address in address(),
        bad in prop::sample::select(vec![' ', '/', '.', '@', '#', '\n']),
        at in any::<prop::sample::Index>(),
    ) {
        let mut chars: Vec<char> = address.chars().collect();
        let position = at.index(chars.len() + 1);
        chars.insert(position, bad);
        let corrupted: String = chars.into_iter().collect();
        prop_assert!(!is_valid_address(&corrupted));
    }

    /// Property 3: Reversing twice yields the original postings.
    #[test]
    fn prop_double_reverse_is_identity(postings in prop::collection::vec(posting(), 1..8)) {
        let postings = Postings(postings);
        prop_assert_eq!(postings.reversed().reversed(), postings);
    }

    /// Property 4: Reversal preserves amounts and assets.
    #[test]
    fn prop_reverse_preserves_amounts(postings in prop::collection::vec(posting(), 1..8)) {
        let postings = Postings(postings);
        let reversed = postings.reversed();
        prop_assert_eq!(reversed.len(), postings.len());
        for (original, inverse) in postings.iter().zip(reversed.iter().rev()) {
            prop_assert_eq!(&original.amount, &inverse.amount);
            prop_assert_eq!(&original.asset, &inverse.asset);
            prop_assert_eq!(&original.source, &inverse.destination);
            prop_assert_eq!(&original.destination, &inverse.source);
        }
    }

    /// Property 5: Valid postings pass validation.
    #[test]
    fn prop_valid_postings_validate(postings in prop::collection::vec(posting(), 1..8)) {
        prop_assert!(Postings(postings).validate().is_ok());
    }
}
