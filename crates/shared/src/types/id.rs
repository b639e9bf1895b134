//! Typed IDs for type-safe entity references.
//!
//! Ledger IDs are per-ledger sequences assigned at commit time, so they are
//! plain integers rather than UUIDs. The wrapper keeps a `LogId` from being
//! passed where a `TransactionId` is expected.

use serde::{Deserialize, Serialize};

/// Macro to generate typed ID wrappers over sequence numbers.
macro_rules! typed_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// First ID of a fresh ledger.
            pub const FIRST: Self = Self(1);

            /// Creates an ID from a raw sequence number.
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the inner value.
            #[must_use]
            pub const fn into_inner(self) -> u64 {
                self.0
            }

            /// The ID following this one.
            #[must_use]
            pub const fn next(self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

typed_id!(TransactionId, "Identifier of a transaction within its ledger.");
typed_id!(LogId, "Identifier of a log entry within its ledger.");
typed_id!(BlockId, "Identifier of a sealed log block within its ledger.");
