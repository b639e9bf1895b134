//! Unbounded non-negative amounts.
//!
//! CRITICAL: Never use floating-point for money calculations.
//! Amounts are integers of arbitrary precision expressed in the smallest unit
//! of their asset (`USD/2` amounts are cents). They serialize as decimal
//! strings so that no JSON consumer truncates them.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

use num_bigint::{BigInt, BigUint};
use num_traits::Zero;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Raised when a string is not a plain run of decimal digits.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid amount {0:?}")]
pub struct ParseAmountError(String);

/// A non-negative integer amount of unbounded precision.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(BigUint);

impl Amount {
    /// The zero amount.
    #[must_use]
    pub fn zero() -> Self {
        Self(BigUint::zero())
    }

    /// Whether this amount is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Borrows the underlying integer.
    #[must_use]
    pub const fn as_biguint(&self) -> &BigUint {
        &self.0
    }

    /// Signed view of the amount, used for balance arithmetic.
    #[must_use]
    pub fn to_bigint(&self) -> BigInt {
        BigInt::from(self.0.clone())
    }

    /// Converts a signed integer back to an amount; `None` when negative.
    #[must_use]
    pub fn from_bigint(value: &BigInt) -> Option<Self> {
        value.to_biguint().map(Self)
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl From<BigUint> for Amount {
    fn from(value: BigUint) -> Self {
        Self(value)
    }
}

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // BigUint alone would accept a leading '+' and '_' separators.
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseAmountError(s.to_string()));
        }
        s.parse::<BigUint>()
            .map(Self)
            .map_err(|_| ParseAmountError(s.to_string()))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl<'a> Add<&'a Amount> for Amount {
    type Output = Self;

    fn add(self, rhs: &'a Amount) -> Self {
        Self(self.0 + &rhs.0)
    }
}

impl AddAssign<&Amount> for Amount {
    fn add_assign(&mut self, rhs: &Amount) {
        self.0 += &rhs.0;
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::zero(), Add::add)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(AmountVisitor)
    }
}

struct AmountVisitor;

impl Visitor<'_> for AmountVisitor {
    type Value = Amount;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative integer or a string of decimal digits")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
        Ok(Amount::from(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
        u64::try_from(v)
            .map(Amount::from)
            .map_err(|_| E::custom(format!("amount must not be negative, got {v}")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
        v.parse().map_err(E::custom)
    }
}

/// Serde helpers for signed balances, written as decimal strings.
pub mod signed {
    use std::str::FromStr;

    use num_bigint::BigInt;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes a balance as a string.
    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    /// Deserializes a balance from a string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let raw = String::deserialize(deserializer)?;
        BigInt::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_huge_amounts_survive_json() {
        let raw = "123456789012345678901234567890123456789";
        let amount: Amount = raw.parse().unwrap();
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, format!("\"{raw}\""));
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn test_accepts_json_numbers() {
        let amount: Amount = serde_json::from_str("100").unwrap();
        assert_eq!(amount, Amount::from(100));
    }

    #[rstest]
    #[case("-5")]
    #[case("+5")]
    #[case("1_000")]
    #[case("")]
    #[case("1.5")]
    fn test_rejects_malformed(#[case] raw: &str) {
        assert!(raw.parse::<Amount>().is_err());
    }

    #[test]
    fn test_rejects_negative_number() {
        assert!(serde_json::from_str::<Amount>("-1").is_err());
    }

    #[test]
    fn test_sum_and_signed_view() {
        let total: Amount = [Amount::from(40), Amount::from(2)].into_iter().sum();
        assert_eq!(total, Amount::from(42));
        assert_eq!(total.to_bigint(), BigInt::from(42));
        assert!(Amount::from_bigint(&BigInt::from(-1)).is_none());
        assert!(Amount::zero().is_zero());
    }
}
