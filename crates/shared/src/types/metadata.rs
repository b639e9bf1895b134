//! Metadata maps attached to transactions, accounts and ledgers.

use std::collections::BTreeMap;

/// String to string map.
///
/// Ordered so that its serialized form is canonical, which hashing and
/// request fingerprinting rely on.
pub type Metadata = BTreeMap<String, String>;
