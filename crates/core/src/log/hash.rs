//! Canonical encoding and hash chain of log entries.
//!
//! `hash(n) = SHA-256(hash(n-1) ‖ canonical(n))`, with a zero seed before the
//! first entry. The canonical form is an explicit, versioned JSON document:
//! fixed field order, sorted metadata, amounts as decimal strings, timestamps
//! as RFC 3339 with microseconds. Volume snapshots and the mutable
//! `reverted_at` flag are not part of it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use tally_shared::types::{LogId, Metadata, TransactionId};

use super::{Log, LogPayload, LogType, MetadataTarget};
use crate::error::LedgerError;
use crate::posting::Postings;
use crate::transaction::Transaction;

/// Version of the canonical encoding.
pub const CANONICAL_VERSION: u8 = 1;

/// A SHA-256 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LogHash(pub [u8; 32]);

impl LogHash {
    /// Value chained before the first entry.
    pub const SEED: Self = Self([0u8; 32]);

    /// Raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lower-case hexadecimal form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses the hexadecimal form.
    pub fn from_hex(raw: &str) -> Result<Self, String> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(raw, &mut bytes)
            .map_err(|e| format!("invalid log hash {raw:?}: {e}"))?;
        Ok(Self(bytes))
    }

    /// Builds a hash from a byte slice, which must be 32 bytes long.
    pub fn from_slice(raw: &[u8]) -> Result<Self, String> {
        <[u8; 32]>::try_from(raw)
            .map(Self)
            .map_err(|_| format!("expected 32 bytes, got {}", raw.len()))
    }
}

impl fmt::Debug for LogHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogHash({})", self.to_hex())
    }
}

impl fmt::Display for LogHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for LogHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for LogHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Serialize)]
struct CanonicalTransaction<'a> {
    id: TransactionId,
    postings: &'a Postings,
    metadata: &'a Metadata,
    timestamp: String,
    inserted_at: String,
    reference: Option<&'a str>,
}

impl<'a> From<&'a Transaction> for CanonicalTransaction<'a> {
    fn from(tx: &'a Transaction) -> Self {
        Self {
            id: tx.id,
            postings: &tx.postings,
            metadata: &tx.metadata,
            timestamp: timestamp(tx.timestamp),
            inserted_at: timestamp(tx.inserted_at),
            reference: tx.reference.as_deref(),
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum CanonicalPayload<'a> {
    NewTransaction {
        transaction: CanonicalTransaction<'a>,
        account_metadata: &'a BTreeMap<String, Metadata>,
    },
    SetMetadata {
        target: &'a MetadataTarget,
        metadata: &'a Metadata,
    },
    DeleteMetadata {
        target: &'a MetadataTarget,
        key: &'a str,
    },
    RevertedTransaction {
        reverted_transaction_id: TransactionId,
        transaction: CanonicalTransaction<'a>,
    },
}

impl<'a> From<&'a LogPayload> for CanonicalPayload<'a> {
    fn from(payload: &'a LogPayload) -> Self {
        match payload {
            LogPayload::NewTransaction {
                transaction,
                account_metadata,
            } => Self::NewTransaction {
                transaction: transaction.into(),
                account_metadata,
            },
            LogPayload::SetMetadata { target, metadata } => Self::SetMetadata { target, metadata },
            LogPayload::DeleteMetadata { target, key } => Self::DeleteMetadata { target, key },
            LogPayload::RevertedTransaction {
                reverted_transaction_id,
                transaction,
            } => Self::RevertedTransaction {
                reverted_transaction_id: *reverted_transaction_id,
                transaction: transaction.into(),
            },
        }
    }
}

#[derive(Serialize)]
struct CanonicalLog<'a> {
    version: u8,
    id: LogId,
    #[serde(rename = "type")]
    log_type: LogType,
    data: CanonicalPayload<'a>,
    date: String,
    idempotency_key: Option<&'a str>,
}

/// Canonical bytes of an entry, excluding its hash.
pub fn canonical_bytes(log: &Log) -> Result<Vec<u8>, LedgerError> {
    let canonical = CanonicalLog {
        version: CANONICAL_VERSION,
        id: log.id,
        log_type: log.log_type(),
        data: (&log.payload).into(),
        date: timestamp(log.date),
        idempotency_key: log.idempotency_key.as_deref(),
    };
    Ok(serde_json::to_vec(&canonical)?)
}

/// Hash of `log` chained onto `previous` (the seed when `None`).
pub fn chain_hash(previous: Option<&LogHash>, log: &Log) -> Result<LogHash, LedgerError> {
    let mut hasher = Sha256::new();
    hasher.update(previous.unwrap_or(&LogHash::SEED).as_bytes());
    hasher.update(canonical_bytes(log)?);
    Ok(LogHash(hasher.finalize().into()))
}

/// Recomputes the chain over `logs`, which must follow `previous`.
///
/// Checks that IDs are gapless and that every stored hash matches.
pub fn verify_chain(previous: Option<&Log>, logs: &[Log]) -> Result<(), LedgerError> {
    let mut expected_id = previous.map_or(LogId::FIRST, |log| log.id.next());
    let mut previous_hash = previous.map(|log| log.hash);
    for log in logs {
        if log.id != expected_id {
            return Err(LedgerError::Import(format!(
                "log {} out of sequence, expected {expected_id}",
                log.id
            )));
        }
        if chain_hash(previous_hash.as_ref(), log)? != log.hash {
            return Err(LedgerError::InvalidHash { log_id: log.id });
        }
        previous_hash = Some(log.hash);
        expected_id = expected_id.next();
    }
    Ok(())
}
