//! Log blocks: sealed, contiguous ranges of log entries.
//!
//! A block commits to its members through a binary SHA-256 Merkle root over
//! their hashes, and to the previous block through its own chained hash. An
//! auditor holding the block chain can check any range of the log without
//! replaying it entry by entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tally_shared::types::{BlockId, LogId};

use super::{Log, LogHash};
use crate::error::LedgerError;

/// A sealed range of log entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBlock {
    /// Per-ledger block sequence number.
    pub id: BlockId,
    /// First member entry.
    pub first_log_id: LogId,
    /// Last member entry.
    pub last_log_id: LogId,
    /// Number of member entries.
    pub entries: u64,
    /// Merkle root of the member hashes.
    pub merkle_root: LogHash,
    /// Hash of the previous block, the seed for the first one.
    pub previous_hash: LogHash,
    /// Hash of this block.
    pub hash: LogHash,
    /// When the block was sealed.
    pub created_at: DateTime<Utc>,
}

fn hash_pair(left: &LogHash, right: &LogHash) -> LogHash {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    LogHash(hasher.finalize().into())
}

/// Merkle root over `leaves`; an odd node is paired with itself.
///
/// The root of an empty list is the seed.
#[must_use]
pub fn merkle_root(leaves: &[LogHash]) -> LogHash {
    if leaves.is_empty() {
        return LogHash::SEED;
    }
    let mut level: Vec<LogHash> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [single] => hash_pair(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }
    level[0]
}

fn block_hash(previous: &LogHash, root: &LogHash, first: LogId, last: LogId) -> LogHash {
    let mut hasher = Sha256::new();
    hasher.update(previous.as_bytes());
    hasher.update(root.as_bytes());
    hasher.update(first.into_inner().to_be_bytes());
    hasher.update(last.into_inner().to_be_bytes());
    LogHash(hasher.finalize().into())
}

impl LogBlock {
    /// Seals `logs` into the block following `previous`.
    ///
    /// `logs` must be non-empty, contiguous, and start right after the last
    /// entry of `previous` (or at the first entry when there is none).
    pub fn seal(
        previous: Option<&LogBlock>,
        logs: &[Log],
        now: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        let (Some(first), Some(last)) = (logs.first(), logs.last()) else {
            return Err(LedgerError::Internal("cannot seal an empty block".into()));
        };
        let expected_first = previous.map_or(LogId::FIRST, |block| block.last_log_id.next());
        if first.id != expected_first {
            return Err(LedgerError::Internal(format!(
                "block must start at log {expected_first}, got {}",
                first.id
            )));
        }
        if logs.windows(2).any(|pair| pair[1].id != pair[0].id.next()) {
            return Err(LedgerError::Internal("block members are not contiguous".into()));
        }

        let leaves: Vec<LogHash> = logs.iter().map(|log| log.hash).collect();
        let root = merkle_root(&leaves);
        let previous_hash = previous.map_or(LogHash::SEED, |block| block.hash);
        Ok(Self {
            id: previous.map_or(BlockId::FIRST, |block| block.id.next()),
            first_log_id: first.id,
            last_log_id: last.id,
            entries: logs.len() as u64,
            merkle_root: root,
            previous_hash,
            hash: block_hash(&previous_hash, &root, first.id, last.id),
            created_at: crate::time::normalize(now),
        })
    }

    /// Whether `id` falls inside this block.
    #[must_use]
    pub fn contains(&self, id: LogId) -> bool {
        self.first_log_id <= id && id <= self.last_log_id
    }
}

/// Checks that `logs` are exactly the members `block` was sealed over.
pub fn verify_block(block: &LogBlock, logs: &[Log]) -> Result<(), LedgerError> {
    let ids_match = logs.first().map(|log| log.id) == Some(block.first_log_id)
        && logs.last().map(|log| log.id) == Some(block.last_log_id)
        && logs.len() as u64 == block.entries;
    if !ids_match {
        return Err(LedgerError::Validation(format!(
            "block {} does not cover the given entries",
            block.id
        )));
    }
    let leaves: Vec<LogHash> = logs.iter().map(|log| log.hash).collect();
    let root = merkle_root(&leaves);
    let hash = block_hash(&block.previous_hash, &root, block.first_log_id, block.last_log_id);
    if root != block.merkle_root || hash != block.hash {
        return Err(LedgerError::InvalidHash {
            log_id: block.first_log_id,
        });
    }
    Ok(())
}

/// Checks the linkage of consecutive blocks, starting from the first block.
pub fn verify_block_chain(blocks: &[LogBlock]) -> Result<(), LedgerError> {
    let mut previous: Option<&LogBlock> = None;
    for block in blocks {
        let expected_previous = previous.map_or(LogHash::SEED, |p| p.hash);
        let expected_first = previous.map_or(LogId::FIRST, |p| p.last_log_id.next());
        let recomputed = block_hash(
            &block.previous_hash,
            &block.merkle_root,
            block.first_log_id,
            block.last_log_id,
        );
        if block.previous_hash != expected_previous
            || block.first_log_id != expected_first
            || recomputed != block.hash
        {
            return Err(LedgerError::InvalidHash {
                log_id: block.first_log_id,
            });
        }
        previous = Some(block);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogPayload, MetadataTarget};

    fn chain(len: usize) -> Vec<Log> {
        let mut logs: Vec<Log> = Vec::new();
        for i in 0..len {
            let log = Log::chained(
                logs.last(),
                LogPayload::DeleteMetadata {
                    target: MetadataTarget::Account("alice".into()),
                    key: format!("k{i}"),
                },
                Utc::now(),
                None,
            )
            .unwrap();
            logs.push(log);
        }
        logs
    }

    #[test]
    fn test_merkle_root_of_single_leaf_pairs_with_itself() {
        let leaf = LogHash([7; 32]);
        assert_eq!(merkle_root(&[leaf]), leaf);
        assert_eq!(merkle_root(&[leaf, leaf]), hash_pair(&leaf, &leaf));
        assert_eq!(
            merkle_root(&[leaf, leaf, leaf]),
            hash_pair(&hash_pair(&leaf, &leaf), &hash_pair(&leaf, &leaf))
        );
        assert_eq!(merkle_root(&[]), LogHash::SEED);
    }

    #[test]
    fn test_consecutive_blocks_chain() {
        let logs = chain(7);
        let first = LogBlock::seal(None, &logs[..4], Utc::now()).unwrap();
        let second = LogBlock::seal(Some(&first), &logs[4..], Utc::now()).unwrap();
        assert_eq!(first.id, BlockId(1));
        assert_eq!(second.id, BlockId(2));
        assert_eq!(second.first_log_id, LogId(5));
        assert_eq!(second.previous_hash, first.hash);
        assert!(verify_block(&second, &logs[4..]).is_ok());
        assert!(verify_block_chain(&[first.clone(), second.clone()]).is_ok());
        assert!(verify_block_chain(&[second]).is_err());
        assert!(first.contains(LogId(4)));
        assert!(!first.contains(LogId(5)));
    }

    #[test]
    fn test_seal_rejects_gaps() {
        let logs = chain(4);
        assert!(LogBlock::seal(None, &logs[1..], Utc::now()).is_err());
        assert!(LogBlock::seal(None, &[], Utc::now()).is_err());
        let gapped = vec![logs[0].clone(), logs[2].clone()];
        assert!(LogBlock::seal(None, &gapped, Utc::now()).is_err());
    }
}
