//! Property-based tests for the log hash chain and log blocks.

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use tally_shared::types::{LogId, Metadata};

use super::{verify_block, verify_chain, Log, LogBlock, LogPayload, MetadataTarget};
use crate::error::LedgerError;

/// Strategy for a metadata value.
fn value() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,8}"
}

fn build_chain(values: &[String]) -> Vec<Log> {
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let mut logs: Vec<Log> = Vec::with_capacity(values.len());
    for (i, value) in values.iter().enumerate() {
        let log = Log::chained(
            logs.last(),
            LogPayload::SetMetadata {
                target: MetadataTarget::Account(format!("users:{i}")),
                metadata: Metadata::from([("k".to_string(), value.clone())]),
            },
            start + Duration::seconds(i64::try_from(i).unwrap()),
            None,
        )
        .unwrap();
        logs.push(log);
    }
    logs
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property 1: Chains built by `Log::chained` always verify, and IDs are gapless.
    #[test]
    fn prop_built_chain_verifies(values in prop::collection::vec(value(), 1..40)) {
        let logs = build_chain(&values);
        prop_assert!(verify_chain(None, &logs).is_ok());
        for (i, log) in logs.iter().enumerate() {
            prop_assert_eq!(log.id, LogId(u64::try_from(i).unwrap() + 1));
        }
    }

    /// Property 2: Altering any entry is detected at exactly that entry.
    #[test]
    fn prop_tampering_detected_at_entry(
        values in prop::collection::vec(value(), 1..40),
        at in any::<prop::sample::Index>(),
    ) {
        let mut logs = build_chain(&values);
        let index = at.index(logs.len());
        if let LogPayload::SetMetadata { metadata, .. } = &mut logs[index].payload {
            metadata.insert("k".to_string(), "TAMPERED".to_string());
        }
        prop_assert_eq!(
            verify_chain(None, &logs),
            Err(LedgerError::InvalidHash { log_id: logs[index].id })
        );
    }

    /// Property 3: A block sealed over any slice verifies against that slice
    /// and fails against a tampered copy.
    #[test]
    fn prop_block_covers_members(
        values in prop::collection::vec(value(), 1..40),
        at in any::<prop::sample::Index>(),
    ) {
        let logs = build_chain(&values);
        let block = LogBlock::seal(None, &logs, Utc::now()).unwrap();
        prop_assert!(verify_block(&block, &logs).is_ok());

        let mut tampered = logs.clone();
        let index = at.index(tampered.len());
        tampered[index].hash.0[0] ^= 0xff;
        prop_assert!(verify_block(&block, &tampered).is_err());
    }
}
