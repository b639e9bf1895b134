//! Conversions between entity models and domain types.

use chrono::{DateTime, Utc};
use num_bigint::BigInt;
use sea_orm::prelude::{DateTimeWithTimeZone, Json};
use sea_orm::ActiveValue::Set;
use tally_core::idempotency::IdempotencyRecord;
use tally_core::ledger::{Features, Ledger};
use tally_core::log::{Log, LogBlock, LogHash, MetadataTarget};
use tally_core::transaction::{Account, MetadataRevision, Transaction};
use tally_core::volumes::VolumesByAsset;
use tally_core::LedgerError;
use tally_shared::types::{Amount, BlockId, LogId, Metadata, TransactionId};

use crate::entities::{
    account_metadata_history, accounts, idempotency_keys, ledgers, log_blocks, logs,
    transaction_metadata_history, transactions,
};

pub(crate) fn to_db_id(id: u64) -> Result<i64, LedgerError> {
    i64::try_from(id).map_err(|_| LedgerError::Internal(format!("id {id} out of range")))
}

pub(crate) fn from_db_id(id: i64) -> Result<u64, LedgerError> {
    u64::try_from(id).map_err(|_| LedgerError::Internal(format!("negative id {id} in storage")))
}

pub(crate) fn db_time(at: DateTime<Utc>) -> DateTimeWithTimeZone {
    at.fixed_offset()
}

pub(crate) fn utc(at: DateTimeWithTimeZone) -> DateTime<Utc> {
    at.with_timezone(&Utc)
}

pub(crate) fn parse_amount(raw: &str) -> Result<Amount, LedgerError> {
    raw.parse()
        .map_err(|_| LedgerError::Internal(format!("invalid amount {raw:?} in storage")))
}

pub(crate) fn parse_bigint(raw: &str) -> Result<BigInt, LedgerError> {
    raw.parse()
        .map_err(|_| LedgerError::Internal(format!("invalid balance {raw:?} in storage")))
}

fn hash(bytes: &[u8]) -> Result<LogHash, LedgerError> {
    LogHash::from_slice(bytes).map_err(LedgerError::Internal)
}

fn metadata(value: Json) -> Result<Metadata, LedgerError> {
    Ok(serde_json::from_value(value)?)
}

pub(crate) fn metadata_json(metadata: &Metadata) -> Result<Json, LedgerError> {
    Ok(serde_json::to_value(metadata)?)
}

pub(crate) fn ledger_from(model: ledgers::Model) -> Result<Ledger, LedgerError> {
    Ok(Ledger {
        name: model.name,
        bucket: model.bucket,
        features: serde_json::from_value::<Features>(model.features)?,
        metadata: metadata(model.metadata)?,
        created_at: utc(model.created_at),
        deleted_at: model.deleted_at.map(utc),
    })
}

pub(crate) fn ledger_model(ledger: &Ledger) -> Result<ledgers::ActiveModel, LedgerError> {
    Ok(ledgers::ActiveModel {
        name: Set(ledger.name.clone()),
        bucket: Set(ledger.bucket.clone()),
        features: Set(serde_json::to_value(&ledger.features)?),
        metadata: Set(metadata_json(&ledger.metadata)?),
        created_at: Set(db_time(ledger.created_at)),
        deleted_at: Set(ledger.deleted_at.map(db_time)),
    })
}

/// Transaction as stored: insertion volumes only.
pub(crate) fn transaction_from(model: transactions::Model) -> Result<Transaction, LedgerError> {
    Ok(Transaction {
        id: TransactionId(from_db_id(model.id)?),
        postings: serde_json::from_value(model.postings)?,
        metadata: metadata(model.metadata)?,
        timestamp: utc(model.timestamp),
        inserted_at: utc(model.inserted_at),
        reference: model.reference,
        reverted_at: model.reverted_at.map(utc),
        post_commit_volumes: model
            .post_commit_volumes
            .map(serde_json::from_value)
            .transpose()?,
        post_commit_effective_volumes: None,
    })
}

pub(crate) fn transaction_model(
    ledger: &str,
    transaction: &Transaction,
) -> Result<transactions::ActiveModel, LedgerError> {
    Ok(transactions::ActiveModel {
        ledger: Set(ledger.to_string()),
        id: Set(to_db_id(transaction.id.into_inner())?),
        postings: Set(serde_json::to_value(&transaction.postings)?),
        metadata: Set(metadata_json(&transaction.metadata)?),
        timestamp: Set(db_time(transaction.timestamp)),
        inserted_at: Set(db_time(transaction.inserted_at)),
        reference: Set(transaction.reference.clone()),
        reverted_at: Set(transaction.reverted_at.map(db_time)),
        post_commit_volumes: Set(transaction
            .post_commit_volumes
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?),
    })
}

pub(crate) fn account_from(
    model: accounts::Model,
    volumes: VolumesByAsset,
) -> Result<Account, LedgerError> {
    Ok(Account {
        address: model.address,
        metadata: metadata(model.metadata)?,
        first_usage: utc(model.first_usage),
        inserted_at: utc(model.inserted_at),
        updated_at: utc(model.updated_at),
        volumes,
    })
}

pub(crate) fn account_revision_from(
    model: account_metadata_history::Model,
) -> Result<MetadataRevision, LedgerError> {
    Ok(MetadataRevision {
        target: MetadataTarget::Account(model.address),
        revision: from_db_id(model.revision)?,
        metadata: metadata(model.metadata)?,
        date: utc(model.date),
    })
}

pub(crate) fn transaction_revision_from(
    model: transaction_metadata_history::Model,
) -> Result<MetadataRevision, LedgerError> {
    Ok(MetadataRevision {
        target: MetadataTarget::Transaction(TransactionId(from_db_id(model.transaction_id)?)),
        revision: from_db_id(model.revision)?,
        metadata: metadata(model.metadata)?,
        date: utc(model.date),
    })
}

/// The `type`/`data` columns hold the two halves of the tagged payload.
pub(crate) fn log_from(model: logs::Model) -> Result<Log, LedgerError> {
    let payload = serde_json::from_value(serde_json::json!({
        "type": model.log_type,
        "data": model.data,
    }))?;
    Ok(Log {
        id: LogId(from_db_id(model.id)?),
        payload,
        date: utc(model.date),
        idempotency_key: model.idempotency_key,
        hash: hash(&model.hash)?,
    })
}

pub(crate) fn log_model(ledger: &str, log: &Log) -> Result<logs::ActiveModel, LedgerError> {
    let mut tagged = serde_json::to_value(&log.payload)?;
    let data = tagged
        .get_mut("data")
        .map(Json::take)
        .ok_or_else(|| LedgerError::Internal("log payload without data".into()))?;
    Ok(logs::ActiveModel {
        ledger: Set(ledger.to_string()),
        id: Set(to_db_id(log.id.into_inner())?),
        log_type: Set(log.log_type().as_str().to_string()),
        data: Set(data),
        date: Set(db_time(log.date)),
        idempotency_key: Set(log.idempotency_key.clone()),
        hash: Set(log.hash.as_bytes().to_vec()),
    })
}

pub(crate) fn block_from(model: log_blocks::Model) -> Result<LogBlock, LedgerError> {
    Ok(LogBlock {
        id: BlockId(from_db_id(model.id)?),
        first_log_id: LogId(from_db_id(model.first_log_id)?),
        last_log_id: LogId(from_db_id(model.last_log_id)?),
        entries: from_db_id(model.entries)?,
        merkle_root: hash(&model.merkle_root)?,
        previous_hash: hash(&model.previous_hash)?,
        hash: hash(&model.hash)?,
        created_at: utc(model.created_at),
    })
}

pub(crate) fn block_model(
    ledger: &str,
    block: &LogBlock,
) -> Result<log_blocks::ActiveModel, LedgerError> {
    Ok(log_blocks::ActiveModel {
        ledger: Set(ledger.to_string()),
        id: Set(to_db_id(block.id.into_inner())?),
        first_log_id: Set(to_db_id(block.first_log_id.into_inner())?),
        last_log_id: Set(to_db_id(block.last_log_id.into_inner())?),
        entries: Set(to_db_id(block.entries)?),
        merkle_root: Set(block.merkle_root.as_bytes().to_vec()),
        previous_hash: Set(block.previous_hash.as_bytes().to_vec()),
        hash: Set(block.hash.as_bytes().to_vec()),
        created_at: Set(db_time(block.created_at)),
    })
}

pub(crate) fn idempotency_from(
    model: idempotency_keys::Model,
) -> Result<IdempotencyRecord, LedgerError> {
    Ok(IdempotencyRecord {
        key: model.key,
        scope: model.scope,
        fingerprint: model.fingerprint,
        response: model.response,
        log_id: model.log_id.map(from_db_id).transpose()?.map(LogId),
        created_at: utc(model.created_at),
    })
}

pub(crate) fn idempotency_model(
    ledger: &str,
    record: &IdempotencyRecord,
) -> Result<idempotency_keys::ActiveModel, LedgerError> {
    Ok(idempotency_keys::ActiveModel {
        ledger: Set(ledger.to_string()),
        scope: Set(record.scope.clone()),
        key: Set(record.key.clone()),
        fingerprint: Set(record.fingerprint.clone()),
        response: Set(record.response.clone()),
        log_id: Set(record
            .log_id
            .map(|id| to_db_id(id.into_inner()))
            .transpose()?),
        created_at: Set(db_time(record.created_at)),
    })
}
