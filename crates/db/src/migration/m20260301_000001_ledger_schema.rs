//! Ledger schema.
//!
//! Every table is keyed by ledger name first. Amounts are unbounded integers
//! stored as `NUMERIC` with no scale; timestamps are `TIMESTAMPTZ`, whose
//! microsecond precision matches the normalization applied before hashing.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();

        // ============================================================
        // PART 1: LEDGER REGISTRY
        // ============================================================
        db.execute_unprepared(LEDGERS_SQL).await?;

        // ============================================================
        // PART 2: ACCOUNTS & VOLUMES
        // ============================================================
        db.execute_unprepared(ACCOUNTS_SQL).await?;
        db.execute_unprepared(VOLUMES_SQL).await?;

        // ============================================================
        // PART 3: TRANSACTIONS & MOVES
        // ============================================================
        db.execute_unprepared(TRANSACTIONS_SQL).await?;
        db.execute_unprepared(MOVES_SQL).await?;

        // ============================================================
        // PART 4: LOG, BLOCKS, IDEMPOTENCY
        // ============================================================
        db.execute_unprepared(LOGS_SQL).await?;
        db.execute_unprepared(LOG_BLOCKS_SQL).await?;
        db.execute_unprepared(IDEMPOTENCY_KEYS_SQL).await?;

        // ============================================================
        // PART 5: APPEND-ONLY GUARDS
        // ============================================================
        db.execute_unprepared(IMMUTABILITY_SQL).await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared(DROP_ALL_SQL).await?;
        Ok(())
    }
}

const LEDGERS_SQL: &str = r"
CREATE TABLE ledgers (
    name        TEXT PRIMARY KEY,
    bucket      TEXT NOT NULL,
    features    JSONB NOT NULL DEFAULT '{}'::jsonb,
    metadata    JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at  TIMESTAMPTZ NOT NULL,
    deleted_at  TIMESTAMPTZ
);

CREATE INDEX idx_ledgers_bucket ON ledgers (bucket);
CREATE INDEX idx_ledgers_deleted_at ON ledgers (deleted_at) WHERE deleted_at IS NOT NULL;
";

const ACCOUNTS_SQL: &str = r"
CREATE TABLE accounts (
    ledger      TEXT NOT NULL,
    address     TEXT NOT NULL,
    metadata    JSONB NOT NULL DEFAULT '{}'::jsonb,
    first_usage TIMESTAMPTZ NOT NULL,
    inserted_at TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (ledger, address)
);

CREATE INDEX idx_accounts_address_prefix ON accounts (ledger, address text_pattern_ops);
";

const VOLUMES_SQL: &str = r"
CREATE TABLE volumes (
    ledger      TEXT NOT NULL,
    account     TEXT NOT NULL,
    asset       TEXT NOT NULL,
    input       NUMERIC NOT NULL DEFAULT 0 CHECK (input >= 0),
    output      NUMERIC NOT NULL DEFAULT 0 CHECK (output >= 0),
    PRIMARY KEY (ledger, account, asset)
);
";

const TRANSACTIONS_SQL: &str = r"
CREATE TABLE transactions (
    ledger              TEXT NOT NULL,
    id                  BIGINT NOT NULL,
    postings            JSONB NOT NULL,
    metadata            JSONB NOT NULL DEFAULT '{}'::jsonb,
    timestamp           TIMESTAMPTZ NOT NULL,
    inserted_at         TIMESTAMPTZ NOT NULL,
    reference           TEXT,
    reverted_at         TIMESTAMPTZ,
    post_commit_volumes JSONB,
    PRIMARY KEY (ledger, id)
);

CREATE UNIQUE INDEX idx_transactions_reference
    ON transactions (ledger, reference) WHERE reference IS NOT NULL;
CREATE INDEX idx_transactions_timestamp ON transactions (ledger, timestamp);
";

const MOVES_SQL: &str = r"
CREATE TABLE moves (
    seq             BIGSERIAL PRIMARY KEY,
    ledger          TEXT NOT NULL,
    transaction_id  BIGINT NOT NULL,
    posting_index   INTEGER NOT NULL,
    account         TEXT NOT NULL,
    asset           TEXT NOT NULL,
    amount          NUMERIC NOT NULL CHECK (amount >= 0),
    is_source       BOOLEAN NOT NULL,
    effective_date  TIMESTAMPTZ NOT NULL,
    inserted_at     TIMESTAMPTZ NOT NULL,
    FOREIGN KEY (ledger, transaction_id) REFERENCES transactions (ledger, id)
);

CREATE INDEX idx_moves_effective
    ON moves (ledger, account, asset, effective_date, transaction_id);
CREATE INDEX idx_moves_inserted ON moves (ledger, account, asset, inserted_at);
CREATE INDEX idx_moves_ledger_effective ON moves (ledger, effective_date DESC);
";

const LOGS_SQL: &str = r"
CREATE TABLE logs (
    ledger          TEXT NOT NULL,
    id              BIGINT NOT NULL,
    type            TEXT NOT NULL CHECK (type IN (
                        'NEW_TRANSACTION', 'SET_METADATA',
                        'DELETE_METADATA', 'REVERTED_TRANSACTION')),
    data            JSONB NOT NULL,
    date            TIMESTAMPTZ NOT NULL,
    idempotency_key TEXT,
    hash            BYTEA NOT NULL CHECK (length(hash) = 32),
    PRIMARY KEY (ledger, id)
);
";

const LOG_BLOCKS_SQL: &str = r"
CREATE TABLE log_blocks (
    ledger          TEXT NOT NULL,
    id              BIGINT NOT NULL,
    first_log_id    BIGINT NOT NULL,
    last_log_id     BIGINT NOT NULL,
    entries         BIGINT NOT NULL CHECK (entries > 0),
    merkle_root     BYTEA NOT NULL,
    previous_hash   BYTEA NOT NULL,
    hash            BYTEA NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (ledger, id),
    UNIQUE (ledger, first_log_id)
);
";

const IDEMPOTENCY_KEYS_SQL: &str = r"
CREATE TABLE idempotency_keys (
    ledger      TEXT NOT NULL,
    scope       TEXT NOT NULL,
    key         TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    response    JSONB NOT NULL,
    log_id      BIGINT,
    created_at  TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (ledger, scope, key)
);
";

const IMMUTABILITY_SQL: &str = r"
CREATE OR REPLACE FUNCTION reject_mutation() RETURNS trigger AS $$
BEGIN
    RAISE EXCEPTION '% rows are immutable', TG_TABLE_NAME;
END;
$$ LANGUAGE plpgsql;

CREATE TRIGGER logs_immutable
    BEFORE UPDATE ON logs
    FOR EACH ROW EXECUTE FUNCTION reject_mutation();

CREATE TRIGGER log_blocks_immutable
    BEFORE UPDATE ON log_blocks
    FOR EACH ROW EXECUTE FUNCTION reject_mutation();
";

const DROP_ALL_SQL: &str = r"
DROP TABLE IF EXISTS idempotency_keys;
DROP TABLE IF EXISTS log_blocks;
DROP TABLE IF EXISTS logs;
DROP TABLE IF EXISTS moves;
DROP TABLE IF EXISTS transactions;
DROP TABLE IF EXISTS volumes;
DROP TABLE IF EXISTS accounts;
DROP TABLE IF EXISTS ledgers;
DROP FUNCTION IF EXISTS reject_mutation();
";
