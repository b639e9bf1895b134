//! Metadata history.
//!
//! One row per change of an account's or transaction's metadata, holding the
//! full metadata after the change. Rows are written by the commit that made
//! the change, only on ledgers with the matching history feature.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared(METADATA_HISTORY_SQL).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let db = manager.get_connection();
        db.execute_unprepared(
            "DROP TABLE IF EXISTS transaction_metadata_history; \
             DROP TABLE IF EXISTS account_metadata_history;",
        )
        .await?;
        Ok(())
    }
}

const METADATA_HISTORY_SQL: &str = r"
CREATE TABLE account_metadata_history (
    ledger      TEXT NOT NULL,
    address     TEXT NOT NULL,
    revision    BIGINT NOT NULL CHECK (revision > 0),
    metadata    JSONB NOT NULL,
    date        TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (ledger, address, revision)
);

CREATE INDEX idx_account_metadata_history_date
    ON account_metadata_history (ledger, address, date);

CREATE TABLE transaction_metadata_history (
    ledger          TEXT NOT NULL,
    transaction_id  BIGINT NOT NULL,
    revision        BIGINT NOT NULL CHECK (revision > 0),
    metadata        JSONB NOT NULL,
    date            TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (ledger, transaction_id, revision),
    FOREIGN KEY (ledger, transaction_id) REFERENCES transactions (ledger, id)
);

CREATE TRIGGER account_metadata_history_immutable
    BEFORE UPDATE ON account_metadata_history
    FOR EACH ROW EXECUTE FUNCTION reject_mutation();

CREATE TRIGGER transaction_metadata_history_immutable
    BEFORE UPDATE ON transaction_metadata_history
    FOR EACH ROW EXECUTE FUNCTION reject_mutation();
";
