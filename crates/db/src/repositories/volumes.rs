//! Volume reads and writes in raw SQL.
//!
//! Amounts travel as text in both directions and are cast to and from
//! `NUMERIC` by the server, so no precision is lost on either side.

use chrono::{DateTime, Utc};
use sea_orm::{ConnectionTrait, DbBackend, FromQueryResult, Statement, Value};
use tally_core::store::{AddressFilter, Balances, VolumePairs};
use tally_core::volumes::{AccountVolumes, Move, TimeAxis, Volumes};
use tally_core::LedgerError;
use tally_shared::types::TransactionId;

use super::rows::{db_time, parse_amount, parse_bigint, to_db_id};
use crate::error::db_err;

/// Positional SQL under construction.
#[derive(Debug, Default)]
pub(crate) struct Sql {
    text: String,
    values: Vec<Value>,
}

impl Sql {
    pub(crate) fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            values: Vec::new(),
        }
    }

    /// Binds a value and returns its placeholder.
    pub(crate) fn bind(&mut self, value: impl Into<Value>) -> String {
        self.values.push(value.into());
        format!("${}", self.values.len())
    }

    pub(crate) fn push(&mut self, text: &str) -> &mut Self {
        self.text.push_str(text);
        self
    }

    pub(crate) fn statement(self) -> Statement {
        Statement::from_sql_and_values(DbBackend::Postgres, self.text, self.values)
    }
}

/// Which moves a projection folds.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MoveBound {
    /// Moves dated at or before `at`.
    EffectiveAt(DateTime<Utc>),
    /// Moves up to and including `(at, id)` in business order.
    EffectiveThrough(DateTime<Utc>, TransactionId),
    /// Moves committed at or before `at`.
    InsertedAt(DateTime<Utc>),
}

impl MoveBound {
    pub(crate) fn at(pit: DateTime<Utc>, axis: TimeAxis) -> Self {
        match axis {
            TimeAxis::Effective => Self::EffectiveAt(pit),
            TimeAxis::Insertion => Self::InsertedAt(pit),
        }
    }

    fn push(self, sql: &mut Sql) -> Result<(), LedgerError> {
        match self {
            Self::EffectiveAt(at) => {
                let at = sql.bind(db_time(at));
                sql.push(&format!(" AND effective_date <= {at}"));
            }
            Self::EffectiveThrough(at, id) => {
                let at = sql.bind(db_time(at));
                let id = sql.bind(to_db_id(id.into_inner())?);
                sql.push(&format!(" AND (effective_date, transaction_id) <= ({at}, {id})"));
            }
            Self::InsertedAt(at) => {
                let at = sql.bind(db_time(at));
                sql.push(&format!(" AND inserted_at <= {at}"));
            }
        }
        Ok(())
    }
}

/// Accounts a volume read covers.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Selection<'a> {
    Pairs(&'a VolumePairs),
    Account(&'a str),
}

impl Selection<'_> {
    fn push(self, sql: &mut Sql) {
        match self {
            Self::Pairs(pairs) => {
                let tuples: Vec<String> = pairs
                    .iter()
                    .map(|(account, asset)| {
                        let account = sql.bind(account.clone());
                        let asset = sql.bind(asset.clone());
                        format!("({account}, {asset})")
                    })
                    .collect();
                sql.push(&format!(" AND (account, asset) IN ({})", tuples.join(", ")));
            }
            Self::Account(address) => {
                let address = sql.bind(address.to_string());
                sql.push(&format!(" AND account = {address}"));
            }
        }
    }

    fn is_empty(self) -> bool {
        matches!(self, Self::Pairs(pairs) if pairs.is_empty())
    }
}

#[derive(Debug, FromQueryResult)]
struct VolumeRow {
    account: String,
    asset: String,
    input: String,
    output: String,
}

#[derive(Debug, FromQueryResult)]
struct BalanceRow {
    asset: String,
    balance: String,
}

async fn fold_rows<C: ConnectionTrait>(
    conn: &C,
    sql: Sql,
) -> Result<AccountVolumes, LedgerError> {
    let rows = VolumeRow::find_by_statement(sql.statement())
        .all(conn)
        .await
        .map_err(db_err)?;
    let mut volumes = AccountVolumes::default();
    for row in rows {
        volumes.set(
            &row.account,
            &row.asset,
            Volumes {
                input: parse_amount(&row.input)?,
                output: parse_amount(&row.output)?,
            },
        );
    }
    Ok(volumes)
}

/// Current insertion volumes.
pub(crate) async fn current_volumes<C: ConnectionTrait>(
    conn: &C,
    ledger: &str,
    selection: Selection<'_>,
) -> Result<AccountVolumes, LedgerError> {
    if selection.is_empty() {
        return Ok(AccountVolumes::default());
    }
    let mut sql = Sql::new(
        "SELECT account, asset, input::text AS input, output::text AS output \
         FROM volumes WHERE ledger = ",
    );
    let ledger = sql.bind(ledger.to_string());
    sql.push(&ledger);
    selection.push(&mut sql);
    fold_rows(conn, sql).await
}

/// Volumes rebuilt from moves within `bound`.
pub(crate) async fn volumes_from_moves<C: ConnectionTrait>(
    conn: &C,
    ledger: &str,
    selection: Selection<'_>,
    bound: MoveBound,
) -> Result<AccountVolumes, LedgerError> {
    if selection.is_empty() {
        return Ok(AccountVolumes::default());
    }
    let mut sql = Sql::new(
        "SELECT account, asset, \
         COALESCE(SUM(amount) FILTER (WHERE NOT is_source), 0)::text AS input, \
         COALESCE(SUM(amount) FILTER (WHERE is_source), 0)::text AS output \
         FROM moves WHERE ledger = ",
    );
    let ledger = sql.bind(ledger.to_string());
    sql.push(&ledger);
    selection.push(&mut sql);
    bound.push(&mut sql)?;
    sql.push(" GROUP BY account, asset");
    fold_rows(conn, sql).await
}

fn push_filter(sql: &mut Sql, filter: &AddressFilter) {
    match filter {
        AddressFilter::Exact(addresses) => {
            let placeholders: Vec<String> = addresses
                .iter()
                .map(|address| sql.bind(address.clone()))
                .collect();
            sql.push(&format!(" AND account IN ({})", placeholders.join(", ")));
        }
        AddressFilter::Prefix(prefix) => {
            let prefix = sql.bind(prefix.clone());
            sql.push(&format!(" AND starts_with(account, {prefix})"));
        }
    }
}

/// Balances per asset over the selected accounts.
pub(crate) async fn balances<C: ConnectionTrait>(
    conn: &C,
    ledger: &str,
    filter: &AddressFilter,
    bound: Option<MoveBound>,
) -> Result<Balances, LedgerError> {
    if matches!(filter, AddressFilter::Exact(addresses) if addresses.is_empty()) {
        return Ok(Balances::new());
    }
    let mut sql = match bound {
        None => Sql::new(
            "SELECT asset, SUM(input - output)::text AS balance FROM volumes WHERE ledger = ",
        ),
        Some(_) => Sql::new(
            "SELECT asset, \
             SUM(CASE WHEN is_source THEN -amount ELSE amount END)::text AS balance \
             FROM moves WHERE ledger = ",
        ),
    };
    let ledger = sql.bind(ledger.to_string());
    sql.push(&ledger);
    push_filter(&mut sql, filter);
    if let Some(bound) = bound {
        bound.push(&mut sql)?;
    }
    sql.push(" GROUP BY asset");

    let rows = BalanceRow::find_by_statement(sql.statement())
        .all(conn)
        .await
        .map_err(db_err)?;
    rows.into_iter()
        .map(|row| Ok((row.asset, parse_bigint(&row.balance)?)))
        .collect()
}

/// Adds counters to the insertion volumes, creating missing rows.
pub(crate) async fn apply_deltas<C: ConnectionTrait>(
    conn: &C,
    ledger: &str,
    deltas: &AccountVolumes,
) -> Result<(), LedgerError> {
    for (account, asset, delta) in deltas.iter() {
        let mut sql = Sql::new("INSERT INTO volumes (ledger, account, asset, input, output) VALUES (");
        let values = [
            sql.bind(ledger.to_string()),
            sql.bind(account.to_string()),
            sql.bind(asset.to_string()),
            format!("{}::numeric", sql.bind(delta.input.to_string())),
            format!("{}::numeric", sql.bind(delta.output.to_string())),
        ];
        sql.push(&values.join(", ")).push(
            ") ON CONFLICT (ledger, account, asset) DO UPDATE SET \
             input = volumes.input + EXCLUDED.input, \
             output = volumes.output + EXCLUDED.output",
        );
        conn.execute(sql.statement()).await.map_err(db_err)?;
    }
    Ok(())
}

/// Inserts moves in one statement.
pub(crate) async fn insert_moves<C: ConnectionTrait>(
    conn: &C,
    ledger: &str,
    moves: &[Move],
) -> Result<(), LedgerError> {
    if moves.is_empty() {
        return Ok(());
    }
    let mut sql = Sql::new(
        "INSERT INTO moves (ledger, transaction_id, posting_index, account, asset, amount, \
         is_source, effective_date, inserted_at) VALUES ",
    );
    let mut rows = Vec::with_capacity(moves.len());
    for mv in moves {
        let values = [
            sql.bind(ledger.to_string()),
            sql.bind(to_db_id(mv.transaction_id.into_inner())?),
            sql.bind(i64::from(mv.posting_index)),
            sql.bind(mv.account.clone()),
            sql.bind(mv.asset.clone()),
            format!("{}::numeric", sql.bind(mv.amount.to_string())),
            sql.bind(mv.is_source),
            sql.bind(db_time(mv.effective_date)),
            sql.bind(db_time(mv.inserted_at)),
        ];
        rows.push(format!("({})", values.join(", ")));
    }
    sql.push(&rows.join(", "));
    conn.execute(sql.statement()).await.map_err(db_err)?;
    Ok(())
}
