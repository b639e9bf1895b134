//! `SeaORM` Entity for transactions table.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub ledger: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub postings: Json,
    pub metadata: Json,
    pub timestamp: DateTimeWithTimeZone,
    pub inserted_at: DateTimeWithTimeZone,
    pub reference: Option<String>,
    pub reverted_at: Option<DateTimeWithTimeZone>,
    pub post_commit_volumes: Option<Json>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
