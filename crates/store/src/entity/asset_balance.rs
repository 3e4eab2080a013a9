//! Per-identity asset balance entity
//!
//! Unique on (user_pubkey, asset_id); `balance >= reserved_balance >= 0`
//! holds at every commit.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "asset_balances")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_pubkey: String,
    pub asset_id: String,
    pub balance: i64,
    pub reserved_balance: i64,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
