//! Produced/broadcast transaction entity

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub txid: String,
    pub session_id: Option<String>,
    /// ark_tx | checkpoint_tx | settlement_tx
    pub tx_type: String,
    pub raw_tx: Option<String>,
    /// prepared | broadcast | confirmed | failed
    pub status: String,
    pub amount_sats: i64,
    pub fee_sats: i64,
    pub created_at: DateTimeUtc,
    pub confirmed_at: Option<DateTimeUtc>,
    pub block_height: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
