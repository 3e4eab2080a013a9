//! Virtual UTXO entity

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "vtxos")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub vtxo_id: String,
    pub txid: String,
    pub vout: i32,
    pub amount_sats: i64,
    pub script_pubkey: String,
    pub asset_id: String,
    /// None while the VTXO sits in the unassigned inventory pool.
    pub user_pubkey: Option<String>,
    /// available | assigned | spent | expired
    pub status: String,
    /// Session currently holding the assignment, if any.
    pub session_id: Option<String>,
    pub created_at: DateTimeUtc,
    pub expires_at: DateTimeUtc,
    pub spending_txid: Option<String>,
    /// Batch id of the L1 commitment that anchored this spend, once settled.
    pub settled_in: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
