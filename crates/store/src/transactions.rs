//! Broadcastable transaction records and L1 commitment bookkeeping.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
};

use crate::entity::l1_commitment;
use crate::entity::transaction::{ActiveModel, Column, Entity, Model};
use crate::error::{Result, StoreError};
use crate::types::{TxStatus, TxType};

pub struct NewTransaction {
    pub txid: String,
    pub session_id: Option<String>,
    pub tx_type: TxType,
    pub raw_tx: Option<String>,
    pub status: TxStatus,
    pub amount_sats: i64,
    pub fee_sats: i64,
}

pub async fn insert<C: ConnectionTrait>(db: &C, new: NewTransaction) -> Result<Model> {
    let row = ActiveModel {
        txid: Set(new.txid),
        session_id: Set(new.session_id),
        tx_type: Set(new.tx_type.as_str().to_string()),
        raw_tx: Set(new.raw_tx),
        status: Set(new.status.as_str().to_string()),
        amount_sats: Set(new.amount_sats),
        fee_sats: Set(new.fee_sats),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    Ok(row.insert(db).await?)
}

pub async fn find_by_txid<C: ConnectionTrait>(db: &C, txid: &str) -> Result<Option<Model>> {
    Ok(Entity::find().filter(Column::Txid.eq(txid)).one(db).await?)
}

pub async fn find_for_session<C: ConnectionTrait>(
    db: &C,
    session_id: &str,
) -> Result<Vec<Model>> {
    Ok(Entity::find()
        .filter(Column::SessionId.eq(session_id))
        .all(db)
        .await?)
}

/// Guarded status move; false when the transaction was not in `expected`.
pub async fn transition<C: ConnectionTrait>(
    db: &C,
    txid: &str,
    expected: &[TxStatus],
    next: TxStatus,
    error_message: Option<&str>,
) -> Result<bool> {
    let expected: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
    let mut update = Entity::update_many()
        .col_expr(Column::Status, Expr::value(next.as_str()))
        .filter(Column::Txid.eq(txid))
        .filter(Column::Status.is_in(expected));
    if let Some(message) = error_message {
        update = update.col_expr(Column::ErrorMessage, Expr::value(message));
    }
    let result = update.exec(db).await?;
    Ok(result.rows_affected == 1)
}

pub async fn mark_confirmed<C: ConnectionTrait>(
    db: &C,
    txid: &str,
    block_height: Option<i64>,
    confirmed_at: DateTime<Utc>,
) -> Result<bool> {
    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value(TxStatus::Confirmed.as_str()))
        .col_expr(Column::ConfirmedAt, Expr::value(confirmed_at))
        .col_expr(Column::BlockHeight, Expr::value(block_height))
        .filter(Column::Txid.eq(txid))
        .filter(Column::Status.eq(TxStatus::Broadcast.as_str()))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Transactions of one type currently in `status`, oldest first.
pub async fn list_by_type_status<C: ConnectionTrait>(
    db: &C,
    tx_type: TxType,
    status: TxStatus,
    limit: u64,
) -> Result<Vec<Model>> {
    use sea_orm::{QueryOrder, QuerySelect};
    Ok(Entity::find()
        .filter(Column::TxType.eq(tx_type.as_str()))
        .filter(Column::Status.eq(status.as_str()))
        .order_by_asc(Column::CreatedAt)
        .limit(limit)
        .all(db)
        .await?)
}

pub struct NewCommitment {
    pub batch_id: String,
    pub l1_txid: String,
    pub merkle_root: String,
    pub asset_id: String,
    pub vtxo_count: i32,
    pub block_height: Option<i64>,
}

pub async fn insert_commitment<C: ConnectionTrait>(
    db: &C,
    new: NewCommitment,
) -> Result<l1_commitment::Model> {
    let row = l1_commitment::ActiveModel {
        batch_id: Set(new.batch_id),
        l1_txid: Set(new.l1_txid),
        merkle_root: Set(new.merkle_root),
        asset_id: Set(new.asset_id),
        vtxo_count: Set(new.vtxo_count),
        block_height: Set(new.block_height),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    row.insert(db).await.map_err(StoreError::from)
}
