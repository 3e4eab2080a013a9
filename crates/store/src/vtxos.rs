//! VTXO inventory records.
//!
//! Status writes are guarded by the expected current status, which together
//! with row locks in the assignment path keeps every VTXO transition
//! linearizable and monotone.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};

use crate::entity::vtxo::{ActiveModel, Column, Entity, Model};
use crate::error::Result;
use crate::types::VtxoStatus;

pub struct NewVtxo {
    pub vtxo_id: String,
    pub txid: String,
    pub vout: i32,
    pub amount_sats: i64,
    pub script_pubkey: String,
    pub asset_id: String,
    /// `Some` creates the row directly in `assigned` (ceremony outputs,
    /// lift credits); `None` lands it in the unowned `available` pool.
    pub owner: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Insert a batch of new rows; ownership decides the initial status.
pub async fn insert_batch<C: ConnectionTrait>(db: &C, batch: Vec<NewVtxo>) -> Result<usize> {
    let now = Utc::now();
    let count = batch.len();
    if count == 0 {
        return Ok(0);
    }
    let rows: Vec<ActiveModel> = batch
        .into_iter()
        .map(|v| {
            let status = if v.owner.is_some() {
                VtxoStatus::Assigned
            } else {
                VtxoStatus::Available
            };
            ActiveModel {
                vtxo_id: Set(v.vtxo_id),
                txid: Set(v.txid),
                vout: Set(v.vout),
                amount_sats: Set(v.amount_sats),
                script_pubkey: Set(v.script_pubkey),
                asset_id: Set(v.asset_id),
                user_pubkey: Set(v.owner),
                status: Set(status.as_str().to_string()),
                session_id: Set(None),
                created_at: Set(now),
                expires_at: Set(v.expires_at),
                spending_txid: Set(None),
                settled_in: Set(None),
                ..Default::default()
            }
        })
        .collect();
    Entity::insert_many(rows).exec(db).await?;
    Ok(count)
}

pub async fn find_by_vtxo_id<C: ConnectionTrait>(db: &C, vtxo_id: &str) -> Result<Option<Model>> {
    Ok(Entity::find()
        .filter(Column::VtxoId.eq(vtxo_id))
        .one(db)
        .await?)
}

/// Unexpired available inventory for an asset, smallest first, locked for
/// update so two assignments cannot pick the same rows.
pub async fn lock_available<C: ConnectionTrait>(
    db: &C,
    asset_id: &str,
    now: DateTime<Utc>,
    limit: u64,
) -> Result<Vec<Model>> {
    Ok(Entity::find()
        .filter(Column::AssetId.eq(asset_id))
        .filter(Column::Status.eq(VtxoStatus::Available.as_str()))
        .filter(Column::ExpiresAt.gt(now))
        .order_by_asc(Column::AmountSats)
        .limit(limit)
        .lock_exclusive()
        .all(db)
        .await?)
}

/// available -> assigned for a selected set. Returns false when any row was
/// taken by a concurrent assignment.
pub async fn mark_assigned<C: ConnectionTrait>(
    db: &C,
    vtxo_ids: &[String],
    user_pubkey: &str,
    session_id: Option<&str>,
) -> Result<bool> {
    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value(VtxoStatus::Assigned.as_str()))
        .col_expr(Column::UserPubkey, Expr::value(user_pubkey))
        .col_expr(Column::SessionId, Expr::value(session_id))
        .filter(Column::VtxoId.is_in(vtxo_ids.iter().map(String::as_str)))
        .filter(Column::Status.eq(VtxoStatus::Available.as_str()))
        .exec(db)
        .await?;
    Ok(result.rows_affected as usize == vtxo_ids.len())
}

/// assigned -> spent with the spending transaction recorded. Returns false
/// when any input was already spent elsewhere (double-spend race loser).
pub async fn mark_spent<C: ConnectionTrait>(
    db: &C,
    vtxo_ids: &[String],
    spending_txid: &str,
) -> Result<bool> {
    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value(VtxoStatus::Spent.as_str()))
        .col_expr(Column::SpendingTxid, Expr::value(spending_txid))
        .filter(Column::VtxoId.is_in(vtxo_ids.iter().map(String::as_str)))
        .filter(Column::Status.eq(VtxoStatus::Assigned.as_str()))
        .exec(db)
        .await?;
    Ok(result.rows_affected as usize == vtxo_ids.len())
}

/// Expire a set of VTXOs from either live state.
pub async fn mark_expired<C: ConnectionTrait>(db: &C, vtxo_ids: &[String]) -> Result<u64> {
    let live = [
        VtxoStatus::Available.as_str(),
        VtxoStatus::Assigned.as_str(),
    ];
    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value(VtxoStatus::Expired.as_str()))
        .filter(Column::VtxoId.is_in(vtxo_ids.iter().map(String::as_str)))
        .filter(Column::Status.is_in(live))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

pub async fn count_by_status<C: ConnectionTrait>(
    db: &C,
    asset_id: &str,
    status: VtxoStatus,
) -> Result<u64> {
    Ok(Entity::find()
        .filter(Column::AssetId.eq(asset_id))
        .filter(Column::Status.eq(status.as_str()))
        .count(db)
        .await?)
}

/// Assigned VTXOs a user holds in an asset, smallest first.
pub async fn user_assigned<C: ConnectionTrait>(
    db: &C,
    user_pubkey: &str,
    asset_id: &str,
) -> Result<Vec<Model>> {
    Ok(Entity::find()
        .filter(Column::UserPubkey.eq(user_pubkey))
        .filter(Column::AssetId.eq(asset_id))
        .filter(Column::Status.eq(VtxoStatus::Assigned.as_str()))
        .order_by_asc(Column::AmountSats)
        .all(db)
        .await?)
}

/// Assigned VTXOs past their deadline, with the owning session so the
/// sweeper can skip ones tied to a live ceremony.
pub async fn list_expired_assigned<C: ConnectionTrait>(
    db: &C,
    now: DateTime<Utc>,
    limit: u64,
) -> Result<Vec<Model>> {
    Ok(Entity::find()
        .filter(Column::Status.eq(VtxoStatus::Assigned.as_str()))
        .filter(Column::ExpiresAt.lt(now))
        .order_by_asc(Column::ExpiresAt)
        .limit(limit)
        .all(db)
        .await?)
}

/// Available inventory past its deadline.
pub async fn list_expired_available<C: ConnectionTrait>(
    db: &C,
    now: DateTime<Utc>,
    limit: u64,
) -> Result<Vec<Model>> {
    Ok(Entity::find()
        .filter(Column::Status.eq(VtxoStatus::Available.as_str()))
        .filter(Column::ExpiresAt.lt(now))
        .order_by_asc(Column::ExpiresAt)
        .limit(limit)
        .all(db)
        .await?)
}

/// Spent VTXOs not yet anchored by an L1 commitment, grouped per asset by
/// the settlement coordinator.
pub async fn list_unsettled_spent<C: ConnectionTrait>(
    db: &C,
    asset_id: &str,
    limit: u64,
) -> Result<Vec<Model>> {
    Ok(Entity::find()
        .filter(Column::AssetId.eq(asset_id))
        .filter(Column::Status.eq(VtxoStatus::Spent.as_str()))
        .filter(Column::SettledIn.is_null())
        .order_by_asc(Column::Id)
        .limit(limit)
        .all(db)
        .await?)
}

/// Stamp spent VTXOs with the commitment batch that anchored them.
pub async fn mark_settled<C: ConnectionTrait>(
    db: &C,
    vtxo_ids: &[String],
    batch_id: &str,
) -> Result<u64> {
    let result = Entity::update_many()
        .col_expr(Column::SettledIn, Expr::value(batch_id))
        .filter(Column::VtxoId.is_in(vtxo_ids.iter().map(String::as_str)))
        .filter(Column::Status.eq(VtxoStatus::Spent.as_str()))
        .filter(Column::SettledIn.is_null())
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Distinct asset ids that currently have unsettled spends.
pub async fn assets_with_unsettled_spends<C: ConnectionTrait>(db: &C) -> Result<Vec<String>> {
    let rows: Vec<Model> = Entity::find()
        .filter(Column::Status.eq(VtxoStatus::Spent.as_str()))
        .filter(Column::SettledIn.is_null())
        .all(db)
        .await?;
    let mut assets: Vec<String> = rows.into_iter().map(|v| v.asset_id).collect();
    assets.sort();
    assets.dedup();
    Ok(assets)
}
