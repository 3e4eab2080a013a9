//! Per-user asset balances with reserve accounting.
//!
//! Every mutation here is a guarded single-statement update whose WHERE
//! clause re-checks the non-negativity precondition, so
//! `balance >= reserved_balance >= 0` holds at every commit boundary even
//! under concurrent writers.

use chrono::Utc;
use sea_orm::sea_query::{Expr, ExprTrait};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
};

use crate::entity::asset_balance::{ActiveModel, Column, Entity, Model};
use crate::error::{Result, StoreError};

pub async fn find<C: ConnectionTrait>(
    db: &C,
    user_pubkey: &str,
    asset_id: &str,
) -> Result<Option<Model>> {
    Ok(Entity::find()
        .filter(Column::UserPubkey.eq(user_pubkey))
        .filter(Column::AssetId.eq(asset_id))
        .one(db)
        .await?)
}

pub async fn list_for_user<C: ConnectionTrait>(db: &C, user_pubkey: &str) -> Result<Vec<Model>> {
    Ok(Entity::find()
        .filter(Column::UserPubkey.eq(user_pubkey))
        .all(db)
        .await?)
}

/// Spendable amount: balance minus reserved.
pub async fn spendable<C: ConnectionTrait>(
    db: &C,
    user_pubkey: &str,
    asset_id: &str,
) -> Result<i64> {
    Ok(find(db, user_pubkey, asset_id)
        .await?
        .map(|b| b.balance - b.reserved_balance)
        .unwrap_or(0))
}

/// Add to a balance, creating the row on first credit.
pub async fn credit<C: ConnectionTrait>(
    db: &C,
    user_pubkey: &str,
    asset_id: &str,
    amount: i64,
) -> Result<()> {
    debug_assert!(amount >= 0);
    if find(db, user_pubkey, asset_id).await?.is_some() {
        Entity::update_many()
            .col_expr(Column::Balance, Expr::col(Column::Balance).add(amount))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::UserPubkey.eq(user_pubkey))
            .filter(Column::AssetId.eq(asset_id))
            .exec(db)
            .await?;
    } else {
        let row = ActiveModel {
            user_pubkey: Set(user_pubkey.to_string()),
            asset_id: Set(asset_id.to_string()),
            balance: Set(amount),
            reserved_balance: Set(0),
            updated_at: Set(Utc::now()),
            ..Default::default()
        };
        row.insert(db).await?;
    }
    Ok(())
}

/// Move `amount` from spendable into reserved. Fails with
/// `InsufficientBalance` when spendable < amount.
pub async fn reserve<C: ConnectionTrait>(
    db: &C,
    user_pubkey: &str,
    asset_id: &str,
    amount: i64,
) -> Result<()> {
    let result = Entity::update_many()
        .col_expr(
            Column::ReservedBalance,
            Expr::col(Column::ReservedBalance).add(amount),
        )
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::UserPubkey.eq(user_pubkey))
        .filter(Column::AssetId.eq(asset_id))
        .filter(Expr::col(Column::Balance).sub(Expr::col(Column::ReservedBalance)).gte(amount))
        .exec(db)
        .await?;
    if result.rows_affected == 1 {
        Ok(())
    } else {
        let available = spendable(db, user_pubkey, asset_id).await?;
        Err(StoreError::InsufficientBalance {
            available,
            needed: amount,
        })
    }
}

/// Return reserved funds to spendable, e.g. on session failure or VTXO
/// expiry.
pub async fn release<C: ConnectionTrait>(
    db: &C,
    user_pubkey: &str,
    asset_id: &str,
    amount: i64,
) -> Result<()> {
    let result = Entity::update_many()
        .col_expr(
            Column::ReservedBalance,
            Expr::col(Column::ReservedBalance).sub(amount),
        )
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::UserPubkey.eq(user_pubkey))
        .filter(Column::AssetId.eq(asset_id))
        .filter(Column::ReservedBalance.gte(amount))
        .exec(db)
        .await?;
    if result.rows_affected == 1 {
        Ok(())
    } else {
        Err(StoreError::Conflict(format!(
            "release of {amount} exceeds reserve for {user_pubkey}/{asset_id}"
        )))
    }
}

/// Spend reserved funds: both balance and reserved drop by `amount`.
pub async fn debit_reserved<C: ConnectionTrait>(
    db: &C,
    user_pubkey: &str,
    asset_id: &str,
    amount: i64,
) -> Result<()> {
    let result = Entity::update_many()
        .col_expr(Column::Balance, Expr::col(Column::Balance).sub(amount))
        .col_expr(
            Column::ReservedBalance,
            Expr::col(Column::ReservedBalance).sub(amount),
        )
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::UserPubkey.eq(user_pubkey))
        .filter(Column::AssetId.eq(asset_id))
        .filter(Column::Balance.gte(amount))
        .filter(Column::ReservedBalance.gte(amount))
        .exec(db)
        .await?;
    if result.rows_affected == 1 {
        Ok(())
    } else {
        let available = spendable(db, user_pubkey, asset_id).await?;
        Err(StoreError::InsufficientBalance {
            available,
            needed: amount,
        })
    }
}

/// Debit unreserved funds directly (admin transfers, fee sweeps).
pub async fn debit<C: ConnectionTrait>(
    db: &C,
    user_pubkey: &str,
    asset_id: &str,
    amount: i64,
) -> Result<()> {
    let result = Entity::update_many()
        .col_expr(Column::Balance, Expr::col(Column::Balance).sub(amount))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::UserPubkey.eq(user_pubkey))
        .filter(Column::AssetId.eq(asset_id))
        .filter(Expr::col(Column::Balance).sub(Expr::col(Column::ReservedBalance)).gte(amount))
        .exec(db)
        .await?;
    if result.rows_affected == 1 {
        Ok(())
    } else {
        let available = spendable(db, user_pubkey, asset_id).await?;
        Err(StoreError::InsufficientBalance {
            available,
            needed: amount,
        })
    }
}
