//! Fungible asset registry records.

use chrono::Utc;
use sea_orm::sea_query::{Expr, ExprTrait};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};

use crate::entity::asset::{ActiveModel, Column, Entity, Model};
use crate::error::{Result, StoreError};
use crate::types::AssetType;

pub struct NewAsset {
    pub asset_id: String,
    pub name: String,
    pub ticker: String,
    pub asset_type: AssetType,
    pub decimals: i32,
}

pub async fn insert<C: ConnectionTrait>(db: &C, new: NewAsset) -> Result<Model> {
    let row = ActiveModel {
        asset_id: Set(new.asset_id.clone()),
        name: Set(new.name),
        ticker: Set(new.ticker),
        asset_type: Set(new.asset_type.as_str().to_string()),
        decimals: Set(new.decimals),
        total_supply: Set(0),
        is_active: Set(true),
        created_at: Set(Utc::now()),
        ..Default::default()
    };
    match row.insert(db).await {
        Ok(model) => Ok(model),
        Err(err) => {
            let err = StoreError::from(err);
            if err.is_unique_violation() {
                Err(StoreError::Duplicate(new.asset_id))
            } else {
                Err(err)
            }
        }
    }
}

pub async fn find<C: ConnectionTrait>(db: &C, asset_id: &str) -> Result<Option<Model>> {
    Ok(Entity::find()
        .filter(Column::AssetId.eq(asset_id))
        .one(db)
        .await?)
}

pub async fn list<C: ConnectionTrait>(db: &C, active_only: bool) -> Result<Vec<Model>> {
    let mut query = Entity::find().order_by_asc(Column::Ticker);
    if active_only {
        query = query.filter(Column::IsActive.eq(true));
    }
    Ok(query.all(db).await?)
}

/// Adjust total supply by `delta` (positive mint, negative burn). The guard
/// keeps supply non-negative.
pub async fn adjust_supply<C: ConnectionTrait>(
    db: &C,
    asset_id: &str,
    delta: i64,
) -> Result<bool> {
    let mut update = Entity::update_many()
        .col_expr(Column::TotalSupply, Expr::col(Column::TotalSupply).add(delta))
        .filter(Column::AssetId.eq(asset_id));
    if delta < 0 {
        update = update.filter(Column::TotalSupply.gte(-delta));
    }
    let result = update.exec(db).await?;
    Ok(result.rows_affected == 1)
}

pub async fn set_active<C: ConnectionTrait>(db: &C, asset_id: &str, active: bool) -> Result<bool> {
    let result = Entity::update_many()
        .col_expr(Column::IsActive, Expr::value(active))
        .filter(Column::AssetId.eq(asset_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}
