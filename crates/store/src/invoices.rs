//! Lightning invoice records.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};

use crate::entity::lightning_invoice::{ActiveModel, Column, Entity, Model};
use crate::error::Result;
use crate::types::{InvoiceStatus, InvoiceType};

pub struct NewInvoice {
    pub payment_hash: String,
    pub bolt11_invoice: String,
    pub session_id: Option<String>,
    pub amount_sats: i64,
    pub asset_id: String,
    pub invoice_type: InvoiceType,
    pub expires_at: DateTime<Utc>,
}

pub async fn insert<C: ConnectionTrait>(db: &C, new: NewInvoice) -> Result<Model> {
    let row = ActiveModel {
        payment_hash: Set(new.payment_hash),
        bolt11_invoice: Set(new.bolt11_invoice),
        session_id: Set(new.session_id),
        amount_sats: Set(new.amount_sats),
        asset_id: Set(new.asset_id),
        status: Set(InvoiceStatus::Pending.as_str().to_string()),
        invoice_type: Set(new.invoice_type.as_str().to_string()),
        created_at: Set(Utc::now()),
        expires_at: Set(new.expires_at),
        ..Default::default()
    };
    Ok(row.insert(db).await?)
}

pub async fn find_by_payment_hash<C: ConnectionTrait>(
    db: &C,
    payment_hash: &str,
) -> Result<Option<Model>> {
    Ok(Entity::find()
        .filter(Column::PaymentHash.eq(payment_hash))
        .one(db)
        .await?)
}

/// pending -> settled, guarded so duplicate settlement signals are no-ops.
pub async fn settle<C: ConnectionTrait>(
    db: &C,
    payment_hash: &str,
    preimage: Option<&str>,
    settled_at: DateTime<Utc>,
) -> Result<bool> {
    let mut update = Entity::update_many()
        .col_expr(Column::Status, Expr::value(InvoiceStatus::Settled.as_str()))
        .col_expr(Column::SettledAt, Expr::value(settled_at))
        .filter(Column::PaymentHash.eq(payment_hash))
        .filter(Column::Status.eq(InvoiceStatus::Pending.as_str()));
    if let Some(preimage) = preimage {
        update = update.col_expr(Column::Preimage, Expr::value(preimage));
    }
    let result = update.exec(db).await?;
    Ok(result.rows_affected == 1)
}

pub async fn mark_failed<C: ConnectionTrait>(db: &C, payment_hash: &str) -> Result<bool> {
    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value(InvoiceStatus::Failed.as_str()))
        .filter(Column::PaymentHash.eq(payment_hash))
        .filter(Column::Status.eq(InvoiceStatus::Pending.as_str()))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Pending invoices past their deadline -> expired. Returns how many moved.
pub async fn expire_pending<C: ConnectionTrait>(db: &C, now: DateTime<Utc>) -> Result<u64> {
    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value(InvoiceStatus::Expired.as_str()))
        .filter(Column::Status.eq(InvoiceStatus::Pending.as_str()))
        .filter(Column::ExpiresAt.lt(now))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}

/// Oldest pending invoices, for the reconciliation watcher.
pub async fn list_pending<C: ConnectionTrait>(db: &C, limit: u64) -> Result<Vec<Model>> {
    Ok(Entity::find()
        .filter(Column::Status.eq(InvoiceStatus::Pending.as_str()))
        .order_by_asc(Column::CreatedAt)
        .limit(limit)
        .all(db)
        .await?)
}

/// Recently settled invoices of one type. The watcher re-checks these
/// against their sessions so a settlement that raced the ceremony still
/// completes it.
pub async fn list_settled<C: ConnectionTrait>(
    db: &C,
    invoice_type: InvoiceType,
    limit: u64,
) -> Result<Vec<Model>> {
    Ok(Entity::find()
        .filter(Column::Status.eq(InvoiceStatus::Settled.as_str()))
        .filter(Column::InvoiceType.eq(invoice_type.as_str()))
        .order_by_desc(Column::SettledAt)
        .limit(limit)
        .all(db)
        .await?)
}
