//! Signing challenge records.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
};

use crate::entity::signing_challenge::{ActiveModel, Column, Entity, Model};
use crate::error::Result;

pub struct NewChallenge {
    pub challenge_id: String,
    pub session_id: String,
    pub challenge_data: String,
    pub payload_ref: String,
    pub context: String,
    pub step_index: i32,
    pub step_total: i32,
    pub expires_at: DateTime<Utc>,
}

pub async fn insert<C: ConnectionTrait>(db: &C, new: NewChallenge) -> Result<Model> {
    let row = ActiveModel {
        challenge_id: Set(new.challenge_id),
        session_id: Set(new.session_id),
        challenge_data: Set(new.challenge_data),
        payload_ref: Set(new.payload_ref),
        context: Set(new.context),
        step_index: Set(new.step_index),
        step_total: Set(new.step_total),
        created_at: Set(Utc::now()),
        expires_at: Set(new.expires_at),
        is_used: Set(false),
        ..Default::default()
    };
    Ok(row.insert(db).await?)
}

pub async fn find_by_challenge_id<C: ConnectionTrait>(
    db: &C,
    challenge_id: &str,
) -> Result<Option<Model>> {
    Ok(Entity::find()
        .filter(Column::ChallengeId.eq(challenge_id))
        .one(db)
        .await?)
}

/// Most recent unconsumed challenge for a session.
pub async fn find_open_for_session<C: ConnectionTrait>(
    db: &C,
    session_id: &str,
) -> Result<Option<Model>> {
    Ok(Entity::find()
        .filter(Column::SessionId.eq(session_id))
        .filter(Column::IsUsed.eq(false))
        .order_by_desc(Column::CreatedAt)
        .one(db)
        .await?)
}

/// Flip `is_used` and persist the winning signature. The guard on
/// `is_used = false` makes concurrent responses race to a single winner;
/// everyone else sees false.
pub async fn consume<C: ConnectionTrait>(
    db: &C,
    challenge_id: &str,
    signature: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    let result = Entity::update_many()
        .col_expr(Column::IsUsed, Expr::value(true))
        .col_expr(Column::Signature, Expr::value(signature))
        .filter(Column::ChallengeId.eq(challenge_id))
        .filter(Column::IsUsed.eq(false))
        .filter(Column::ExpiresAt.gt(now))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Count of consumed challenges for a session; the ceremony uses this to
/// decide when signature collection is complete.
pub async fn count_consumed<C: ConnectionTrait>(db: &C, session_id: &str) -> Result<u64> {
    use sea_orm::PaginatorTrait;
    Ok(Entity::find()
        .filter(Column::SessionId.eq(session_id))
        .filter(Column::IsUsed.eq(true))
        .count(db)
        .await?)
}

/// Drop unconsumed challenges past their deadline. Returns how many went.
pub async fn delete_expired<C: ConnectionTrait>(db: &C, now: DateTime<Utc>) -> Result<u64> {
    let result = Entity::delete_many()
        .filter(Column::ExpiresAt.lt(now))
        .filter(Column::IsUsed.eq(false))
        .exec(db)
        .await?;
    Ok(result.rows_affected)
}
