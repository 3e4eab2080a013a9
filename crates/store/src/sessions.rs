//! Signing session records.
//!
//! The session manager in the gateway crate is the sole mutator of session
//! state; every status write here is guarded by the expected current status
//! so concurrent writers cannot persist an illegal edge.

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde_json::Value as JsonValue;

use crate::entity::signing_session::{ActiveModel, Column, Entity, Model};
use crate::error::{Result, StoreError};
use crate::types::{SessionStatus, SessionType};

/// Input for a new session row.
pub struct NewSession {
    pub session_id: String,
    pub user_pubkey: String,
    pub action_id: String,
    pub session_type: SessionType,
    pub intent_data: JsonValue,
    pub context: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Insert a session in `initiated`. A uniqueness violation on
/// (user_pubkey, action_id) resolves to the existing row, making intent
/// receipt idempotent.
pub async fn insert<C: ConnectionTrait>(db: &C, new: NewSession) -> Result<(Model, bool)> {
    let now = Utc::now();
    let row = ActiveModel {
        session_id: Set(new.session_id),
        user_pubkey: Set(new.user_pubkey.clone()),
        action_id: Set(new.action_id.clone()),
        session_type: Set(new.session_type.as_str().to_string()),
        status: Set(SessionStatus::Initiated.as_str().to_string()),
        intent_data: Set(new.intent_data),
        context: Set(new.context),
        last_completed_step: Set(0),
        created_at: Set(now),
        updated_at: Set(now),
        expires_at: Set(new.expires_at),
        ..Default::default()
    };

    match row.insert(db).await {
        Ok(model) => Ok((model, true)),
        Err(err) => {
            let err = StoreError::from(err);
            if err.is_unique_violation() {
                let existing = find_by_action(db, &new.user_pubkey, &new.action_id)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Conflict(format!(
                            "duplicate session for action {} vanished",
                            new.action_id
                        ))
                    })?;
                Ok((existing, false))
            } else {
                Err(err)
            }
        }
    }
}

pub async fn find_by_session_id<C: ConnectionTrait>(
    db: &C,
    session_id: &str,
) -> Result<Option<Model>> {
    Ok(Entity::find()
        .filter(Column::SessionId.eq(session_id))
        .one(db)
        .await?)
}

pub async fn find_by_action<C: ConnectionTrait>(
    db: &C,
    user_pubkey: &str,
    action_id: &str,
) -> Result<Option<Model>> {
    Ok(Entity::find()
        .filter(Column::UserPubkey.eq(user_pubkey))
        .filter(Column::ActionId.eq(action_id))
        .one(db)
        .await?)
}

/// Move a session from one of `expected` to `next`. Returns false when no
/// row matched, i.e. the session changed state underneath the caller.
pub async fn transition<C: ConnectionTrait>(
    db: &C,
    session_id: &str,
    expected: &[SessionStatus],
    next: SessionStatus,
    error_message: Option<&str>,
) -> Result<bool> {
    let expected: Vec<&str> = expected.iter().map(|s| s.as_str()).collect();
    let mut update = Entity::update_many()
        .col_expr(Column::Status, Expr::value(next.as_str()))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::SessionId.eq(session_id))
        .filter(Column::Status.is_in(expected));
    if let Some(message) = error_message {
        update = update.col_expr(Column::ErrorMessage, Expr::value(message));
    }
    let result = update.exec(db).await?;
    Ok(result.rows_affected == 1)
}

/// Record ceremony progress. Only moves forward; a stale worker writing an
/// older step is a no-op.
pub async fn advance_step<C: ConnectionTrait>(
    db: &C,
    session_id: &str,
    completed_step: i32,
) -> Result<bool> {
    let result = Entity::update_many()
        .col_expr(Column::LastCompletedStep, Expr::value(completed_step))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::SessionId.eq(session_id))
        .filter(Column::LastCompletedStep.lt(completed_step))
        .exec(db)
        .await?;
    Ok(result.rows_affected == 1)
}

pub async fn set_challenge<C: ConnectionTrait>(
    db: &C,
    session_id: &str,
    challenge_id: &str,
) -> Result<()> {
    Entity::update_many()
        .col_expr(Column::ChallengeId, Expr::value(challenge_id))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::SessionId.eq(session_id))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn set_result<C: ConnectionTrait>(
    db: &C,
    session_id: &str,
    result_data: JsonValue,
    signed_tx: Option<&str>,
) -> Result<()> {
    let mut update = Entity::update_many()
        .col_expr(Column::ResultData, Expr::value(result_data))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::SessionId.eq(session_id));
    if let Some(tx) = signed_tx {
        update = update.col_expr(Column::SignedTx, Expr::value(tx));
    }
    update.exec(db).await?;
    Ok(())
}

/// Non-terminal sessions past their deadline, oldest first.
pub async fn list_expired<C: ConnectionTrait>(
    db: &C,
    now: DateTime<Utc>,
    limit: u64,
) -> Result<Vec<Model>> {
    let terminal = [
        SessionStatus::Completed.as_str(),
        SessionStatus::Failed.as_str(),
        SessionStatus::Expired.as_str(),
    ];
    Ok(Entity::find()
        .filter(Column::ExpiresAt.lt(now))
        .filter(Column::Status.is_not_in(terminal))
        .order_by_asc(Column::ExpiresAt)
        .paginate(db, limit)
        .fetch_page(0)
        .await?)
}

/// All sessions currently holding a non-terminal state.
pub async fn count_active<C: ConnectionTrait>(db: &C) -> Result<u64> {
    let terminal = [
        SessionStatus::Completed.as_str(),
        SessionStatus::Failed.as_str(),
        SessionStatus::Expired.as_str(),
    ];
    Ok(Entity::find()
        .filter(Column::Status.is_not_in(terminal))
        .count(db)
        .await?)
}

pub async fn list_active<C: ConnectionTrait>(db: &C) -> Result<Vec<Model>> {
    let terminal = [
        SessionStatus::Completed.as_str(),
        SessionStatus::Failed.as_str(),
        SessionStatus::Expired.as_str(),
    ];
    Ok(Entity::find()
        .filter(Column::Status.is_not_in(terminal))
        .order_by_asc(Column::CreatedAt)
        .all(db)
        .await?)
}

/// Session counts grouped by status, for the statistics surface.
pub async fn counts_by_status<C: ConnectionTrait>(db: &C) -> Result<Vec<(String, u64)>> {
    let all = [
        SessionStatus::Initiated,
        SessionStatus::ChallengeSent,
        SessionStatus::AwaitingSignature,
        SessionStatus::Signing,
        SessionStatus::Completed,
        SessionStatus::Failed,
        SessionStatus::Expired,
    ];
    let mut out = Vec::with_capacity(all.len());
    for status in all {
        let count = Entity::find()
            .filter(Column::Status.eq(status.as_str()))
            .count(db)
            .await?;
        if count > 0 {
            out.push((status.as_str().to_string(), count));
        }
    }
    Ok(out)
}
