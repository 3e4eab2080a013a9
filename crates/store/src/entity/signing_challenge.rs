//! Signing challenge entity
//!
//! `is_used` is monotone false -> true; the consume path flips it with a
//! guarded update so concurrent responses see at most one winner.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "signing_challenges")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub challenge_id: String,
    pub session_id: String,
    /// Base64 payload the wallet signs; opaque to the gateway.
    pub challenge_data: String,
    /// sha256 digest the wallet re-derives and echoes back.
    pub payload_ref: String,
    pub context: String,
    pub step_index: i32,
    pub step_total: i32,
    pub created_at: DateTimeUtc,
    pub expires_at: DateTimeUtc,
    pub is_used: bool,
    pub signature: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
