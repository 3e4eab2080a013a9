//! Signing session entity
//!
//! `action_id` is extracted from the intent at insert time so the
//! (user_pubkey, action_id) uniqueness index can enforce intent idempotency.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "signing_sessions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique)]
    pub session_id: String,
    pub user_pubkey: String,
    pub action_id: String,
    /// p2p_transfer | lightning_lift | lightning_land | protocol_op
    pub session_type: String,
    /// Canonical states of the session machine; legacy aliases are
    /// normalized before they reach this column.
    pub status: String,
    pub intent_data: Json,
    pub context: Option<String>,
    /// Highest ceremony step already committed (0 = none). Steps consult
    /// this marker before doing work so a restarted worker resumes safely.
    pub last_completed_step: i32,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub expires_at: DateTimeUtc,
    pub result_data: Option<Json>,
    pub signed_tx: Option<String>,
    pub error_message: Option<String>,
    pub challenge_id: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
