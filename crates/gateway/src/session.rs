//! Signing-session lifecycle (state machine owner).
//!
//! All session status writes in the gateway go through this manager. The
//! legal transition graph lives on `store::SessionStatus`; this layer adds
//! the expiry rules, the admission ceiling, the idempotent create and the
//! background sweeper.

use std::str::FromStr;

use chrono::Utc;
use monitoring::GatewayMetrics;
use relay::FailurePayload;
use serde_json::Value as JsonValue;
use store::entity::signing_session::Model as Session;
use store::{sessions, SessionStatus};
use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::events::Intent;
use crate::outbound::OutboundEvent;
use crate::state::SharedState;

#[derive(Clone)]
pub struct SessionManager {
    state: SharedState,
}

impl SessionManager {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Create a session for a validated intent. Replayed intents resolve to
    /// the existing session; the admission ceiling rejects new work with a
    /// busy failure.
    pub async fn create_for_intent(&self, intent: &Intent) -> Result<(Session, bool)> {
        let active = sessions::count_active(self.state.store.connection()).await?;
        if active >= self.state.config.max_concurrent_sessions {
            let existing = sessions::find_by_action(
                self.state.store.connection(),
                &intent.author,
                &intent.action_id,
            )
            .await?;
            // a replay of an admitted intent is never bounced
            if let Some(existing) = existing {
                return Ok((existing, false));
            }
            warn!(
                "admission ceiling reached ({active} active), rejecting intent {}",
                intent.action_id
            );
            return Err(GatewayError::Busy);
        }

        let now = Utc::now();
        let expires_at = self.state.session_deadline(now).min(intent.expires_at);
        let new = sessions::NewSession {
            session_id: uuid::Uuid::new_v4().to_string(),
            user_pubkey: intent.author.clone(),
            action_id: intent.action_id.clone(),
            session_type: intent.session_type(),
            intent_data: intent.raw.clone(),
            context: Some(intent.context()),
            expires_at,
        };
        let (session, created) = sessions::insert(self.state.store.connection(), new).await?;
        if created {
            GatewayMetrics::incr(&self.state.metrics.sessions_created);
            info!(
                "created session {} ({}) for {}",
                session.session_id,
                session.session_type,
                abbrev(&session.user_pubkey)
            );
        }
        Ok((session, created))
    }

    pub async fn get(&self, session_id: &str) -> Result<Session> {
        sessions::find_by_session_id(self.state.store.connection(), session_id)
            .await?
            .ok_or_else(|| GatewayError::Internal(format!("session {session_id} not found")))
    }

    pub fn status_of(&self, session: &Session) -> Result<SessionStatus> {
        SessionStatus::from_str(&session.status).map_err(GatewayError::from)
    }

    /// Request a transition. Rejects edges outside the state-machine graph
    /// and races where the session moved underneath the caller.
    pub async fn transition(
        &self,
        session_id: &str,
        next: SessionStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let session = self.get(session_id).await?;
        let current = self.status_of(&session)?;
        if !current.can_transition_to(next) {
            return Err(GatewayError::InvalidTransition(format!(
                "session {session_id}: {current} -> {next} is not a legal edge"
            )));
        }
        let moved = sessions::transition(
            self.state.store.connection(),
            session_id,
            &[current],
            next,
            message,
        )
        .await?;
        if !moved {
            return Err(GatewayError::Conflict(format!(
                "session {session_id} changed state during {current} -> {next}"
            )));
        }
        info!("session {session_id}: {current} -> {next}");
        Ok(())
    }

    pub async fn complete(&self, session_id: &str, result_data: JsonValue) -> Result<()> {
        sessions::set_result(self.state.store.connection(), session_id, result_data, None).await?;
        self.transition(session_id, SessionStatus::Completed, None)
            .await?;
        GatewayMetrics::incr(&self.state.metrics.sessions_completed);
        self.state.drop_signal(session_id).await;
        self.state.clear_cancel(session_id).await;
        Ok(())
    }

    /// Fail a session and send the (single) failure DM to its user. A
    /// session already in a terminal state is left untouched, which makes
    /// repeated failure reports idempotent.
    pub async fn fail(&self, session_id: &str, err: &GatewayError) -> Result<()> {
        let session = self.get(session_id).await?;
        let current = self.status_of(&session)?;
        if current.is_terminal() {
            return Ok(());
        }
        let target = if matches!(err, GatewayError::Expired(_)) {
            SessionStatus::Expired
        } else {
            SessionStatus::Failed
        };
        let moved = sessions::transition(
            self.state.store.connection(),
            session_id,
            &[current],
            target,
            Some(&err.to_string()),
        )
        .await?;
        if !moved {
            // lost the race to another failure path; that path owns the DM
            return Ok(());
        }
        match target {
            SessionStatus::Expired => GatewayMetrics::incr(&self.state.metrics.sessions_expired),
            _ => GatewayMetrics::incr(&self.state.metrics.sessions_failed),
        }
        warn!(
            "session {session_id} -> {target} ({}, code {})",
            err,
            err.code()
        );

        self.state
            .notifier
            .notify_failure(OutboundEvent::Failure {
                recipient: session.user_pubkey.clone(),
                payload: FailurePayload {
                    status: "failure".to_string(),
                    code: err.code(),
                    message: err.wire_message(),
                    ref_action_id: session.action_id.clone(),
                },
                deadline: None,
            })
            .await;

        self.state.wake_session(session_id).await;
        self.state.drop_signal(session_id).await;
        self.state.clear_cancel(session_id).await;
        Ok(())
    }

    /// Cancel a non-terminal session (admin or sweeper). Rejected once
    /// finalization has committed — including the window where step 6 has
    /// already spent the inputs but the `completed` transition has not
    /// landed yet.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let session = self.get(session_id).await?;
        let current = self.status_of(&session)?;
        if current == SessionStatus::Completed
            || session.last_completed_step >= crate::ceremony::step::FINALIZATION
        {
            return Err(GatewayError::Conflict(format!(
                "session {session_id} already finalized, cancellation rejected"
            )));
        }
        if current.is_terminal() {
            return Ok(());
        }
        self.state.request_cancel(session_id).await;
        self.fail(session_id, &GatewayError::Cancelled).await
    }

    /// One sweeper pass: move timed-out sessions to `expired` and notify
    /// users who were still owed an answer.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let expired = sessions::list_expired(self.state.store.connection(), now, 200).await?;
        let count = expired.len();
        for session in expired {
            let err = GatewayError::Expired(format!(
                "session deadline {} passed",
                session.expires_at
            ));
            if let Err(e) = self.fail(&session.session_id, &err).await {
                warn!("sweeper could not expire {}: {e}", session.session_id);
            }
        }
        if count > 0 {
            info!("sweeper expired {count} sessions");
        }
        Ok(count)
    }

    pub async fn statistics(&self) -> Result<Vec<(String, u64)>> {
        Ok(sessions::counts_by_status(self.state.store.connection()).await?)
    }
}

fn abbrev(pubkey: &str) -> &str {
    pubkey.get(..8).unwrap_or(pubkey)
}
