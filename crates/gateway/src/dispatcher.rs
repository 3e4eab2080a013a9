//! Inbound event dispatch: classify, validate, deduplicate, hand off.
//!
//! The relay loop feeds decoded events into one channel; the dispatcher
//! classifies them by kind, applies idempotency, and spawns the long work
//! (ceremonies) as independent tasks. Event handling itself is bounded by
//! the worker pool so a burst cannot starve the process.

use chrono::Utc;
use monitoring::GatewayMetrics;
use relay::protocol::{KIND_INTENT, KIND_SERVICE_REQUEST, KIND_SIGNING_RESPONSE};
use relay::{FailurePayload, InboundEvent, IntentPayload, ResponsePayload};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ceremony::SigningOrchestrator;
use crate::challenge::{ChallengeManager, VerifyOutcome};
use crate::error::GatewayError;
use crate::events;
use crate::outbound::OutboundEvent;
use crate::session::SessionManager;
use crate::state::SharedState;

#[derive(Clone)]
pub struct Dispatcher {
    state: SharedState,
    sessions: SessionManager,
    challenges: ChallengeManager,
    orchestrator: SigningOrchestrator,
}

impl Dispatcher {
    pub fn new(state: SharedState) -> Self {
        Self {
            sessions: SessionManager::new(state.clone()),
            challenges: ChallengeManager::new(state.clone()),
            orchestrator: SigningOrchestrator::new(state.clone()),
            state,
        }
    }

    /// Drain the inbound channel until it closes or shutdown is requested.
    pub async fn run(&self, mut inbound: mpsc::Receiver<InboundEvent>) {
        info!("event dispatcher started");
        while let Some(event) = inbound.recv().await {
            if self.state.is_shutting_down() {
                debug!("shutting down, dropping inbound event {}", event.event_id);
                continue;
            }
            let permit = match self.state.worker_pool.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let this = self.clone();
            tokio::spawn(async move {
                this.handle(event).await;
                drop(permit);
            });
        }
        info!("event dispatcher stopped");
    }

    async fn handle(&self, event: InboundEvent) {
        match event.kind {
            KIND_INTENT => self.handle_intent(event).await,
            KIND_SIGNING_RESPONSE => self.handle_response(event).await,
            KIND_SERVICE_REQUEST => self.handle_service_request(event).await,
            other => debug!("ignoring event {} of kind {other}", event.event_id),
        }
    }

    async fn handle_intent(&self, event: InboundEvent) {
        GatewayMetrics::incr(&self.state.metrics.intents_received);

        let payload: IntentPayload = match serde_json::from_str(&event.content) {
            Ok(payload) => payload,
            Err(err) => {
                GatewayMetrics::incr(&self.state.metrics.intents_rejected);
                warn!("unparseable intent in event {}: {err}", event.event_id);
                return;
            }
        };
        let action_id = payload.action_id.clone();

        let intent = match events::parse_intent(
            &event.author,
            &event.event_id,
            payload,
            Utc::now(),
            &self.state.config.native_asset_id,
            &self.state.config.solvers,
        ) {
            Ok(intent) => intent,
            Err(err) => {
                GatewayMetrics::incr(&self.state.metrics.intents_rejected);
                warn!("rejecting intent {action_id}: {err}");
                self.send_failure(&event.author, &action_id, &err).await;
                return;
            }
        };

        let (session, created) = match self.sessions.create_for_intent(&intent).await {
            Ok(result) => result,
            Err(err) => {
                GatewayMetrics::incr(&self.state.metrics.intents_rejected);
                warn!("could not admit intent {action_id}: {err}");
                self.send_failure(&event.author, &action_id, &err).await;
                return;
            }
        };
        if !created {
            GatewayMetrics::incr(&self.state.metrics.intents_duplicate);
            info!(
                "duplicate intent ({}, {action_id}) dropped; session {} is {}",
                abbrev(&event.author),
                session.session_id,
                session.status
            );
            return;
        }

        // ceremonies outlive the event worker; the admission ceiling
        // bounds how many run at once
        let orchestrator = self.orchestrator.clone();
        let session_id = session.session_id.clone();
        tokio::spawn(async move {
            if let Err(err) = orchestrator.run(&session_id).await {
                warn!("ceremony for session {session_id} ended in error: {err}");
            }
        });
    }

    async fn handle_response(&self, event: InboundEvent) {
        let payload: ResponsePayload = match serde_json::from_str(&event.content) {
            Ok(payload) => payload,
            Err(err) => {
                GatewayMetrics::incr(&self.state.metrics.responses_rejected);
                warn!("unparseable signing response in {}: {err}", event.event_id);
                return;
            }
        };

        match self.challenges.verify(&event.author, &payload).await {
            Ok(VerifyOutcome::Accepted) => {
                self.state.wake_session(&payload.session_id).await;
            }
            Ok(VerifyOutcome::AlreadyUsed) => {
                info!(
                    "duplicate response ({}, {}) dropped",
                    payload.session_id, payload.challenge_id
                );
            }
            Err(err) => {
                GatewayMetrics::incr(&self.state.metrics.responses_rejected);
                warn!(
                    "response for session {} rejected: {err}",
                    payload.session_id
                );
                match &err {
                    // a stranger's garbage must not kill the session
                    GatewayError::InvalidAuthorSignature(_) => {}
                    GatewayError::Expired(_) | GatewayError::SignatureInvalid(_) => {
                        if let Err(fail_err) =
                            self.sessions.fail(&payload.session_id, &err).await
                        {
                            warn!(
                                "could not fail session {}: {fail_err}",
                                payload.session_id
                            );
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// Service requests are solver traffic; the gateway relays them to the
    /// registered solver for their namespace.
    async fn handle_service_request(&self, event: InboundEvent) {
        let namespace = serde_json::from_str::<serde_json::Value>(&event.content)
            .ok()
            .and_then(|v| {
                v.get("type")
                    .and_then(|t| t.as_str())
                    .map(|t| t.split(':').next().unwrap_or(t).to_string())
            });
        let Some(namespace) = namespace else {
            debug!("service request {} without a type, ignored", event.event_id);
            return;
        };
        match self.state.config.solvers.get(&namespace) {
            Some(solver_pubkey) => {
                if let Err(err) = self
                    .state
                    .notifier
                    .forward_service_request(solver_pubkey, &event.content)
                    .await
                {
                    warn!("could not forward service request to {namespace}: {err}");
                }
            }
            None => {
                debug!(
                    "service request {} for unregistered namespace {namespace}, ignored",
                    event.event_id
                );
            }
        }
    }

    async fn send_failure(&self, recipient: &str, action_id: &str, err: &GatewayError) {
        self.state
            .notifier
            .notify_failure(OutboundEvent::Failure {
                recipient: recipient.to_string(),
                payload: FailurePayload {
                    status: "failure".to_string(),
                    code: err.code(),
                    message: err.wire_message(),
                    ref_action_id: action_id.to_string(),
                },
                deadline: None,
            })
            .await;
    }
}

fn abbrev(pubkey: &str) -> &str {
    pubkey.get(..8).unwrap_or(pubkey)
}
