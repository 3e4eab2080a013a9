//! Outbound notices: challenge DMs, failure DMs, public confirmations and
//! L1 commitment notices.
//!
//! Challenges are sent directly because the session machine needs to know
//! the DM left the building before moving to `awaiting_signature`.
//! Everything else goes through the bounded publish buffer so a relay
//! outage retries in the background while the database stays the source of
//! truth.

use std::sync::Arc;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use buffer::{BufferableEvent, EventSink, PublishBuffer};
use relay::{
    ChallengePayload, ConfirmationPayload, FailurePayload, L1CommitmentPayload, RelayClient,
};
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;

/// A notice queued for delivery.
#[derive(Debug, Clone)]
pub enum OutboundEvent {
    Confirmation {
        author: String,
        ref_event_id: Option<String>,
        payload: ConfirmationPayload,
        deadline: Option<Instant>,
    },
    Failure {
        recipient: String,
        payload: FailurePayload,
        deadline: Option<Instant>,
    },
    L1Commitment {
        payload: L1CommitmentPayload,
    },
}

impl BufferableEvent for OutboundEvent {
    fn describe(&self) -> String {
        match self {
            OutboundEvent::Confirmation { payload, .. } => {
                format!("confirmation:{}", payload.ref_action_id)
            }
            OutboundEvent::Failure { payload, .. } => {
                format!("failure:{}:{}", payload.code, payload.ref_action_id)
            }
            OutboundEvent::L1Commitment { payload } => {
                format!("l1_commitment:{}", payload.batch_id)
            }
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self {
            OutboundEvent::Confirmation { deadline, .. } => *deadline,
            OutboundEvent::Failure { deadline, .. } => *deadline,
            OutboundEvent::L1Commitment { .. } => None,
        }
    }
}

/// Buffer sink that writes to the relay pool.
pub struct RelaySink {
    relay: Arc<RelayClient>,
}

impl RelaySink {
    pub fn new(relay: Arc<RelayClient>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl EventSink<OutboundEvent> for RelaySink {
    async fn publish(&self, event: &OutboundEvent) -> AnyResult<()> {
        match event {
            OutboundEvent::Confirmation {
                author,
                ref_event_id,
                payload,
                ..
            } => {
                self.relay
                    .publish_confirmation(author, ref_event_id.as_deref(), payload)
                    .await?;
            }
            OutboundEvent::Failure {
                recipient, payload, ..
            } => {
                self.relay.publish_failure(recipient, payload).await?;
            }
            OutboundEvent::L1Commitment { payload } => {
                self.relay.publish_l1_commitment(payload).await?;
            }
        }
        Ok(())
    }

    fn sink_name(&self) -> &'static str {
        "relay"
    }
}

/// Delivery seam between the orchestration engine and the relay overlay.
/// Mocked in tests; `RelayNotifier` is the production implementation.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a challenge DM. Must not return until the relay accepted the
    /// event (or fail), because session state depends on it.
    async fn send_challenge(&self, recipient: &str, payload: ChallengePayload) -> Result<()>;

    /// Queue a failure DM for delivery.
    async fn notify_failure(&self, event: OutboundEvent);

    /// Queue a public confirmation for delivery.
    async fn notify_confirmation(&self, event: OutboundEvent);

    /// Queue a public L1 commitment notice for delivery.
    async fn notify_l1_commitment(&self, payload: L1CommitmentPayload);

    /// Forward a service request unchanged to a registered solver.
    async fn forward_service_request(&self, solver_pubkey: &str, content: &str) -> Result<()>;
}

pub struct RelayNotifier {
    relay: Arc<RelayClient>,
    outbound: PublishBuffer<OutboundEvent>,
}

impl RelayNotifier {
    pub fn new(relay: Arc<RelayClient>) -> Self {
        let sink = Arc::new(RelaySink::new(relay.clone()));
        Self {
            relay,
            outbound: PublishBuffer::new(sink),
        }
    }

    pub fn buffer(&self) -> &PublishBuffer<OutboundEvent> {
        &self.outbound
    }
}

#[async_trait]
impl Notifier for RelayNotifier {
    async fn send_challenge(&self, recipient: &str, payload: ChallengePayload) -> Result<()> {
        let event_id = self.relay.publish_challenge(recipient, &payload).await?;
        debug!(
            "challenge {} delivered as event {}",
            payload.challenge_id, event_id
        );
        Ok(())
    }

    async fn notify_failure(&self, event: OutboundEvent) {
        if let Err(err) = self.outbound.enqueue(event).await {
            tracing::error!("failed to queue failure notice: {err}");
        }
    }

    async fn notify_confirmation(&self, event: OutboundEvent) {
        if let Err(err) = self.outbound.enqueue(event).await {
            tracing::error!("failed to queue confirmation: {err}");
        }
    }

    async fn notify_l1_commitment(&self, payload: L1CommitmentPayload) {
        if let Err(err) = self
            .outbound
            .enqueue(OutboundEvent::L1Commitment { payload })
            .await
        {
            tracing::error!("failed to queue l1 commitment notice: {err}");
        }
    }

    async fn forward_service_request(&self, solver_pubkey: &str, content: &str) -> Result<()> {
        self.relay
            .forward_service_request(solver_pubkey, content)
            .await?;
        Ok(())
    }
}
