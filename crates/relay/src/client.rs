//! Relay pool client for the gateway identity.
//!
//! Connects to the configured relays, subscribes to events addressed to the
//! gateway, deduplicates across relays by event id, decrypts direct
//! messages and delivers decoded events to one inbound channel. Per-author
//! arrival order per relay is preserved by the single notification loop;
//! global order is not guaranteed.

use std::collections::{HashSet, VecDeque};

use nostr_sdk::prelude::*;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::protocol::{self, INBOUND_KINDS};

/// How many recently seen event ids to remember for dedup.
const DEDUP_WINDOW: usize = 8192;

/// A decoded inbound relay event. `content` is plaintext: DM kinds are
/// decrypted before delivery.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub event_id: String,
    pub author: String,
    pub kind: u16,
    pub content: String,
    pub created_at: i64,
}

/// Bounded sliding window of seen event ids.
struct DedupWindow {
    seen: HashSet<EventId>,
    order: VecDeque<EventId>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns true when the id was not seen before.
    fn insert(&mut self, id: EventId) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

pub struct RelayClient {
    client: Client,
    keys: Keys,
}

impl RelayClient {
    /// Connect to every configured relay and subscribe to the gateway's
    /// inbound kinds.
    pub async fn connect(secret_key_hex: &str, relay_urls: &[String]) -> Result<Self> {
        let keys = Keys::parse(secret_key_hex)?;
        let client = Client::new(keys.clone());

        for url in relay_urls {
            client.add_relay(url.as_str()).await?;
        }
        client.connect().await;
        info!(
            "Relay client connected as {} across {} relays",
            keys.public_key(),
            relay_urls.len()
        );

        let kinds: Vec<Kind> = INBOUND_KINDS.iter().map(|k| Kind::Custom(*k)).collect();
        let filter = Filter::new()
            .kinds(kinds)
            .pubkey(keys.public_key())
            .since(Timestamp::now());
        client.subscribe(vec![filter], None).await?;
        debug!("Subscribed to kinds {:?}", INBOUND_KINDS);

        Ok(Self { client, keys })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Relays currently holding a live connection.
    pub async fn healthy_relay_count(&self) -> usize {
        let relays = self.client.relays().await;
        let mut count = 0;
        for relay in relays.values() {
            if relay.status().await == RelayStatus::Connected {
                count += 1;
            }
        }
        count
    }

    /// Run the inbound loop, pushing decoded events into `tx` until the
    /// channel closes. Invalid signatures and undecryptable DMs are dropped
    /// with a single log line.
    pub async fn run_inbound(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let mut dedup = DedupWindow::new(DEDUP_WINDOW);
        let mut notifications = self.client.notifications();

        while let Ok(notification) = notifications.recv().await {
            let RelayPoolNotification::Event { event, .. } = notification else {
                continue;
            };

            if event.verify().is_err() {
                warn!("Dropping event {} with invalid signature", event.id);
                continue;
            }
            if !dedup.insert(event.id) {
                debug!("Duplicate event {} from another relay", event.id);
                continue;
            }

            let kind = event.kind.as_u16();
            let content = if protocol::is_direct_message(kind) {
                match nip04::decrypt(self.keys.secret_key(), &event.pubkey, &event.content) {
                    Ok(plaintext) => plaintext,
                    Err(err) => {
                        warn!("Dropping DM {} we cannot decrypt: {}", event.id, err);
                        continue;
                    }
                }
            } else {
                event.content.clone()
            };

            let inbound = InboundEvent {
                event_id: event.id.to_hex(),
                author: event.pubkey.to_hex(),
                kind,
                content,
                created_at: event.created_at.as_u64() as i64,
            };

            if tx.send(inbound).await.is_err() {
                info!("Inbound channel closed, stopping relay loop");
                break;
            }
        }
        Ok(())
    }

    /// Encrypted signing challenge to a single wallet.
    pub async fn publish_challenge(
        &self,
        recipient_hex: &str,
        payload: &protocol::ChallengePayload,
    ) -> Result<String> {
        self.send_dm(
            recipient_hex,
            protocol::KIND_SIGNING_CHALLENGE,
            &serde_json::to_string(payload)?,
        )
        .await
    }

    /// Encrypted failure notice to the intent author.
    pub async fn publish_failure(
        &self,
        recipient_hex: &str,
        payload: &protocol::FailurePayload,
    ) -> Result<String> {
        self.send_dm(
            recipient_hex,
            protocol::KIND_FAILURE,
            &serde_json::to_string(payload)?,
        )
        .await
    }

    /// Public confirmation referencing the original intent.
    pub async fn publish_confirmation(
        &self,
        author_hex: &str,
        ref_event_id: Option<&str>,
        payload: &protocol::ConfirmationPayload,
    ) -> Result<String> {
        self.ensure_healthy().await?;
        let author = PublicKey::from_hex(author_hex)
            .map_err(|e| RelayError::InvalidEvent(e.to_string()))?;
        let mut tags = vec![
            Tag::public_key(author),
            action_tag(&payload.ref_action_id),
        ];
        if let Some(id) = ref_event_id {
            if let Ok(event_id) = EventId::from_hex(id) {
                tags.push(Tag::event(event_id));
            }
        }
        let builder = EventBuilder::new(
            Kind::Custom(protocol::KIND_CONFIRMATION),
            serde_json::to_string(payload)?,
            tags,
        );
        let output = self.client.send_event_builder(builder).await?;
        Ok((*output).to_hex())
    }

    /// Public L1 commitment notice.
    pub async fn publish_l1_commitment(
        &self,
        payload: &protocol::L1CommitmentPayload,
    ) -> Result<String> {
        self.ensure_healthy().await?;
        let builder = EventBuilder::new(
            Kind::Custom(protocol::KIND_L1_COMMITMENT),
            serde_json::to_string(payload)?,
            [Tag::identifier(payload.batch_id.clone())],
        );
        let output = self.client.send_event_builder(builder).await?;
        Ok((*output).to_hex())
    }

    /// Re-address a solver-bound service request to the registered solver.
    pub async fn forward_service_request(
        &self,
        solver_hex: &str,
        content: &str,
    ) -> Result<String> {
        self.ensure_healthy().await?;
        let solver = PublicKey::from_hex(solver_hex)
            .map_err(|e| RelayError::InvalidEvent(e.to_string()))?;
        let builder = EventBuilder::new(
            Kind::Custom(protocol::KIND_SERVICE_REQUEST),
            content,
            [Tag::public_key(solver)],
        );
        let output = self.client.send_event_builder(builder).await?;
        Ok((*output).to_hex())
    }

    async fn send_dm(&self, recipient_hex: &str, kind: u16, plaintext: &str) -> Result<String> {
        self.ensure_healthy().await?;
        let recipient = PublicKey::from_hex(recipient_hex)
            .map_err(|e| RelayError::InvalidEvent(e.to_string()))?;
        let ciphertext = nip04::encrypt(self.keys.secret_key(), &recipient, plaintext)?;
        let builder = EventBuilder::new(
            Kind::Custom(kind),
            ciphertext,
            [Tag::public_key(recipient)],
        );
        let output = self.client.send_event_builder(builder).await?;
        debug!("Sent kind {} DM to {}", kind, recipient_hex);
        Ok((*output).to_hex())
    }

    async fn ensure_healthy(&self) -> Result<()> {
        if self.healthy_relay_count().await == 0 {
            return Err(RelayError::NoHealthyRelay);
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.client.disconnect().await.ok();
    }
}

fn action_tag(action_id: &str) -> Tag {
    Tag::custom(
        TagKind::Custom("action".into()),
        vec![action_id.to_string()],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_window_drops_repeats_and_evicts() {
        let mut window = DedupWindow::new(2);
        let a = EventId::all_zeros();
        let b = EventId::from_slice(&[1u8; 32]).unwrap();
        let c = EventId::from_slice(&[2u8; 32]).unwrap();

        assert!(window.insert(a));
        assert!(!window.insert(a));
        assert!(window.insert(b));
        // capacity 2: inserting c evicts a
        assert!(window.insert(c));
        assert!(window.insert(a));
    }
}
