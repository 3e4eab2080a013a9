//! Signing challenges: generation, delivery payloads and response
//! verification.
//!
//! The challenge body is deterministic — a canonical JSON serialization of
//! the session's logical payload — so the wallet can re-derive the digest
//! (`payload_ref`) from the original intent and refuse to sign anything
//! that does not match what it authorized.

use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use monitoring::GatewayMetrics;
use relay::{ChallengePayload, ResponsePayload};
use secp256k1::schnorr::Signature;
use secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use store::entity::signing_challenge::Model as Challenge;
use store::entity::signing_session::Model as Session;
use store::{challenges, sessions, SessionStatus};
use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::state::SharedState;

/// Signature scheme advertised in challenge DMs.
pub const CHALLENGE_ALGO: &str = "schnorr-secp256k1";
/// Domain separator so wallet signatures cannot be replayed elsewhere.
pub const CHALLENGE_DOMAIN: &str = "arkrelay-gateway-v1";

#[derive(Clone)]
pub struct ChallengeManager {
    state: SharedState,
}

/// Outcome of a response verification.
#[derive(Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Signature accepted and bound; session moved to `signing`.
    Accepted,
    /// The challenge was already consumed; duplicate responses are dropped.
    AlreadyUsed,
}

impl ChallengeManager {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Create, persist and return the challenge for a session covering the
    /// given signing payloads.
    pub async fn issue(
        &self,
        session: &Session,
        signing_payloads: &[String],
        step_index: u32,
        step_total: u32,
    ) -> Result<(Challenge, ChallengePayload)> {
        let now = Utc::now();
        let expires_at = self.state.challenge_deadline(now, session.expires_at);
        if expires_at <= now {
            return Err(GatewayError::Expired(format!(
                "session {} has no time left for a challenge",
                session.session_id
            )));
        }

        let challenge_bytes = challenge_bytes(session, signing_payloads);
        let payload_ref = digest_hex(&challenge_bytes);
        let challenge_id = uuid::Uuid::new_v4().to_string();

        let stored = challenges::insert(
            self.state.store.connection(),
            challenges::NewChallenge {
                challenge_id: challenge_id.clone(),
                session_id: session.session_id.clone(),
                challenge_data: BASE64.encode(&challenge_bytes),
                payload_ref: payload_ref.clone(),
                context: session.context.clone().unwrap_or_default(),
                step_index: step_index as i32,
                step_total: step_total as i32,
                expires_at,
            },
        )
        .await?;
        sessions::set_challenge(
            self.state.store.connection(),
            &session.session_id,
            &challenge_id,
        )
        .await?;
        GatewayMetrics::incr(&self.state.metrics.challenges_issued);
        info!(
            "issued challenge {} for session {} (step {}/{})",
            challenge_id, session.session_id, step_index, step_total
        );

        let dm = ChallengePayload {
            session_id: session.session_id.clone(),
            challenge_id,
            challenge_type: "sign_payload".to_string(),
            payload_to_sign: BASE64.encode(&challenge_bytes),
            payload_ref,
            algo: CHALLENGE_ALGO.to_string(),
            domain: CHALLENGE_DOMAIN.to_string(),
            context: session.context.clone().unwrap_or_default(),
            step_index: Some(step_index),
            step_total: Some(step_total),
            expires_at: expires_at.timestamp(),
        };
        Ok((stored, dm))
    }

    /// Verify a wallet response and bind it to its session.
    ///
    /// Order matters: existence, expiry, digest, signature, then the atomic
    /// consume; only the winner of the consume moves the session to
    /// `signing`.
    pub async fn verify(&self, author: &str, response: &ResponsePayload) -> Result<VerifyOutcome> {
        let db = self.state.store.connection();
        let challenge = challenges::find_by_challenge_id(db, &response.challenge_id)
            .await?
            .ok_or_else(|| {
                GatewayError::SignatureInvalid(format!(
                    "unknown challenge {}",
                    response.challenge_id
                ))
            })?;
        if challenge.session_id != response.session_id {
            return Err(GatewayError::SignatureInvalid(
                "response session does not match challenge".to_string(),
            ));
        }
        if challenge.is_used {
            return Ok(VerifyOutcome::AlreadyUsed);
        }

        let session = sessions::find_by_session_id(db, &challenge.session_id)
            .await?
            .ok_or_else(|| {
                GatewayError::Internal(format!("session {} missing", challenge.session_id))
            })?;
        if author != session.user_pubkey {
            return Err(GatewayError::InvalidAuthorSignature(format!(
                "response author {} is not the session owner",
                abbrev(author)
            )));
        }
        let status = SessionStatus::from_str(&session.status)?;
        if status != SessionStatus::AwaitingSignature {
            return Err(GatewayError::InvalidTransition(format!(
                "session {} is {status}, not awaiting a signature",
                session.session_id
            )));
        }

        let now = Utc::now();
        if challenge.expires_at <= now {
            return Err(GatewayError::Expired(format!(
                "challenge {} expired at {}",
                challenge.challenge_id, challenge.expires_at
            )));
        }

        let challenge_bytes = BASE64.decode(&challenge.challenge_data).map_err(|e| {
            GatewayError::Internal(format!("stored challenge data undecodable: {e}"))
        })?;
        if digest_hex(&challenge_bytes) != response.payload_ref
            || challenge.payload_ref != response.payload_ref
        {
            return Err(GatewayError::SignatureInvalid(
                "payload_ref does not match the challenged payload".to_string(),
            ));
        }

        verify_schnorr(&session.user_pubkey, &challenge_bytes, &response.signature)?;

        // single-winner consume; losers of a concurrent race land here
        let consumed =
            challenges::consume(db, &challenge.challenge_id, &response.signature, now).await?;
        if !consumed {
            warn!(
                "challenge {} consumed concurrently, dropping duplicate response",
                challenge.challenge_id
            );
            return Ok(VerifyOutcome::AlreadyUsed);
        }

        let moved = sessions::transition(
            db,
            &session.session_id,
            &[SessionStatus::AwaitingSignature],
            SessionStatus::Signing,
            None,
        )
        .await?;
        if !moved {
            return Err(GatewayError::Conflict(format!(
                "session {} left awaiting_signature during verification",
                session.session_id
            )));
        }

        GatewayMetrics::incr(&self.state.metrics.responses_accepted);
        info!(
            "response bound to session {} (challenge {})",
            session.session_id, challenge.challenge_id
        );
        Ok(VerifyOutcome::Accepted)
    }
}

/// Canonical challenge body. serde_json serializes object keys in sorted
/// order, which is what makes this reproducible on the wallet side.
pub fn challenge_bytes(session: &Session, signing_payloads: &[String]) -> Vec<u8> {
    let body = serde_json::json!({
        "domain": CHALLENGE_DOMAIN,
        "session_id": session.session_id,
        "user_pubkey": session.user_pubkey,
        "session_type": session.session_type,
        "intent": session.intent_data,
        "payloads": signing_payloads,
    });
    serde_json::to_vec(&body).expect("static json structure serializes")
}

pub fn digest_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Schnorr verification over sha256 of the challenge bytes with the
/// session owner's x-only key.
fn verify_schnorr(pubkey_hex: &str, challenge_bytes: &[u8], signature_hex: &str) -> Result<()> {
    // accept compressed keys by dropping the parity byte
    let xonly_hex = match pubkey_hex.len() {
        66 => &pubkey_hex[2..],
        _ => pubkey_hex,
    };
    let pubkey_bytes = hex::decode(xonly_hex)
        .map_err(|e| GatewayError::SignatureInvalid(format!("bad pubkey encoding: {e}")))?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes)
        .map_err(|e| GatewayError::SignatureInvalid(format!("bad pubkey: {e}")))?;

    let sig_bytes = hex::decode(signature_hex)
        .map_err(|e| GatewayError::SignatureInvalid(format!("bad signature encoding: {e}")))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| GatewayError::SignatureInvalid(format!("bad signature: {e}")))?;

    let digest: [u8; 32] = Sha256::digest(challenge_bytes).into();
    let message = Message::from_digest(digest);

    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&signature, &message, &pubkey)
        .map_err(|_| GatewayError::SignatureInvalid("schnorr verification failed".to_string()))
}

fn abbrev(pubkey: &str) -> &str {
    pubkey.get(..8).unwrap_or(pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use secp256k1::Keypair;

    fn test_session() -> Session {
        let now = Utc::now();
        Session {
            id: 1,
            session_id: "s1".to_string(),
            user_pubkey: "a".repeat(64),
            action_id: "a1".to_string(),
            session_type: "p2p_transfer".to_string(),
            status: "awaiting_signature".to_string(),
            intent_data: serde_json::json!({"amount": 10000}),
            context: Some("Transfer".to_string()),
            last_completed_step: 3,
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::minutes(30),
            result_data: None,
            signed_tx: None,
            error_message: None,
            challenge_id: None,
        }
    }

    #[test]
    fn challenge_bytes_are_deterministic() {
        let session = test_session();
        let payloads = vec!["cGF5bG9hZA==".to_string()];
        let a = challenge_bytes(&session, &payloads);
        let b = challenge_bytes(&session, &payloads);
        assert_eq!(a, b);
        assert_eq!(digest_hex(&a), digest_hex(&b));
        // different payloads change the digest
        let c = challenge_bytes(&session, &["b3RoZXI=".to_string()]);
        assert_ne!(digest_hex(&a), digest_hex(&c));
    }

    #[test]
    fn schnorr_round_trip_and_bit_flips() {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        let (xonly, _) = keypair.x_only_public_key();
        let pubkey_hex = hex::encode(xonly.serialize());

        let session = test_session();
        let bytes = challenge_bytes(&session, &["cGF5bG9hZA==".to_string()]);
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        let message = Message::from_digest(digest);
        let signature = secp.sign_schnorr_no_aux_rand(&message, &keypair);
        let sig_hex = hex::encode(signature.serialize());

        assert!(verify_schnorr(&pubkey_hex, &bytes, &sig_hex).is_ok());

        // flip one byte of the signature
        let mut bad_sig = hex::decode(&sig_hex).unwrap();
        bad_sig[10] ^= 0x01;
        assert!(verify_schnorr(&pubkey_hex, &bytes, &hex::encode(bad_sig)).is_err());

        // flip one byte of the challenge data
        let mut bad_bytes = bytes.clone();
        bad_bytes[0] ^= 0x01;
        assert!(verify_schnorr(&pubkey_hex, &bad_bytes, &sig_hex).is_err());

        // wrong key
        let other = Keypair::new(&secp, &mut rand::thread_rng());
        let (other_xonly, _) = other.x_only_public_key();
        assert!(
            verify_schnorr(&hex::encode(other_xonly.serialize()), &bytes, &sig_hex).is_err()
        );
    }
}
