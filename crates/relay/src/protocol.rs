//! Wire protocol spoken over the relay overlay.
//!
//! Kinds continue the 315xx block used by wallets today. Payloads are JSON
//! in the event content; direct-message kinds carry NIP-04 ciphertext.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Solver service request (public).
pub const KIND_SERVICE_REQUEST: u16 = 31500;
/// Solver service response (public).
pub const KIND_SERVICE_RESPONSE: u16 = 31501;
/// User action intent (public, p-tagged to the gateway).
pub const KIND_INTENT: u16 = 31510;
/// Signing challenge (DM to the wallet).
pub const KIND_SIGNING_CHALLENGE: u16 = 31511;
/// Signing response (DM to the gateway).
pub const KIND_SIGNING_RESPONSE: u16 = 31512;
/// Public settlement confirmation.
pub const KIND_CONFIRMATION: u16 = 31520;
/// Failure notice (DM to the wallet).
pub const KIND_FAILURE: u16 = 31521;
/// Public L1 commitment notice.
pub const KIND_L1_COMMITMENT: u16 = 31522;

/// Inbound kinds the gateway subscribes to.
pub const INBOUND_KINDS: [u16; 3] = [KIND_SERVICE_REQUEST, KIND_INTENT, KIND_SIGNING_RESPONSE];

/// Kinds whose content is NIP-04 encrypted.
pub fn is_direct_message(kind: u16) -> bool {
    matches!(
        kind,
        KIND_SIGNING_CHALLENGE | KIND_SIGNING_RESPONSE | KIND_FAILURE
    )
}

/// High-level action authorization published by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentPayload {
    pub action_id: String,
    #[serde(rename = "type")]
    pub intent_type: String,
    pub params: JsonValue,
    /// Unix seconds; intents are rejected once past this.
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengePayload {
    pub session_id: String,
    pub challenge_id: String,
    #[serde(rename = "type")]
    pub challenge_type: String,
    pub payload_to_sign: String,
    pub payload_ref: String,
    pub algo: String,
    pub domain: String,
    pub context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_total: Option<u32>,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub session_id: String,
    pub challenge_id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub signature: String,
    /// Must equal the challenge's `payload_ref`.
    pub payload_ref: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationPayload {
    pub status: String,
    pub ref_action_id: String,
    pub results: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePayload {
    pub status: String,
    pub code: u32,
    pub message: String,
    pub ref_action_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L1CommitmentPayload {
    pub l1_txid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_height: Option<i64>,
    pub merkle_root: String,
    pub batch_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_round_trips_with_type_field() {
        let json = r#"{
            "action_id": "a1",
            "type": "p2p_transfer",
            "params": {"amount": 10000},
            "expires_at": 1900000000
        }"#;
        let intent: IntentPayload = serde_json::from_str(json).unwrap();
        assert_eq!(intent.intent_type, "p2p_transfer");
        let back = serde_json::to_value(&intent).unwrap();
        assert_eq!(back["type"], "p2p_transfer");
    }

    #[test]
    fn dm_kinds_are_encrypted() {
        assert!(is_direct_message(KIND_SIGNING_CHALLENGE));
        assert!(is_direct_message(KIND_SIGNING_RESPONSE));
        assert!(is_direct_message(KIND_FAILURE));
        assert!(!is_direct_message(KIND_INTENT));
        assert!(!is_direct_message(KIND_CONFIRMATION));
    }
}
