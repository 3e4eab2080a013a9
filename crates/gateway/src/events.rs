//! Intent decoding and validation.
//!
//! Maps relay intent payloads to typed session parameters, enforcing the
//! schema, freshness and fee rules before a session is created.

use chrono::{DateTime, TimeZone, Utc};
use relay::IntentPayload;
use serde_json::Value as JsonValue;
use store::SessionType;

use crate::constants::{LAND_FEE_BPS, TRANSFER_FEE_UNITS};
use crate::error::{GatewayError, Result};

/// A validated, typed intent ready to become a session.
#[derive(Debug, Clone)]
pub struct Intent {
    pub author: String,
    pub event_id: String,
    pub action_id: String,
    pub expires_at: DateTime<Utc>,
    pub kind: IntentKind,
    pub raw: JsonValue,
}

#[derive(Debug, Clone)]
pub enum IntentKind {
    Transfer(TransferParams),
    Lift(LiftParams),
    Land(LandParams),
    /// Namespaced type delegated to a registered solver.
    Solver { namespace: String },
}

#[derive(Debug, Clone)]
pub struct TransferParams {
    pub recipient_pubkey: String,
    pub asset_id: String,
    pub amount: i64,
    pub fee: i64,
}

#[derive(Debug, Clone)]
pub struct LiftParams {
    pub asset_id: String,
    pub amount_sats: i64,
}

#[derive(Debug, Clone)]
pub struct LandParams {
    pub asset_id: String,
    pub amount_sats: i64,
    pub fee: i64,
    pub invoice: String,
}

impl Intent {
    pub fn session_type(&self) -> SessionType {
        match self.kind {
            IntentKind::Transfer(_) => SessionType::P2pTransfer,
            IntentKind::Lift(_) => SessionType::LightningLift,
            IntentKind::Land(_) => SessionType::LightningLand,
            IntentKind::Solver { .. } => SessionType::ProtocolOp,
        }
    }

    /// Human-readable summary shown to the wallet alongside the challenge.
    pub fn context(&self) -> String {
        match &self.kind {
            IntentKind::Transfer(t) => format!(
                "Transfer {} {} to {}",
                t.amount,
                t.asset_id,
                abbrev(&t.recipient_pubkey)
            ),
            IntentKind::Lift(l) => format!(
                "Lightning lift (on-ramp): {} sats into {}",
                l.amount_sats, l.asset_id
            ),
            IntentKind::Land(l) => format!(
                "Lightning land (off-ramp): {} sats out of {} (fee {})",
                l.amount_sats, l.asset_id, l.fee
            ),
            IntentKind::Solver { namespace } => format!("Protocol operation: {namespace}"),
        }
    }
}

/// Parse and validate an intent payload. `registered_solvers` decides
/// whether unknown namespaced types are delegated or rejected.
pub fn parse_intent(
    author: &str,
    event_id: &str,
    payload: IntentPayload,
    now: DateTime<Utc>,
    native_asset_id: &str,
    registered_solvers: &std::collections::HashMap<String, String>,
) -> Result<Intent> {
    if payload.action_id.is_empty() {
        return Err(GatewayError::Validation("intent missing action_id".into()));
    }
    let expires_at = Utc
        .timestamp_opt(payload.expires_at, 0)
        .single()
        .ok_or_else(|| GatewayError::Validation("intent expires_at out of range".into()))?;
    if expires_at <= now {
        return Err(GatewayError::Expired(format!(
            "intent {} expired at {}",
            payload.action_id, expires_at
        )));
    }

    let params = &payload.params;
    let kind = match payload.intent_type.as_str() {
        "p2p_transfer" => {
            let transfer = TransferParams {
                recipient_pubkey: required_str(params, "recipient")?,
                asset_id: required_str(params, "asset_id")?,
                amount: required_amount(params, "amount")?,
                fee: params.get("fee").and_then(JsonValue::as_i64).unwrap_or(-1),
            };
            validate_pubkey(&transfer.recipient_pubkey)?;
            // fee is always denominated in the native asset
            if transfer.fee != TRANSFER_FEE_UNITS {
                return Err(GatewayError::FeeOutput(format!(
                    "transfer fee output must be {TRANSFER_FEE_UNITS} {native_asset_id}, got {}",
                    transfer.fee
                )));
            }
            IntentKind::Transfer(transfer)
        }
        "lightning:lift" => IntentKind::Lift(LiftParams {
            asset_id: required_str(params, "asset_id")?,
            amount_sats: required_amount(params, "amount")?,
        }),
        "lightning:land" => {
            let land = LandParams {
                asset_id: required_str(params, "asset_id")?,
                amount_sats: required_amount(params, "amount")?,
                fee: params.get("fee").and_then(JsonValue::as_i64).unwrap_or(-1),
                invoice: required_str(params, "invoice")?,
            };
            let expected_fee = land_fee(land.amount_sats);
            if land.fee != expected_fee {
                return Err(GatewayError::FeeOutput(format!(
                    "land fee output must be {expected_fee} ({} bps), got {}",
                    LAND_FEE_BPS, land.fee
                )));
            }
            IntentKind::Land(land)
        }
        other => {
            let namespace = other.split(':').next().unwrap_or(other).to_string();
            if registered_solvers.contains_key(&namespace) {
                IntentKind::Solver { namespace }
            } else {
                return Err(GatewayError::Validation(format!(
                    "unsupported intent type {other}"
                )));
            }
        }
    };

    let raw = serde_json::json!({
        "action_id": payload.action_id.clone(),
        "type": payload.intent_type.clone(),
        "params": payload.params.clone(),
        "expires_at": payload.expires_at,
    });

    Ok(Intent {
        author: author.to_string(),
        event_id: event_id.to_string(),
        action_id: payload.action_id,
        expires_at,
        kind,
        raw,
    })
}

/// 0.1% of the withdrawn amount, floored, minimum one unit.
pub fn land_fee(amount_sats: i64) -> i64 {
    (amount_sats * LAND_FEE_BPS / 10_000).max(1)
}

fn required_str(params: &JsonValue, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::Validation(format!("intent params missing `{key}`")))
}

fn required_amount(params: &JsonValue, key: &str) -> Result<i64> {
    let amount = params
        .get(key)
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| GatewayError::Validation(format!("intent params missing `{key}`")))?;
    if amount <= 0 {
        return Err(GatewayError::Validation(format!(
            "`{key}` must be positive, got {amount}"
        )));
    }
    Ok(amount)
}

fn validate_pubkey(pubkey: &str) -> Result<()> {
    let ok = (pubkey.len() == 64 || pubkey.len() == 66)
        && pubkey.chars().all(|c| c.is_ascii_hexdigit());
    if ok {
        Ok(())
    } else {
        Err(GatewayError::InvalidRecipient(format!(
            "recipient pubkey `{}` is not a hex public key",
            abbrev(pubkey)
        )))
    }
}

fn abbrev(pubkey: &str) -> String {
    if pubkey.len() > 8 {
        format!("{}...", &pubkey[..8])
    } else {
        pubkey.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn payload(intent_type: &str, params: JsonValue) -> IntentPayload {
        IntentPayload {
            action_id: "a1".into(),
            intent_type: intent_type.into(),
            params,
            expires_at: Utc::now().timestamp() + 900,
        }
    }

    fn parse(p: IntentPayload) -> Result<Intent> {
        parse_intent(
            &"a".repeat(64),
            "e1",
            p,
            Utc::now(),
            "gBTC",
            &HashMap::new(),
        )
    }

    #[test]
    fn transfer_with_correct_fee_parses() {
        let intent = parse(payload(
            "p2p_transfer",
            serde_json::json!({
                "recipient": "b".repeat(64),
                "asset_id": "gBTC",
                "amount": 10000,
                "fee": 10,
            }),
        ))
        .unwrap();
        assert!(matches!(intent.kind, IntentKind::Transfer(_)));
        assert_eq!(intent.session_type(), store::SessionType::P2pTransfer);
    }

    #[test]
    fn mispriced_fee_is_4001() {
        let err = parse(payload(
            "p2p_transfer",
            serde_json::json!({
                "recipient": "b".repeat(64),
                "asset_id": "gBTC",
                "amount": 10000,
                "fee": 5,
            }),
        ))
        .unwrap_err();
        assert_eq!(err.code(), 4001);

        // missing fee entirely
        let err = parse(payload(
            "p2p_transfer",
            serde_json::json!({
                "recipient": "b".repeat(64),
                "asset_id": "gBTC",
                "amount": 10000,
            }),
        ))
        .unwrap_err();
        assert_eq!(err.code(), 4001);
    }

    #[test]
    fn bad_recipient_is_2003() {
        let err = parse(payload(
            "p2p_transfer",
            serde_json::json!({
                "recipient": "not-hex",
                "asset_id": "gBTC",
                "amount": 10000,
                "fee": 10,
            }),
        ))
        .unwrap_err();
        assert_eq!(err.code(), 2003);
    }

    #[test]
    fn expired_intent_is_rejected() {
        let mut p = payload(
            "lightning:lift",
            serde_json::json!({"asset_id": "gBTC", "amount": 1000}),
        );
        p.expires_at = Utc::now().timestamp() - 1;
        let err = parse(p).unwrap_err();
        assert_eq!(err.code(), 5002);
    }

    #[test]
    fn land_fee_is_ten_bps_with_floor() {
        assert_eq!(land_fee(1_000_000), 1000);
        assert_eq!(land_fee(10_000), 10);
        assert_eq!(land_fee(500), 1);
    }

    #[test]
    fn land_with_wrong_fee_is_4001() {
        let err = parse(payload(
            "lightning:land",
            serde_json::json!({
                "asset_id": "gBTC",
                "amount": 1_000_000,
                "fee": 5,
                "invoice": "lnbc10m1...",
            }),
        ))
        .unwrap_err();
        assert_eq!(err.code(), 4001);
    }

    #[test]
    fn unknown_type_without_solver_is_rejected() {
        let err = parse(payload("lending:open", serde_json::json!({}))).unwrap_err();
        assert_eq!(err.code(), 3001);
    }

    #[test]
    fn unknown_type_with_registered_solver_delegates() {
        let mut solvers = HashMap::new();
        solvers.insert("lending".to_string(), "c".repeat(64));
        let intent = parse_intent(
            &"a".repeat(64),
            "e1",
            payload("lending:open", serde_json::json!({"pool": "x"})),
            Utc::now(),
            "gBTC",
            &solvers,
        )
        .unwrap();
        assert!(matches!(intent.kind, IntentKind::Solver { .. }));
        assert_eq!(intent.session_type(), store::SessionType::ProtocolOp);
    }
}
