//! Shared status and type vocabulary for gateway records.
//!
//! Statuses are stored as strings; these enums are the single place that
//! knows the canonical names, the accepted legacy aliases, and the allowed
//! state progressions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Signing session lifecycle states.
///
/// `pending` and `response_received` are accepted as input aliases for
/// `initiated` and `awaiting_signature`; output is always canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initiated,
    ChallengeSent,
    AwaitingSignature,
    Signing,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initiated => "initiated",
            SessionStatus::ChallengeSent => "challenge_sent",
            SessionStatus::AwaitingSignature => "awaiting_signature",
            SessionStatus::Signing => "signing",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Expired
        )
    }

    /// Valid forward edges of the session state machine.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Initiated, ChallengeSent) => true,
            (ChallengeSent, AwaitingSignature) => true,
            (AwaitingSignature, Signing) => true,
            (Signing, Completed) => true,
            // any non-terminal state may fail or expire
            (from, Failed) | (from, Expired) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl FromStr for SessionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" | "pending" => Ok(SessionStatus::Initiated),
            "challenge_sent" => Ok(SessionStatus::ChallengeSent),
            "awaiting_signature" | "response_received" => Ok(SessionStatus::AwaitingSignature),
            "signing" => Ok(SessionStatus::Signing),
            "completed" => Ok(SessionStatus::Completed),
            "failed" => Ok(SessionStatus::Failed),
            "expired" => Ok(SessionStatus::Expired),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of operation a session executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    P2pTransfer,
    LightningLift,
    LightningLand,
    ProtocolOp,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::P2pTransfer => "p2p_transfer",
            SessionType::LightningLift => "lightning_lift",
            SessionType::LightningLand => "lightning_land",
            SessionType::ProtocolOp => "protocol_op",
        }
    }
}

impl FromStr for SessionType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p2p_transfer" => Ok(SessionType::P2pTransfer),
            "lightning_lift" => Ok(SessionType::LightningLift),
            "lightning_land" => Ok(SessionType::LightningLand),
            "protocol_op" => Ok(SessionType::ProtocolOp),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// VTXO lifecycle states. Transitions are monotone: a VTXO never moves
/// backwards, and `spent`/`expired` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VtxoStatus {
    Available,
    Assigned,
    Spent,
    Expired,
}

impl VtxoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VtxoStatus::Available => "available",
            VtxoStatus::Assigned => "assigned",
            VtxoStatus::Spent => "spent",
            VtxoStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VtxoStatus::Spent | VtxoStatus::Expired)
    }

    pub fn can_transition_to(&self, next: VtxoStatus) -> bool {
        use VtxoStatus::*;
        matches!(
            (self, next),
            (Available, Assigned) | (Available, Expired) | (Assigned, Spent) | (Assigned, Expired)
        )
    }
}

impl FromStr for VtxoStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(VtxoStatus::Available),
            "assigned" => Ok(VtxoStatus::Assigned),
            "spent" => Ok(VtxoStatus::Spent),
            "expired" => Ok(VtxoStatus::Expired),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for VtxoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcastable transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Prepared,
    Broadcast,
    Confirmed,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Prepared => "prepared",
            TxStatus::Broadcast => "broadcast",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Failed => "failed",
        }
    }
}

impl FromStr for TxStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepared" => Ok(TxStatus::Prepared),
            "broadcast" => Ok(TxStatus::Broadcast),
            "confirmed" => Ok(TxStatus::Confirmed),
            "failed" => Ok(TxStatus::Failed),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    ArkTx,
    CheckpointTx,
    SettlementTx,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::ArkTx => "ark_tx",
            TxType::CheckpointTx => "checkpoint_tx",
            TxType::SettlementTx => "settlement_tx",
        }
    }
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Settled,
    Failed,
    Expired,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Settled => "settled",
            InvoiceStatus::Failed => "failed",
            InvoiceStatus::Expired => "expired",
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InvoiceStatus::Pending),
            "settled" => Ok(InvoiceStatus::Settled),
            "failed" => Ok(InvoiceStatus::Failed),
            "expired" => Ok(InvoiceStatus::Expired),
            other => Err(StoreError::UnknownStatus(other.to_string())),
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceType {
    Lift,
    Land,
}

impl InvoiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceType::Lift => "lift",
            InvoiceType::Land => "land",
        }
    }
}

impl fmt::Display for InvoiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    Native,
    Permissionless,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Native => "native",
            AssetType::Permissionless => "permissionless",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_aliases_parse_to_canonical() {
        assert_eq!(
            "pending".parse::<SessionStatus>().unwrap(),
            SessionStatus::Initiated
        );
        assert_eq!(
            "response_received".parse::<SessionStatus>().unwrap(),
            SessionStatus::AwaitingSignature
        );
        // canonical output never echoes aliases
        assert_eq!(SessionStatus::Initiated.as_str(), "initiated");
        assert_eq!(SessionStatus::AwaitingSignature.as_str(), "awaiting_signature");
    }

    #[test]
    fn session_transition_graph() {
        use SessionStatus::*;
        let happy = [Initiated, ChallengeSent, AwaitingSignature, Signing, Completed];
        for pair in happy.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        // skipping a step is rejected
        assert!(!Initiated.can_transition_to(AwaitingSignature));
        assert!(!ChallengeSent.can_transition_to(Signing));
        assert!(!AwaitingSignature.can_transition_to(Completed));
        // terminal states are sinks
        for terminal in [Completed, Failed, Expired] {
            for next in [Initiated, ChallengeSent, AwaitingSignature, Signing, Completed, Failed, Expired] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        // every non-terminal state may fail or expire
        for from in [Initiated, ChallengeSent, AwaitingSignature, Signing] {
            assert!(from.can_transition_to(Failed));
            assert!(from.can_transition_to(Expired));
        }
    }

    #[test]
    fn vtxo_status_is_monotone() {
        use VtxoStatus::*;
        assert!(Available.can_transition_to(Assigned));
        assert!(Assigned.can_transition_to(Spent));
        assert!(Available.can_transition_to(Expired));
        assert!(Assigned.can_transition_to(Expired));
        // no backward or skipping edges
        assert!(!Assigned.can_transition_to(Available));
        assert!(!Spent.can_transition_to(Assigned));
        assert!(!Spent.can_transition_to(Available));
        assert!(!Expired.can_transition_to(Available));
        assert!(!Available.can_transition_to(Spent));
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("settling".parse::<SessionStatus>().is_err());
        assert!("reserved".parse::<VtxoStatus>().is_err());
    }
}
