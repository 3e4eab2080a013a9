//! Relay overlay client for the gateway identity.
//!
//! Wraps the Nostr relay pool: inbound subscription/dedup/decryption on one
//! channel, outbound challenge/failure DMs and public confirmation notices.

pub mod client;
pub mod error;
pub mod protocol;

pub use client::{InboundEvent, RelayClient};
pub use error::{RelayError, Result};
pub use protocol::{
    ChallengePayload, ConfirmationPayload, FailurePayload, IntentPayload, L1CommitmentPayload,
    ResponsePayload,
};
