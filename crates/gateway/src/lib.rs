//! Non-custodial L2 settlement gateway orchestration engine.
//!
//! Accepts user intents from the relay overlay, conducts the interactive
//! signing ceremony with the user's wallet, coordinates the Ark,
//! Taproot-asset and Lightning daemons, and publishes public confirmations
//! of the results.

pub mod assets;
pub mod ceremony;
pub mod challenge;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gateway;
pub mod lightning;
pub mod outbound;
pub mod processor;
pub mod session;
pub mod settlement;
pub mod state;
pub mod vtxo;

pub use config::Config;
pub use error::{GatewayError, Result};
