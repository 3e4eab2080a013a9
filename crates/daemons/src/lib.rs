//! Uniform access to the three backend daemons (arkd, tapd, lnd).
//!
//! Each adapter shares one transport shape (`DaemonClient::post`) with
//! retry, timeout and a circuit breaker; protocol operations live behind
//! the `ArkDaemon` / `TapDaemon` / `LightningDaemon` traits so the
//! orchestrator can run against mocks in tests.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

pub mod arkd;
pub mod breaker;
pub mod client;
pub mod error;
pub mod lnd;
pub mod tapd;

pub use arkd::{
    ArkDaemon, ArkdClient, BatchVtxo, CheckpointPrep, CollectedSignature, CommitmentTx,
    Confirmations, FinalizedTx, NetworkInfo, PreparedTx, SigningPayload, TxOutput, VtxoBatch,
};
pub use breaker::{BreakerState, CircuitBreaker};
pub use client::{DaemonClient, RetryPolicy};
pub use error::{DaemonError, Result};
pub use lnd::{
    ChannelBalance, CreatedInvoice, DecodedInvoice, InvoiceStatus as LnInvoiceStatus,
    LightningDaemon, LnInfo, LnInvoiceState, LndClient, PaymentResult,
};
pub use tapd::{
    DecodedAssetInvoice, MintResult, ProofCheck, TapAsset, TapDaemon, TapdClient, TransferResult,
};

/// Connection settings for one daemon endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub url: String,
    pub macaroon: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub arkd: EndpointConfig,
    pub tapd: EndpointConfig,
    pub lnd: EndpointConfig,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

/// Per-daemon health snapshot.
#[derive(Debug, Clone, Copy)]
pub struct DaemonHealth {
    pub arkd: bool,
    pub tapd: bool,
    pub lnd: bool,
}

impl DaemonHealth {
    pub fn all_healthy(&self) -> bool {
        self.arkd && self.tapd && self.lnd
    }
}

/// Long-lived holder of the three adapters, shared across workers.
#[derive(Clone)]
pub struct DaemonManager {
    arkd: Arc<ArkdClient>,
    tapd: Arc<TapdClient>,
    lnd: Arc<LndClient>,
}

impl DaemonManager {
    pub fn new(config: &DaemonConfig) -> Result<Self> {
        let arkd = ArkdClient::new(DaemonClient::new(
            "arkd",
            &config.arkd.url,
            config.arkd.macaroon.clone(),
            config.call_timeout,
            config.retry.clone(),
        )?);
        let tapd = TapdClient::new(DaemonClient::new(
            "tapd",
            &config.tapd.url,
            config.tapd.macaroon.clone(),
            config.call_timeout,
            config.retry.clone(),
        )?);
        let lnd = LndClient::new(DaemonClient::new(
            "lnd",
            &config.lnd.url,
            config.lnd.macaroon.clone(),
            config.call_timeout,
            config.retry.clone(),
        )?);
        info!(
            "Daemon adapters configured: arkd={} tapd={} lnd={}",
            config.arkd.url, config.tapd.url, config.lnd.url
        );
        Ok(Self {
            arkd: Arc::new(arkd),
            tapd: Arc::new(tapd),
            lnd: Arc::new(lnd),
        })
    }

    pub fn ark(&self) -> Arc<dyn ArkDaemon> {
        self.arkd.clone()
    }

    pub fn tap(&self) -> Arc<dyn TapDaemon> {
        self.tapd.clone()
    }

    pub fn lightning(&self) -> Arc<dyn LightningDaemon> {
        self.lnd.clone()
    }

    pub async fn health(&self) -> DaemonHealth {
        let (arkd, tapd, lnd) = tokio::join!(
            self.arkd.health_check(),
            self.tapd.health_check(),
            self.lnd.health_check(),
        );
        DaemonHealth { arkd, tapd, lnd }
    }
}
