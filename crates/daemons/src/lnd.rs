//! Lightning daemon adapter: invoices and payments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::DaemonClient;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LnInfo {
    pub identity_pubkey: String,
    pub synced_to_chain: bool,
    pub block_height: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedInvoice {
    pub payment_hash: String,
    pub bolt11: String,
    pub add_index: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LnInvoiceState {
    Open,
    Settled,
    Cancelled,
    Accepted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceStatus {
    pub payment_hash: String,
    pub state: LnInvoiceState,
    pub amt_paid_sat: i64,
    pub preimage: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedInvoice {
    pub payment_hash: String,
    pub num_satoshis: i64,
    pub description: String,
    pub expiry: i64,
    pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResult {
    pub payment_hash: String,
    pub preimage: Option<String>,
    pub fee_sats: i64,
    pub succeeded: bool,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBalance {
    pub local_balance_sat: i64,
    pub remote_balance_sat: i64,
}

#[async_trait]
pub trait LightningDaemon: Send + Sync {
    async fn get_info(&self) -> Result<LnInfo>;

    async fn add_invoice(&self, amount_sats: i64, memo: &str, expiry_secs: i64)
        -> Result<CreatedInvoice>;

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceStatus>;

    async fn decode_invoice(&self, bolt11: &str) -> Result<DecodedInvoice>;

    async fn send_payment(&self, bolt11: &str, fee_limit_sats: i64) -> Result<PaymentResult>;

    async fn channel_balance(&self) -> Result<ChannelBalance>;
}

pub struct LndClient {
    client: DaemonClient,
}

impl LndClient {
    pub fn new(client: DaemonClient) -> Self {
        Self { client }
    }

    pub async fn health_check(&self) -> bool {
        matches!(self.get_info().await, Ok(info) if info.synced_to_chain)
    }
}

#[async_trait]
impl LightningDaemon for LndClient {
    async fn get_info(&self) -> Result<LnInfo> {
        self.client.post("v1/getinfo", &serde_json::json!({})).await
    }

    async fn add_invoice(
        &self,
        amount_sats: i64,
        memo: &str,
        expiry_secs: i64,
    ) -> Result<CreatedInvoice> {
        self.client
            .post(
                "v1/invoices",
                &serde_json::json!({
                    "value": amount_sats,
                    "memo": memo,
                    "expiry": expiry_secs,
                }),
            )
            .await
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceStatus> {
        self.client
            .post(
                "v1/invoice/lookup",
                &serde_json::json!({ "payment_hash": payment_hash }),
            )
            .await
    }

    async fn decode_invoice(&self, bolt11: &str) -> Result<DecodedInvoice> {
        self.client
            .post("v1/payreq/decode", &serde_json::json!({ "pay_req": bolt11 }))
            .await
    }

    async fn send_payment(&self, bolt11: &str, fee_limit_sats: i64) -> Result<PaymentResult> {
        self.client
            .post(
                "v1/channels/transactions",
                &serde_json::json!({
                    "payment_request": bolt11,
                    "fee_limit_sat": fee_limit_sats,
                }),
            )
            .await
    }

    async fn channel_balance(&self) -> Result<ChannelBalance> {
        self.client
            .post("v1/balance/channels", &serde_json::json!({}))
            .await
    }
}
