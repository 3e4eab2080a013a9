//! Taproot-asset daemon adapter: issuance, transfers and proofs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::DaemonClient;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapAsset {
    pub asset_id: String,
    pub name: String,
    pub amount: i64,
    pub genesis_point: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MintResult {
    pub asset_id: String,
    pub batch_txid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_txid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofCheck {
    pub valid: bool,
    pub asset_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedAssetInvoice {
    pub asset_id: String,
    pub amount: i64,
    pub payment_hash: String,
}

#[async_trait]
pub trait TapDaemon: Send + Sync {
    async fn list_assets(&self) -> Result<Vec<TapAsset>>;

    async fn mint_asset(&self, name: &str, ticker: &str, amount: i64) -> Result<MintResult>;

    async fn transfer_asset(
        &self,
        asset_id: &str,
        recipient_script: &str,
        amount: i64,
    ) -> Result<TransferResult>;

    async fn verify_proof(&self, proof: &str) -> Result<ProofCheck>;

    /// Decode an asset-denominated Lightning invoice.
    async fn decode_asset_invoice(&self, invoice: &str) -> Result<DecodedAssetInvoice>;
}

pub struct TapdClient {
    client: DaemonClient,
}

impl TapdClient {
    pub fn new(client: DaemonClient) -> Self {
        Self { client }
    }

    pub async fn health_check(&self) -> bool {
        self.list_assets().await.is_ok()
    }
}

#[async_trait]
impl TapDaemon for TapdClient {
    async fn list_assets(&self) -> Result<Vec<TapAsset>> {
        #[derive(Deserialize)]
        struct ListResponse {
            assets: Vec<TapAsset>,
        }
        let resp: ListResponse = self
            .client
            .post("v1/taproot-assets/assets", &serde_json::json!({}))
            .await?;
        Ok(resp.assets)
    }

    async fn mint_asset(&self, name: &str, ticker: &str, amount: i64) -> Result<MintResult> {
        self.client
            .post(
                "v1/taproot-assets/mint",
                &serde_json::json!({
                    "name": name,
                    "ticker": ticker,
                    "amount": amount,
                }),
            )
            .await
    }

    async fn transfer_asset(
        &self,
        asset_id: &str,
        recipient_script: &str,
        amount: i64,
    ) -> Result<TransferResult> {
        self.client
            .post(
                "v1/taproot-assets/send",
                &serde_json::json!({
                    "asset_id": asset_id,
                    "script_key": recipient_script,
                    "amount": amount,
                }),
            )
            .await
    }

    async fn verify_proof(&self, proof: &str) -> Result<ProofCheck> {
        self.client
            .post(
                "v1/taproot-assets/proofs/verify",
                &serde_json::json!({ "raw_proof": proof }),
            )
            .await
    }

    async fn decode_asset_invoice(&self, invoice: &str) -> Result<DecodedAssetInvoice> {
        self.client
            .post(
                "v1/taproot-assets/invoices/decode",
                &serde_json::json!({ "invoice": invoice }),
            )
            .await
    }
}
