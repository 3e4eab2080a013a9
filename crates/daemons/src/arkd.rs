//! Ark daemon adapter: VTXO lifecycle and L1 commitment operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::DaemonClient;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub network: String,
    pub block_height: i64,
    pub synced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchVtxo {
    pub vtxo_id: String,
    pub txid: String,
    pub vout: i32,
    pub script_pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VtxoBatch {
    pub batch_txid: String,
    pub vtxos: Vec<BatchVtxo>,
}

/// One per-input blob the wallet must sign. Opaque to the gateway; only the
/// digest (`payload_ref` upstream) binds it to a challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningPayload {
    pub input_id: String,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreparedTx {
    pub ark_txid: String,
    pub unsigned_tx: String,
    pub signing_payloads: Vec<SigningPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPrep {
    pub checkpoint_txid: String,
    pub signing_payloads: Vec<SigningPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectedSignature {
    pub input_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizedTx {
    pub txid: String,
    pub signed_tx: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxOutput {
    pub recipient_pubkey: Option<String>,
    pub amount_sats: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitmentTx {
    pub txid: String,
    pub raw_tx: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Confirmations {
    pub txid: String,
    pub confirmations: u32,
    pub block_height: Option<i64>,
}

#[async_trait]
pub trait ArkDaemon: Send + Sync {
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    async fn create_vtxo_batch(
        &self,
        asset_id: &str,
        count: u32,
        amount_sats: i64,
        fee_sats: i64,
    ) -> Result<VtxoBatch>;

    /// Build the unsigned Ark transaction for the given inputs/outputs and
    /// return the per-input signing payloads.
    async fn prepare_transaction(
        &self,
        input_vtxo_ids: &[String],
        outputs: &[TxOutput],
    ) -> Result<PreparedTx>;

    /// Produce the checkpoint transaction binding `ark_txid` to L1
    /// commitment scheduling.
    async fn prepare_checkpoint(&self, ark_txid: &str) -> Result<CheckpointPrep>;

    /// Submit collected signatures; the daemon finalizes and returns the
    /// signed transaction.
    async fn submit_signatures(
        &self,
        ark_txid: &str,
        signatures: &[CollectedSignature],
    ) -> Result<FinalizedTx>;

    async fn create_commitment(
        &self,
        asset_id: &str,
        vtxo_ids: &[String],
        merkle_root: &str,
        fee_sats: i64,
    ) -> Result<CommitmentTx>;

    async fn broadcast(&self, raw_tx: &str) -> Result<String>;

    async fn get_fee_rate(&self) -> Result<i64>;

    async fn get_confirmations(&self, txid: &str) -> Result<Confirmations>;
}

pub struct ArkdClient {
    client: DaemonClient,
}

impl ArkdClient {
    pub fn new(client: DaemonClient) -> Self {
        Self { client }
    }

    pub async fn health_check(&self) -> bool {
        self.get_network_info().await.is_ok()
    }
}

#[async_trait]
impl ArkDaemon for ArkdClient {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        self.client.post("v1/network/info", &serde_json::json!({})).await
    }

    async fn create_vtxo_batch(
        &self,
        asset_id: &str,
        count: u32,
        amount_sats: i64,
        fee_sats: i64,
    ) -> Result<VtxoBatch> {
        self.client
            .post(
                "v1/vtxos/batch",
                &serde_json::json!({
                    "asset_id": asset_id,
                    "count": count,
                    "amount_sats": amount_sats,
                    "fee_sats": fee_sats,
                }),
            )
            .await
    }

    async fn prepare_transaction(
        &self,
        input_vtxo_ids: &[String],
        outputs: &[TxOutput],
    ) -> Result<PreparedTx> {
        self.client
            .post(
                "v1/tx/prepare",
                &serde_json::json!({
                    "inputs": input_vtxo_ids,
                    "outputs": outputs,
                }),
            )
            .await
    }

    async fn prepare_checkpoint(&self, ark_txid: &str) -> Result<CheckpointPrep> {
        self.client
            .post(
                "v1/tx/checkpoint",
                &serde_json::json!({ "ark_txid": ark_txid }),
            )
            .await
    }

    async fn submit_signatures(
        &self,
        ark_txid: &str,
        signatures: &[CollectedSignature],
    ) -> Result<FinalizedTx> {
        self.client
            .post(
                "v1/tx/submit",
                &serde_json::json!({
                    "ark_txid": ark_txid,
                    "signatures": signatures,
                }),
            )
            .await
    }

    async fn create_commitment(
        &self,
        asset_id: &str,
        vtxo_ids: &[String],
        merkle_root: &str,
        fee_sats: i64,
    ) -> Result<CommitmentTx> {
        self.client
            .post(
                "v1/commitment/create",
                &serde_json::json!({
                    "asset_id": asset_id,
                    "vtxo_ids": vtxo_ids,
                    "merkle_root": merkle_root,
                    "fee_sats": fee_sats,
                }),
            )
            .await
    }

    async fn broadcast(&self, raw_tx: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct BroadcastResponse {
            txid: String,
        }
        let resp: BroadcastResponse = self
            .client
            .post("v1/tx/broadcast", &serde_json::json!({ "raw_tx": raw_tx }))
            .await?;
        Ok(resp.txid)
    }

    async fn get_fee_rate(&self) -> Result<i64> {
        #[derive(Deserialize)]
        struct FeeRateResponse {
            sat_per_vbyte: i64,
        }
        let resp: FeeRateResponse = self
            .client
            .post("v1/fees/estimate", &serde_json::json!({}))
            .await?;
        Ok(resp.sat_per_vbyte)
    }

    async fn get_confirmations(&self, txid: &str) -> Result<Confirmations> {
        self.client
            .post("v1/tx/confirmations", &serde_json::json!({ "txid": txid }))
            .await
    }
}
