//! Periodic L1 settlement: anchor settled L2 spends on-chain.
//!
//! Every run pulls the spent-but-unanchored VTXOs per asset, builds a
//! Merkle tree over them, asks the Ark daemon for a commitment transaction
//! and broadcasts it, bumping the fee on broadcast failure. Runs are
//! single-flight; a daemon outage just queues the batch for the next run.

use std::sync::Arc;

use chrono::Utc;
use monitoring::GatewayMetrics;
use relay::L1CommitmentPayload;
use sha2::{Digest, Sha256};
use store::{transactions, vtxos, StoreError, TxStatus, TxType};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::constants::{
    SETTLEMENT_BATCH_LIMIT, SETTLEMENT_BROADCAST_ATTEMPTS, SETTLEMENT_FEE_BUMP_PERCENT,
};
use crate::error::{GatewayError, Result};
use crate::state::SharedState;

const BASE_SETTLEMENT_FEE_SATS: i64 = 2000;
const PER_VTXO_FEE_SATS: i64 = 100;

#[derive(Clone)]
pub struct SettlementCoordinator {
    state: SharedState,
    /// Serializes concurrent invocations; the coordinator is
    /// single-flight per run.
    gate: Arc<Mutex<()>>,
}

impl SettlementCoordinator {
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// One settlement run across every asset with unanchored spends.
    pub async fn run_once(&self) -> Result<()> {
        let _guard = self.gate.lock().await;

        self.poll_pending_confirmations().await;

        let assets = vtxos::assets_with_unsettled_spends(self.state.store.connection()).await?;
        if assets.is_empty() {
            return Ok(());
        }
        for asset_id in assets {
            if let Err(err) = self.settle_asset(&asset_id).await {
                match err {
                    GatewayError::BackendUnavailable(msg) => {
                        // queue for the next run
                        warn!("settlement of {asset_id} deferred, daemon unavailable: {msg}");
                    }
                    other => warn!("settlement of {asset_id} failed: {other}"),
                }
            }
        }
        Ok(())
    }

    async fn settle_asset(&self, asset_id: &str) -> Result<()> {
        let db = self.state.store.connection();
        let batch = vtxos::list_unsettled_spent(db, asset_id, SETTLEMENT_BATCH_LIMIT).await?;
        if batch.is_empty() {
            return Ok(());
        }

        let leaves: Vec<String> = batch
            .iter()
            .map(|v| {
                format!(
                    "{}:{}",
                    v.vtxo_id,
                    v.spending_txid.as_deref().unwrap_or_default()
                )
            })
            .collect();
        let root = merkle_root(&leaves);
        let vtxo_ids: Vec<String> = batch.iter().map(|v| v.vtxo_id.clone()).collect();
        let batch_id = uuid::Uuid::new_v4().to_string();
        info!(
            "settling {} spent VTXOs of {asset_id} under root {root} (batch {batch_id})",
            batch.len()
        );

        // create + broadcast, bumping the fee on each failed broadcast
        let mut fee = self.estimate_fee(batch.len()).await;
        let mut commitment = None;
        for attempt in 0..SETTLEMENT_BROADCAST_ATTEMPTS {
            let candidate = self
                .state
                .ark
                .create_commitment(asset_id, &vtxo_ids, &root, fee)
                .await
                .map_err(GatewayError::from_daemon)?;
            match self.state.ark.broadcast(&candidate.raw_tx).await {
                Ok(_) => {
                    commitment = Some(candidate);
                    break;
                }
                Err(err) => {
                    warn!(
                        "settlement broadcast attempt {} failed ({err}), bumping fee from {fee}",
                        attempt + 1
                    );
                    fee += fee * SETTLEMENT_FEE_BUMP_PERCENT / 100;
                }
            }
        }
        let commitment = commitment.ok_or_else(|| {
            GatewayError::BackendUnavailable(format!(
                "settlement broadcast for {asset_id} failed after {SETTLEMENT_BROADCAST_ATTEMPTS} attempts"
            ))
        })?;

        let total: i64 = batch.iter().map(|v| v.amount_sats).sum();
        let txn = self.state.store.begin().await?;
        transactions::insert(
            &txn,
            transactions::NewTransaction {
                txid: commitment.txid.clone(),
                session_id: None,
                tx_type: TxType::SettlementTx,
                raw_tx: Some(commitment.raw_tx.clone()),
                status: TxStatus::Broadcast,
                amount_sats: total,
                fee_sats: fee,
            },
        )
        .await?;
        transactions::insert_commitment(
            &txn,
            transactions::NewCommitment {
                batch_id: batch_id.clone(),
                l1_txid: commitment.txid.clone(),
                merkle_root: root.clone(),
                asset_id: asset_id.to_string(),
                vtxo_count: batch.len() as i32,
                block_height: None,
            },
        )
        .await?;
        vtxos::mark_settled(&txn, &vtxo_ids, &batch_id).await?;
        txn.commit().await.map_err(StoreError::from)?;

        GatewayMetrics::incr(&self.state.metrics.settlements_committed);
        self.state
            .notifier
            .notify_l1_commitment(L1CommitmentPayload {
                l1_txid: commitment.txid.clone(),
                block_height: None,
                merkle_root: root,
                batch_id,
            })
            .await;
        info!("settlement {} broadcast for {asset_id}", commitment.txid);
        Ok(())
    }

    /// Commitment fee from the daemon fee rate and an approximate
    /// transaction size, with a size-proportional floor when the daemon
    /// is unreachable.
    async fn estimate_fee(&self, vtxo_count: usize) -> i64 {
        let floor = BASE_SETTLEMENT_FEE_SATS + vtxo_count as i64 * PER_VTXO_FEE_SATS;
        let est_vbytes = 150 + 10 * vtxo_count as i64;
        match self.state.ark.get_fee_rate().await {
            Ok(rate) if rate > 0 => (est_vbytes * rate).max(floor),
            _ => floor,
        }
    }

    /// Resolve settlement transactions still waiting for a confirmation
    /// depth; ambiguous results stay `broadcast` and get polled again.
    async fn poll_pending_confirmations(&self) {
        let db = self.state.store.connection();
        let pending = match transactions::list_by_type_status(
            db,
            TxType::SettlementTx,
            TxStatus::Broadcast,
            50,
        )
        .await
        {
            Ok(pending) => pending,
            Err(err) => {
                warn!("could not list pending settlements: {err}");
                return;
            }
        };
        for tx in pending {
            match self.state.ark.get_confirmations(&tx.txid).await {
                Ok(confs) if confs.confirmations >= 1 => {
                    if let Err(err) =
                        transactions::mark_confirmed(db, &tx.txid, confs.block_height, Utc::now())
                            .await
                    {
                        warn!("could not confirm settlement {}: {err}", tx.txid);
                    } else {
                        info!(
                            "settlement {} confirmed at height {:?}",
                            tx.txid, confs.block_height
                        );
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("confirmation poll for {} failed: {err}", tx.txid);
                }
            }
        }
    }
}

/// Merkle root over sha256 leaf hashes, duplicating the last node on odd
/// levels, hex encoded.
pub fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return hex::encode(Sha256::digest(b""));
    }
    let mut level: Vec<[u8; 32]> = leaves
        .iter()
        .map(|leaf| Sha256::digest(leaf.as_bytes()).into())
        .collect();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        for pair in level.chunks(2) {
            let mut hasher = Sha256::new();
            hasher.update(pair[0]);
            hasher.update(pair.get(1).unwrap_or(&pair[0]));
            next.push(hasher.finalize().into());
        }
        level = next;
    }
    hex::encode(level[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let leaves = vec!["v1:tx1".to_string()];
        assert_eq!(
            merkle_root(&leaves),
            hex::encode(Sha256::digest(b"v1:tx1"))
        );
    }

    #[test]
    fn root_is_order_sensitive_and_deterministic() {
        let a = vec!["l1".to_string(), "l2".to_string(), "l3".to_string()];
        let b = vec!["l2".to_string(), "l1".to_string(), "l3".to_string()];
        assert_eq!(merkle_root(&a), merkle_root(&a));
        assert_ne!(merkle_root(&a), merkle_root(&b));
    }

    #[test]
    fn odd_levels_duplicate_last_node() {
        // manual two-level check for three leaves
        let leaves = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ha: [u8; 32] = Sha256::digest(b"a").into();
        let hb: [u8; 32] = Sha256::digest(b"b").into();
        let hc: [u8; 32] = Sha256::digest(b"c").into();
        let hab: [u8; 32] = {
            let mut h = Sha256::new();
            h.update(ha);
            h.update(hb);
            h.finalize().into()
        };
        let hcc: [u8; 32] = {
            let mut h = Sha256::new();
            h.update(hc);
            h.update(hc);
            h.finalize().into()
        };
        let root: [u8; 32] = {
            let mut h = Sha256::new();
            h.update(hab);
            h.update(hcc);
            h.finalize().into()
        };
        assert_eq!(merkle_root(&leaves), hex::encode(root));
    }

    #[test]
    fn empty_batch_has_stable_sentinel() {
        assert_eq!(merkle_root(&[]), hex::encode(Sha256::digest(b"")));
    }
}
