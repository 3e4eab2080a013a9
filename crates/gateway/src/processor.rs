//! Transaction processing: preparation, finalization, broadcast and
//! confirmation tracking for P2P transfers.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use daemons::{FinalizedTx, PreparedTx, TxOutput};
use monitoring::GatewayMetrics;
use store::entity::transaction::Model as TransactionRow;
use store::{balances, sessions, transactions, vtxos, StoreError, TxStatus, TxType};
use tracing::{info, warn};

use crate::constants::{STEP_TIMEOUT_SECS, VTXO_EXPIRY_HOURS};
use crate::error::{GatewayError, Result};
use crate::events::TransferParams;
use crate::state::SharedState;
use crate::vtxo::{Assignment, VtxoManager};

/// Confirmation depth at which a broadcast transaction is considered final.
pub const CONFIRMATION_POLICY_DEPTH: u32 = 1;

#[derive(Clone)]
pub struct TransactionProcessor {
    state: SharedState,
    vtxo: VtxoManager,
}

impl TransactionProcessor {
    pub fn new(state: SharedState) -> Self {
        let vtxo = VtxoManager::new(state.clone());
        Self { state, vtxo }
    }

    /// Build the unsigned transfer for a session: re-validate the balance
    /// (defense in depth), lock inputs, obtain signing payloads from the
    /// Ark daemon and persist a `prepared` transaction row.
    pub async fn prepare_transfer(
        &self,
        session_id: &str,
        user_pubkey: &str,
        params: &TransferParams,
    ) -> Result<(PreparedTx, Assignment)> {
        let needed = params.amount + params.fee;
        let spendable =
            balances::spendable(self.state.store.connection(), user_pubkey, &params.asset_id)
                .await?;
        if spendable < needed {
            return Err(GatewayError::InsufficientBalance {
                available: spendable,
                needed,
            });
        }

        let assignment = self
            .vtxo
            .assign(user_pubkey, &params.asset_id, needed, session_id)
            .await?;

        let change = assignment.total_sats - needed;
        let mut outputs = vec![
            TxOutput {
                recipient_pubkey: Some(params.recipient_pubkey.clone()),
                amount_sats: params.amount,
            },
            // dedicated fee output to the operator
            TxOutput {
                recipient_pubkey: None,
                amount_sats: params.fee,
            },
        ];
        if change > 0 {
            outputs.push(TxOutput {
                recipient_pubkey: Some(user_pubkey.to_string()),
                amount_sats: change,
            });
        }

        let call = tokio::time::timeout(
            Duration::from_secs(STEP_TIMEOUT_SECS as u64),
            self.state.ark.prepare_transaction(&assignment.vtxo_ids, &outputs),
        )
        .await;
        let prepared = match call {
            Ok(Ok(prepared)) => prepared,
            outcome => {
                // the inputs were locked for this attempt only; without a
                // prepared transaction they must not stay reserved
                if let Err(release_err) = self
                    .vtxo
                    .release_assignment(user_pubkey, &params.asset_id, &assignment.vtxo_ids, needed)
                    .await
                {
                    warn!(
                        "could not release assignment after failed preparation: {release_err}"
                    );
                }
                return Err(match outcome {
                    Ok(Err(err)) => GatewayError::from_daemon(err),
                    _ => GatewayError::StepTimeout("ark_prep"),
                });
            }
        };

        transactions::insert(
            self.state.store.connection(),
            transactions::NewTransaction {
                txid: prepared.ark_txid.clone(),
                session_id: Some(session_id.to_string()),
                tx_type: TxType::ArkTx,
                raw_tx: Some(prepared.unsigned_tx.clone()),
                status: TxStatus::Prepared,
                amount_sats: params.amount,
                fee_sats: params.fee,
            },
        )
        .await?;
        info!(
            "prepared transfer {} for session {session_id} ({} inputs, {} outputs)",
            prepared.ark_txid,
            assignment.vtxo_ids.len(),
            outputs.len()
        );
        Ok((prepared, assignment))
    }

    /// All-or-nothing finalization of a transfer (ceremony step 6). One
    /// store transaction covers: transaction row to `broadcast`, inputs
    /// `assigned -> spent`, output VTXO rows, and both balance movements.
    pub async fn finalize_transfer(
        &self,
        session_id: &str,
        user_pubkey: &str,
        params: &TransferParams,
        assignment: &Assignment,
        finalized: &FinalizedTx,
    ) -> Result<()> {
        let needed = params.amount + params.fee;
        let change = assignment.total_sats - needed;
        let txn = self.state.store.begin().await?;

        let moved = transactions::transition(
            &txn,
            &finalized.txid,
            &[TxStatus::Prepared],
            TxStatus::Broadcast,
            None,
        )
        .await?;
        if !moved {
            // the daemon finalized under a different txid than it prepared
            transactions::insert(
                &txn,
                transactions::NewTransaction {
                    txid: finalized.txid.clone(),
                    session_id: Some(session_id.to_string()),
                    tx_type: TxType::ArkTx,
                    raw_tx: Some(finalized.signed_tx.clone()),
                    status: TxStatus::Broadcast,
                    amount_sats: params.amount,
                    fee_sats: params.fee,
                },
            )
            .await?;
        }

        if !vtxos::mark_spent(&txn, &assignment.vtxo_ids, &finalized.txid).await? {
            txn.rollback().await.map_err(StoreError::from)?;
            return Err(GatewayError::Conflict(format!(
                "input VTXOs of session {session_id} were spent elsewhere"
            )));
        }

        let expires_at = Utc::now() + ChronoDuration::hours(VTXO_EXPIRY_HOURS);
        let mut outputs = vec![vtxos::NewVtxo {
            vtxo_id: format!("{}:0", finalized.txid),
            txid: finalized.txid.clone(),
            vout: 0,
            amount_sats: params.amount,
            script_pubkey: params.recipient_pubkey.clone(),
            asset_id: params.asset_id.clone(),
            owner: Some(params.recipient_pubkey.clone()),
            expires_at,
        }];
        // vout 1 is the operator fee output, tracked as balance not VTXO
        if change > 0 {
            outputs.push(vtxos::NewVtxo {
                vtxo_id: format!("{}:2", finalized.txid),
                txid: finalized.txid.clone(),
                vout: 2,
                amount_sats: change,
                script_pubkey: user_pubkey.to_string(),
                asset_id: params.asset_id.clone(),
                owner: Some(user_pubkey.to_string()),
                expires_at,
            });
        }
        vtxos::insert_batch(&txn, outputs).await?;

        balances::debit_reserved(&txn, user_pubkey, &params.asset_id, needed).await?;
        balances::credit(&txn, &params.recipient_pubkey, &params.asset_id, params.amount).await?;
        balances::credit(
            &txn,
            &self.state.config.fee_pubkey,
            &params.asset_id,
            params.fee,
        )
        .await?;

        sessions::set_result(
            &txn,
            session_id,
            serde_json::json!({
                "txid": finalized.txid,
                "amount": params.amount,
                "fee": params.fee,
                "recipient": params.recipient_pubkey,
                "inputs": assignment.vtxo_ids,
            }),
            Some(&finalized.signed_tx),
        )
        .await?;

        txn.commit().await.map_err(StoreError::from)?;
        GatewayMetrics::add(
            &self.state.metrics.vtxos_spent,
            assignment.vtxo_ids.len() as u64,
        );
        info!(
            "finalized transfer {} for session {session_id}: {} -> {} ({} sats, fee {})",
            finalized.txid,
            abbrev(user_pubkey),
            abbrev(&params.recipient_pubkey),
            params.amount,
            params.fee
        );
        Ok(())
    }

    /// Hand raw bytes to the network (settlement and land paths).
    pub async fn broadcast(&self, txid: &str) -> Result<()> {
        let row = self.status(txid).await?;
        let raw = row.raw_tx.ok_or_else(|| {
            GatewayError::Internal(format!("transaction {txid} has no raw bytes to broadcast"))
        })?;
        self.state
            .ark
            .broadcast(&raw)
            .await
            .map_err(GatewayError::from_daemon)?;
        let moved = transactions::transition(
            self.state.store.connection(),
            txid,
            &[TxStatus::Prepared],
            TxStatus::Broadcast,
            None,
        )
        .await?;
        if !moved {
            warn!("transaction {txid} was not in prepared state at broadcast");
        }
        Ok(())
    }

    pub async fn status(&self, txid: &str) -> Result<TransactionRow> {
        transactions::find_by_txid(self.state.store.connection(), txid)
            .await?
            .ok_or_else(|| GatewayError::Validation(format!("unknown transaction {txid}")))
    }

    /// Record a confirmation report from the chain observer; `broadcast ->
    /// confirmed` once the policy depth is met.
    pub async fn confirm(&self, txid: &str, confirmations: u32) -> Result<bool> {
        if confirmations < CONFIRMATION_POLICY_DEPTH {
            return Ok(false);
        }
        let depth = self
            .state
            .ark
            .get_confirmations(txid)
            .await
            .map(|c| c.block_height)
            .unwrap_or(None);
        Ok(transactions::mark_confirmed(self.state.store.connection(), txid, depth, Utc::now())
            .await?)
    }

    /// Release a failed ceremony's inputs (reserve + assignment).
    pub async fn abandon_transfer(
        &self,
        user_pubkey: &str,
        asset_id: &str,
        assignment: &Assignment,
        reserved: i64,
    ) -> Result<()> {
        self.vtxo
            .release_assignment(user_pubkey, asset_id, &assignment.vtxo_ids, reserved)
            .await
    }
}

fn abbrev(pubkey: &str) -> &str {
    pubkey.get(..8).unwrap_or(pubkey)
}
