//! VTXO lifecycle: inventory monitoring and replenishment, user-side
//! assignment, spending and expiration.
//!
//! Assignment and spending are the two paths where double-spends could
//! arise; both run in one store transaction with row locks and guarded
//! status updates, so a VTXO is assigned to at most one session and spent
//! at most once.

use chrono::{Duration as ChronoDuration, Utc};
use monitoring::GatewayMetrics;
use store::entity::vtxo::Model as Vtxo;
use store::{balances, sessions, vtxos, SessionStatus, StoreError, VtxoStatus};
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_VTXO_AMOUNT_SATS, INVENTORY_BATCH_SIZE, INVENTORY_CRITICAL_THRESHOLD,
    INVENTORY_FEE_CEILING_SAT_PER_VB, INVENTORY_TARGET_LEVEL, INVENTORY_WARNING_THRESHOLD,
    VTXO_EXPIRY_HOURS,
};
use crate::error::{GatewayError, Result};
use crate::state::SharedState;

#[derive(Clone)]
pub struct VtxoManager {
    state: SharedState,
}

/// VTXOs put under a session's control by `assign`.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub vtxo_ids: Vec<String>,
    pub total_sats: i64,
}

impl VtxoManager {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Assign the smallest-fit combination of available VTXOs covering
    /// `amount_needed` to a user, reserving the matching balance, all in
    /// one transaction.
    pub async fn assign(
        &self,
        user_pubkey: &str,
        asset_id: &str,
        amount_needed: i64,
        session_id: &str,
    ) -> Result<Assignment> {
        let now = Utc::now();
        let txn = self.state.store.begin().await?;

        let available = vtxos::lock_available(&txn, asset_id, now, 256).await?;
        let selected = select_smallest_fit(&available, amount_needed).ok_or_else(|| {
            GatewayError::Validation(format!(
                "insufficient VTXO inventory for {amount_needed} sats of {asset_id}"
            ))
        })?;
        let vtxo_ids: Vec<String> = selected.iter().map(|v| v.vtxo_id.clone()).collect();
        let total_sats: i64 = selected.iter().map(|v| v.amount_sats).sum();

        if !vtxos::mark_assigned(&txn, &vtxo_ids, user_pubkey, Some(session_id)).await? {
            txn.rollback().await.map_err(StoreError::from)?;
            return Err(GatewayError::Conflict(
                "VTXO selection raced with a concurrent assignment".to_string(),
            ));
        }
        balances::reserve(&txn, user_pubkey, asset_id, amount_needed).await?;
        txn.commit().await.map_err(StoreError::from)?;

        debug!(
            "assigned {} VTXOs ({} sats) to {} for session {}",
            vtxo_ids.len(),
            total_sats,
            abbrev(user_pubkey),
            session_id
        );
        Ok(Assignment {
            vtxo_ids,
            total_sats,
        })
    }

    /// Release a session's assignment after a failed ceremony: the VTXOs
    /// return to inventory is not possible (states are monotone), so they
    /// expire instead, and the reserve is released.
    pub async fn release_assignment(
        &self,
        user_pubkey: &str,
        asset_id: &str,
        vtxo_ids: &[String],
        reserved: i64,
    ) -> Result<()> {
        let txn = self.state.store.begin().await?;
        vtxos::mark_expired(&txn, vtxo_ids).await?;
        balances::release(&txn, user_pubkey, asset_id, reserved).await?;
        txn.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    /// One inventory pass: request batches for assets running low.
    pub async fn check_inventory(&self, asset_ids: &[String]) -> Result<()> {
        for asset_id in asset_ids {
            let available = vtxos::count_by_status(
                self.state.store.connection(),
                asset_id,
                VtxoStatus::Available,
            )
            .await?;

            if available >= INVENTORY_WARNING_THRESHOLD {
                continue;
            }

            let deficit = INVENTORY_TARGET_LEVEL.saturating_sub(available);
            let batch = deficit.min(INVENTORY_BATCH_SIZE as u64) as u32;

            if available < INVENTORY_CRITICAL_THRESHOLD {
                warn!(
                    "asset {asset_id} inventory critical ({available} available), minting {batch}"
                );
                self.create_batch(asset_id, batch).await?;
                continue;
            }

            // warning band: only mint while fees are acceptable
            match self.state.ark.get_fee_rate().await {
                Ok(rate) if rate <= INVENTORY_FEE_CEILING_SAT_PER_VB => {
                    info!(
                        "asset {asset_id} inventory low ({available}), fee rate {rate} ok, minting {batch}"
                    );
                    self.create_batch(asset_id, batch).await?;
                }
                Ok(rate) => {
                    debug!(
                        "asset {asset_id} inventory low ({available}) but fee rate {rate} above ceiling, deferring"
                    );
                }
                Err(err) => {
                    warn!("fee rate lookup failed, deferring batch for {asset_id}: {err}");
                }
            }
        }
        Ok(())
    }

    /// Mint a batch through the Ark daemon and store it as available
    /// inventory.
    pub async fn create_batch(&self, asset_id: &str, count: u32) -> Result<usize> {
        let fee = estimate_batch_fee(count);
        let batch = self
            .state
            .ark
            .create_vtxo_batch(asset_id, count, DEFAULT_VTXO_AMOUNT_SATS, fee)
            .await
            .map_err(GatewayError::from_daemon)?;

        let expires_at = Utc::now() + ChronoDuration::hours(VTXO_EXPIRY_HOURS);
        let rows: Vec<vtxos::NewVtxo> = batch
            .vtxos
            .into_iter()
            .map(|v| vtxos::NewVtxo {
                vtxo_id: v.vtxo_id,
                txid: v.txid,
                vout: v.vout,
                amount_sats: DEFAULT_VTXO_AMOUNT_SATS,
                script_pubkey: v.script_pubkey,
                asset_id: asset_id.to_string(),
                owner: None,
                expires_at,
            })
            .collect();
        let stored = vtxos::insert_batch(self.state.store.connection(), rows).await?;
        GatewayMetrics::add(&self.state.metrics.vtxos_created, stored as u64);
        info!("stored {stored} new VTXOs for asset {asset_id}");
        Ok(stored)
    }

    /// One expiration pass. Assigned VTXOs tied to a live session are left
    /// alone; everything else past its deadline expires and releases its
    /// reserve.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let db = self.state.store.connection();
        let mut expired_total = 0u64;

        let stale_available = vtxos::list_expired_available(db, now, 500).await?;
        if !stale_available.is_empty() {
            let ids: Vec<String> = stale_available.iter().map(|v| v.vtxo_id.clone()).collect();
            expired_total += vtxos::mark_expired(db, &ids).await?;
        }

        let stale_assigned = vtxos::list_expired_assigned(db, now, 500).await?;
        for vtxo in stale_assigned {
            if let Some(session_id) = &vtxo.session_id {
                let live = match sessions::find_by_session_id(db, session_id).await? {
                    Some(session) => session
                        .status
                        .parse::<SessionStatus>()
                        .map(|s| !s.is_terminal())
                        .unwrap_or(false),
                    None => false,
                };
                if live {
                    continue;
                }
            }

            let txn = self.state.store.begin().await?;
            let ids = [vtxo.vtxo_id.clone()];
            let moved = vtxos::mark_expired(&txn, &ids).await?;
            if moved == 1 {
                if let Some(owner) = &vtxo.user_pubkey {
                    if vtxo.session_id.is_some() {
                        balances::release(&txn, owner, &vtxo.asset_id, vtxo.amount_sats).await?;
                    }
                }
            }
            txn.commit().await.map_err(StoreError::from)?;
            expired_total += moved;
        }

        if expired_total > 0 {
            GatewayMetrics::add(&self.state.metrics.vtxos_expired, expired_total);
            info!("expired {expired_total} VTXOs");
        }
        Ok(expired_total)
    }
}

/// Smallest-fit selection: prefer the single smallest VTXO that covers the
/// amount; otherwise accumulate from the smallest up. `candidates` must be
/// sorted by amount ascending (the query guarantees it).
pub fn select_smallest_fit(candidates: &[Vtxo], amount_needed: i64) -> Option<Vec<&Vtxo>> {
    if amount_needed <= 0 {
        return None;
    }
    if let Some(single) = candidates.iter().find(|v| v.amount_sats >= amount_needed) {
        return Some(vec![single]);
    }
    let mut picked = Vec::new();
    let mut total = 0i64;
    for vtxo in candidates {
        picked.push(vtxo);
        total += vtxo.amount_sats;
        if total >= amount_needed {
            return Some(picked);
        }
    }
    None
}

fn estimate_batch_fee(count: u32) -> i64 {
    const BASE_FEE_SATS: i64 = 1000;
    const PER_VTXO_FEE_SATS: i64 = 500;
    BASE_FEE_SATS + count as i64 * PER_VTXO_FEE_SATS
}

fn abbrev(pubkey: &str) -> &str {
    pubkey.get(..8).unwrap_or(pubkey)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vtxo(id: &str, amount: i64) -> Vtxo {
        let now = Utc::now();
        Vtxo {
            id: 0,
            vtxo_id: id.to_string(),
            txid: "t".to_string(),
            vout: 0,
            amount_sats: amount,
            script_pubkey: String::new(),
            asset_id: "gBTC".to_string(),
            user_pubkey: None,
            status: "available".to_string(),
            session_id: None,
            created_at: now,
            expires_at: now,
            spending_txid: None,
            settled_in: None,
        }
    }

    #[test]
    fn prefers_single_smallest_cover() {
        let pool = vec![vtxo("a", 1000), vtxo("b", 5000), vtxo("c", 100_000)];
        let picked = select_smallest_fit(&pool, 4000).unwrap();
        assert_eq!(
            picked.iter().map(|v| v.vtxo_id.as_str()).collect::<Vec<_>>(),
            vec!["b"]
        );
    }

    #[test]
    fn accumulates_when_no_single_fits() {
        let pool = vec![vtxo("a", 1000), vtxo("b", 2000), vtxo("c", 3000)];
        let picked = select_smallest_fit(&pool, 5500).unwrap();
        let total: i64 = picked.iter().map(|v| v.amount_sats).sum();
        assert!(total >= 5500);
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn insufficient_inventory_is_none() {
        let pool = vec![vtxo("a", 1000)];
        assert!(select_smallest_fit(&pool, 5000).is_none());
        assert!(select_smallest_fit(&[], 1).is_none());
        assert!(select_smallest_fit(&pool, 0).is_none());
    }

    #[test]
    fn batch_fee_scales_with_count() {
        assert_eq!(estimate_batch_fee(0), 1000);
        assert_eq!(estimate_batch_fee(1000), 1000 + 500_000);
    }
}
