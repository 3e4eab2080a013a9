//! Lightning operations: lift settlement credit and the reconciliation
//! watcher.
//!
//! Lift invoices are created inside the ceremony; this module owns what
//! happens when one settles: credit the user with a VTXO and balance,
//! complete the session and publish the confirmation, all idempotent by
//! payment hash.

use chrono::{Duration as ChronoDuration, Utc};
use daemons::LnInvoiceState;
use monitoring::GatewayMetrics;
use relay::ConfirmationPayload;
use store::entity::lightning_invoice::Model as Invoice;
use store::{balances, invoices, vtxos, InvoiceType, SessionStatus, StoreError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::{PUBLISH_GRACE_SECS, VTXO_EXPIRY_HOURS};
use crate::error::{GatewayError, Result};
use crate::outbound::OutboundEvent;
use crate::session::SessionManager;
use crate::state::SharedState;

#[derive(Clone)]
pub struct LightningManager {
    state: SharedState,
    sessions: SessionManager,
}

impl LightningManager {
    pub fn new(state: SharedState) -> Self {
        Self {
            sessions: SessionManager::new(state.clone()),
            state,
        }
    }

    /// Handle a settlement signal for a lift invoice. Duplicate signals
    /// are no-ops: the guarded invoice settle is the idempotency gate.
    pub async fn settle_lift(&self, payment_hash: &str, preimage: Option<&str>) -> Result<()> {
        let db = self.state.store.connection();
        let invoice = invoices::find_by_payment_hash(db, payment_hash)
            .await?
            .ok_or_else(|| {
                GatewayError::Internal(format!("settled invoice {payment_hash} unknown"))
            })?;
        if invoice.invoice_type != InvoiceType::Lift.as_str() {
            return Err(GatewayError::Internal(format!(
                "invoice {payment_hash} is not a lift invoice"
            )));
        }

        // asset lifts carry a taproot transfer proof (keyed by the
        // preimage); it must verify before anything is credited
        if invoice.asset_id != self.state.config.native_asset_id {
            let proof = preimage.ok_or_else(|| {
                GatewayError::Validation(format!(
                    "asset lift {payment_hash} settled without a transfer proof"
                ))
            })?;
            let check = self
                .state
                .tap
                .verify_proof(proof)
                .await
                .map_err(GatewayError::from_daemon)?;
            if !check.valid || check.asset_id != invoice.asset_id {
                invoices::mark_failed(db, payment_hash).await?;
                let err = GatewayError::Validation(format!(
                    "asset transfer proof for {payment_hash} did not verify"
                ));
                if let Some(session_id) = invoice.session_id.as_deref() {
                    self.sessions.fail(session_id, &err).await?;
                }
                return Err(err);
            }
        }

        let settled = invoices::settle(db, payment_hash, preimage, Utc::now()).await?;
        if settled {
            GatewayMetrics::incr(&self.state.metrics.invoices_settled);
            let session = self
                .sessions
                .get(invoice.session_id.as_deref().ok_or_else(|| {
                    GatewayError::Internal(format!("lift invoice {payment_hash} has no session"))
                })?)
                .await?;
            // credit: one VTXO carrying the lifted amount, plus the balance
            self.credit_lift(&invoice, &session.user_pubkey).await?;
        } else {
            debug!("duplicate settlement signal for {payment_hash}");
        }

        // completion is retried by the watcher until the session is ready
        self.try_complete_lift(&invoice).await
    }

    /// Move a settled lift's session to `completed` and publish the
    /// confirmation. A session still travelling through signature
    /// collection is left for the next watcher pass.
    async fn try_complete_lift(&self, invoice: &Invoice) -> Result<()> {
        let Some(session_id) = invoice.session_id.as_deref() else {
            return Ok(());
        };
        let session = self.sessions.get(session_id).await?;
        match self.sessions.status_of(&session)? {
            SessionStatus::Signing => {}
            status if status.is_terminal() => return Ok(()),
            other => {
                debug!(
                    "lift invoice {} settled while session {session_id} is {other}; will retry",
                    invoice.payment_hash
                );
                return Ok(());
            }
        }

        self.sessions
            .complete(
                session_id,
                serde_json::json!({
                    "payment_hash": invoice.payment_hash,
                    "amount": invoice.amount_sats,
                    "asset_id": invoice.asset_id,
                }),
            )
            .await?;
        let remaining = (session.expires_at - Utc::now()).to_std().unwrap_or_default();
        self.state
            .notifier
            .notify_confirmation(OutboundEvent::Confirmation {
                author: session.user_pubkey.clone(),
                ref_event_id: None,
                payload: ConfirmationPayload {
                    status: "success".to_string(),
                    ref_action_id: session.action_id.clone(),
                    results: serde_json::json!({
                        "payment_hash": invoice.payment_hash,
                        "amount": invoice.amount_sats,
                    }),
                },
                deadline: Some(
                    Instant::now() + remaining + std::time::Duration::from_secs(PUBLISH_GRACE_SECS),
                ),
            })
            .await;
        info!(
            "lift settled: {} sats of {} credited to {} (session {session_id})",
            invoice.amount_sats,
            invoice.asset_id,
            abbrev(&session.user_pubkey)
        );
        Ok(())
    }

    /// One store transaction: a new assigned VTXO plus the balance credit.
    async fn credit_lift(&self, invoice: &Invoice, user_pubkey: &str) -> Result<()> {
        let txn = self.state.store.begin().await?;
        vtxos::insert_batch(
            &txn,
            vec![vtxos::NewVtxo {
                vtxo_id: format!("lift:{}", invoice.payment_hash),
                txid: invoice.payment_hash.clone(),
                vout: 0,
                amount_sats: invoice.amount_sats,
                script_pubkey: user_pubkey.to_string(),
                asset_id: invoice.asset_id.clone(),
                owner: Some(user_pubkey.to_string()),
                expires_at: Utc::now() + ChronoDuration::hours(VTXO_EXPIRY_HOURS),
            }],
        )
        .await?;
        balances::credit(&txn, user_pubkey, &invoice.asset_id, invoice.amount_sats).await?;
        txn.commit().await.map_err(StoreError::from)?;
        GatewayMetrics::incr(&self.state.metrics.vtxos_created);
        Ok(())
    }

    /// One reconciliation pass: poll pending invoices against the daemon,
    /// settle or fail them, and expire the stale ones.
    pub async fn reconcile(&self) -> Result<()> {
        let db = self.state.store.connection();
        let pending = invoices::list_pending(db, 100).await?;
        for invoice in pending {
            match self.state.lightning.lookup_invoice(&invoice.payment_hash).await {
                Ok(status) => match status.state {
                    LnInvoiceState::Settled => {
                        if invoice.invoice_type == InvoiceType::Lift.as_str() {
                            if let Err(err) = self
                                .settle_lift(&invoice.payment_hash, status.preimage.as_deref())
                                .await
                            {
                                warn!(
                                    "lift settlement for {} failed: {err}",
                                    invoice.payment_hash
                                );
                            }
                        } else {
                            // land invoices settle inside the ceremony;
                            // this is a safety net after a crash
                            invoices::settle(
                                db,
                                &invoice.payment_hash,
                                status.preimage.as_deref(),
                                Utc::now(),
                            )
                            .await?;
                        }
                    }
                    LnInvoiceState::Cancelled => {
                        invoices::mark_failed(db, &invoice.payment_hash).await?;
                        if let Some(session_id) = &invoice.session_id {
                            let err = GatewayError::Validation(format!(
                                "invoice {} was cancelled",
                                invoice.payment_hash
                            ));
                            if let Err(fail_err) = self.sessions.fail(session_id, &err).await {
                                warn!("could not fail session {session_id}: {fail_err}");
                            }
                        }
                    }
                    LnInvoiceState::Open | LnInvoiceState::Accepted => {}
                },
                Err(err) => {
                    debug!(
                        "invoice {} lookup failed, retrying next pass: {err}",
                        invoice.payment_hash
                    );
                }
            }
        }

        // settled lifts whose session completion raced the ceremony
        for invoice in invoices::list_settled(db, InvoiceType::Lift, 50).await? {
            if let Err(err) = self.try_complete_lift(&invoice).await {
                warn!(
                    "retrying lift completion for {} failed: {err}",
                    invoice.payment_hash
                );
            }
        }

        let expired = invoices::expire_pending(db, Utc::now()).await?;
        if expired > 0 {
            info!("expired {expired} stale invoices");
        }
        Ok(())
    }
}

fn abbrev(pubkey: &str) -> &str {
    pubkey.get(..8).unwrap_or(pubkey)
}
