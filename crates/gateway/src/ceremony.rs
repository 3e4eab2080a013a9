//! The signing ceremony: six ordered steps that take an intent from
//! accepted to settled.
//!
//! Each step consults the session's `last_completed_step` marker before
//! doing work, so a crashed worker can resume any ceremony by id. Failure
//! handling is per step: preparation failures release the input
//! assignment and fail the session; only step 6 commits VTXO spends, and
//! it does so in a single store transaction.

use std::future::Future;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use daemons::{CollectedSignature, DaemonError, SigningPayload};
use relay::{ConfirmationPayload, IntentPayload};
use serde::{Deserialize, Serialize};
use store::entity::signing_session::Model as Session;
use store::{
    challenges, invoices, sessions, transactions, InvoiceType, SessionStatus, SessionType,
    TxStatus, TxType,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::challenge::ChallengeManager;
use crate::constants::{PUBLISH_GRACE_SECS, STEP_MAX_TRANSIENT_RETRIES, STEP_TIMEOUT_SECS};
use crate::error::{GatewayError, Result};
use crate::events::{self, Intent, IntentKind, TransferParams};
use crate::outbound::OutboundEvent;
use crate::processor::TransactionProcessor;
use crate::session::SessionManager;
use crate::state::SharedState;
use crate::vtxo::Assignment;

/// Ceremony steps in execution order.
pub mod step {
    pub const INTENT_VERIFICATION: i32 = 1;
    pub const ARK_PREP: i32 = 2;
    pub const CHECKPOINT_PREP: i32 = 3;
    pub const SIGNATURE_COLLECTION: i32 = 4;
    pub const ARK_EXECUTION: i32 = 5;
    pub const FINALIZATION: i32 = 6;
}

/// Durable ceremony progress, stored in the session's `result_data` so a
/// restarted worker picks up where the last one stopped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CeremonyArtifacts {
    pub ark_txid: Option<String>,
    pub unsigned_tx: Option<String>,
    pub signing_payloads: Vec<SigningPayload>,
    pub input_vtxo_ids: Vec<String>,
    pub input_total_sats: i64,
    pub reserved_sats: i64,
    pub checkpoint_txid: Option<String>,
    pub finalized_txid: Option<String>,
    pub signed_tx: Option<String>,
    pub payment_hash: Option<String>,
    pub bolt11: Option<String>,
}

#[derive(Clone)]
pub struct SigningOrchestrator {
    state: SharedState,
    sessions: SessionManager,
    challenges: ChallengeManager,
    processor: TransactionProcessor,
}

impl SigningOrchestrator {
    pub fn new(state: SharedState) -> Self {
        Self {
            sessions: SessionManager::new(state.clone()),
            challenges: ChallengeManager::new(state.clone()),
            processor: TransactionProcessor::new(state.clone()),
            state,
        }
    }

    /// Drive a session's ceremony to completion. Any error fails the
    /// session (publishing the single failure notice) and releases input
    /// assignments that never reached finalization.
    pub async fn run(&self, session_id: &str) -> Result<()> {
        let outcome = self.run_inner(session_id).await;
        if let Err(err) = &outcome {
            self.cleanup_after_failure(session_id, err).await;
            self.sessions.fail(session_id, err).await?;
        }
        outcome
    }

    async fn run_inner(&self, session_id: &str) -> Result<()> {
        let session = self.sessions.get(session_id).await?;
        let session_type: SessionType = session
            .session_type
            .parse()
            .map_err(GatewayError::from)?;
        match session_type {
            SessionType::P2pTransfer => self.run_transfer(session).await,
            SessionType::LightningLift => self.run_lift(session).await,
            SessionType::LightningLand => self.run_land(session).await,
            SessionType::ProtocolOp => self.run_protocol_op(session).await,
        }
    }

    // ---------------------------------------------------------------- p2p

    async fn run_transfer(&self, session: Session) -> Result<()> {
        let session_id = session.session_id.clone();
        let mut artifacts = load_artifacts(&session);

        // Step 1: intent verification
        if session.last_completed_step < step::INTENT_VERIFICATION {
            self.liveness(&session_id, session.expires_at).await?;
            let intent = self.reparse_intent(&session).await?;
            let IntentKind::Transfer(params) = &intent.kind else {
                return Err(GatewayError::Internal(
                    "transfer session carries non-transfer intent".to_string(),
                ));
            };
            let spendable = store::balances::spendable(
                self.state.store.connection(),
                &session.user_pubkey,
                &params.asset_id,
            )
            .await?;
            let needed = params.amount + params.fee;
            if spendable < needed {
                return Err(GatewayError::InsufficientBalance {
                    available: spendable,
                    needed,
                });
            }
            self.advance(&session_id, step::INTENT_VERIFICATION).await?;
        }

        let params = self.transfer_params(&session).await?;

        // Step 2: Ark transaction preparation. The adapter retries
        // transient failures internally; a hard failure releases the
        // assignment inside the processor, so no outer retry loop here.
        if self.marker(&session_id).await? < step::ARK_PREP {
            self.liveness(&session_id, session.expires_at).await?;
            let (prepared, assignment) = self
                .processor
                .prepare_transfer(&session_id, &session.user_pubkey, &params)
                .await?;
            artifacts.ark_txid = Some(prepared.ark_txid.clone());
            artifacts.unsigned_tx = Some(prepared.unsigned_tx.clone());
            artifacts.signing_payloads = prepared.signing_payloads.clone();
            artifacts.input_vtxo_ids = assignment.vtxo_ids.clone();
            artifacts.input_total_sats = assignment.total_sats;
            artifacts.reserved_sats = params.amount + params.fee;
            self.save_artifacts(&session_id, &artifacts).await?;
            self.advance(&session_id, step::ARK_PREP).await?;
        }

        // Step 3: checkpoint transaction preparation
        if self.marker(&session_id).await? < step::CHECKPOINT_PREP {
            self.liveness(&session_id, session.expires_at).await?;
            let ark_txid = artifacts
                .ark_txid
                .clone()
                .ok_or_else(|| GatewayError::Internal("no ark_txid after step 2".to_string()))?;
            let checkpoint = self
                .retry_daemon("checkpoint_prep", || {
                    self.state.ark.prepare_checkpoint(&ark_txid)
                })
                .await?;
            artifacts.checkpoint_txid = Some(checkpoint.checkpoint_txid.clone());
            artifacts
                .signing_payloads
                .extend(checkpoint.signing_payloads.clone());
            self.save_artifacts(&session_id, &artifacts).await?;
            self.advance(&session_id, step::CHECKPOINT_PREP).await?;
        }

        // Step 4: signature collection
        if self.marker(&session_id).await? < step::SIGNATURE_COLLECTION {
            let payloads: Vec<String> = artifacts
                .signing_payloads
                .iter()
                .map(|p| p.payload.clone())
                .collect();
            self.collect_signature(&session_id, &payloads).await?;
            self.advance(&session_id, step::SIGNATURE_COLLECTION).await?;
        }

        // Step 5: Ark protocol execution
        if self.marker(&session_id).await? < step::ARK_EXECUTION {
            self.liveness(&session_id, session.expires_at).await?;
            let signature = self.collected_signature(&session_id).await?;
            let ark_txid = artifacts
                .ark_txid
                .clone()
                .ok_or_else(|| GatewayError::Internal("no ark_txid after step 2".to_string()))?;
            let collected: Vec<CollectedSignature> = artifacts
                .signing_payloads
                .iter()
                .map(|p| CollectedSignature {
                    input_id: p.input_id.clone(),
                    signature: signature.clone(),
                })
                .collect();
            let finalized = self
                .retry_daemon("ark_execution", || {
                    self.state.ark.submit_signatures(&ark_txid, &collected)
                })
                .await?;
            artifacts.finalized_txid = Some(finalized.txid.clone());
            artifacts.signed_tx = Some(finalized.signed_tx.clone());
            self.save_artifacts(&session_id, &artifacts).await?;
            self.advance(&session_id, step::ARK_EXECUTION).await?;
        }

        // Step 6: finalization (all-or-nothing)
        if self.marker(&session_id).await? < step::FINALIZATION {
            self.liveness(&session_id, session.expires_at).await?;
            let finalized = daemons::FinalizedTx {
                txid: artifacts
                    .finalized_txid
                    .clone()
                    .ok_or_else(|| GatewayError::Internal("no txid after step 5".to_string()))?,
                signed_tx: artifacts.signed_tx.clone().unwrap_or_default(),
            };
            let assignment = Assignment {
                vtxo_ids: artifacts.input_vtxo_ids.clone(),
                total_sats: artifacts.input_total_sats,
            };
            self.processor
                .finalize_transfer(
                    &session_id,
                    &session.user_pubkey,
                    &params,
                    &assignment,
                    &finalized,
                )
                .await?;
            self.advance(&session_id, step::FINALIZATION).await?;
            self.finish(&session, serde_json::json!({
                "txid": finalized.txid,
                "amount": params.amount,
                "fee": params.fee,
                "outputs": [format!("{}:0", finalized.txid)],
            }))
            .await?;
        }
        Ok(())
    }

    // --------------------------------------------------------------- lift

    /// Lift ceremony: verification, invoice creation, then an
    /// authorization signature over the invoice. The session stays in
    /// `signing` until the invoice settles; the reconciliation watcher
    /// finishes it.
    async fn run_lift(&self, session: Session) -> Result<()> {
        let session_id = session.session_id.clone();
        let mut artifacts = load_artifacts(&session);
        let intent = self.reparse_intent(&session).await?;
        let IntentKind::Lift(params) = intent.kind else {
            return Err(GatewayError::Internal(
                "lift session carries non-lift intent".to_string(),
            ));
        };

        if session.last_completed_step < step::INTENT_VERIFICATION {
            self.liveness(&session_id, session.expires_at).await?;
            self.advance(&session_id, step::INTENT_VERIFICATION).await?;
        }

        if self.marker(&session_id).await? < step::ARK_PREP {
            self.liveness(&session_id, session.expires_at).await?;
            let remaining = (session.expires_at - Utc::now()).num_seconds().max(60);
            let invoice = self
                .retry_daemon("lift_invoice", || {
                    self.state.lightning.add_invoice(
                        params.amount_sats,
                        session.context.as_deref().unwrap_or("lift"),
                        remaining,
                    )
                })
                .await?;
            invoices::insert(
                self.state.store.connection(),
                invoices::NewInvoice {
                    payment_hash: invoice.payment_hash.clone(),
                    bolt11_invoice: invoice.bolt11.clone(),
                    session_id: Some(session_id.clone()),
                    amount_sats: params.amount_sats,
                    asset_id: params.asset_id.clone(),
                    invoice_type: InvoiceType::Lift,
                    expires_at: session.expires_at,
                },
            )
            .await?;
            artifacts.payment_hash = Some(invoice.payment_hash);
            artifacts.bolt11 = Some(invoice.bolt11);
            self.save_artifacts(&session_id, &artifacts).await?;
            // lift has no checkpoint; jump the marker past step 3
            self.advance(&session_id, step::CHECKPOINT_PREP).await?;
        }

        if self.marker(&session_id).await? < step::SIGNATURE_COLLECTION {
            // the wallet signs the invoice binding; paying it is the
            // user's on-ramp action
            let invoice_blob = BASE64.encode(
                serde_json::json!({
                    "payment_hash": artifacts.payment_hash,
                    "bolt11": artifacts.bolt11,
                    "amount_sats": params.amount_sats,
                    "asset_id": params.asset_id,
                })
                .to_string(),
            );
            self.collect_signature(&session_id, &[invoice_blob]).await?;
            self.advance(&session_id, step::SIGNATURE_COLLECTION).await?;
            info!(
                "lift session {session_id} authorized; awaiting invoice settlement for {}",
                artifacts.payment_hash.as_deref().unwrap_or("?")
            );
        }
        Ok(())
    }

    // --------------------------------------------------------------- land

    async fn run_land(&self, session: Session) -> Result<()> {
        let session_id = session.session_id.clone();
        let intent = self.reparse_intent(&session).await?;
        let IntentKind::Land(params) = intent.kind else {
            return Err(GatewayError::Internal(
                "land session carries non-land intent".to_string(),
            ));
        };

        // Step 1 includes invoice decode validation against the declared
        // amount. Asset-denominated invoices decode through tapd, plain
        // sat invoices through lnd.
        if session.last_completed_step < step::INTENT_VERIFICATION {
            self.liveness(&session_id, session.expires_at).await?;
            let native = params.asset_id == self.state.config.native_asset_id;
            let (payment_hash, invoice_amount) = if native {
                let decoded = self
                    .retry_daemon("land_decode", || {
                        self.state.lightning.decode_invoice(&params.invoice)
                    })
                    .await?;
                (decoded.payment_hash, decoded.num_satoshis)
            } else {
                let decoded = self
                    .retry_daemon("land_decode_asset", || {
                        self.state.tap.decode_asset_invoice(&params.invoice)
                    })
                    .await?;
                if decoded.asset_id != params.asset_id {
                    return Err(GatewayError::Validation(format!(
                        "invoice is denominated in {} but intent declares {}",
                        decoded.asset_id, params.asset_id
                    )));
                }
                (decoded.payment_hash, decoded.amount)
            };
            if invoice_amount != params.amount_sats {
                return Err(GatewayError::Validation(format!(
                    "invoice pays {invoice_amount} but intent declares {}",
                    params.amount_sats
                )));
            }
            invoices::insert(
                self.state.store.connection(),
                invoices::NewInvoice {
                    payment_hash: payment_hash.clone(),
                    bolt11_invoice: params.invoice.clone(),
                    session_id: Some(session_id.clone()),
                    amount_sats: params.amount_sats,
                    asset_id: params.asset_id.clone(),
                    invoice_type: InvoiceType::Land,
                    expires_at: session.expires_at,
                },
            )
            .await?;
            self.advance(&session_id, step::INTENT_VERIFICATION).await?;
        }

        // The withdrawn funds move to the operator, who pays the user's
        // invoice out-of-band; the land path is a transfer with the
        // operator as recipient plus a Lightning payment between steps 5
        // and 6.
        let transfer = TransferParams {
            recipient_pubkey: self.state.config.fee_pubkey.clone(),
            asset_id: params.asset_id.clone(),
            amount: params.amount_sats,
            fee: params.fee,
        };

        let mut artifacts = load_artifacts(&self.sessions.get(&session_id).await?);

        if self.marker(&session_id).await? < step::ARK_PREP {
            self.liveness(&session_id, session.expires_at).await?;
            let (prepared, assignment) = self
                .processor
                .prepare_transfer(&session_id, &session.user_pubkey, &transfer)
                .await?;
            artifacts.ark_txid = Some(prepared.ark_txid.clone());
            artifacts.unsigned_tx = Some(prepared.unsigned_tx.clone());
            artifacts.signing_payloads = prepared.signing_payloads.clone();
            artifacts.input_vtxo_ids = assignment.vtxo_ids.clone();
            artifacts.input_total_sats = assignment.total_sats;
            artifacts.reserved_sats = transfer.amount + transfer.fee;
            self.save_artifacts(&session_id, &artifacts).await?;
            self.advance(&session_id, step::ARK_PREP).await?;
        }

        if self.marker(&session_id).await? < step::CHECKPOINT_PREP {
            self.liveness(&session_id, session.expires_at).await?;
            let ark_txid = artifacts.ark_txid.clone().unwrap_or_default();
            let checkpoint = self
                .retry_daemon("checkpoint_prep", || {
                    self.state.ark.prepare_checkpoint(&ark_txid)
                })
                .await?;
            artifacts.checkpoint_txid = Some(checkpoint.checkpoint_txid.clone());
            artifacts
                .signing_payloads
                .extend(checkpoint.signing_payloads.clone());
            self.save_artifacts(&session_id, &artifacts).await?;
            self.advance(&session_id, step::CHECKPOINT_PREP).await?;
        }

        if self.marker(&session_id).await? < step::SIGNATURE_COLLECTION {
            let payloads: Vec<String> = artifacts
                .signing_payloads
                .iter()
                .map(|p| p.payload.clone())
                .collect();
            self.collect_signature(&session_id, &payloads).await?;
            self.advance(&session_id, step::SIGNATURE_COLLECTION).await?;
        }

        if self.marker(&session_id).await? < step::ARK_EXECUTION {
            self.liveness(&session_id, session.expires_at).await?;

            // outbound liquidity preflight; without it the payment after
            // Ark execution would fail late for a predictable reason
            let channels = self
                .retry_daemon("land_preflight", || self.state.lightning.channel_balance())
                .await?;
            if channels.local_balance_sat < params.amount_sats {
                return Err(GatewayError::BackendUnavailable(format!(
                    "insufficient outbound liquidity: {} sats local, invoice needs {}",
                    channels.local_balance_sat, params.amount_sats
                )));
            }

            let signature = self.collected_signature(&session_id).await?;
            let ark_txid = artifacts.ark_txid.clone().unwrap_or_default();
            let collected: Vec<CollectedSignature> = artifacts
                .signing_payloads
                .iter()
                .map(|p| CollectedSignature {
                    input_id: p.input_id.clone(),
                    signature: signature.clone(),
                })
                .collect();
            let finalized = self
                .retry_daemon("ark_execution", || {
                    self.state.ark.submit_signatures(&ark_txid, &collected)
                })
                .await?;

            // pay the user's invoice before any VTXO write; a failed
            // payment fails the session with nothing spent
            let payment = self
                .retry_daemon("land_payment", || {
                    self.state.lightning.send_payment(
                        &params.invoice,
                        crate::constants::LAND_PAYMENT_FEE_LIMIT_SATS,
                    )
                })
                .await?;
            if !payment.succeeded {
                invoices::mark_failed(self.state.store.connection(), &payment.payment_hash)
                    .await?;
                return Err(GatewayError::Validation(format!(
                    "invoice payment failed: {}",
                    payment.failure_reason.unwrap_or_else(|| "unknown".into())
                )));
            }
            invoices::settle(
                self.state.store.connection(),
                &payment.payment_hash,
                payment.preimage.as_deref(),
                Utc::now(),
            )
            .await?;

            artifacts.finalized_txid = Some(finalized.txid.clone());
            artifacts.signed_tx = Some(finalized.signed_tx.clone());
            artifacts.payment_hash = Some(payment.payment_hash);
            self.save_artifacts(&session_id, &artifacts).await?;
            self.advance(&session_id, step::ARK_EXECUTION).await?;
        }

        if self.marker(&session_id).await? < step::FINALIZATION {
            self.liveness(&session_id, session.expires_at).await?;
            let finalized = daemons::FinalizedTx {
                txid: artifacts.finalized_txid.clone().unwrap_or_default(),
                signed_tx: artifacts.signed_tx.clone().unwrap_or_default(),
            };
            let assignment = Assignment {
                vtxo_ids: artifacts.input_vtxo_ids.clone(),
                total_sats: artifacts.input_total_sats,
            };
            self.processor
                .finalize_transfer(
                    &session_id,
                    &session.user_pubkey,
                    &transfer,
                    &assignment,
                    &finalized,
                )
                .await?;
            self.advance(&session_id, step::FINALIZATION).await?;
            self.finish(&session, serde_json::json!({
                "txid": finalized.txid,
                "amount": params.amount_sats,
                "fee": params.fee,
                "payment_hash": artifacts.payment_hash,
            }))
            .await?;
        }
        Ok(())
    }

    // -------------------------------------------------------- protocol_op

    /// Generic solver path: steps 1 and 4-6 with solver-supplied payloads.
    async fn run_protocol_op(&self, session: Session) -> Result<()> {
        let session_id = session.session_id.clone();
        let intent = self.reparse_intent(&session).await?;

        if session.last_completed_step < step::INTENT_VERIFICATION {
            self.liveness(&session_id, session.expires_at).await?;
            self.advance(&session_id, step::INTENT_VERIFICATION).await?;
            // steps 2-3 do not apply to solver operations
            self.advance(&session_id, step::CHECKPOINT_PREP).await?;
        }

        let payloads: Vec<String> = intent
            .raw
            .get("params")
            .and_then(|p| p.get("payloads"))
            .and_then(|p| p.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        if self.marker(&session_id).await? < step::SIGNATURE_COLLECTION {
            self.collect_signature(&session_id, &payloads).await?;
            self.advance(&session_id, step::SIGNATURE_COLLECTION).await?;
        }

        let ark_txid = intent
            .raw
            .get("params")
            .and_then(|p| p.get("ark_txid"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut finalized_txid = None;
        if self.marker(&session_id).await? < step::ARK_EXECUTION {
            self.liveness(&session_id, session.expires_at).await?;
            if let Some(ark_txid) = &ark_txid {
                let signature = self.collected_signature(&session_id).await?;
                let collected = vec![CollectedSignature {
                    input_id: "solver".to_string(),
                    signature,
                }];
                let finalized = self
                    .retry_daemon("ark_execution", || {
                        self.state.ark.submit_signatures(ark_txid, &collected)
                    })
                    .await?;
                finalized_txid = Some(finalized.txid);
            }
            self.advance(&session_id, step::ARK_EXECUTION).await?;
        }

        if self.marker(&session_id).await? < step::FINALIZATION {
            if let Some(txid) = &finalized_txid {
                transactions::insert(
                    self.state.store.connection(),
                    transactions::NewTransaction {
                        txid: txid.clone(),
                        session_id: Some(session_id.clone()),
                        tx_type: TxType::ArkTx,
                        raw_tx: None,
                        status: TxStatus::Broadcast,
                        amount_sats: 0,
                        fee_sats: 0,
                    },
                )
                .await?;
            }
            self.advance(&session_id, step::FINALIZATION).await?;
            self.finish(&session, serde_json::json!({
                "txid": finalized_txid,
                "delegated": true,
            }))
            .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------ helpers

    /// Step 4 shared machinery: issue the challenge, move through
    /// challenge_sent/awaiting_signature and park until the response is
    /// bound or the deadline passes.
    async fn collect_signature(&self, session_id: &str, payloads: &[String]) -> Result<()> {
        let session = self.sessions.get(session_id).await?;
        let status = self.sessions.status_of(&session)?;

        match status {
            SessionStatus::Initiated => {
                let (challenge, dm) = self.challenges.issue(&session, payloads, 1, 1).await?;
                self.sessions
                    .transition(session_id, SessionStatus::ChallengeSent, None)
                    .await?;
                self.state
                    .notifier
                    .send_challenge(&session.user_pubkey, dm)
                    .await?;
                self.sessions
                    .transition(session_id, SessionStatus::AwaitingSignature, None)
                    .await?;
                debug!(
                    "session {session_id} awaiting signature (challenge {})",
                    challenge.challenge_id
                );
            }
            // a worker died between the two transitions: resend from the
            // stored challenge and move on
            SessionStatus::ChallengeSent => {
                if let Some(stored) = challenges::find_open_for_session(
                    self.state.store.connection(),
                    session_id,
                )
                .await?
                {
                    let dm = relay::ChallengePayload {
                        session_id: session_id.to_string(),
                        challenge_id: stored.challenge_id.clone(),
                        challenge_type: "sign_payload".to_string(),
                        payload_to_sign: stored.challenge_data.clone(),
                        payload_ref: stored.payload_ref.clone(),
                        algo: crate::challenge::CHALLENGE_ALGO.to_string(),
                        domain: crate::challenge::CHALLENGE_DOMAIN.to_string(),
                        context: stored.context.clone(),
                        step_index: Some(stored.step_index as u32),
                        step_total: Some(stored.step_total as u32),
                        expires_at: stored.expires_at.timestamp(),
                    };
                    self.state
                        .notifier
                        .send_challenge(&session.user_pubkey, dm)
                        .await?;
                }
                self.sessions
                    .transition(session_id, SessionStatus::AwaitingSignature, None)
                    .await?;
            }
            _ => {}
        }

        let challenge = challenges::find_open_for_session(
            self.state.store.connection(),
            session_id,
        )
        .await?;
        let deadline = challenge
            .map(|c| c.expires_at)
            .unwrap_or(session.expires_at)
            .min(session.expires_at);

        self.await_signature(session_id, deadline).await
    }

    /// Park on the session's response signal until it reaches `signing`.
    async fn await_signature(
        &self,
        session_id: &str,
        deadline: DateTime<Utc>,
    ) -> Result<()> {
        let notify = self.state.response_signal(session_id).await;
        loop {
            let session = self.sessions.get(session_id).await?;
            match self.sessions.status_of(&session)? {
                SessionStatus::Signing => return Ok(()),
                SessionStatus::AwaitingSignature => {}
                terminal if terminal.is_terminal() => {
                    return Err(GatewayError::Conflict(format!(
                        "session {session_id} reached {terminal} during signature collection"
                    )));
                }
                other => {
                    return Err(GatewayError::InvalidTransition(format!(
                        "session {session_id} unexpectedly in {other} while collecting"
                    )));
                }
            }
            if self.state.is_cancelled(session_id).await {
                return Err(GatewayError::Cancelled);
            }
            let now = Utc::now();
            if now >= deadline {
                return Err(GatewayError::SignatureMissing(session_id.to_string()));
            }
            let remaining = (deadline - now)
                .to_std()
                .unwrap_or(Duration::from_secs(1))
                .min(Duration::from_secs(STEP_TIMEOUT_SECS as u64));
            let _ = tokio::time::timeout(remaining, notify.notified()).await;
        }
    }

    /// The wallet signature bound in step 4.
    async fn collected_signature(&self, session_id: &str) -> Result<String> {
        let session = self.sessions.get(session_id).await?;
        let challenge_id = session
            .challenge_id
            .ok_or_else(|| GatewayError::SignatureMissing(session_id.to_string()))?;
        let challenge = challenges::find_by_challenge_id(
            self.state.store.connection(),
            &challenge_id,
        )
        .await?
        .ok_or_else(|| GatewayError::SignatureMissing(session_id.to_string()))?;
        if !challenge.is_used {
            return Err(GatewayError::SignatureMissing(session_id.to_string()));
        }
        challenge
            .signature
            .ok_or_else(|| GatewayError::SignatureMissing(session_id.to_string()))
    }

    /// Complete the session and queue the public confirmation.
    async fn finish(&self, session: &Session, results: serde_json::Value) -> Result<()> {
        self.sessions
            .complete(&session.session_id, results.clone())
            .await?;
        let grace = Duration::from_secs(PUBLISH_GRACE_SECS);
        let remaining = (session.expires_at - Utc::now())
            .to_std()
            .unwrap_or_default();
        self.state
            .notifier
            .notify_confirmation(OutboundEvent::Confirmation {
                author: session.user_pubkey.clone(),
                ref_event_id: None,
                payload: ConfirmationPayload {
                    status: "success".to_string(),
                    ref_action_id: session.action_id.clone(),
                    results,
                },
                deadline: Some(Instant::now() + remaining + grace),
            })
            .await;
        info!("session {} completed", session.session_id);
        Ok(())
    }

    /// Cooperative cancellation / expiry gate, checked at every suspension
    /// point.
    async fn liveness(&self, session_id: &str, expires_at: DateTime<Utc>) -> Result<()> {
        if self.state.is_cancelled(session_id).await {
            return Err(GatewayError::Cancelled);
        }
        if Utc::now() >= expires_at {
            return Err(GatewayError::Expired(format!(
                "session deadline {expires_at} passed"
            )));
        }
        Ok(())
    }

    async fn marker(&self, session_id: &str) -> Result<i32> {
        Ok(self.sessions.get(session_id).await?.last_completed_step)
    }

    async fn advance(&self, session_id: &str, completed: i32) -> Result<()> {
        sessions::advance_step(self.state.store.connection(), session_id, completed).await?;
        Ok(())
    }

    async fn save_artifacts(&self, session_id: &str, artifacts: &CeremonyArtifacts) -> Result<()> {
        sessions::set_result(
            self.state.store.connection(),
            session_id,
            serde_json::json!({ "ceremony": artifacts }),
            None,
        )
        .await?;
        Ok(())
    }

    async fn reparse_intent(&self, session: &Session) -> Result<Intent> {
        let payload: IntentPayload = serde_json::from_value(session.intent_data.clone())
            .map_err(|e| GatewayError::Validation(format!("stored intent unreadable: {e}")))?;
        events::parse_intent(
            &session.user_pubkey,
            "",
            payload,
            Utc::now(),
            &self.state.config.native_asset_id,
            &self.state.config.solvers,
        )
    }

    async fn transfer_params(&self, session: &Session) -> Result<TransferParams> {
        let intent = self.reparse_intent(session).await?;
        match intent.kind {
            IntentKind::Transfer(params) => Ok(params),
            _ => Err(GatewayError::Internal(
                "transfer session carries non-transfer intent".to_string(),
            )),
        }
    }

    /// Daemon-facing step work runs under the step-local cap with bounded
    /// transient retries.
    async fn retry_daemon<T, F, Fut>(&self, what: &'static str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, DaemonError>>,
    {
        run_step_capped(what, step_cap(), || {
            let fut = call();
            async move { fut.await.map_err(GatewayError::from_daemon) }
        })
        .await
    }

    /// Undo the session's input assignment when the ceremony dies before
    /// finalization. After step 6 nothing is released: the spend is
    /// committed and cancellation is rejected upstream.
    async fn cleanup_after_failure(&self, session_id: &str, err: &GatewayError) {
        let Ok(session) = self.sessions.get(session_id).await else {
            return;
        };
        if session.last_completed_step >= step::FINALIZATION {
            return;
        }
        let artifacts = load_artifacts(&session);
        if artifacts.input_vtxo_ids.is_empty() {
            return;
        }
        let asset_id = session
            .intent_data
            .get("params")
            .and_then(|p| p.get("asset_id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        debug!(
            "releasing {} assigned inputs of failed session {session_id} ({err})",
            artifacts.input_vtxo_ids.len()
        );
        if let Err(release_err) = self
            .processor
            .abandon_transfer(
                &session.user_pubkey,
                &asset_id,
                &Assignment {
                    vtxo_ids: artifacts.input_vtxo_ids.clone(),
                    total_sats: artifacts.input_total_sats,
                },
                artifacts.reserved_sats,
            )
            .await
        {
            warn!("could not release inputs of {session_id}: {release_err}");
        }
    }
}

/// Ceremony artifacts stored under `result_data.ceremony`.
pub fn load_artifacts(session: &Session) -> CeremonyArtifacts {
    session
        .result_data
        .as_ref()
        .and_then(|data| data.get("ceremony"))
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .unwrap_or_default()
}

fn step_cap() -> Duration {
    Duration::from_secs(STEP_TIMEOUT_SECS as u64)
}

/// Run one retriable step under its local deadline. Transient daemon
/// failures retry with backoff inside the cap; when the cap elapses the
/// step reports a timeout (wire code 3003).
async fn run_step_capped<T, F, Fut>(what: &'static str, cap: Duration, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let deadline = Instant::now() + cap;
    let mut attempts = 0u32;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(GatewayError::StepTimeout(what));
        }
        match tokio::time::timeout(remaining, call()).await {
            Err(_) => return Err(GatewayError::StepTimeout(what)),
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(GatewayError::BackendUnavailable(msg)))
                if attempts < STEP_MAX_TRANSIENT_RETRIES =>
            {
                attempts += 1;
                warn!("{what} transient failure (attempt {attempts}): {msg}");
                tokio::time::sleep(Duration::from_secs(attempts as u64)).await;
            }
            Ok(Err(err)) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future;

    #[tokio::test(start_paused = true)]
    async fn step_cap_reports_timeout() {
        let result: Result<()> =
            run_step_capped("hung_step", Duration::from_secs(5), || {
                future::pending::<Result<()>>()
            })
            .await;
        match result {
            Err(GatewayError::StepTimeout("hung_step")) => {}
            other => panic!("expected step timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_inside_the_cap() {
        let mut attempts = 0u32;
        let result = run_step_capped("flaky_step", Duration::from_secs(60), || {
            attempts += 1;
            let attempt = attempts;
            async move {
                if attempt < 3 {
                    Err(GatewayError::BackendUnavailable("blip".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_exhaustion_surfaces_backend_unavailable() {
        let result: Result<()> =
            run_step_capped("down_step", Duration::from_secs(600), || async {
                Err(GatewayError::BackendUnavailable("still down".into()))
            })
            .await;
        match result {
            Err(GatewayError::BackendUnavailable(_)) => {}
            other => panic!("expected backend_unavailable, got {other:?}"),
        }
    }
}
