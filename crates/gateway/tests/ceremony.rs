//! End-to-end ceremony tests against an in-memory store and mock daemons.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use daemons::{
    ArkDaemon, BatchVtxo, CheckpointPrep, CollectedSignature, CommitmentTx, Confirmations,
    CreatedInvoice, DaemonError, DecodedAssetInvoice, DecodedInvoice, FinalizedTx,
    LightningDaemon, LnInfo, LnInvoiceState, LnInvoiceStatus, MintResult, NetworkInfo,
    PaymentResult, PreparedTx, ProofCheck, SigningPayload, TapAsset, TapDaemon, TransferResult,
    TxOutput, VtxoBatch, ChannelBalance,
};
use gateway::assets::AssetManager;
use gateway::ceremony::SigningOrchestrator;
use gateway::challenge::{ChallengeManager, VerifyOutcome};
use gateway::config::Config;
use gateway::error::GatewayError;
use gateway::events::parse_intent;
use gateway::lightning::LightningManager;
use gateway::outbound::{Notifier, OutboundEvent};
use gateway::session::SessionManager;
use gateway::state::SharedState;
use relay::{ChallengePayload, ConfirmationPayload, FailurePayload, IntentPayload, L1CommitmentPayload, ResponsePayload};
use secp256k1::{Keypair, Message, Secp256k1};
use sha2::{Digest, Sha256};
use store::{balances, challenges, sessions, transactions, vtxos, AssetType, SessionStatus,
    SessionType, Store, TxStatus, VtxoStatus};
use tokio::sync::Mutex;

// ----------------------------------------------------------------- mocks

#[derive(Default)]
struct MockArk;

#[async_trait]
impl ArkDaemon for MockArk {
    async fn get_network_info(&self) -> daemons::Result<NetworkInfo> {
        Ok(NetworkInfo {
            network: "regtest".into(),
            block_height: 100,
            synced: true,
        })
    }

    async fn create_vtxo_batch(
        &self,
        _asset_id: &str,
        count: u32,
        _amount_sats: i64,
        _fee_sats: i64,
    ) -> daemons::Result<VtxoBatch> {
        let vtxos = (0..count)
            .map(|i| BatchVtxo {
                vtxo_id: format!("batch-vtxo-{i}"),
                txid: "batch-tx".into(),
                vout: i as i32,
                script_pubkey: "51".into(),
            })
            .collect();
        Ok(VtxoBatch {
            batch_txid: "batch-tx".into(),
            vtxos,
        })
    }

    async fn prepare_transaction(
        &self,
        input_vtxo_ids: &[String],
        _outputs: &[TxOutput],
    ) -> daemons::Result<PreparedTx> {
        let signing_payloads = input_vtxo_ids
            .iter()
            .map(|id| SigningPayload {
                input_id: id.clone(),
                payload: BASE64.encode(format!("payload-for-{id}")),
            })
            .collect();
        Ok(PreparedTx {
            ark_txid: "ark-tx-1".into(),
            unsigned_tx: "raw-unsigned".into(),
            signing_payloads,
        })
    }

    async fn prepare_checkpoint(&self, ark_txid: &str) -> daemons::Result<CheckpointPrep> {
        Ok(CheckpointPrep {
            checkpoint_txid: format!("checkpoint-{ark_txid}"),
            signing_payloads: vec![SigningPayload {
                input_id: "checkpoint".into(),
                payload: BASE64.encode("checkpoint-payload"),
            }],
        })
    }

    async fn submit_signatures(
        &self,
        ark_txid: &str,
        signatures: &[CollectedSignature],
    ) -> daemons::Result<FinalizedTx> {
        assert!(!signatures.is_empty());
        Ok(FinalizedTx {
            txid: ark_txid.to_string(),
            signed_tx: "raw-signed".into(),
        })
    }

    async fn create_commitment(
        &self,
        _asset_id: &str,
        _vtxo_ids: &[String],
        merkle_root: &str,
        _fee_sats: i64,
    ) -> daemons::Result<CommitmentTx> {
        Ok(CommitmentTx {
            txid: format!("l1-{}", &merkle_root[..8]),
            raw_tx: "raw-commitment".into(),
        })
    }

    async fn broadcast(&self, _raw_tx: &str) -> daemons::Result<String> {
        Ok("broadcast".into())
    }

    async fn get_fee_rate(&self) -> daemons::Result<i64> {
        Ok(10)
    }

    async fn get_confirmations(&self, txid: &str) -> daemons::Result<Confirmations> {
        Ok(Confirmations {
            txid: txid.to_string(),
            confirmations: 1,
            block_height: Some(101),
        })
    }
}

#[derive(Default)]
struct MockTap;

#[async_trait]
impl TapDaemon for MockTap {
    async fn list_assets(&self) -> daemons::Result<Vec<TapAsset>> {
        Ok(vec![])
    }

    async fn mint_asset(&self, _: &str, _: &str, _: i64) -> daemons::Result<MintResult> {
        Ok(MintResult {
            asset_id: "tUSD".into(),
            batch_txid: "tap-mint-1".into(),
        })
    }

    async fn transfer_asset(&self, _: &str, _: &str, _: i64) -> daemons::Result<TransferResult> {
        Ok(TransferResult {
            transfer_txid: "tap-transfer-1".into(),
        })
    }

    async fn verify_proof(&self, _: &str) -> daemons::Result<ProofCheck> {
        Ok(ProofCheck {
            valid: true,
            asset_id: "tUSD".into(),
        })
    }

    async fn decode_asset_invoice(&self, _: &str) -> daemons::Result<DecodedAssetInvoice> {
        Err(DaemonError::InvalidRequest("not in test".into()))
    }
}

#[derive(Default)]
struct MockLnd;

#[async_trait]
impl LightningDaemon for MockLnd {
    async fn get_info(&self) -> daemons::Result<LnInfo> {
        Ok(LnInfo {
            identity_pubkey: "02ab".into(),
            synced_to_chain: true,
            block_height: 100,
        })
    }

    async fn add_invoice(
        &self,
        amount_sats: i64,
        _memo: &str,
        _expiry_secs: i64,
    ) -> daemons::Result<CreatedInvoice> {
        Ok(CreatedInvoice {
            payment_hash: "ph-lift-1".into(),
            bolt11: format!("lnbcrt{amount_sats}..."),
            add_index: 1,
        })
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> daemons::Result<LnInvoiceStatus> {
        Ok(LnInvoiceStatus {
            payment_hash: payment_hash.to_string(),
            state: LnInvoiceState::Open,
            amt_paid_sat: 0,
            preimage: None,
        })
    }

    async fn decode_invoice(&self, _bolt11: &str) -> daemons::Result<DecodedInvoice> {
        Ok(DecodedInvoice {
            payment_hash: "ph-land-1".into(),
            num_satoshis: 50_000,
            description: "land".into(),
            expiry: 3600,
            destination: "02ab".into(),
        })
    }

    async fn send_payment(&self, _bolt11: &str, _fee_limit: i64) -> daemons::Result<PaymentResult> {
        Ok(PaymentResult {
            payment_hash: "ph-land-1".into(),
            preimage: Some("pre".into()),
            fee_sats: 1,
            succeeded: true,
            failure_reason: None,
        })
    }

    async fn channel_balance(&self) -> daemons::Result<ChannelBalance> {
        Ok(ChannelBalance {
            local_balance_sat: 10_000_000,
            remote_balance_sat: 10_000_000,
        })
    }
}

/// Notifier that records everything instead of touching the network.
#[derive(Default)]
struct RecordingNotifier {
    challenges: Mutex<Vec<(String, ChallengePayload)>>,
    failures: Mutex<Vec<FailurePayload>>,
    confirmations: Mutex<Vec<ConfirmationPayload>>,
    commitments: Mutex<Vec<L1CommitmentPayload>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_challenge(
        &self,
        recipient: &str,
        payload: ChallengePayload,
    ) -> gateway::Result<()> {
        self.challenges
            .lock()
            .await
            .push((recipient.to_string(), payload));
        Ok(())
    }

    async fn notify_failure(&self, event: OutboundEvent) {
        if let OutboundEvent::Failure { payload, .. } = event {
            self.failures.lock().await.push(payload);
        }
    }

    async fn notify_confirmation(&self, event: OutboundEvent) {
        if let OutboundEvent::Confirmation { payload, .. } = event {
            self.confirmations.lock().await.push(payload);
        }
    }

    async fn notify_l1_commitment(&self, payload: L1CommitmentPayload) {
        self.commitments.lock().await.push(payload);
    }

    async fn forward_service_request(&self, _: &str, _: &str) -> gateway::Result<()> {
        Ok(())
    }
}

// --------------------------------------------------------------- harness

struct Harness {
    state: SharedState,
    notifier: Arc<RecordingNotifier>,
    user_keys: Keypair,
    user_pubkey: String,
}

fn test_config() -> Config {
    Config {
        database_url: "sqlite::memory:".into(),
        database_max_connections: 1,
        relay_secret_key: String::new(),
        relay_urls: vec![],
        arkd_url: String::new(),
        arkd_macaroon: None,
        tapd_url: String::new(),
        tapd_macaroon: None,
        lnd_url: String::new(),
        lnd_macaroon: None,
        daemon_timeout_secs: 5,
        session_timeout_secs: 1800,
        challenge_timeout_secs: 300,
        max_concurrent_sessions: 100,
        worker_pool_size: 4,
        native_asset_id: "gBTC".into(),
        fee_pubkey: "gateway-fees".into(),
        solvers: HashMap::new(),
    }
}

async fn harness() -> Harness {
    let store = Store::connect("sqlite::memory:", 1).await.unwrap();
    store.create_schema().await.unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let state = SharedState::new(
        store,
        Arc::new(MockArk),
        Arc::new(MockTap),
        Arc::new(MockLnd),
        notifier.clone(),
        Arc::new(test_config()),
    );

    let secp = Secp256k1::new();
    let user_keys = Keypair::new(&secp, &mut rand::thread_rng());
    let (xonly, _) = user_keys.x_only_public_key();
    let user_pubkey = hex::encode(xonly.serialize());

    AssetManager::new(state.clone())
        .ensure_asset("gBTC", "Gateway Bitcoin", "gBTC", AssetType::Native)
        .await
        .unwrap();

    Harness {
        state,
        notifier,
        user_keys,
        user_pubkey,
    }
}

impl Harness {
    async fn seed_balance(&self, user: &str, amount: i64) {
        balances::credit(self.state.store.connection(), user, "gBTC", amount)
            .await
            .unwrap();
    }

    async fn seed_inventory(&self, amounts: &[i64]) {
        let rows = amounts
            .iter()
            .enumerate()
            .map(|(i, amount)| vtxos::NewVtxo {
                vtxo_id: format!("pool-{i}"),
                txid: "pool-tx".into(),
                vout: i as i32,
                amount_sats: *amount,
                script_pubkey: "51".into(),
                asset_id: "gBTC".into(),
                owner: None,
                expires_at: Utc::now() + chrono::Duration::hours(24),
            })
            .collect();
        vtxos::insert_batch(self.state.store.connection(), rows)
            .await
            .unwrap();
    }

    fn intent(&self, action_id: &str, intent_type: &str, params: serde_json::Value) -> IntentPayload {
        IntentPayload {
            action_id: action_id.into(),
            intent_type: intent_type.into(),
            params,
            expires_at: Utc::now().timestamp() + 900,
        }
    }

    async fn create_session(&self, payload: IntentPayload) -> (String, bool) {
        let intent = parse_intent(
            &self.user_pubkey,
            "event-1",
            payload,
            Utc::now(),
            "gBTC",
            &HashMap::new(),
        )
        .unwrap();
        let (session, created) = SessionManager::new(self.state.clone())
            .create_for_intent(&intent)
            .await
            .unwrap();
        (session.session_id, created)
    }

    /// Wait for the ceremony to issue its challenge DM.
    async fn wait_for_challenge(&self) -> ChallengePayload {
        for _ in 0..200 {
            if let Some((_, challenge)) = self.notifier.challenges.lock().await.last().cloned() {
                return challenge;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no challenge issued within the test window");
    }

    /// Sign like a wallet and deliver the response the way the dispatcher
    /// would.
    async fn sign_and_respond(&self, challenge: &ChallengePayload) {
        let bytes = BASE64.decode(&challenge.payload_to_sign).unwrap();
        let digest: [u8; 32] = Sha256::digest(&bytes).into();
        let secp = Secp256k1::new();
        let signature =
            secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &self.user_keys);

        let response = ResponsePayload {
            session_id: challenge.session_id.clone(),
            challenge_id: challenge.challenge_id.clone(),
            response_type: "sign_payload".into(),
            signature: hex::encode(signature.serialize()),
            payload_ref: challenge.payload_ref.clone(),
        };
        let outcome = ChallengeManager::new(self.state.clone())
            .verify(&self.user_pubkey, &response)
            .await
            .unwrap();
        assert_eq!(outcome, VerifyOutcome::Accepted);
        self.state.wake_session(&challenge.session_id).await;
    }
}

// ------------------------------------------------------------- scenarios

#[tokio::test]
async fn p2p_transfer_happy_path() {
    let h = harness().await;
    let recipient = "b".repeat(64);
    h.seed_balance(&h.user_pubkey, 100_000).await;
    h.seed_inventory(&[100_000, 100_000]).await;

    let payload = h.intent(
        "A1",
        "p2p_transfer",
        serde_json::json!({
            "recipient": recipient,
            "asset_id": "gBTC",
            "amount": 10_000,
            "fee": 10,
        }),
    );
    let (session_id, created) = h.create_session(payload).await;
    assert!(created);

    let session = sessions::find_by_session_id(h.state.store.connection(), &session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, "initiated");

    let orchestrator = SigningOrchestrator::new(h.state.clone());
    let run = {
        let orchestrator = orchestrator.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { orchestrator.run(&session_id).await })
    };

    let challenge = h.wait_for_challenge().await;
    assert_eq!(challenge.session_id, session_id);
    h.sign_and_respond(&challenge).await;

    run.await.unwrap().unwrap();

    let db = h.state.store.connection();
    let session = sessions::find_by_session_id(db, &session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, "completed");

    // sender: 100000 - 10000 - 10; recipient: 10000; operator: 10
    let sender = balances::find(db, &h.user_pubkey, "gBTC").await.unwrap().unwrap();
    assert_eq!(sender.balance, 89_990);
    assert_eq!(sender.reserved_balance, 0);
    let received = balances::find(db, &recipient, "gBTC").await.unwrap().unwrap();
    assert_eq!(received.balance, 10_000);
    let fees = balances::find(db, "gateway-fees", "gBTC").await.unwrap().unwrap();
    assert_eq!(fees.balance, 10);

    // one broadcast transaction bound to the session
    let tx = transactions::find_by_txid(db, "ark-tx-1").await.unwrap().unwrap();
    assert_eq!(tx.status, TxStatus::Broadcast.as_str());
    assert_eq!(tx.session_id.as_deref(), Some(session_id.as_str()));

    // input spent with the winner's txid, recipient output assigned
    let input = vtxos::find_by_vtxo_id(db, "pool-0").await.unwrap().unwrap();
    assert_eq!(input.status, VtxoStatus::Spent.as_str());
    assert_eq!(input.spending_txid.as_deref(), Some("ark-tx-1"));
    let output = vtxos::find_by_vtxo_id(db, "ark-tx-1:0").await.unwrap().unwrap();
    assert_eq!(output.status, VtxoStatus::Assigned.as_str());
    assert_eq!(output.user_pubkey.as_deref(), Some(recipient.as_str()));

    // exactly one public confirmation referencing the intent
    let confirmations = h.notifier.confirmations.lock().await;
    assert_eq!(confirmations.len(), 1);
    assert_eq!(confirmations[0].ref_action_id, "A1");
    assert_eq!(confirmations[0].status, "success");
}

#[tokio::test]
async fn duplicate_intent_returns_same_session() {
    let h = harness().await;
    h.seed_balance(&h.user_pubkey, 100_000).await;

    let payload = h.intent(
        "A1",
        "p2p_transfer",
        serde_json::json!({
            "recipient": "b".repeat(64),
            "asset_id": "gBTC",
            "amount": 10_000,
            "fee": 10,
        }),
    );
    let (first, created_first) = h.create_session(payload.clone()).await;
    let (second, created_second) = h.create_session(payload).await;

    assert!(created_first);
    assert!(!created_second);
    assert_eq!(first, second);

    // replaying did not issue a second session row or challenge
    let count = sessions::count_active(h.state.store.connection()).await.unwrap();
    assert_eq!(count, 1);
    assert!(h.notifier.challenges.lock().await.is_empty());
}

#[tokio::test]
async fn insufficient_balance_fails_with_2001() {
    let h = harness().await;
    h.seed_balance(&h.user_pubkey, 5_000).await;
    h.seed_inventory(&[100_000]).await;

    let payload = h.intent(
        "A2",
        "p2p_transfer",
        serde_json::json!({
            "recipient": "b".repeat(64),
            "asset_id": "gBTC",
            "amount": 10_000,
            "fee": 10,
        }),
    );
    let (session_id, _) = h.create_session(payload).await;

    let err = SigningOrchestrator::new(h.state.clone())
        .run(&session_id)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 2001);

    let db = h.state.store.connection();
    let session = sessions::find_by_session_id(db, &session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, "failed");

    // failure notice carries the stable code; no VTXO was touched
    let failures = h.notifier.failures.lock().await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].code, 2001);
    let untouched = vtxos::find_by_vtxo_id(db, "pool-0").await.unwrap().unwrap();
    assert_eq!(untouched.status, VtxoStatus::Available.as_str());
}

#[tokio::test]
async fn expired_challenge_fails_with_5002() {
    let h = harness().await;
    h.seed_balance(&h.user_pubkey, 100_000).await;
    h.seed_inventory(&[100_000]).await;

    let payload = h.intent(
        "A3",
        "p2p_transfer",
        serde_json::json!({
            "recipient": "b".repeat(64),
            "asset_id": "gBTC",
            "amount": 10_000,
            "fee": 10,
        }),
    );
    let (session_id, _) = h.create_session(payload).await;

    let orchestrator = SigningOrchestrator::new(h.state.clone());
    let run = {
        let orchestrator = orchestrator.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { orchestrator.run(&session_id).await })
    };
    let challenge = h.wait_for_challenge().await;

    // age the challenge past its deadline before answering
    use sea_orm::sea_query::Expr;
    use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
    store::entity::signing_challenge::Entity::update_many()
        .col_expr(
            store::entity::signing_challenge::Column::ExpiresAt,
            Expr::value(Utc::now() - chrono::Duration::minutes(1)),
        )
        .filter(
            store::entity::signing_challenge::Column::ChallengeId.eq(challenge.challenge_id.clone()),
        )
        .exec(h.state.store.connection())
        .await
        .unwrap();

    let bytes = BASE64.decode(&challenge.payload_to_sign).unwrap();
    let digest: [u8; 32] = Sha256::digest(&bytes).into();
    let secp = Secp256k1::new();
    let signature = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &h.user_keys);
    let response = ResponsePayload {
        session_id: challenge.session_id.clone(),
        challenge_id: challenge.challenge_id.clone(),
        response_type: "sign_payload".into(),
        signature: hex::encode(signature.serialize()),
        payload_ref: challenge.payload_ref.clone(),
    };

    let err = ChallengeManager::new(h.state.clone())
        .verify(&h.user_pubkey, &response)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 5002);

    // the dispatcher fails the session on an expired response
    SessionManager::new(h.state.clone())
        .fail(&session_id, &err)
        .await
        .unwrap();
    run.await.unwrap().ok();

    let session = sessions::find_by_session_id(h.state.store.connection(), &session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, "expired");

    let failures = h.notifier.failures.lock().await;
    assert!(failures.iter().any(|f| f.code == 5002));
}

#[tokio::test]
async fn lightning_lift_settlement_credits_user() {
    let h = harness().await;

    let payload = h.intent(
        "A4",
        "lightning:lift",
        serde_json::json!({
            "asset_id": "gBTC",
            "amount": 1_000_000,
        }),
    );
    let (session_id, _) = h.create_session(payload).await;

    let orchestrator = SigningOrchestrator::new(h.state.clone());
    let run = {
        let orchestrator = orchestrator.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { orchestrator.run(&session_id).await })
    };
    let challenge = h.wait_for_challenge().await;
    h.sign_and_respond(&challenge).await;
    run.await.unwrap().unwrap();

    // ceremony leaves the authorized session waiting for the payment
    let db = h.state.store.connection();
    let session = sessions::find_by_session_id(db, &session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, "signing");

    let lightning = LightningManager::new(h.state.clone());
    lightning.settle_lift("ph-lift-1", Some("preimage")).await.unwrap();

    let session = sessions::find_by_session_id(db, &session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, "completed");

    let balance = balances::find(db, &h.user_pubkey, "gBTC").await.unwrap().unwrap();
    assert_eq!(balance.balance, 1_000_000);

    let vtxo = vtxos::find_by_vtxo_id(db, "lift:ph-lift-1").await.unwrap().unwrap();
    assert_eq!(vtxo.status, VtxoStatus::Assigned.as_str());
    assert_eq!(vtxo.amount_sats, 1_000_000);

    let invoice = store::invoices::find_by_payment_hash(db, "ph-lift-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(invoice.status, "settled");

    // duplicate settlement signals are idempotent
    lightning.settle_lift("ph-lift-1", Some("preimage")).await.unwrap();
    let balance = balances::find(db, &h.user_pubkey, "gBTC").await.unwrap().unwrap();
    assert_eq!(balance.balance, 1_000_000);
    assert_eq!(h.notifier.confirmations.lock().await.len(), 1);
}

#[tokio::test]
async fn double_spend_race_has_one_winner() {
    let h = harness().await;
    let db = h.state.store.connection();
    h.seed_inventory(&[100_000]).await;

    // both sessions claim the same input
    let ids = vec!["pool-0".to_string()];
    assert!(vtxos::mark_assigned(db, &ids, &h.user_pubkey, Some("s-winner"))
        .await
        .unwrap());

    let winner = vtxos::mark_spent(db, &ids, "tx-winner").await.unwrap();
    let loser = vtxos::mark_spent(db, &ids, "tx-loser").await.unwrap();
    assert!(winner);
    assert!(!loser);

    let vtxo = vtxos::find_by_vtxo_id(db, "pool-0").await.unwrap().unwrap();
    assert_eq!(vtxo.status, VtxoStatus::Spent.as_str());
    assert_eq!(vtxo.spending_txid.as_deref(), Some("tx-winner"));
}

#[tokio::test]
async fn duplicate_response_is_dropped() {
    let h = harness().await;
    h.seed_balance(&h.user_pubkey, 100_000).await;
    h.seed_inventory(&[100_000]).await;

    let payload = h.intent(
        "A5",
        "p2p_transfer",
        serde_json::json!({
            "recipient": "b".repeat(64),
            "asset_id": "gBTC",
            "amount": 10_000,
            "fee": 10,
        }),
    );
    let (session_id, _) = h.create_session(payload).await;

    let orchestrator = SigningOrchestrator::new(h.state.clone());
    let run = {
        let orchestrator = orchestrator.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { orchestrator.run(&session_id).await })
    };
    let challenge = h.wait_for_challenge().await;
    h.sign_and_respond(&challenge).await;
    run.await.unwrap().unwrap();

    // a replayed response hits the consumed challenge and changes nothing
    let bytes = BASE64.decode(&challenge.payload_to_sign).unwrap();
    let digest: [u8; 32] = Sha256::digest(&bytes).into();
    let secp = Secp256k1::new();
    let signature = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &h.user_keys);
    let replay = ResponsePayload {
        session_id: session_id.clone(),
        challenge_id: challenge.challenge_id.clone(),
        response_type: "sign_payload".into(),
        signature: hex::encode(signature.serialize()),
        payload_ref: challenge.payload_ref.clone(),
    };
    let outcome = ChallengeManager::new(h.state.clone())
        .verify(&h.user_pubkey, &replay)
        .await
        .unwrap();
    assert_eq!(outcome, VerifyOutcome::AlreadyUsed);

    let stored = challenges::find_by_challenge_id(
        h.state.store.connection(),
        &challenge.challenge_id,
    )
    .await
    .unwrap()
    .unwrap();
    assert!(stored.is_used);
}

#[tokio::test]
async fn cancellation_rejected_once_finalization_committed() {
    let h = harness().await;
    let db = h.state.store.connection();

    // walk a session to `signing` with the finalization marker committed:
    // the window between step 6 and the completed transition
    let (session, _) = sessions::insert(
        db,
        sessions::NewSession {
            session_id: "sess-window".into(),
            user_pubkey: h.user_pubkey.clone(),
            action_id: "A7".into(),
            session_type: SessionType::P2pTransfer,
            intent_data: serde_json::json!({"amount": 1}),
            context: None,
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        },
    )
    .await
    .unwrap();
    for (from, to) in [
        (SessionStatus::Initiated, SessionStatus::ChallengeSent),
        (SessionStatus::ChallengeSent, SessionStatus::AwaitingSignature),
        (SessionStatus::AwaitingSignature, SessionStatus::Signing),
    ] {
        assert!(sessions::transition(db, &session.session_id, &[from], to, None)
            .await
            .unwrap());
    }
    assert!(sessions::advance_step(db, &session.session_id, 6).await.unwrap());

    let err = SessionManager::new(h.state.clone())
        .cancel(&session.session_id)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Conflict(_)));

    // the settled session was not failed and no spurious notice went out
    let session = sessions::find_by_session_id(db, &session.session_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(session.status, "signing");
    assert!(h.notifier.failures.lock().await.is_empty());
}

#[tokio::test]
async fn cancellation_is_rejected_after_finalization() {
    let h = harness().await;
    h.seed_balance(&h.user_pubkey, 100_000).await;
    h.seed_inventory(&[100_000]).await;

    let payload = h.intent(
        "A6",
        "p2p_transfer",
        serde_json::json!({
            "recipient": "b".repeat(64),
            "asset_id": "gBTC",
            "amount": 10_000,
            "fee": 10,
        }),
    );
    let (session_id, _) = h.create_session(payload).await;

    let orchestrator = SigningOrchestrator::new(h.state.clone());
    let run = {
        let orchestrator = orchestrator.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move { orchestrator.run(&session_id).await })
    };
    let challenge = h.wait_for_challenge().await;
    h.sign_and_respond(&challenge).await;
    run.await.unwrap().unwrap();

    let err = SessionManager::new(h.state.clone())
        .cancel(&session_id)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Conflict(_)));
}
