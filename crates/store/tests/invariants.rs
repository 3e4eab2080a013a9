//! Store-level invariant tests on an in-memory database.

use chrono::{Duration, Utc};
use store::{balances, challenges, sessions, vtxos, SessionStatus, SessionType, Store, StoreError};

async fn test_store() -> Store {
    let store = Store::connect("sqlite::memory:", 1).await.unwrap();
    store.create_schema().await.unwrap();
    store
}

fn new_session(action_id: &str) -> sessions::NewSession {
    sessions::NewSession {
        session_id: format!("sess-{action_id}"),
        user_pubkey: "a".repeat(64),
        action_id: action_id.to_string(),
        session_type: SessionType::P2pTransfer,
        intent_data: serde_json::json!({"amount": 1}),
        context: None,
        expires_at: Utc::now() + Duration::minutes(30),
    }
}

#[tokio::test]
async fn duplicate_intent_insert_resolves_to_existing_row() {
    let store = test_store().await;
    let db = store.connection();

    let (first, created) = sessions::insert(db, new_session("A1")).await.unwrap();
    assert!(created);

    // same (user, action_id) under a different session id
    let mut dup = new_session("A1");
    dup.session_id = "sess-other".to_string();
    let (second, created) = sessions::insert(db, dup).await.unwrap();
    assert!(!created);
    assert_eq!(first.session_id, second.session_id);
}

#[tokio::test]
async fn guarded_transition_rejects_stale_writers() {
    let store = test_store().await;
    let db = store.connection();
    let (session, _) = sessions::insert(db, new_session("A2")).await.unwrap();

    let moved = sessions::transition(
        db,
        &session.session_id,
        &[SessionStatus::Initiated],
        SessionStatus::ChallengeSent,
        None,
    )
    .await
    .unwrap();
    assert!(moved);

    // a second writer that still believes the session is `initiated`
    let raced = sessions::transition(
        db,
        &session.session_id,
        &[SessionStatus::Initiated],
        SessionStatus::Failed,
        None,
    )
    .await
    .unwrap();
    assert!(!raced);
}

#[tokio::test]
async fn reserve_never_exceeds_balance() {
    let store = test_store().await;
    let db = store.connection();
    let user = "u".repeat(64);

    balances::credit(db, &user, "gBTC", 1000).await.unwrap();
    balances::reserve(db, &user, "gBTC", 600).await.unwrap();

    // spendable is 400 now; reserving more must fail
    let err = balances::reserve(db, &user, "gBTC", 500).await.unwrap_err();
    assert!(matches!(err, StoreError::InsufficientBalance { .. }));

    let row = balances::find(db, &user, "gBTC").await.unwrap().unwrap();
    assert_eq!(row.balance, 1000);
    assert_eq!(row.reserved_balance, 600);
    assert!(row.balance >= row.reserved_balance);

    // spending reserved funds drops both sides together
    balances::debit_reserved(db, &user, "gBTC", 600).await.unwrap();
    let row = balances::find(db, &user, "gBTC").await.unwrap().unwrap();
    assert_eq!(row.balance, 400);
    assert_eq!(row.reserved_balance, 0);
}

#[tokio::test]
async fn release_cannot_underflow_reserve() {
    let store = test_store().await;
    let db = store.connection();
    let user = "u".repeat(64);

    balances::credit(db, &user, "gBTC", 1000).await.unwrap();
    balances::reserve(db, &user, "gBTC", 100).await.unwrap();
    assert!(balances::release(db, &user, "gBTC", 200).await.is_err());
    balances::release(db, &user, "gBTC", 100).await.unwrap();
}

#[tokio::test]
async fn challenge_consume_has_a_single_winner() {
    let store = test_store().await;
    let db = store.connection();
    let (session, _) = sessions::insert(db, new_session("A3")).await.unwrap();

    challenges::insert(
        db,
        challenges::NewChallenge {
            challenge_id: "c1".into(),
            session_id: session.session_id.clone(),
            challenge_data: "cGF5bG9hZA==".into(),
            payload_ref: "ref".into(),
            context: "ctx".into(),
            step_index: 1,
            step_total: 1,
            expires_at: Utc::now() + Duration::minutes(5),
        },
    )
    .await
    .unwrap();

    let now = Utc::now();
    let first = challenges::consume(db, "c1", "sig-a", now).await.unwrap();
    let second = challenges::consume(db, "c1", "sig-b", now).await.unwrap();
    assert!(first);
    assert!(!second);

    // the losing signature never replaces the winner's
    let stored = challenges::find_by_challenge_id(db, "c1").await.unwrap().unwrap();
    assert!(stored.is_used);
    assert_eq!(stored.signature.as_deref(), Some("sig-a"));
}

#[tokio::test]
async fn expired_challenge_cannot_be_consumed() {
    let store = test_store().await;
    let db = store.connection();
    let (session, _) = sessions::insert(db, new_session("A4")).await.unwrap();

    challenges::insert(
        db,
        challenges::NewChallenge {
            challenge_id: "c2".into(),
            session_id: session.session_id.clone(),
            challenge_data: "cGF5bG9hZA==".into(),
            payload_ref: "ref".into(),
            context: "ctx".into(),
            step_index: 1,
            step_total: 1,
            expires_at: Utc::now() - Duration::seconds(1),
        },
    )
    .await
    .unwrap();

    assert!(!challenges::consume(db, "c2", "sig", Utc::now()).await.unwrap());
}

#[tokio::test]
async fn vtxo_spend_requires_assignment() {
    let store = test_store().await;
    let db = store.connection();

    vtxos::insert_batch(
        db,
        vec![vtxos::NewVtxo {
            vtxo_id: "v1".into(),
            txid: "t1".into(),
            vout: 0,
            amount_sats: 1000,
            script_pubkey: "51".into(),
            asset_id: "gBTC".into(),
            owner: None,
            expires_at: Utc::now() + Duration::hours(24),
        }],
    )
    .await
    .unwrap();

    // available -> spent is not a legal edge
    let ids = vec!["v1".to_string()];
    assert!(!vtxos::mark_spent(db, &ids, "tx").await.unwrap());

    assert!(vtxos::mark_assigned(db, &ids, "user", None).await.unwrap());
    assert!(vtxos::mark_spent(db, &ids, "tx").await.unwrap());

    // spent is terminal: expiry and re-assignment bounce off
    assert_eq!(vtxos::mark_expired(db, &ids).await.unwrap(), 0);
    assert!(!vtxos::mark_assigned(db, &ids, "other", None).await.unwrap());
}

#[tokio::test]
async fn settlement_stamps_each_spend_once() {
    let store = test_store().await;
    let db = store.connection();

    vtxos::insert_batch(
        db,
        vec![vtxos::NewVtxo {
            vtxo_id: "v2".into(),
            txid: "t2".into(),
            vout: 0,
            amount_sats: 1000,
            script_pubkey: "51".into(),
            asset_id: "gBTC".into(),
            owner: Some("user".into()),
            expires_at: Utc::now() + Duration::hours(24),
        }],
    )
    .await
    .unwrap();
    let ids = vec!["v2".to_string()];
    vtxos::mark_spent(db, &ids, "tx2").await.unwrap();

    assert_eq!(vtxos::assets_with_unsettled_spends(db).await.unwrap(), vec!["gBTC"]);
    assert_eq!(vtxos::mark_settled(db, &ids, "batch-1").await.unwrap(), 1);
    // second settlement pass finds nothing left
    assert_eq!(vtxos::mark_settled(db, &ids, "batch-2").await.unwrap(), 0);
    assert!(vtxos::assets_with_unsettled_spends(db).await.unwrap().is_empty());
}
