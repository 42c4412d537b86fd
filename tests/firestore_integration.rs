// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Firestore integration tests.
//!
//! These tests require the Firestore emulator and the `gcp` feature:
//! `FIRESTORE_EMULATOR_HOST=localhost:8080 cargo test --features gcp`
//!
//! Every test works under freshly generated ids, so runs do not interfere.
#![cfg(feature = "gcp")]

use family_hub::db::{
    collections, DocumentChange, DocumentStore, FieldUpdate, FirestoreStore, ListenTarget, Query,
    StoreError, Transaction,
};
use family_hub::models::Role;
use family_hub::services::MembershipRepository;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

mod common;

async fn test_store() -> Arc<FirestoreStore> {
    Arc::new(
        FirestoreStore::new("test-project")
            .await
            .expect("Failed to connect to Firestore emulator"),
    )
}

#[tokio::test]
async fn test_patch_and_server_timestamp() {
    require_emulator!();

    let store = test_store().await;
    let doc = collections::user(&store.new_id());

    let mut tx = Transaction::new();
    tx.upsert(
        doc.clone(),
        vec![
            FieldUpdate::set("memberships.f1", json!({"role": "member"})),
            FieldUpdate::server_timestamp("updatedAt"),
        ],
    );
    store.commit(tx).await.unwrap();

    let snapshot = store.get(&doc).await.unwrap().expect("document written");
    assert_eq!(snapshot.data["memberships"]["f1"]["role"], json!("member"));

    // Filled in by the server at commit time, so it matches the update time.
    let stamped = snapshot.data["updatedAt"].as_str().expect("timestamp stored");
    let stamped = chrono::DateTime::parse_from_rfc3339(stamped).unwrap();
    let skew = stamped.with_timezone(&chrono::Utc) - snapshot.update_time;
    assert!(skew.num_milliseconds().abs() < 1, "skew {:?}", skew);

    let mut tx = Transaction::new();
    tx.patch(doc.clone(), vec![FieldUpdate::delete("memberships.f1")]);
    store.commit(tx).await.unwrap();
    let snapshot = store.get(&doc).await.unwrap().unwrap();
    assert_eq!(snapshot.data["memberships"], json!({}));
}

#[tokio::test]
async fn test_stale_read_aborts() {
    require_emulator!();

    let store = test_store().await;
    let doc = collections::user(&store.new_id());
    store
        .apply(family_hub::db::Write::Patch {
            doc: doc.clone(),
            fields: vec![FieldUpdate::set("n", json!(1))],
            upsert: true,
        })
        .await
        .unwrap();

    let seen = store.get(&doc).await.unwrap();
    let mut stale = Transaction::new();
    stale.observe(&doc, seen.as_ref());
    stale.patch(doc.clone(), vec![FieldUpdate::set("n", json!(3))]);

    let mut winner = Transaction::new();
    winner.patch(doc.clone(), vec![FieldUpdate::set("n", json!(2))]);
    store.commit(winner).await.unwrap();

    let err = store.commit(stale).await.unwrap_err();
    assert!(matches!(err, StoreError::Aborted(_)), "got {:?}", err);
    let snapshot = store.get(&doc).await.unwrap().unwrap();
    assert_eq!(snapshot.data["n"], json!(2));
}

#[tokio::test]
async fn test_changed_read_only_document_aborts() {
    require_emulator!();

    let store = test_store().await;
    let guard = collections::family(&store.new_id());
    let target = collections::user(&store.new_id());
    let mut seed = Transaction::new();
    seed.upsert(guard.clone(), vec![FieldUpdate::set("n", json!(1))]);
    store.commit(seed).await.unwrap();

    let seen = store.get(&guard).await.unwrap();
    let mut stale = Transaction::new();
    stale.observe(&guard, seen.as_ref());
    stale.upsert(target.clone(), vec![FieldUpdate::set("n", json!(1))]);

    let mut winner = Transaction::new();
    winner.patch(guard.clone(), vec![FieldUpdate::set("n", json!(2))]);
    store.commit(winner).await.unwrap();

    let err = store.commit(stale).await.unwrap_err();
    assert!(matches!(err, StoreError::Aborted(_)), "got {:?}", err);
    assert!(store.get(&target).await.unwrap().is_none());
}

#[tokio::test]
async fn test_create_and_join_household() {
    require_emulator!();

    let store = test_store().await;
    let repo = MembershipRepository::new(store.clone());
    let alice = store.new_id();
    let bob = store.new_id();
    seed_firestore_user(&repo, &alice, Role::Organizer).await;
    seed_firestore_user(&repo, &bob, Role::Member).await;

    let household = repo.create_household("Emulated", &alice).await.unwrap();
    let joined = repo.join_by_code(&household.join_code, &bob).await.unwrap();
    assert!(joined.is_member(&bob));

    let report = repo.reconcile_user(&bob, false).await.unwrap();
    assert!(report.is_consistent());
}

#[tokio::test]
async fn test_query_listener_sees_changes() {
    require_emulator!();

    let store = test_store().await;
    let household_id = store.new_id();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let query = Query::field_eq(
        collections::member_locations(&household_id),
        "isSharing",
        json!(true),
    );
    let subscription = store.listen(ListenTarget::Query(query), tx).await.unwrap();

    let initial = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(initial.changes.is_empty());

    let mut write = Transaction::new();
    write.upsert(
        collections::member_location(&household_id, "u1"),
        vec![
            FieldUpdate::set("uid", json!("u1")),
            FieldUpdate::set("isSharing", json!(true)),
        ],
    );
    store.commit(write).await.unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(batch.subscription, subscription.id());
    assert!(matches!(&batch.changes[..], [DocumentChange::Added(s)] if s.id() == "u1"));
}

async fn seed_firestore_user(repo: &MembershipRepository<FirestoreStore>, uid: &str, role: Role) {
    let user = family_hub::models::User::new_signup(
        uid,
        None,
        Some(uid.to_string()),
        role,
        vec!["password".to_string()],
        family_hub::time_utils::now_micros(),
    );
    repo.save_user(&user).await.expect("seed user");
}

