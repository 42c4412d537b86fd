// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Location coordinator: batched writes, throttling and the member feed.

use chrono::{TimeZone, Utc};
use family_hub::db::{collections, MemoryStore};
use family_hub::models::{Coordinate, Membership, Role, User};
use family_hub::services::{LocationCoordinator, ThrottleConfig};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

fn user(uid: &str, households: &[&str]) -> User {
    let now = Utc.with_ymd_and_hms(2025, 8, 10, 12, 0, 0).unwrap();
    let mut user = User::new_signup(
        uid,
        Some(format!("{}@example.com", uid)),
        Some(uid.to_uppercase()),
        Role::Member,
        vec!["password".to_string()],
        now,
    );
    for id in households {
        user.memberships.insert(
            id.to_string(),
            Membership {
                role: Role::Member,
                joined_at: now,
            },
        );
    }
    user
}

fn coordinator() -> (Arc<MemoryStore>, LocationCoordinator<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let coordinator = LocationCoordinator::new(store.clone(), ThrottleConfig::default());
    (store, coordinator)
}

#[tokio::test]
async fn test_writes_every_household_in_one_commit() {
    let (store, locations) = coordinator();
    let alice = user("alice", &["f1", "f2"]);
    locations.update_coordinate(Coordinate::new(37.4, -122.1));

    let commits = store.commit_count();
    assert!(locations.upsert_my_location(&alice).await.unwrap());
    assert_eq!(store.commit_count(), commits + 1);

    for household in ["f1", "f2"] {
        let doc = store
            .document(&collections::member_location(household, "alice"))
            .expect("location written");
        assert_eq!(doc["uid"], json!("alice"));
        assert_eq!(doc["displayName"], json!("ALICE"));
        assert_eq!(doc["isSharing"], json!(true));
        assert_eq!(doc["coord"], json!({"lat": 37.4, "lon": -122.1}));
        assert!(doc["lastUpdated"].is_string());
    }
}

#[tokio::test]
async fn test_failed_batch_writes_nothing_and_is_not_throttled() {
    let (store, locations) = coordinator();
    let alice = user("alice", &["f1", "f2"]);
    locations.update_coordinate(Coordinate::new(37.4, -122.1));
    store.fail_writes_to(collections::MEMBER_LOCATIONS);

    assert!(locations.upsert_my_location(&alice).await.is_err());
    assert!(store
        .document(&collections::member_location("f1", "alice"))
        .is_none());
    assert!(store
        .document(&collections::member_location("f2", "alice"))
        .is_none());

    store.clear_failures();
    assert!(locations.upsert_my_location(&alice).await.unwrap());
}

#[tokio::test]
async fn test_throttle_skips_until_reset() {
    let (store, locations) = coordinator();
    let alice = user("alice", &["f1"]);
    locations.update_coordinate(Coordinate::new(37.4, -122.1));
    assert!(locations.upsert_my_location(&alice).await.unwrap());

    let commits = store.commit_count();
    locations.update_coordinate(Coordinate::new(37.401, -122.1));
    assert!(!locations.upsert_my_location(&alice).await.unwrap());
    assert_eq!(store.commit_count(), commits);

    locations.reset_throttle().await;
    assert!(locations.upsert_my_location(&alice).await.unwrap());
    let doc = store
        .document(&collections::member_location("f1", "alice"))
        .unwrap();
    assert_eq!(doc["coord"]["lat"], json!(37.401));
}

#[tokio::test]
async fn test_nothing_to_write() {
    let (store, locations) = coordinator();
    let commits = store.commit_count();

    // no fix yet
    assert!(!locations
        .upsert_my_location(&user("alice", &["f1"]))
        .await
        .unwrap());
    // no households
    locations.update_coordinate(Coordinate::new(37.4, -122.1));
    assert!(!locations
        .upsert_my_location(&user("alice", &[]))
        .await
        .unwrap());
    assert_eq!(store.commit_count(), commits);
}

#[tokio::test]
async fn test_stop_sharing_is_per_household() {
    let (store, locations) = coordinator();
    let alice = user("alice", &["f1", "f2"]);
    locations.update_coordinate(Coordinate::new(37.4, -122.1));
    locations.upsert_my_location(&alice).await.unwrap();

    locations.stop_sharing("alice", "f1").await.unwrap();

    let f1 = store
        .document(&collections::member_location("f1", "alice"))
        .unwrap();
    assert_eq!(f1["isSharing"], json!(false));
    assert_eq!(f1["coord"]["lat"], json!(37.4));
    let f2 = store
        .document(&collections::member_location("f2", "alice"))
        .unwrap();
    assert_eq!(f2["isSharing"], json!(true));
}

#[tokio::test]
async fn test_feed_merges_changes_and_drops_stale_batches() {
    let (store, locations) = coordinator();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let alice = user("alice", &["f1", "f2"]);
    let bob = user("bob", &["f1"]);
    locations.update_coordinate(Coordinate::new(37.4, -122.1));
    locations.upsert_my_location(&alice).await.unwrap();

    let seeded = locations.subscribe("f1", tx.clone()).await.unwrap();
    assert_eq!(seeded.map(|m| m.len()), Some(0));
    assert!(locations.subscribe("f1", tx.clone()).await.unwrap().is_none());

    let initial = rx.recv().await.unwrap();
    let (household, markers) = locations.apply(&initial).await.unwrap();
    assert_eq!(household, "f1");
    assert!(markers.contains_key("alice"));

    // A second coordinator stands in for bob's device.
    let bob_device = LocationCoordinator::new(store.clone(), ThrottleConfig::default());
    bob_device.update_coordinate(Coordinate::new(37.5, -122.2));
    bob_device.upsert_my_location(&bob).await.unwrap();
    let batch = rx.recv().await.unwrap();
    let (_, markers) = locations.apply(&batch).await.unwrap();
    assert_eq!(markers.len(), 2);
    assert_eq!(markers["bob"].coord, Coordinate::new(37.5, -122.2));

    bob_device.stop_sharing("bob", "f1").await.unwrap();
    let batch = rx.recv().await.unwrap();
    let (_, markers) = locations.apply(&batch).await.unwrap();
    assert!(!markers.contains_key("bob"));

    // Moving the feed makes batches from the old listener stale.
    locations.subscribe("f2", tx.clone()).await.unwrap();
    assert!(locations.apply(&batch).await.is_none());
    assert_eq!(locations.cached("f1").len(), 1);
}

