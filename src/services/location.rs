// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Location sharing coordinator.
//!
//! Handles:
//! - Throttling the current user's coordinate writes (distance OR time,
//!   with a hard minimum interval)
//! - Writing one location document per household in a single batch
//! - The member-location feed for the current household, with a
//!   per-household cache so switching back restores markers instantly

use crate::db::{
    collections, ChangeBatch, ChangeSink, DocumentChange, DocumentStore, FieldUpdate,
    ListenTarget, Query, Subscription, Transaction,
};
use crate::error::Result;
use crate::models::{Coordinate, MemberLocation, User};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

/// Member markers for one household, keyed by uid.
pub type MemberLocations = BTreeMap<String, MemberLocation>;

/// Thresholds for [`WriteThrottle`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleConfig {
    pub min_distance_meters: f64,
    pub min_interval: Duration,
    /// Floor applied regardless of distance or elapsed time.
    pub hard_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            min_distance_meters: 750.0,
            min_interval: Duration::minutes(10),
            hard_min_interval: Duration::seconds(20),
        }
    }
}

/// Decides whether a coordinate is worth writing given the last write.
#[derive(Debug, Clone)]
pub struct WriteThrottle {
    config: ThrottleConfig,
    last_write: Option<(Coordinate, DateTime<Utc>)>,
}

impl WriteThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            last_write: None,
        }
    }

    pub fn should_write(&self, coord: Coordinate, now: DateTime<Utc>) -> bool {
        let Some((last_coord, last_at)) = self.last_write else {
            return true;
        };
        let elapsed = now - last_at;
        if elapsed < self.config.hard_min_interval {
            return false;
        }
        coord.distance_meters(last_coord) >= self.config.min_distance_meters
            || elapsed >= self.config.min_interval
    }

    /// Record a write that actually committed.
    pub fn record(&mut self, coord: Coordinate, at: DateTime<Utc>) {
        self.last_write = Some((coord, at));
    }

    /// Forget the last write so the next fix is written.
    pub fn reset(&mut self) {
        self.last_write = None;
    }
}

struct ActiveFeed {
    household_id: String,
    subscription: Subscription,
    /// The first batch is the listener's full initial result set.
    awaiting_initial: bool,
}

pub struct LocationCoordinator<S> {
    store: Arc<S>,
    throttle: tokio::sync::Mutex<WriteThrottle>,
    current: Mutex<Option<Coordinate>>,
    cache: DashMap<String, MemberLocations>,
    feed: tokio::sync::Mutex<Option<ActiveFeed>>,
}

impl<S: DocumentStore> LocationCoordinator<S> {
    pub fn new(store: Arc<S>, config: ThrottleConfig) -> Self {
        Self {
            store,
            throttle: tokio::sync::Mutex::new(WriteThrottle::new(config)),
            current: Mutex::new(None),
            cache: DashMap::new(),
            feed: tokio::sync::Mutex::new(None),
        }
    }

    /// Record the latest device fix.
    pub fn update_coordinate(&self, coord: Coordinate) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(coord);
    }

    pub fn current_coordinate(&self) -> Option<Coordinate> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn reset_throttle(&self) {
        self.throttle.lock().await.reset();
    }

    /// Write the current coordinate into every household `user` belongs to,
    /// as one batch. Returns whether a write happened.
    pub async fn upsert_my_location(&self, user: &User) -> Result<bool> {
        let Some(coord) = self.current_coordinate() else {
            tracing::debug!(uid = %user.id, "No coordinate yet; skipping location write");
            return Ok(false);
        };
        if user.memberships.is_empty() {
            return Ok(false);
        }

        // Held across the commit so concurrent callers see the recorded write.
        let mut throttle = self.throttle.lock().await;
        let now = Utc::now();
        if !throttle.should_write(coord, now) {
            tracing::debug!(uid = %user.id, "Location write throttled");
            return Ok(false);
        }

        let display_name = user
            .display_name
            .clone()
            .or_else(|| user.email.clone())
            .unwrap_or_default();

        let mut tx = Transaction::new();
        for household_id in user.memberships.keys() {
            let mut fields = vec![
                FieldUpdate::set("uid", json!(user.id)),
                FieldUpdate::set("displayName", json!(display_name)),
                FieldUpdate::set("isSharing", json!(true)),
                FieldUpdate::set("coord", json!(coord)),
                FieldUpdate::server_timestamp("lastUpdated"),
            ];
            if let Some(photo) = &user.photo_url {
                fields.push(FieldUpdate::set("photoURL", json!(photo)));
            }
            tx.upsert(collections::member_location(household_id, &user.id), fields);
        }
        self.store.commit(tx).await?;
        throttle.record(coord, now);

        tracing::info!(
            uid = %user.id,
            households = user.memberships.len(),
            "Location written"
        );
        Ok(true)
    }

    /// Mark the user as not sharing in `household_id` only. The document is
    /// kept so the last position survives.
    pub async fn stop_sharing(&self, uid: &str, household_id: &str) -> Result<()> {
        let mut tx = Transaction::new();
        tx.upsert(
            collections::member_location(household_id, uid),
            vec![
                FieldUpdate::set("uid", json!(uid)),
                FieldUpdate::set("isSharing", json!(false)),
            ],
        );
        self.store.commit(tx).await?;
        tracing::info!(uid, household_id, "Stopped sharing location");
        Ok(())
    }

    /// Point the feed at `household_id`, replacing any previous listener.
    ///
    /// Returns the cached markers to publish immediately, or `None` if the
    /// feed already tracks this household.
    pub async fn subscribe(
        &self,
        household_id: &str,
        sink: ChangeSink,
    ) -> Result<Option<MemberLocations>> {
        let mut feed = self.feed.lock().await;
        if feed
            .as_ref()
            .is_some_and(|f| f.household_id == household_id)
        {
            return Ok(None);
        }

        if let Some(previous) = feed.take() {
            tracing::debug!(household_id = %previous.household_id, "Detaching location feed");
            previous.subscription.cancel();
        }

        let seeded = self.cached(household_id);
        let query = Query::field_eq(
            collections::member_locations(household_id),
            "isSharing",
            json!(true),
        );
        let subscription = self.store.listen(ListenTarget::Query(query), sink).await?;
        tracing::debug!(household_id, subscription = ?subscription.id(), "Location feed attached");

        *feed = Some(ActiveFeed {
            household_id: household_id.to_string(),
            subscription,
            awaiting_initial: true,
        });
        Ok(Some(seeded))
    }

    /// Merge a feed batch into the cache. Batches from a detached listener
    /// are ignored. Returns the household and its updated markers.
    pub async fn apply(&self, batch: &ChangeBatch) -> Option<(String, MemberLocations)> {
        let mut guard = self.feed.lock().await;
        let feed = guard.as_mut()?;
        if feed.subscription.id() != batch.subscription {
            tracing::debug!(subscription = ?batch.subscription, "Dropping stale location batch");
            return None;
        }

        let mut entry = self.cache.entry(feed.household_id.clone()).or_default();
        let markers = entry.value_mut();

        if feed.awaiting_initial {
            feed.awaiting_initial = false;
            let present: HashSet<&str> = batch.changes.iter().map(|c| c.doc().id()).collect();
            markers.retain(|uid, _| present.contains(uid.as_str()));
        }

        for change in &batch.changes {
            match change {
                DocumentChange::Added(snapshot) | DocumentChange::Modified(snapshot) => {
                    match snapshot.decode::<MemberLocation>() {
                        Ok(location) => {
                            markers.insert(snapshot.id().to_string(), location);
                        }
                        Err(e) => {
                            tracing::warn!(doc = %snapshot.doc, error = %e, "Skipping undecodable location");
                        }
                    }
                }
                DocumentChange::Removed(doc) => {
                    markers.remove(doc.id());
                }
            }
        }

        Some((feed.household_id.clone(), markers.clone()))
    }

    /// Cached markers for a household (empty if never seen).
    pub fn cached(&self, household_id: &str) -> MemberLocations {
        self.cache
            .get(household_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Detach the feed, keeping the cache.
    pub async fn detach(&self) {
        if let Some(feed) = self.feed.lock().await.take() {
            tracing::debug!(household_id = %feed.household_id, "Location feed detached");
            feed.subscription.cancel();
        }
    }

    /// Detach and forget everything, including the last write.
    pub async fn reset(&self) {
        self.detach().await;
        self.cache.clear();
        self.throttle.lock().await.reset();
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
