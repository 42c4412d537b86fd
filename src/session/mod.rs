// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Session orchestrator.
//!
//! Owns the published [`SessionState`] and the listeners that keep it
//! current: the identity watch channel, the signed-in user's document, the
//! current household's document and its member-location feed. Every store
//! listener pushes onto one channel drained by a single update loop, so
//! feed-driven mutations are serialized.
//!
//! Actions return their result to the caller and also record failures in
//! `error_message`, leaving the rest of the published state untouched.

pub mod route;
pub mod state;

pub use route::{compute_route, resolve_current_household, Route};
pub use state::{order_households, SessionState};

use crate::db::{
    collections, ChangeBatch, DocumentChange, DocumentStore, ListenTarget, Subscription,
    SubscriptionId,
};
use crate::error::{AppError, Result};
use crate::models::{decode_household, decode_user, Coordinate, Household, Role, User};
use crate::services::{
    AuthState, FederatedCredential, IdentityProvider, LocationCoordinator, MemberLocations,
    MembershipRepository, Principal, ThrottleConfig,
};
use crate::time_utils::now_micros;
use futures_util::future::{try_join_all, BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use validator::Validate;

type SharedRefresh = Shared<BoxFuture<'static, Result<()>>>;

/// Sign-up form.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SignUpRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 6))]
    pub password: String,
    #[validate(length(min = 1, max = 80))]
    pub display_name: Option<String>,
    pub role: Role,
}

/// Handle to a running session. Cheap to clone.
pub struct Session<S, A> {
    inner: Arc<Inner<S, A>>,
}

impl<S, A> Clone for Session<S, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S, A> {
    identity: Arc<A>,
    repo: MembershipRepository<S>,
    locations: LocationCoordinator<S>,
    state: watch::Sender<SessionState>,
    events_tx: mpsc::UnboundedSender<ChangeBatch>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChangeBatch>>>,
    /// uid and listener for the signed-in user's document
    user_feed: tokio::sync::Mutex<Option<(String, Subscription)>>,
    /// id and listener for the current household's document
    household_feed: tokio::sync::Mutex<Option<(String, Subscription)>>,
    /// In-flight refresh shared by overlapping callers
    refresh: Mutex<Option<SharedRefresh>>,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_signed_in() -> AppError {
    AppError::InvalidState("Not signed in".to_string())
}

impl<S: DocumentStore, A: IdentityProvider> Session<S, A> {
    pub fn new(store: Arc<S>, identity: Arc<A>, throttle: ThrottleConfig) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                identity,
                repo: MembershipRepository::new(store.clone()),
                locations: LocationCoordinator::new(store, throttle),
                state,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                user_feed: tokio::sync::Mutex::new(None),
                household_feed: tokio::sync::Mutex::new(None),
                refresh: Mutex::new(None),
                shutdown: Notify::new(),
                task: Mutex::new(None),
            }),
        }
    }

    /// Spawn the update loop. Calling it again has no effect.
    pub fn start(&self) {
        let Some(events) = lock(&self.inner.events_rx).take() else {
            return;
        };
        let auth = self.inner.identity.auth_state();
        let handle = tokio::spawn(run_loop(self.inner.clone(), auth, events));
        *lock(&self.inner.task) = Some(handle);
        tracing::info!("Session started");
    }

    /// Stop the update loop and detach every listener.
    pub async fn shutdown(&self) {
        self.inner.shutdown.notify_one();
        let handle = lock(&self.inner.task).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Session loop panicked");
            }
        }
        self.inner.teardown_user().await;
        tracing::info!("Session shut down");
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn repository(&self) -> &MembershipRepository<S> {
        &self.inner.repo
    }

    pub fn locations(&self) -> &LocationCoordinator<S> {
        &self.inner.locations
    }

    pub fn identity(&self) -> &Arc<A> {
        &self.inner.identity
    }

    pub fn clear_error(&self) {
        self.inner.publish(|s| s.error_message = None);
    }

    /// Reload the session. Overlapping calls share one in-flight refresh.
    pub async fn refresh(&self) -> Result<()> {
        self.inner.refresh().await
    }

    // ─── Identity actions ────────────────────────────────────

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<()> {
        let result = async {
            if email.trim().is_empty() || password.is_empty() {
                return Err(AppError::Validation(
                    "Email and password are required".to_string(),
                ));
            }
            self.inner.identity.sign_in(email.trim(), password).await?;
            self.inner.refresh().await
        }
        .await;
        self.inner.record("sign_in", result)
    }

    /// Create the account and its profile document.
    pub async fn sign_up(&self, request: SignUpRequest) -> Result<()> {
        let result = async {
            request.validate()?;
            let email = request.email.trim();
            let principal = self.inner.identity.sign_up(email, &request.password).await?;
            let display_name = request
                .display_name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string);
            let user = User::new_signup(
                &principal.uid,
                Some(email.to_string()),
                display_name,
                request.role,
                principal.provider_ids.clone(),
                now_micros(),
            );
            self.inner.repo.save_user(&user).await?;
            tracing::info!(uid = %user.id, role = ?user.role, "Profile created");
            self.inner.refresh().await
        }
        .await;
        self.inner.record("sign_up", result)
    }

    /// Federated sign-in. A first-time principal gets a member profile.
    pub async fn sign_in_with_credential(&self, credential: &FederatedCredential) -> Result<()> {
        let result = async {
            let principal = self
                .inner
                .identity
                .sign_in_with_credential(credential)
                .await?;
            if self.inner.repo.load_user(&principal.uid).await?.is_none() {
                let user = User::new_signup(
                    &principal.uid,
                    principal.email.clone(),
                    None,
                    Role::Member,
                    principal.provider_ids.clone(),
                    now_micros(),
                );
                self.inner.repo.save_user(&user).await?;
                tracing::info!(uid = %user.id, "Profile created for federated sign-in");
            }
            self.inner.refresh().await
        }
        .await;
        self.inner.record("sign_in_with_credential", result)
    }

    pub async fn sign_out(&self) -> Result<()> {
        let result = async {
            self.inner.identity.sign_out().await?;
            self.inner.refresh().await
        }
        .await;
        self.inner.record("sign_out", result)
    }

    pub async fn send_password_reset(&self, email: &str) -> Result<()> {
        let result = async {
            if email.trim().is_empty() {
                return Err(AppError::Validation("Email is required".to_string()));
            }
            self.inner.identity.send_password_reset(email.trim()).await
        }
        .await;
        self.inner.record("send_password_reset", result)
    }

    // ─── Household actions ───────────────────────────────────

    pub async fn create_household(&self, name: &str) -> Result<Household> {
        let result = async {
            let principal = self.inner.principal()?;
            let household = self
                .inner
                .repo
                .create_household(name, &principal.uid)
                .await?;
            self.inner.refresh().await?;
            Ok::<_, AppError>(household)
        }
        .await;
        self.inner.record("create_household", result)
    }

    /// Join by code and make the joined household current.
    pub async fn join_household(&self, code: &str) -> Result<Household> {
        let result = async {
            if code.trim().is_empty() {
                return Err(AppError::Validation("Join code is required".to_string()));
            }
            let principal = self.inner.principal()?;
            let household = self.inner.repo.join_by_code(code, &principal.uid).await?;
            self.inner
                .repo
                .set_current_household(&principal.uid, &household.id)
                .await?;
            self.inner.refresh().await?;
            Ok::<_, AppError>(household)
        }
        .await;
        self.inner.record("join_household", result)
    }

    pub async fn switch_household(&self, household_id: &str) -> Result<()> {
        let result = self.inner.switch_household(household_id).await;
        self.inner.record("switch_household", result)
    }

    /// Leave a household other than the current one.
    pub async fn leave_household(&self, household_id: &str) -> Result<()> {
        let result = async {
            let principal = self.inner.principal()?;
            if self.inner.state.borrow().current_household_id() == Some(household_id) {
                return Err(AppError::InvalidState(
                    "Switch to another household before leaving this one".to_string(),
                ));
            }
            self.inner
                .repo
                .leave_household(household_id, &principal.uid)
                .await?;
            self.inner.refresh().await
        }
        .await;
        self.inner.record("leave_household", result)
    }

    // ─── Location actions ────────────────────────────────────

    /// Record a device fix and write it if the throttle allows.
    pub async fn update_location(&self, coord: Coordinate) -> Result<bool> {
        let result = async {
            if !(-90.0..=90.0).contains(&coord.lat) || !(-180.0..=180.0).contains(&coord.lon) {
                return Err(AppError::Validation("Coordinate out of range".to_string()));
            }
            self.inner.locations.update_coordinate(coord);
            self.inner.upsert_my_location().await
        }
        .await;
        self.inner.record("update_location", result)
    }

    /// Write the last recorded fix into every household. Returns whether a
    /// write happened.
    pub async fn upsert_my_location(&self) -> Result<bool> {
        let result = self.inner.upsert_my_location().await;
        self.inner.record("upsert_my_location", result)
    }

    pub async fn stop_sharing(&self) -> Result<()> {
        let result = async {
            let principal = self.inner.principal()?;
            let household_id = self
                .inner
                .state
                .borrow()
                .current_household_id()
                .map(str::to_string)
                .ok_or_else(|| AppError::InvalidState("No current household".to_string()))?;
            self.inner
                .locations
                .stop_sharing(&principal.uid, &household_id)
                .await
        }
        .await;
        self.inner.record("stop_sharing", result)
    }

    pub async fn reset_location_throttle(&self) {
        self.inner.locations.reset_throttle().await;
    }
}

async fn run_loop<S: DocumentStore, A: IdentityProvider>(
    inner: Arc<Inner<S, A>>,
    mut auth: watch::Receiver<AuthState>,
    mut events: mpsc::UnboundedReceiver<ChangeBatch>,
) {
    let _ = inner.refresh().await;
    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => break,
            changed = auth.changed() => {
                if changed.is_err() {
                    tracing::warn!("Identity provider closed its auth channel");
                    break;
                }
                let _ = inner.refresh().await;
            }
            Some(batch) = events.recv() => inner.handle_batch(batch).await,
        }
    }
    tracing::debug!("Session loop exited");
}

impl<S: DocumentStore, A: IdentityProvider> Inner<S, A> {
    fn publish(&self, update: impl FnOnce(&mut SessionState)) {
        self.state.send_modify(|state| {
            let before = state.route;
            update(state);
            if state.route != before {
                tracing::info!(from = ?before, to = ?state.route, "Route changed");
            }
        });
    }

    fn record<T>(&self, action: &'static str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::warn!(action, kind = e.kind(), error = %e, "Session action failed");
            self.publish(|s| s.error_message = Some(e.to_string()));
        }
        result
    }

    fn current_auth(&self) -> AuthState {
        let rx = self.identity.auth_state();
        let auth = rx.borrow().clone();
        auth
    }

    fn principal(&self) -> Result<Principal> {
        self.current_auth()
            .principal()
            .cloned()
            .ok_or_else(not_signed_in)
    }

    // ─── Refresh ─────────────────────────────────────────────

    fn refresh(self: &Arc<Self>) -> SharedRefresh {
        let mut slot = lock(&self.refresh);
        if let Some(in_flight) = slot.as_ref() {
            tracing::debug!("Joining in-flight refresh");
            return in_flight.clone();
        }

        let inner = self.clone();
        let refresh = async move {
            let result = inner.run_refresh().await;
            *lock(&inner.refresh) = None;
            result
        }
        .boxed()
        .shared();
        *slot = Some(refresh.clone());
        refresh
    }

    async fn run_refresh(&self) -> Result<()> {
        let auth = self.current_auth();
        let Some(principal) = auth.principal().cloned() else {
            self.teardown_user().await;
            self.publish(|s| {
                s.clear_user();
                s.route = compute_route(&auth, None);
            });
            return Ok(());
        };

        let result = self.load_session(&auth, &principal).await;
        if let Err(e) = &result {
            tracing::warn!(uid = %principal.uid, error = %e, "Refresh failed");
            self.publish(|s| s.error_message = Some(e.to_string()));
        }
        result
    }

    async fn load_session(&self, auth: &AuthState, principal: &Principal) -> Result<()> {
        let uid = principal.uid.as_str();
        self.watch_user(uid).await?;

        let Some(decoded) = self.repo.load_user(uid).await? else {
            self.detach_household().await;
            self.publish(|s| {
                s.clear_user();
                s.route = Route::SignedInNoProfile;
            });
            return Ok(());
        };

        let mut user = decoded.user;
        if !decoded.backfill.is_empty() {
            let patch = decoded
                .backfill
                .apply(&mut user, &principal.provider_ids, now_micros());
            match self.repo.patch(collections::user(uid), patch).await {
                Ok(()) => tracing::info!(uid, backfill = ?decoded.backfill, "User profile backfilled"),
                Err(e) => tracing::warn!(uid, error = %e, "User backfill failed"),
            }
        }

        let route = compute_route(auth, Some(&user));
        let current = match route {
            Route::Active => resolve_current_household(&user),
            _ => None,
        };
        let Some((current_id, persist)) = current else {
            self.detach_household().await;
            self.publish(|s| {
                s.user = Some(user);
                s.clear_households();
                s.route = route;
            });
            return Ok(());
        };

        if persist {
            match self.repo.set_current_household(uid, &current_id).await {
                Ok(()) => tracing::info!(uid, household_id = %current_id, "Current household resolved"),
                Err(e) => tracing::warn!(uid, error = %e, "Could not persist current household"),
            }
            user.current_family_id = Some(current_id.clone());
        }

        match self.repo.reconcile_user(uid, false).await {
            Ok(report) if !report.is_consistent() => {
                tracing::warn!(uid, report = ?report, "Membership mirror needs repair")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(uid, error = %e, "Reconciliation check failed"),
        }

        let mut households = self.load_households(&user, &current_id).await?;
        let household = households.iter().find(|h| h.id == current_id).cloned();
        if household.is_none() {
            tracing::warn!(uid, household_id = %current_id, "Current household not found");
        }
        order_households(&mut households, Some(&current_id));

        let seeded = self.track_household(&current_id).await?;
        self.publish(|s| {
            s.user = Some(user);
            s.household = household;
            s.households = households;
            if let Some(markers) = seeded {
                s.member_locations = markers;
            }
            s.route = Route::Active;
        });
        Ok(())
    }

    /// Load every household in the user's memberships. Missing households
    /// are skipped; the current one is backfilled if needed.
    async fn load_households(&self, user: &User, current_id: &str) -> Result<Vec<Household>> {
        let loaded = try_join_all(
            user.memberships
                .keys()
                .map(|id| self.repo.load_household(id)),
        )
        .await?;

        let mut households = Vec::with_capacity(loaded.len());
        for (id, decoded) in user.memberships.keys().zip(loaded) {
            let Some(decoded) = decoded else {
                tracing::debug!(household_id = %id, "Household not visible yet");
                continue;
            };
            let mut household = decoded.household;
            if household.id == current_id && !decoded.backfill.is_empty() {
                let code = crate::services::generate_join_code();
                let patch = decoded
                    .backfill
                    .apply(&mut household, &code, &user.id, now_micros());
                match self.repo.patch(collections::family(id), patch).await {
                    Ok(()) => tracing::info!(household_id = %id, backfill = ?decoded.backfill, "Household backfilled"),
                    Err(e) => tracing::warn!(household_id = %id, error = %e, "Household backfill failed"),
                }
            }
            households.push(household);
        }
        Ok(households)
    }

    // ─── Listeners ───────────────────────────────────────────

    /// Attach the listener for `uid`'s document. A different uid than the
    /// one watched drops all state from the previous user.
    async fn watch_user(&self, uid: &str) -> Result<()> {
        let mut feed = self.user_feed.lock().await;
        if feed.as_ref().is_some_and(|(watched, _)| watched == uid) {
            return Ok(());
        }
        if let Some((previous, subscription)) = feed.take() {
            tracing::debug!(uid = %previous, "Detaching user listener");
            subscription.cancel();
            self.detach_household().await;
            self.locations.reset().await;
        }

        let subscription = self
            .repo
            .store()
            .listen(
                ListenTarget::Document(collections::user(uid)),
                self.events_tx.clone(),
            )
            .await?;
        *feed = Some((uid.to_string(), subscription));
        Ok(())
    }

    /// Point the household document listener and the location feed at
    /// `household_id`. Returns cached markers to publish, if the feed moved.
    async fn track_household(&self, household_id: &str) -> Result<Option<MemberLocations>> {
        {
            let mut feed = self.household_feed.lock().await;
            if !feed.as_ref().is_some_and(|(id, _)| id == household_id) {
                if let Some((_, subscription)) = feed.take() {
                    subscription.cancel();
                }
                let subscription = self
                    .repo
                    .store()
                    .listen(
                        ListenTarget::Document(collections::family(household_id)),
                        self.events_tx.clone(),
                    )
                    .await?;
                *feed = Some((household_id.to_string(), subscription));
            }
        }
        self.locations
            .subscribe(household_id, self.events_tx.clone())
            .await
    }

    async fn detach_household(&self) {
        if let Some((_, subscription)) = self.household_feed.lock().await.take() {
            subscription.cancel();
        }
        self.locations.detach().await;
    }

    async fn teardown_user(&self) {
        if let Some((uid, subscription)) = self.user_feed.lock().await.take() {
            tracing::debug!(uid = %uid, "Detaching user listener");
            subscription.cancel();
        }
        self.detach_household().await;
        self.locations.reset().await;
    }

    async fn feed_id(feed: &tokio::sync::Mutex<Option<(String, Subscription)>>) -> Option<SubscriptionId> {
        feed.lock().await.as_ref().map(|(_, s)| s.id())
    }

    // ─── Feed events ─────────────────────────────────────────

    async fn handle_batch(self: &Arc<Self>, batch: ChangeBatch) {
        if Self::feed_id(&self.user_feed).await == Some(batch.subscription) {
            self.on_user_change(&batch).await;
        } else if Self::feed_id(&self.household_feed).await == Some(batch.subscription) {
            self.on_household_change(&batch).await;
        } else if let Some((household_id, markers)) = self.locations.apply(&batch).await {
            self.publish(|s| {
                if s.current_household_id() == Some(household_id.as_str()) {
                    s.member_locations = markers;
                }
            });
        }
    }

    /// Refresh when the user's memberships, current household, status or
    /// role change. Other edits are ignored.
    async fn on_user_change(self: &Arc<Self>, batch: &ChangeBatch) {
        let Some(change) = batch.changes.last() else {
            return;
        };
        let needs_refresh = match change {
            DocumentChange::Removed(_) => true,
            DocumentChange::Added(snapshot) | DocumentChange::Modified(snapshot) => {
                match decode_user(snapshot) {
                    Ok(decoded) => {
                        let state = self.state.borrow();
                        match &state.user {
                            Some(current) => {
                                current.memberships != decoded.user.memberships
                                    || current.current_family_id != decoded.user.current_family_id
                                    || current.status != decoded.user.status
                                    || current.role != decoded.user.role
                            }
                            None => true,
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not decode user update");
                        false
                    }
                }
            }
        };
        if needs_refresh {
            tracing::debug!("User document changed; refreshing");
            let _ = self.refresh().await;
        }
    }

    /// Republish household edits; refresh if the user is no longer a member.
    async fn on_household_change(self: &Arc<Self>, batch: &ChangeBatch) {
        let Some(change) = batch.changes.last() else {
            return;
        };
        let household = match change {
            DocumentChange::Removed(_) => None,
            DocumentChange::Added(snapshot) | DocumentChange::Modified(snapshot) => {
                match decode_household(snapshot) {
                    Ok(decoded) => Some(decoded.household),
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not decode household update");
                        return;
                    }
                }
            }
        };

        let uid = self.state.borrow().user.as_ref().map(|u| u.id.clone());
        match (household, uid) {
            (Some(household), Some(uid)) if household.is_member(&uid) => {
                self.publish(|s| {
                    if let Some(entry) = s.households.iter_mut().find(|h| h.id == household.id) {
                        *entry = household.clone();
                    }
                    if s.current_household_id() == Some(household.id.as_str()) {
                        s.household = Some(household);
                    }
                });
            }
            _ => {
                tracing::debug!("Current household removed or membership lost; refreshing");
                let _ = self.refresh().await;
            }
        }
    }

    // ─── Actions ─────────────────────────────────────────────

    async fn switch_household(&self, target: &str) -> Result<()> {
        let before = self.state.borrow().clone();
        let user = before.user.clone().ok_or_else(not_signed_in)?;
        if before.current_household_id() == Some(target) {
            return Ok(());
        }
        if !user.memberships.contains_key(target) {
            return Err(AppError::InvalidState(
                "You are not a member of that household".to_string(),
            ));
        }

        // Optimistic: show the target household and its cached markers now.
        let optimistic = before.households.iter().find(|h| h.id == target).cloned();
        let seeded = self.track_household(target).await?;
        self.publish(|s| {
            if let Some(u) = s.user.as_mut() {
                u.current_family_id = Some(target.to_string());
            }
            s.household = optimistic;
            order_households(&mut s.households, Some(target));
            if let Some(markers) = seeded {
                s.member_locations = markers;
            }
        });

        if let Err(e) = self.repo.set_current_household(&user.id, target).await {
            if let Some(previous) = before.current_household_id() {
                if let Err(e) = self.track_household(previous).await {
                    tracing::warn!(error = %e, "Could not restore previous household feed");
                }
            }
            self.publish(|s| {
                s.user = before.user;
                s.household = before.household;
                s.households = before.households;
                s.member_locations = before.member_locations;
            });
            return Err(e);
        }
        tracing::info!(uid = %user.id, household_id = target, "Switched household");

        if let Some(decoded) = self.repo.load_household(target).await? {
            let household = decoded.household;
            self.publish(|s| {
                if let Some(entry) = s.households.iter_mut().find(|h| h.id == household.id) {
                    *entry = household.clone();
                }
                if s.current_household_id() == Some(household.id.as_str()) {
                    s.household = Some(household);
                }
            });
        }

        if let Err(e) = self.upsert_my_location().await {
            tracing::warn!(error = %e, "Location write after switch failed");
        }
        Ok(())
    }

    async fn upsert_my_location(&self) -> Result<bool> {
        let user = self.state.borrow().user.clone();
        match user {
            Some(user) => self.locations.upsert_my_location(&user).await,
            None => Ok(false),
        }
    }
}
