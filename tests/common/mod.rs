// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use family_hub::config::Config;
use family_hub::db::{
    ChangeSink, DocRef, DocumentStore, ListenTarget, MemoryStore, Query, Snapshot, StoreError,
    Subscription, Transaction,
};
use family_hub::models::{Role, User};
use family_hub::routes::create_router;
use family_hub::services::{IdentityProvider, MembershipRepository, MemoryIdentity, ThrottleConfig};
use family_hub::session::{Session, SessionState, SignUpRequest};
use family_hub::AppState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type TestSession = Session<MemoryStore, MemoryIdentity>;

/// Check if emulator is available via environment variable.
#[allow(dead_code)]
pub fn emulator_available() -> bool {
    std::env::var("FIRESTORE_EMULATOR_HOST").is_ok()
}

/// Skip test with message if emulator not available.
#[macro_export]
macro_rules! require_emulator {
    () => {
        if !crate::common::emulator_available() {
            eprintln!("⚠️  Skipping: FIRESTORE_EMULATOR_HOST not set");
            return;
        }
    };
}

/// In-memory store whose reads suspend once before answering, so
/// concurrent transactions and refreshes really interleave. Counts reads
/// per document and commits rejected for contention.
#[allow(dead_code)]
#[derive(Default)]
pub struct InterleavingStore {
    inner: MemoryStore,
    reads: Mutex<HashMap<String, usize>>,
    aborted: AtomicUsize,
}

#[allow(dead_code)]
impl InterleavingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reads_of(&self, doc: &DocRef) -> usize {
        self.reads
            .lock()
            .unwrap()
            .get(&doc.path())
            .copied()
            .unwrap_or(0)
    }

    pub fn aborted_commits(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }
}

impl DocumentStore for InterleavingStore {
    fn new_id(&self) -> String {
        self.inner.new_id()
    }

    async fn get(&self, doc: &DocRef) -> Result<Option<Snapshot>, StoreError> {
        *self.reads.lock().unwrap().entry(doc.path()).or_default() += 1;
        tokio::task::yield_now().await;
        self.inner.get(doc).await
    }

    async fn query(&self, query: &Query, limit: Option<u32>) -> Result<Vec<Snapshot>, StoreError> {
        tokio::task::yield_now().await;
        self.inner.query(query, limit).await
    }

    async fn commit(&self, tx: Transaction) -> Result<(), StoreError> {
        let result = self.inner.commit(tx).await;
        if matches!(result, Err(StoreError::Aborted(_))) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    async fn listen(
        &self,
        target: ListenTarget,
        sink: ChangeSink,
    ) -> Result<Subscription, StoreError> {
        self.inner.listen(target, sink).await
    }
}

/// Store, identity provider and a session over both.
#[allow(dead_code)]
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub identity: Arc<MemoryIdentity>,
    pub session: TestSession,
}

#[allow(dead_code)]
impl Harness {
    /// A session that has not been started; auth is still probing.
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// A second device: its own identity provider over a shared store.
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        let identity = Arc::new(MemoryIdentity::new());
        let session = Session::new(store.clone(), identity.clone(), ThrottleConfig::default());
        Self {
            store,
            identity,
            session,
        }
    }

    /// Started session with the auth probe resolved to signed out.
    pub async fn started() -> Self {
        Self::start(Self::new()).await
    }

    pub async fn started_with_store(store: Arc<MemoryStore>) -> Self {
        Self::start(Self::with_store(store)).await
    }

    async fn start(harness: Self) -> Self {
        harness.identity.finish_probe();
        harness.session.start();
        harness
            .wait_for(|s| s.route == family_hub::session::Route::SignedOut)
            .await;
        harness
    }

    pub fn repo(&self) -> MembershipRepository<MemoryStore> {
        MembershipRepository::new(self.store.clone())
    }

    /// Wait until the published state satisfies `predicate`.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&SessionState) -> bool) -> SessionState {
        let mut rx = self.session.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| predicate(s)))
            .await
            .expect("Timed out waiting for session state")
            .expect("Session state channel closed");
        state.clone()
    }

    /// Sign up through the session and return the new uid.
    pub async fn sign_up(&self, email: &str, role: Role) -> String {
        self.session
            .sign_up(sign_up_request(email, role))
            .await
            .expect("sign up should succeed");
        self.identity
            .current_principal()
            .expect("signed in after sign up")
            .uid
    }
}

#[allow(dead_code)]
pub fn sign_up_request(email: &str, role: Role) -> SignUpRequest {
    SignUpRequest {
        email: email.to_string(),
        password: "secret123".to_string(),
        display_name: Some(email.split('@').next().unwrap_or(email).to_string()),
        role,
    }
}

/// Write a fresh profile document for `uid`.
#[allow(dead_code)]
pub async fn seed_user<S: DocumentStore>(
    repo: &MembershipRepository<S>,
    uid: &str,
    role: Role,
) -> User {
    let user = User::new_signup(
        uid,
        Some(format!("{}@example.com", uid)),
        Some(uid.to_string()),
        role,
        vec!["password".to_string()],
        family_hub::time_utils::now_micros(),
    );
    repo.save_user(&user).await.expect("seed user");
    user
}

/// Create a test app over an in-memory store and identity provider.
/// Returns the router and the shared state.
#[allow(dead_code)]
pub fn create_test_app() -> (axum::Router, Arc<AppState<MemoryStore, MemoryIdentity>>) {
    let harness = Harness::new();
    harness.identity.finish_probe();
    harness.session.start();

    let state = Arc::new(AppState {
        config: Config::default(),
        session: harness.session,
    });

    (create_router(state.clone()), state)
}
