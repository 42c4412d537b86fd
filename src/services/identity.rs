// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Identity provider adapter.
//!
//! Handles:
//! - Email/password sign-in and sign-up
//! - Federated (Apple / Google) credential exchange
//! - Password reset emails
//! - Restoring a persisted session at start-up, and keeping the refresh
//!   token in an optional file so the next run can restore it
//!
//! Auth changes are published on a `watch` channel. The channel starts in
//! [`AuthState::Probing`] so the session can hold its splash route until
//! the first real answer arrives. No operation retries on its own.

use crate::error::AppError;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// The authenticated identity, distinct from the user profile document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub uid: String,
    pub email: Option<String>,
    /// Linked sign-in methods, e.g. `password`, `apple.com`
    pub provider_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No auth event observed yet.
    Probing,
    SignedOut,
    SignedIn(Principal),
}

impl AuthState {
    pub fn principal(&self) -> Option<&Principal> {
        match self {
            AuthState::SignedIn(principal) => Some(principal),
            _ => None,
        }
    }
}

/// Third-party credential exchanged for a principal.
#[derive(Debug, Clone)]
pub enum FederatedCredential {
    Apple { id_token: String, raw_nonce: String },
    Google {
        id_token: String,
        access_token: Option<String>,
    },
}

impl FederatedCredential {
    pub fn provider_id(&self) -> &'static str {
        match self {
            FederatedCredential::Apple { .. } => "apple.com",
            FederatedCredential::Google { .. } => "google.com",
        }
    }

    /// Form-encoded `postBody` for `accounts:signInWithIdp`.
    fn post_body(&self) -> String {
        match self {
            FederatedCredential::Apple {
                id_token,
                raw_nonce,
            } => format!(
                "id_token={}&nonce={}&providerId={}",
                urlencoding::encode(id_token),
                urlencoding::encode(raw_nonce),
                self.provider_id()
            ),
            FederatedCredential::Google {
                id_token,
                access_token,
            } => {
                let mut body = format!(
                    "id_token={}&providerId={}",
                    urlencoding::encode(id_token),
                    self.provider_id()
                );
                if let Some(token) = access_token {
                    body.push_str(&format!("&access_token={}", urlencoding::encode(token)));
                }
                body
            }
        }
    }
}

/// Authentication seam used by the session.
pub trait IdentityProvider: Send + Sync + 'static {
    /// Receiver of auth changes, starting from the current state.
    fn auth_state(&self) -> watch::Receiver<AuthState>;

    fn current_principal(&self) -> Option<Principal> {
        let rx = self.auth_state();
        let principal = rx.borrow().principal().cloned();
        principal
    }

    fn sign_in(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<Principal, AppError>> + Send;

    fn sign_up(
        &self,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<Principal, AppError>> + Send;

    fn sign_in_with_credential(
        &self,
        credential: &FederatedCredential,
    ) -> impl Future<Output = Result<Principal, AppError>> + Send;

    fn sign_out(&self) -> impl Future<Output = Result<(), AppError>> + Send;

    fn send_password_reset(&self, email: &str)
        -> impl Future<Output = Result<(), AppError>> + Send;
}

// ─── Firebase Authentication (Identity Toolkit REST) ─────────

const IDENTITY_TOOLKIT_URL: &str = "https://identitytoolkit.googleapis.com/v1";
const SECURE_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1";

/// Firebase Authentication client.
pub struct FirebaseAuth {
    http: reqwest::Client,
    api_key: String,
    identity_url: String,
    token_url: String,
    state: watch::Sender<AuthState>,
    refresh_token: Mutex<Option<String>>,
    token_file: Option<PathBuf>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInResponse {
    local_id: String,
    email: Option<String>,
    id_token: String,
    refresh_token: String,
}

#[derive(Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
}

#[derive(Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
    email: Option<String>,
    #[serde(default)]
    provider_user_info: Vec<ProviderInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProviderInfo {
    provider_id: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

impl FirebaseAuth {
    /// Create a client. `emulator_base` (e.g. `http://localhost:9099`)
    /// points both endpoints at the Auth emulator.
    pub fn new(api_key: String, emulator_base: Option<&str>) -> Self {
        let (identity_url, token_url) = match emulator_base {
            Some(base) => {
                let base = base.trim_end_matches('/');
                (
                    format!("{}/identitytoolkit.googleapis.com/v1", base),
                    format!("{}/securetoken.googleapis.com/v1", base),
                )
            }
            None => (IDENTITY_TOOLKIT_URL.to_string(), SECURE_TOKEN_URL.to_string()),
        };
        let (state, _) = watch::channel(AuthState::Probing);
        Self {
            http: reqwest::Client::new(),
            api_key,
            identity_url,
            token_url,
            state,
            refresh_token: Mutex::new(None),
            token_file: None,
        }
    }

    /// Keep the refresh token in `path`: written on sign-in, removed on
    /// sign-out and read by [`restore`](Self::restore).
    pub fn with_token_file(mut self, path: PathBuf) -> Self {
        self.token_file = Some(path);
        self
    }

    /// Resolve the start-up probe from a refresh token (explicit, else the
    /// token file), publishing `SignedIn` on success and `SignedOut`
    /// otherwise.
    pub async fn restore(&self, refresh_token: Option<&str>) {
        let refresh_token = match refresh_token {
            Some(token) => Some(token.to_string()),
            None => self.read_token_file().await,
        };
        let Some(refresh_token) = refresh_token else {
            self.state.send_replace(AuthState::SignedOut);
            return;
        };

        match self.exchange_refresh_token(&refresh_token).await {
            Ok(principal) => {
                tracing::info!(uid = %principal.uid, "Restored identity session");
                self.state.send_replace(AuthState::SignedIn(principal));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not restore identity session");
                self.state.send_replace(AuthState::SignedOut);
            }
        }
    }

    async fn read_token_file(&self) -> Option<String> {
        let path = self.token_file.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(token) => Some(token.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Could not read token file");
                None
            }
        }
    }

    /// Hold the current refresh token and mirror it to the token file.
    async fn remember(&self, refresh_token: Option<String>) {
        *self.lock_refresh_token() = refresh_token.clone();
        let Some(path) = &self.token_file else {
            return;
        };
        let result = match refresh_token {
            Some(token) => tokio::fs::write(path, token).await,
            None => match tokio::fs::remove_file(path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            tracing::warn!(path = %path.display(), error = %e, "Could not update token file");
        }
    }

    async fn exchange_refresh_token(&self, refresh_token: &str) -> Result<Principal, AppError> {
        let url = format!("{}/token?key={}", self.token_url, self.api_key);
        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| AppError::Provider(format!("Token refresh request failed: {}", e)))?;

        let tokens: RefreshResponse = check_response_json(response).await?;
        let principal = self.lookup(&tokens.id_token).await?;
        self.remember(Some(tokens.refresh_token)).await;
        Ok(principal)
    }

    async fn post<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, AppError> {
        let url = format!("{}/accounts:{}?key={}", self.identity_url, method, self.api_key);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::Provider(e.to_string()))?;

        check_response_json(response).await
    }

    async fn lookup(&self, id_token: &str) -> Result<Principal, AppError> {
        let response: LookupResponse = self.post("lookup", json!({ "idToken": id_token })).await?;
        let user = response
            .users
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Provider("Account no longer exists.".to_string()))?;

        Ok(Principal {
            uid: user.local_id,
            email: user.email,
            provider_ids: user
                .provider_user_info
                .into_iter()
                .map(|p| p.provider_id)
                .collect(),
        })
    }

    /// Store tokens, look up linked providers and publish the new state.
    async fn complete_sign_in(
        &self,
        response: SignInResponse,
        fallback_provider: &str,
    ) -> Principal {
        let principal = match self.lookup(&response.id_token).await {
            Ok(principal) => principal,
            Err(e) => {
                tracing::warn!(uid = %response.local_id, error = %e, "Provider lookup failed");
                Principal {
                    uid: response.local_id.clone(),
                    email: response.email.clone(),
                    provider_ids: vec![fallback_provider.to_string()],
                }
            }
        };

        self.remember(Some(response.refresh_token)).await;
        tracing::info!(uid = %principal.uid, "Signed in");
        self.state.send_replace(AuthState::SignedIn(principal.clone()));
        principal
    }

    fn lock_refresh_token(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.refresh_token.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Check response status and parse JSON, mapping Identity Toolkit error
/// codes to readable messages.
async fn check_response_json<T: for<'de> Deserialize<'de>>(
    response: reqwest::Response,
) -> Result<T, AppError> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => provider_message(&envelope.error.message),
            Err(_) => format!("HTTP {}: {}", status, body),
        };
        return Err(AppError::Provider(message));
    }

    response
        .json()
        .await
        .map_err(|e| AppError::Provider(format!("Invalid provider response: {}", e)))
}

/// Map an Identity Toolkit error code (`WEAK_PASSWORD : ...`) to the text
/// shown to the user.
pub fn provider_message(code: &str) -> String {
    let key = code.split(" : ").next().unwrap_or(code).trim();
    match key {
        "EMAIL_NOT_FOUND" | "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS" => {
            "Incorrect email or password.".to_string()
        }
        "EMAIL_EXISTS" => "An account already exists for this email.".to_string(),
        "INVALID_EMAIL" | "MISSING_EMAIL" => "Enter a valid email address.".to_string(),
        "WEAK_PASSWORD" => "Password should be at least 6 characters.".to_string(),
        "USER_DISABLED" => "This account has been disabled.".to_string(),
        "TOO_MANY_ATTEMPTS_TRY_LATER" => "Too many attempts. Try again later.".to_string(),
        "TOKEN_EXPIRED" | "INVALID_REFRESH_TOKEN" | "USER_NOT_FOUND" => {
            "Your session has expired. Sign in again.".to_string()
        }
        _ => code.to_string(),
    }
}

impl IdentityProvider for FirebaseAuth {
    fn auth_state(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Principal, AppError> {
        let response: SignInResponse = self
            .post(
                "signInWithPassword",
                json!({"email": email, "password": password, "returnSecureToken": true}),
            )
            .await?;
        Ok(self.complete_sign_in(response, "password").await)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Principal, AppError> {
        let response: SignInResponse = self
            .post(
                "signUp",
                json!({"email": email, "password": password, "returnSecureToken": true}),
            )
            .await?;
        Ok(self.complete_sign_in(response, "password").await)
    }

    async fn sign_in_with_credential(
        &self,
        credential: &FederatedCredential,
    ) -> Result<Principal, AppError> {
        let response: SignInResponse = self
            .post(
                "signInWithIdp",
                json!({
                    "postBody": credential.post_body(),
                    "requestUri": "http://localhost",
                    "returnIdpCredential": true,
                    "returnSecureToken": true,
                }),
            )
            .await?;
        Ok(self
            .complete_sign_in(response, credential.provider_id())
            .await)
    }

    async fn sign_out(&self) -> Result<(), AppError> {
        self.remember(None).await;
        self.state.send_replace(AuthState::SignedOut);
        tracing::info!("Signed out");
        Ok(())
    }

    async fn send_password_reset(&self, email: &str) -> Result<(), AppError> {
        let _: serde_json::Value = self
            .post(
                "sendOobCode",
                json!({"requestType": "PASSWORD_RESET", "email": email}),
            )
            .await?;
        tracing::info!("Password reset email requested");
        Ok(())
    }
}

// ─── In-process provider ─────────────────────────────────────

#[derive(Debug, Clone)]
struct Account {
    uid: String,
    email: Option<String>,
    password: Option<String>,
    provider_ids: Vec<String>,
    disabled: bool,
}

impl Account {
    fn principal(&self) -> Principal {
        Principal {
            uid: self.uid.clone(),
            email: self.email.clone(),
            provider_ids: self.provider_ids.clone(),
        }
    }
}

/// Accounts table kept in memory, for tests and offline runs.
pub struct MemoryIdentity {
    state: watch::Sender<AuthState>,
    /// keyed by lower-cased email, or `provider:token` for federated accounts
    accounts: Mutex<HashMap<String, Account>>,
    password_resets: Mutex<Vec<String>>,
}

impl Default for MemoryIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentity {
    pub fn new() -> Self {
        let (state, _) = watch::channel(AuthState::Probing);
        Self {
            state,
            accounts: Mutex::new(HashMap::new()),
            password_resets: Mutex::new(Vec::new()),
        }
    }

    /// Resolve the start-up probe as signed out (if nothing signed in yet).
    pub fn finish_probe(&self) {
        self.state.send_if_modified(|state| {
            if *state == AuthState::Probing {
                *state = AuthState::SignedOut;
                true
            } else {
                false
            }
        });
    }

    /// Register an email/password account without signing in.
    pub fn add_account(&self, email: &str, password: &str) -> Principal {
        let account = Account {
            uid: new_uid(),
            email: Some(email.to_string()),
            password: Some(password.to_string()),
            provider_ids: vec!["password".to_string()],
            disabled: false,
        };
        let principal = account.principal();
        self.lock_accounts().insert(email.to_lowercase(), account);
        principal
    }

    pub fn disable(&self, email: &str) {
        if let Some(account) = self.lock_accounts().get_mut(&email.to_lowercase()) {
            account.disabled = true;
        }
    }

    /// Addresses that were sent a password reset.
    pub fn password_resets(&self) -> Vec<String> {
        self.password_resets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_accounts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Account>> {
        self.accounts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, principal: &Principal) {
        self.state
            .send_replace(AuthState::SignedIn(principal.clone()));
    }
}

fn new_uid() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..28)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

impl IdentityProvider for MemoryIdentity {
    fn auth_state(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<Principal, AppError> {
        let principal = {
            let accounts = self.lock_accounts();
            let account = accounts
                .get(&email.to_lowercase())
                .filter(|a| a.password.as_deref() == Some(password))
                .ok_or_else(|| AppError::Provider(provider_message("INVALID_LOGIN_CREDENTIALS")))?;
            if account.disabled {
                return Err(AppError::Provider(provider_message("USER_DISABLED")));
            }
            account.principal()
        };
        self.publish(&principal);
        Ok(principal)
    }

    async fn sign_up(&self, email: &str, password: &str) -> Result<Principal, AppError> {
        if password.len() < 6 {
            return Err(AppError::Provider(provider_message("WEAK_PASSWORD")));
        }
        if self.lock_accounts().contains_key(&email.to_lowercase()) {
            return Err(AppError::Provider(provider_message("EMAIL_EXISTS")));
        }
        let principal = self.add_account(email, password);
        self.publish(&principal);
        Ok(principal)
    }

    async fn sign_in_with_credential(
        &self,
        credential: &FederatedCredential,
    ) -> Result<Principal, AppError> {
        let (FederatedCredential::Apple { id_token, .. }
        | FederatedCredential::Google { id_token, .. }) = credential;
        let key = format!("{}:{}", credential.provider_id(), id_token);

        let principal = self
            .lock_accounts()
            .entry(key)
            .or_insert_with(|| Account {
                uid: new_uid(),
                email: None,
                password: None,
                provider_ids: vec![credential.provider_id().to_string()],
                disabled: false,
            })
            .principal();
        self.publish(&principal);
        Ok(principal)
    }

    async fn sign_out(&self) -> Result<(), AppError> {
        self.state.send_replace(AuthState::SignedOut);
        Ok(())
    }

    async fn send_password_reset(&self, email: &str) -> Result<(), AppError> {
        if !self.lock_accounts().contains_key(&email.to_lowercase()) {
            return Err(AppError::Provider(provider_message("EMAIL_NOT_FOUND")));
        }
        self.password_resets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(email.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_message_strips_detail() {
        assert_eq!(
            provider_message("WEAK_PASSWORD : Password should be at least 6 characters"),
            "Password should be at least 6 characters."
        );
        assert_eq!(provider_message("SOMETHING_NEW"), "SOMETHING_NEW");
    }

    #[test]
    fn test_apple_post_body_is_form_encoded() {
        let credential = FederatedCredential::Apple {
            id_token: "a.b+c".into(),
            raw_nonce: "n n".into(),
        };
        assert_eq!(
            credential.post_body(),
            "id_token=a.b%2Bc&nonce=n%20n&providerId=apple.com"
        );
    }

    #[tokio::test]
    async fn test_memory_identity_probe_then_sign_in() {
        let identity = MemoryIdentity::new();
        let rx = identity.auth_state();
        assert_eq!(*rx.borrow(), AuthState::Probing);

        identity.finish_probe();
        assert_eq!(*rx.borrow(), AuthState::SignedOut);

        let created = identity.sign_up("t@example.com", "secret1").await.unwrap();
        assert_eq!(identity.current_principal(), Some(created.clone()));

        identity.sign_out().await.unwrap();
        let err = identity.sign_in("T@example.com", "wrong").await.unwrap_err();
        assert!(matches!(err, AppError::Provider(_)));

        let again = identity.sign_in("T@example.com", "secret1").await.unwrap();
        assert_eq!(again.uid, created.uid);
        assert_eq!(again.provider_ids, vec!["password".to_string()]);
    }

    fn token_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("family-hub-{}-{}", name, std::process::id()))
    }

    #[tokio::test]
    async fn test_token_file_follows_sign_in_and_out() {
        let path = token_path("token-file");
        let auth = FirebaseAuth::new("key".into(), None).with_token_file(path.clone());

        auth.remember(Some("refresh-1".into())).await;
        assert_eq!(auth.read_token_file().await.as_deref(), Some("refresh-1"));
        assert_eq!(auth.lock_refresh_token().as_deref(), Some("refresh-1"));

        auth.sign_out().await.unwrap();
        assert!(!path.exists());
        assert_eq!(auth.read_token_file().await, None);
        assert_eq!(*auth.auth_state().borrow(), AuthState::SignedOut);
    }

    #[tokio::test]
    async fn test_restore_without_token_is_signed_out() {
        let auth =
            FirebaseAuth::new("key".into(), None).with_token_file(token_path("missing-token"));
        assert_eq!(*auth.auth_state().borrow(), AuthState::Probing);
        auth.restore(None).await;
        assert_eq!(*auth.auth_state().borrow(), AuthState::SignedOut);
    }

    #[tokio::test]
    async fn test_finish_probe_keeps_signed_in() {
        let identity = MemoryIdentity::new();
        identity.add_account("a@example.com", "secret1");
        identity.sign_in("a@example.com", "secret1").await.unwrap();
        identity.finish_probe();
        assert!(identity.current_principal().is_some());
    }
}
