// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Identity and session routes.

use super::snapshot;
use crate::db::DocumentStore;
use crate::error::{AppError, Result};
use crate::services::{FederatedCredential, IdentityProvider};
use crate::session::{SessionState, SignUpRequest};
use crate::AppState;
use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

pub fn routes<S: DocumentStore, A: IdentityProvider>() -> Router<Arc<AppState<S, A>>> {
    Router::new()
        .route("/session/sign-in", post(sign_in::<S, A>))
        .route("/session/sign-in/federated", post(sign_in_federated::<S, A>))
        .route("/session/sign-up", post(sign_up::<S, A>))
        .route("/session/sign-out", post(sign_out::<S, A>))
        .route("/session/password-reset", post(password_reset::<S, A>))
        .route("/session/refresh", post(refresh::<S, A>))
        .route("/session/clear-error", post(clear_error::<S, A>))
}

#[derive(Debug, Deserialize, Validate)]
pub struct SignInRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

async fn sign_in<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
    Json(request): Json<SignInRequest>,
) -> Result<Json<SessionState>> {
    request.validate()?;
    state
        .session
        .sign_in(&request.email, &request.password)
        .await?;
    Ok(snapshot(&state))
}

/// Federated provider token, as handed over by the native sign-in sheet.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FederatedSignInRequest {
    /// `apple` or `google`
    pub provider: String,
    #[validate(length(min = 1))]
    pub id_token: String,
    pub raw_nonce: Option<String>,
    pub access_token: Option<String>,
}

impl TryFrom<FederatedSignInRequest> for FederatedCredential {
    type Error = AppError;

    fn try_from(request: FederatedSignInRequest) -> Result<Self> {
        match request.provider.as_str() {
            "apple" => {
                let raw_nonce = request
                    .raw_nonce
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| AppError::Validation("Apple sign-in requires a nonce".into()))?;
                Ok(FederatedCredential::Apple {
                    id_token: request.id_token,
                    raw_nonce,
                })
            }
            "google" => Ok(FederatedCredential::Google {
                id_token: request.id_token,
                access_token: request.access_token,
            }),
            other => Err(AppError::Validation(format!(
                "Unsupported provider: {}",
                other
            ))),
        }
    }
}

async fn sign_in_federated<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
    Json(request): Json<FederatedSignInRequest>,
) -> Result<Json<SessionState>> {
    request.validate()?;
    let credential = FederatedCredential::try_from(request)?;
    state.session.sign_in_with_credential(&credential).await?;
    Ok(snapshot(&state))
}

async fn sign_up<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
    Json(request): Json<SignUpRequest>,
) -> Result<Json<SessionState>> {
    request.validate()?;
    state.session.sign_up(request).await?;
    Ok(snapshot(&state))
}

async fn sign_out<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
) -> Result<Json<SessionState>> {
    state.session.sign_out().await?;
    Ok(snapshot(&state))
}

#[derive(Debug, Deserialize, Validate)]
pub struct PasswordResetRequest {
    #[validate(email)]
    pub email: String,
}

async fn password_reset<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
    Json(request): Json<PasswordResetRequest>,
) -> Result<Json<SessionState>> {
    request.validate()?;
    state.session.send_password_reset(&request.email).await?;
    Ok(snapshot(&state))
}

async fn refresh<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
) -> Result<Json<SessionState>> {
    state.session.refresh().await?;
    Ok(snapshot(&state))
}

async fn clear_error<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
) -> Json<SessionState> {
    state.session.clear_error();
    snapshot(&state)
}
