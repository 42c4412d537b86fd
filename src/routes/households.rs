// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Household routes.

use super::snapshot;
use crate::db::DocumentStore;
use crate::error::Result;
use crate::models::Household;
use crate::services::IdentityProvider;
use crate::session::SessionState;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use validator::Validate;

pub fn routes<S: DocumentStore, A: IdentityProvider>() -> Router<Arc<AppState<S, A>>> {
    Router::new()
        .route("/households", post(create_household::<S, A>))
        .route("/households/join", post(join_household::<S, A>))
        .route("/households/{id}/switch", post(switch_household::<S, A>))
        .route("/households/{id}/leave", post(leave_household::<S, A>))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateHouseholdRequest {
    #[validate(length(min = 1, max = 80))]
    pub name: String,
}

async fn create_household<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
    Json(request): Json<CreateHouseholdRequest>,
) -> Result<(StatusCode, Json<Household>)> {
    request.validate()?;
    let household = state.session.create_household(&request.name).await?;
    Ok((StatusCode::CREATED, Json(household)))
}

#[derive(Debug, Deserialize, Validate)]
pub struct JoinHouseholdRequest {
    #[validate(length(min = 1, max = 32))]
    pub code: String,
}

async fn join_household<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
    Json(request): Json<JoinHouseholdRequest>,
) -> Result<Json<Household>> {
    request.validate()?;
    let household = state.session.join_household(&request.code).await?;
    Ok(Json(household))
}

async fn switch_household<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
    Path(id): Path<String>,
) -> Result<Json<SessionState>> {
    state.session.switch_household(&id).await?;
    Ok(snapshot(&state))
}

async fn leave_household<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
    Path(id): Path<String>,
) -> Result<Json<SessionState>> {
    state.session.leave_household(&id).await?;
    Ok(snapshot(&state))
}
