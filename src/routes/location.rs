// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Location sharing routes.

use super::snapshot;
use crate::db::DocumentStore;
use crate::error::Result;
use crate::models::Coordinate;
use crate::services::IdentityProvider;
use crate::session::SessionState;
use crate::AppState;
use axum::{
    extract::State,
    routing::{post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

pub fn routes<S: DocumentStore, A: IdentityProvider>() -> Router<Arc<AppState<S, A>>> {
    Router::new()
        .route("/location", put(update_location::<S, A>))
        .route("/location/stop", post(stop_sharing::<S, A>))
        .route("/location/reset-throttle", post(reset_throttle::<S, A>))
}

#[derive(Debug, Deserialize, Validate)]
pub struct LocationRequest {
    #[validate(range(min = -90.0, max = 90.0))]
    pub lat: f64,
    #[validate(range(min = -180.0, max = 180.0))]
    pub lon: f64,
}

#[derive(Debug, Serialize)]
pub struct LocationResponse {
    /// False when the throttle skipped the write.
    pub written: bool,
}

async fn update_location<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
    Json(request): Json<LocationRequest>,
) -> Result<Json<LocationResponse>> {
    request.validate()?;
    let written = state
        .session
        .update_location(Coordinate::new(request.lat, request.lon))
        .await?;
    Ok(Json(LocationResponse { written }))
}

async fn stop_sharing<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
) -> Result<Json<SessionState>> {
    state.session.stop_sharing().await?;
    Ok(snapshot(&state))
}

async fn reset_throttle<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
) -> Json<SessionState> {
    state.session.reset_location_throttle().await;
    snapshot(&state)
}
