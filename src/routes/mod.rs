// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! HTTP route handlers for the presentation bridge.

pub mod households;
pub mod location;
pub mod session;

use crate::db::DocumentStore;
use crate::services::IdentityProvider;
use crate::session::SessionState;
use crate::AppState;
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
#[cfg(feature = "binding-generation")]
use ts_rs::TS;

#[derive(Serialize)]
#[cfg_attr(feature = "binding-generation", derive(TS))]
#[cfg_attr(
    feature = "binding-generation",
    ts(export, export_to = "web/src/lib/generated/")
)]
pub struct HealthResponse {
    pub status: String,
    pub build_id: String,
}

/// Health check response
async fn health_check() -> Json<HealthResponse> {
    let build_id = option_env!("BUILD_ID").unwrap_or("unknown").to_string();
    Json(HealthResponse {
        status: "ok".to_string(),
        build_id,
    })
}

/// Current published state; most actions answer with it.
pub(crate) fn snapshot<S: DocumentStore, A: IdentityProvider>(
    state: &AppState<S, A>,
) -> Json<SessionState> {
    Json(state.session.snapshot())
}

async fn get_session<S: DocumentStore, A: IdentityProvider>(
    State(state): State<Arc<AppState<S, A>>>,
) -> Json<SessionState> {
    snapshot(&state)
}

/// Build the complete router with all routes.
pub fn create_router<S: DocumentStore, A: IdentityProvider>(state: Arc<AppState<S, A>>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/session", get(get_session::<S, A>))
        .merge(session::routes())
        .merge(households::routes())
        .merge(location::routes())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}
