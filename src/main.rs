// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Family-Hub session bridge
//!
//! Runs a household session against the configured document store and
//! identity provider, and serves its state to a local UI shell.

use family_hub::{
    config::Config,
    db::{DocumentStore, MemoryStore},
    services::{FirebaseAuth, IdentityProvider, MemoryIdentity},
    session::Session,
    AppState,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured JSON logging for GCP
    init_logging();

    // Load configuration from environment
    let config = Config::from_env().expect("Failed to load configuration");
    tracing::info!(port = config.port, "Starting Family-Hub bridge");

    start(config).await
}

#[cfg(feature = "gcp")]
async fn start(config: Config) -> anyhow::Result<()> {
    match config.gcp_project_id.clone() {
        Some(project_id) => {
            let store = family_hub::db::FirestoreStore::new(&project_id)
                .await
                .expect("Failed to connect to Firestore");
            with_identity(config, Arc::new(store)).await
        }
        None => {
            tracing::info!("No GCP project configured; using in-memory store");
            with_identity(config, Arc::new(MemoryStore::new())).await
        }
    }
}

#[cfg(not(feature = "gcp"))]
async fn start(config: Config) -> anyhow::Result<()> {
    if config.gcp_project_id.is_some() {
        tracing::warn!("Built without the gcp feature; ignoring GCP_PROJECT_ID");
    }
    tracing::info!("Using in-memory store");
    with_identity(config, Arc::new(MemoryStore::new())).await
}

async fn with_identity<S: DocumentStore>(config: Config, store: Arc<S>) -> anyhow::Result<()> {
    match config.firebase_api_key.clone() {
        Some(api_key) => {
            let mut auth = FirebaseAuth::new(api_key, config.identity_base_url.as_deref());
            if let Some(path) = config.token_file.clone() {
                auth = auth.with_token_file(path);
            }
            auth.restore(config.refresh_token.as_deref()).await;
            tracing::info!("Firebase identity provider initialized");
            serve(config, store, Arc::new(auth)).await
        }
        None => {
            let identity = MemoryIdentity::new();
            identity.finish_probe();
            tracing::info!("No API key configured; using in-memory identity provider");
            serve(config, store, Arc::new(identity)).await
        }
    }
}

async fn serve<S: DocumentStore, A: IdentityProvider>(
    config: Config,
    store: Arc<S>,
    identity: Arc<A>,
) -> anyhow::Result<()> {
    let session = Session::new(store, identity, config.throttle);
    session.start();

    let addr = format!("127.0.0.1:{}", config.port);
    let state = Arc::new(AppState {
        config,
        session: session.clone(),
    });

    // Build router
    let app = family_hub::routes::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    session.shutdown().await;
    tracing::info!("Shut down");
    Ok(())
}

/// Initialize structured JSON logging (GCP-compliant).
fn init_logging() {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("family_hub=debug".parse().expect("valid directive"))
                .add_directive("info".parse().expect("valid directive")),
        )
        .with(format)
        .init();
}
