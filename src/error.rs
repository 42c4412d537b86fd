// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types with consistent API responses.

use crate::db::StoreError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type shared by the repository, the session and the bridge.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    Provider(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Transaction lost a race with a concurrent writer and may be retried.
    pub fn is_contention(&self) -> bool {
        matches!(self, AppError::Store(StoreError::Aborted(_)))
    }

    /// Short machine-readable kind, used in logs and bridge responses.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::InvalidState(_) => "invalid_state",
            AppError::Provider(_) => "provider_error",
            AppError::Store(_) => "store_error",
            AppError::Validation(_) => "validation_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

/// Shared refresh results hand the same error to every waiter.
impl Clone for AppError {
    fn clone(&self) -> Self {
        match self {
            AppError::NotFound(m) => AppError::NotFound(m.clone()),
            AppError::PermissionDenied(m) => AppError::PermissionDenied(m.clone()),
            AppError::InvalidState(m) => AppError::InvalidState(m.clone()),
            AppError::Provider(m) => AppError::Provider(m.clone()),
            AppError::Store(e) => AppError::Store(e.clone()),
            AppError::Validation(m) => AppError::Validation(m.clone()),
            AppError::Internal(e) => AppError::Internal(anyhow::anyhow!("{:#}", e)),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let field_errors = errors.field_errors();
        let fields: Vec<&str> = field_errors.keys().map(|k| k.as_ref()).collect();
        AppError::Validation(format!("Missing or invalid: {}", fields.join(", ")))
    }
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Provider(_) => StatusCode::BAD_GATEWAY,
            AppError::Store(err) => {
                tracing::error!(error = %err, "Store error");
                StatusCode::BAD_GATEWAY
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let details = match &self {
            AppError::Internal(_) => None,
            other => Some(other.to_string()),
        };

        let body = ErrorResponse {
            error: self.kind().to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AppError>;
