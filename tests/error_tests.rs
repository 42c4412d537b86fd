// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

use axum::{body::to_bytes, http::StatusCode, response::IntoResponse};
use family_hub::db::StoreError;
use family_hub::error::AppError;
use validator::Validate;

#[derive(Validate)]
struct SignInForm {
    #[validate(email)]
    email: String,
    #[validate(length(min = 1))]
    code: String,
}

#[test]
fn test_is_contention_only_for_aborted_commits() {
    let err = AppError::from(StoreError::Aborted("users/u1 changed".to_string()));
    assert!(err.is_contention());

    let err = AppError::from(StoreError::Backend("unavailable".to_string()));
    assert!(!err.is_contention());

    let err = AppError::InvalidState("not signed in".to_string());
    assert!(!err.is_contention());
}

#[test]
fn test_kind_names() {
    assert_eq!(AppError::NotFound("x".into()).kind(), "not_found");
    assert_eq!(AppError::PermissionDenied("x".into()).kind(), "permission_denied");
    assert_eq!(AppError::Provider("x".into()).kind(), "provider_error");
    assert_eq!(
        AppError::from(StoreError::Missing("families/f1".into())).kind(),
        "store_error"
    );
    assert_eq!(
        AppError::Internal(anyhow::anyhow!("boom")).kind(),
        "internal_error"
    );
}

#[test]
fn test_clone_keeps_variant_and_message() {
    let err = AppError::Internal(anyhow::anyhow!("listener closed"));
    let cloned = err.clone();
    assert!(matches!(cloned, AppError::Internal(_)));
    assert_eq!(cloned.to_string(), err.to_string());

    let err = AppError::from(StoreError::Aborted("contention".into()));
    assert!(err.clone().is_contention());
}

#[test]
fn test_validation_errors_name_fields() {
    let form = SignInForm {
        email: "not-an-email".to_string(),
        code: String::new(),
    };
    let err = AppError::from(form.validate().unwrap_err());
    let AppError::Validation(message) = &err else {
        panic!("expected validation error, got {:?}", err);
    };
    assert!(message.contains("email"));
    assert!(message.contains("code"));
}

#[tokio::test]
async fn test_status_codes() {
    let cases = [
        (AppError::NotFound("code".into()), StatusCode::NOT_FOUND),
        (AppError::PermissionDenied("no".into()), StatusCode::FORBIDDEN),
        (AppError::InvalidState("no".into()), StatusCode::CONFLICT),
        (AppError::Validation("no".into()), StatusCode::BAD_REQUEST),
        (AppError::Provider("no".into()), StatusCode::BAD_GATEWAY),
        (
            AppError::from(StoreError::Backend("down".into())),
            StatusCode::BAD_GATEWAY,
        ),
        (
            AppError::Internal(anyhow::anyhow!("boom")),
            StatusCode::INTERNAL_SERVER_ERROR,
        ),
    ];

    for (err, expected) in cases {
        let kind = err.kind();
        let response = err.into_response();
        assert_eq!(response.status(), expected, "{}", kind);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], kind);
        if kind == "internal_error" {
            assert!(body.get("details").is_none());
        }
    }
}
