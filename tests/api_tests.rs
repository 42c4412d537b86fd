// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Presentation bridge tests: routing, validation and error mapping.

use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

mod common;

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_check() {
    let (app, _state) = common::create_test_app();
    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_session_starts_signed_out() {
    let (app, state) = common::create_test_app();
    let mut rx = state.session.subscribe();
    rx.wait_for(|s| s.route == family_hub::session::Route::SignedOut)
        .await
        .unwrap();

    let (status, body) = call(&app, Method::GET, "/session", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["route"]["route"], "signedOut");
    assert!(body["user"].is_null());
    assert_eq!(body["households"], json!([]));
}

#[tokio::test]
async fn test_sign_up_and_create_household() {
    let (app, _state) = common::create_test_app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/session/sign-up",
        Some(json!({
            "email": "alice@example.com",
            "password": "secret123",
            "displayName": "Alice",
            "role": "organizer"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["route"]["route"], "needsHouseholdSetup");
    assert_eq!(body["route"]["role"], "organizer");

    let (status, household) = call(
        &app,
        Method::POST,
        "/households",
        Some(json!({"name": "Smiths"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", household);
    assert_eq!(household["name"], "Smiths");
    assert_eq!(household["joinCode"].as_str().map(str::len), Some(6));

    let (status, body) = call(&app, Method::GET, "/session", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["route"]["route"], "active");
    assert_eq!(body["household"]["name"], "Smiths");

    let (status, body) = call(
        &app,
        Method::PUT,
        "/location",
        Some(json!({"lat": 37.4, "lon": -122.1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["written"], true);
}

#[tokio::test]
async fn test_invalid_bodies_are_rejected() {
    let (app, _state) = common::create_test_app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/session/sign-in",
        Some(json!({"email": "", "password": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = call(
        &app,
        Method::POST,
        "/session/sign-up",
        Some(json!({"email": "not-an-email", "password": "123", "role": "member"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::POST, "/households", Some(json!({"name": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::POST,
        "/households/join",
        Some(json!({"code": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::PUT,
        "/location",
        Some(json!({"lat": 91.0, "lon": 0.0})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::POST,
        "/session/sign-in/federated",
        Some(json!({"provider": "myspace", "idToken": "t"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_errors_map_to_status_codes() {
    let (app, state) = common::create_test_app();
    state
        .session
        .identity()
        .add_account("bob@example.com", "secret123");

    // Wrong password comes back from the identity provider.
    let (status, body) = call(
        &app,
        Method::POST,
        "/session/sign-in",
        Some(json!({"email": "bob@example.com", "password": "nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "provider_error");

    // Household actions need a signed-in user.
    let (status, _) = call(&app, Method::POST, "/households/f1/switch", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = call(
        &app,
        Method::POST,
        "/session/sign-in",
        Some(json!({"email": "bob@example.com", "password": "secret123"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["route"]["route"], "signedInNoProfile");

    let (status, body) = call(
        &app,
        Method::POST,
        "/households/join",
        Some(json!({"code": "ZZZZZZ"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, body) = call(&app, Method::POST, "/session/clear-error", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["errorMessage"].is_null());
}

#[tokio::test]
async fn test_federated_sign_in_creates_member_profile() {
    let (app, _state) = common::create_test_app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/session/sign-in/federated",
        Some(json!({"provider": "google", "idToken": "google-token"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["route"]["route"], "needsHouseholdSetup");
    assert_eq!(body["route"]["role"], "member");
    assert_eq!(body["user"]["providerIds"], json!(["google.com"]));

    let (status, body) = call(&app, Method::POST, "/session/sign-out", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["route"]["route"], "signedOut");
}
