use http::StatusCode;
use serde_json::json;

use gatehouse_common::models::application::{AppStatus, Scope};

use crate::helpers::{app, body_json, request_id_header};

const LOGIN: &str = "/api/v1/gateway/auth/login";

#[tokio::test]
async fn unknown_app_and_wrong_secret_are_byte_identical_except_request_id() {
    let app = app().await;
    let (app_id, _secret) = app.seed_app(&[], &[Scope::AuthLogin], 60).await;

    let wrong_secret = app
        .credentialed(LOGIN, app_id.as_str(), "wrong", json!({}))
        .await;
    let bogus_id = app
        .credentialed(LOGIN, "does-not-exist", "anything", json!({}))
        .await;

    assert_eq!(wrong_secret.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(bogus_id.status(), StatusCode::UNAUTHORIZED);

    let wrong_secret_header = request_id_header(&wrong_secret);
    let bogus_id_header = request_id_header(&bogus_id);

    let mut wrong_secret_body = body_json(wrong_secret).await;
    let mut bogus_id_body = body_json(bogus_id).await;

    // The header and the body agree on the correlation id.
    assert_eq!(wrong_secret_body["request_id"], wrong_secret_header);
    assert_eq!(bogus_id_body["request_id"], bogus_id_header);

    // Apart from the request id, the two rejections are indistinguishable:
    // probing for application existence must be impossible.
    wrong_secret_body["request_id"].take();
    bogus_id_body["request_id"].take();
    assert_eq!(wrong_secret_body, bogus_id_body);
    assert_eq!(wrong_secret_body["error_code"], "invalid_credentials");
}

#[tokio::test]
async fn missing_credential_headers_are_unauthorized() {
    let app = app().await;

    let response = app
        .send(
            http::Request::builder()
                .method(http::Method::POST)
                .uri(LOGIN)
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error_code"], "invalid_credentials");
}

#[tokio::test]
async fn disabled_app_is_forbidden_only_with_a_matching_secret() {
    let app = app().await;
    let (app_id, secret) = app.seed_app(&[], &[Scope::AuthLogin], 60).await;
    app.service
        .admin_set_status(&app_id, AppStatus::Disabled)
        .await
        .unwrap();

    let correct = app
        .credentialed(LOGIN, app_id.as_str(), &secret, json!({}))
        .await;
    assert_eq!(correct.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(correct).await["error_code"], "app_disabled");

    // A wrong secret must not reveal that the application is disabled.
    let wrong = app
        .credentialed(LOGIN, app_id.as_str(), "wrong", json!({}))
        .await;
    assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(wrong).await["error_code"], "invalid_credentials");
}

#[tokio::test]
async fn malformed_json_bodies_are_validation_errors() {
    let app = app().await;
    let (app_id, secret) = app.seed_app(&[], &[Scope::AuthLogin], 60).await;

    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri(LOGIN)
        .header("x-app-id", app_id.as_str())
        .header("x-app-secret", &secret)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(axum::body::Body::from("{not json"))
        .unwrap();
    let response = app.send(request).await;

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "validation_error");
    // Nothing from the inbound body is echoed back.
    assert_eq!(body["message"], "request validation failed");
}
