use http::{Method, StatusCode};
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use gatehouse_common::models::application::Scope;

use crate::helpers::{app, app_with_unreachable_auth, body_json, request_id_header};

#[tokio::test]
async fn downstream_5xx_bodies_are_never_echoed() {
    let app = app().await;
    let (app_id, _secret) = app.seed_app(&[], &[Scope::UserRead], 60).await;
    let user_id = Uuid::new_v4();
    app.bind_user(&app_id, &user_id).await;
    let token = app.access_token(&user_id.to_string(), Some(&app_id));

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/users/{user_id}")))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "detail": "psycopg2.OperationalError: connection to postgres failed at /app/db.py:42",
        })))
        .mount(&app.mock_server)
        .await;

    let response = app
        .bearer(
            Method::GET,
            &format!("/api/v1/gateway/users/{user_id}"),
            &token,
            None,
        )
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let header = request_id_header(&response);
    let body = body_json(response).await;

    let rendered = body.to_string();
    assert!(!rendered.contains("psycopg2"));
    assert!(!rendered.contains("postgres"));

    assert_eq!(body["error_code"], "internal_error");
    assert_eq!(body["request_id"], header);
    assert_eq!(body.as_object().unwrap().len(), 3);
}

#[tokio::test]
async fn downstream_domain_errors_pass_through_on_4xx() {
    let app = app().await;
    let (app_id, secret) = app.seed_app(&[], &[Scope::AuthLogin], 60).await;

    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error_code": "wrong_password",
            "message": "the password does not match",
        })))
        .mount(&app.mock_server)
        .await;

    let response = app
        .credentialed(
            "/api/v1/gateway/auth/login",
            app_id.as_str(),
            &secret,
            json!({"identifier": "neo@the.matrix", "password": "wrong"}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "wrong_password");
    assert_eq!(body["message"], "the password does not match");
    assert!(body["request_id"].is_string());
}

#[tokio::test]
async fn an_unreachable_downstream_is_a_503() {
    let app = app_with_unreachable_auth().await;
    let (app_id, secret) = app.seed_app(&[], &[Scope::AuthLogin], 60).await;

    let response = app
        .credentialed(
            "/api/v1/gateway/auth/login",
            app_id.as_str(),
            &secret,
            json!({"identifier": "neo@the.matrix", "password": "hunter2"}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    // The quota was still spent and its headers still ride along.
    assert!(response.headers().contains_key("x-ratelimit-limit"));

    let body = body_json(response).await;
    assert_eq!(body["error_code"], "service_unavailable");
}

#[tokio::test]
async fn framework_detail_errors_are_normalized() {
    let app = app().await;
    let (app_id, secret) = app.seed_app(&[], &[Scope::AuthLogin], 60).await;

    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({"detail": "user not found"})),
        )
        .mount(&app.mock_server)
        .await;

    let response = app
        .credentialed(
            "/api/v1/gateway/auth/login",
            app_id.as_str(),
            &secret,
            json!({"identifier": "trinity@the.matrix", "password": "hunter2"}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "not_found");
    assert_eq!(body["message"], "user not found");
}
