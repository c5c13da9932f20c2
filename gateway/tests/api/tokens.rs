use chrono::{Duration, Utc};
use http::{Method, StatusCode};
use serde_json::{json, Map};
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use gatehouse_common::claims::{Claim, TokenKeys};
use gatehouse_common::models::application::{AppStatus, Scope};

use crate::helpers::{app, body_json, request_id_header, TestApp, JWT_SECRET};

/// Mint a token the way the downstream auth service would: same shared
/// secret, its own issuer, no application binding.
fn upstream_token(sub: &str, email: &str) -> String {
    let mut extra = Map::new();
    extra.insert("email".to_string(), json!(email));

    let claim = Claim {
        iss: "auth-service".to_string(),
        ..Claim::new_access(sub.to_string(), None, extra)
    };

    TokenKeys::from_secret(JWT_SECRET).encode(&claim).unwrap()
}

#[tokio::test]
async fn login_rewrites_tokens_to_carry_the_application_binding() {
    let app = app().await;
    let (app_id, secret) = app.seed_app(&[], &[Scope::AuthLogin], 60).await;
    let user_id = Uuid::new_v4().to_string();

    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": upstream_token(&user_id, "neo@the.matrix"),
            "refresh_token": upstream_token(&user_id, "neo@the.matrix"),
            "token_type": "bearer",
        })))
        .mount(&app.mock_server)
        .await;

    let response = app
        .credentialed(
            "/api/v1/gateway/auth/login",
            app_id.as_str(),
            &secret,
            json!({"identifier": "neo@the.matrix", "password": "hunter2"}),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    let access = app
        .tokens
        .decode(body["access_token"].as_str().unwrap())
        .unwrap();
    assert_eq!(access.sub, user_id);
    assert_eq!(access.app_id.as_deref(), Some(app_id.as_str()));
    // Registered claims are the gateway's own now.
    assert_eq!(access.iss, "gatehouse");
    // Claims the gateway does not interpret survive the rewrite.
    assert_eq!(access.extra["email"], json!("neo@the.matrix"));

    let refresh = app
        .tokens
        .decode(body["refresh_token"].as_str().unwrap())
        .unwrap();
    assert_eq!(refresh.app_id.as_deref(), Some(app_id.as_str()));
    assert!(refresh.exp > access.exp);
}

async fn seeded_bearer_app() -> (TestApp, gatehouse_common::models::application::AppId, Uuid) {
    let app = app().await;
    let (app_id, _secret) = app.seed_app(&[], &[Scope::UserRead], 60).await;
    let user_id = Uuid::new_v4();

    (app, app_id, user_id)
}

#[tokio::test]
async fn expired_bearer_tokens_are_told_apart_from_invalid_ones() {
    let (app, app_id, user_id) = seeded_bearer_app().await;
    app.bind_user(&app_id, &user_id).await;

    let issued = Utc::now() - Duration::hours(2);
    let expired_claim = Claim {
        exp: (issued + Duration::minutes(15)).timestamp() as usize,
        iat: issued.timestamp() as usize,
        ..Claim::new_access(user_id.to_string(), Some(app_id.to_string()), Map::new())
    };
    let expired = app.tokens.encode(&expired_claim).unwrap();

    let uri = format!("/api/v1/gateway/users/{user_id}");

    let response = app.bearer(Method::GET, &uri, &expired, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error_code"], "token_expired");

    let response = app.bearer(Method::GET, &uri, "garbage.token.here", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error_code"], "invalid_token");

    let response = app
        .send(
            http::Request::builder()
                .method(Method::GET)
                .uri(&uri)
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error_code"], "invalid_token");
}

#[tokio::test]
async fn tokens_without_a_binding_are_rejected() {
    let (app, app_id, user_id) = seeded_bearer_app().await;
    app.bind_user(&app_id, &user_id).await;

    let unbound = app.access_token(&user_id.to_string(), None);

    let response = app
        .bearer(
            Method::GET,
            &format!("/api/v1/gateway/users/{user_id}"),
            &unbound,
            None,
        )
        .await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error_code"], "invalid_token");
}

#[tokio::test]
async fn tokens_bound_to_an_unknown_or_disabled_app_are_rejected() {
    let (app, app_id, user_id) = seeded_bearer_app().await;
    app.bind_user(&app_id, &user_id).await;
    let uri = format!("/api/v1/gateway/users/{user_id}");

    let foreign = app.access_token(&user_id.to_string(), Some(&"ghost-app".into()));
    let response = app.bearer(Method::GET, &uri, &foreign, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error_code"], "invalid_token");

    app.service
        .admin_set_status(&app_id, AppStatus::Disabled)
        .await
        .unwrap();
    let token = app.access_token(&user_id.to_string(), Some(&app_id));
    let response = app.bearer(Method::GET, &uri, &token, None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error_code"], "app_disabled");
}

#[tokio::test]
async fn unbound_users_cannot_be_reached_through_the_application() {
    let (app, app_id, user_id) = seeded_bearer_app().await;
    // Note: no binding row for this user.
    let token = app.access_token(&user_id.to_string(), Some(&app_id));

    let response = app
        .bearer(
            Method::GET,
            &format!("/api/v1/gateway/users/{user_id}"),
            &token,
            None,
        )
        .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let header = request_id_header(&response);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "user_not_bound");
    assert_eq!(body["request_id"], header);
}

#[tokio::test]
async fn a_bound_user_with_the_right_scope_reaches_the_user_service() {
    let (app, app_id, user_id) = seeded_bearer_app().await;
    app.bind_user(&app_id, &user_id).await;
    let token = app.access_token(&user_id.to_string(), Some(&app_id));

    Mock::given(method("GET"))
        .and(path(format!("/api/v1/users/{user_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": user_id,
            "email": "neo@the.matrix",
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

    assert_eq!(response.status(), StatusCode::OK);
    let header = request_id_header(&response);
    let body = body_json(response).await;
    assert_eq!(body["email"], "neo@the.matrix");
    // Success bodies get the correlation id injected too.
    assert_eq!(body["request_id"], header);
}

#[tokio::test]
async fn change_password_targets_the_token_subject() {
    let app = app().await;
    let (app_id, _secret) = app.seed_app(&[], &[Scope::UserWrite], 60).await;
    let user_id = Uuid::new_v4();
    let token = app.access_token(&user_id.to_string(), Some(&app_id));

    // Without a binding the subject itself is refused.
    let response = app
        .bearer(
            Method::POST,
            "/api/v1/gateway/auth/change-password",
            &token,
            Some(json!({"old_password": "a", "new_password": "b"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["error_code"], "user_not_bound");

    app.bind_user(&app_id, &user_id).await;

    Mock::given(method("POST"))
        .and(path("/api/v1/auth/change-password"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"changed": true})))
        .mount(&app.mock_server)
        .await;

    let response = app
        .bearer(
            Method::POST,
            "/api/v1/gateway/auth/change-password",
            &token,
            Some(json!({"old_password": "a", "new_password": "b"})),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}
