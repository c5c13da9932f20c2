use http::StatusCode;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, ResponseTemplate};

use gatehouse_common::models::application::{LoginMethod, OAuthConfig, ProvisionRule, Scope};
use gatehouse_gateway::dal::Dal;

use crate::helpers::{app, body_json};

#[tokio::test]
async fn successful_registration_binds_the_user_and_applies_the_rule() {
    let app = app().await;
    let (app_id, secret) = app
        .seed_app(&[LoginMethod::Email], &[Scope::AuthRegister], 60)
        .await;
    let rule = ProvisionRule {
        role_ids: vec![Uuid::new_v4()],
        permission_ids: vec![Uuid::new_v4()],
        organization_id: Some(Uuid::new_v4()),
        subscription_plan_id: None,
        is_enabled: true,
    };
    app.service
        .admin_set_provision_rule(&app_id, &rule)
        .await
        .unwrap();

    let user_id = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/register/email"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "user_id": user_id,
            "email": "neo@the.matrix",
        })))
        .mount(&app.mock_server)
        .await;

    let response = app
        .credentialed(
            "/api/v1/gateway/auth/register/email",
            app_id.as_str(),
            &secret,
            json!({"email": "neo@the.matrix", "password": "hunter2"}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["email"], "neo@the.matrix");
    assert!(body["request_id"].is_string());

    assert!(app.dal.is_user_bound(&app_id, &user_id).await.unwrap());
}

#[tokio::test]
async fn registering_the_same_user_twice_is_harmless() {
    let app = app().await;
    let (app_id, secret) = app
        .seed_app(&[LoginMethod::Phone], &[Scope::AuthRegister], 60)
        .await;

    let user_id = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/register/phone"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"user_id": user_id})),
        )
        .mount(&app.mock_server)
        .await;

    for _ in 0..2 {
        let response = app
            .credentialed(
                "/api/v1/gateway/auth/register/phone",
                app_id.as_str(),
                &secret,
                json!({"phone": "+15550100", "code": "000000"}),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    assert!(app.dal.is_user_bound(&app_id, &user_id).await.unwrap());
}

#[tokio::test]
async fn failed_registration_provisions_nothing() {
    let app = app().await;
    let (app_id, secret) = app
        .seed_app(&[LoginMethod::Email], &[Scope::AuthRegister], 60)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/v1/auth/register/email"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error_code": "email_exists",
            "message": "this email is already registered",
        })))
        .mount(&app.mock_server)
        .await;

    let response = app
        .credentialed(
            "/api/v1/gateway/auth/register/email",
            app_id.as_str(),
            &secret,
            json!({"email": "neo@the.matrix", "password": "hunter2"}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["error_code"], "email_exists");
}

#[tokio::test]
async fn oauth_uses_the_sealed_application_credentials_and_provisions_new_users() {
    let app = app().await;
    let (app_id, secret) = app
        .seed_app(&[], &[Scope::AuthLogin], 60)
        .await;
    app.service
        .admin_upsert_login_method(
            &app_id,
            LoginMethod::Google,
            true,
            Some(&OAuthConfig {
                client_id: "google-client-1".to_string(),
                client_secret: "google-secret".to_string(),
            }),
        )
        .await
        .unwrap();

    let user_id = Uuid::new_v4();
    // The mock only matches when the application's own OAuth credentials
    // replaced whatever the caller sent.
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/oauth/google"))
        .and(body_partial_json(json!({"client_id": "google-client-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "is_new_user": true,
            "user": {"id": user_id},
        })))
        .mount(&app.mock_server)
        .await;

    let response = app
        .credentialed(
            "/api/v1/gateway/auth/oauth/google",
            app_id.as_str(),
            &secret,
            json!({"code": "authz-code", "client_id": "caller-supplied"}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(app.dal.is_user_bound(&app_id, &user_id).await.unwrap());
}

#[tokio::test]
async fn unknown_oauth_providers_read_as_disabled_methods() {
    let app = app().await;
    let (app_id, secret) = app.seed_app(&[], &[Scope::AuthLogin], 60).await;

    let response = app
        .credentialed(
            "/api/v1/gateway/auth/oauth/saml",
            app_id.as_str(),
            &secret,
            json!({"code": "authz-code"}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        body_json(response).await["error_code"],
        "login_method_disabled"
    );
}

#[tokio::test]
async fn oauth_returning_users_are_not_reprovisioned() {
    let app = app().await;
    let (app_id, secret) = app.seed_app(&[LoginMethod::Google], &[Scope::AuthLogin], 60).await;

    let user_id = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/oauth/google"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "is_new_user": false,
            "user": {"id": user_id},
        })))
        .mount(&app.mock_server)
        .await;

    let response = app
        .credentialed(
            "/api/v1/gateway/auth/oauth/google",
            app_id.as_str(),
            &secret,
            json!({"code": "authz-code"}),
        )
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(!app.dal.is_user_bound(&app_id, &user_id).await.unwrap());
}
