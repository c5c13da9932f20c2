use http::StatusCode;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use gatehouse_common::models::application::Scope;

use crate::helpers::{app, body_json};

const LOGIN: &str = "/api/v1/gateway/auth/login";

#[tokio::test]
async fn the_window_admits_up_to_the_limit_then_denies() {
    let app = app().await;
    let (app_id, secret) = app.seed_app(&[], &[Scope::AuthLogin], 3).await;

    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"user_id": "u-1"})))
        .mount(&app.mock_server)
        .await;

    for expected_remaining in ["2", "1", "0"] {
        let response = app
            .credentialed(LOGIN, app_id.as_str(), &secret, json!({}))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-ratelimit-limit").unwrap(),
            "3"
        );
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            expected_remaining
        );
        assert!(response.headers().contains_key("x-ratelimit-reset"));
    }

    let denied = app
        .credentialed(LOGIN, app_id.as_str(), &secret, json!({}))
        .await;

    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.headers().get("x-ratelimit-remaining").unwrap(), "0");
    let retry_after: u32 = denied
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    assert!(retry_after <= 60);

    assert_eq!(body_json(denied).await["error_code"], "rate_limit_exceeded");
}

#[tokio::test]
async fn applications_have_independent_windows() {
    let app = app().await;
    let (first, first_secret) = app.seed_app(&[], &[Scope::AuthLogin], 1).await;
    let (second, second_secret) = app.seed_app(&[], &[Scope::AuthLogin], 1).await;

    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"user_id": "u-1"})))
        .mount(&app.mock_server)
        .await;

    let allowed = app
        .credentialed(LOGIN, first.as_str(), &first_secret, json!({}))
        .await;
    assert_eq!(allowed.status(), StatusCode::OK);

    let denied = app
        .credentialed(LOGIN, first.as_str(), &first_secret, json!({}))
        .await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);

    // The second application is unaffected by the first one's exhaustion.
    let other = app
        .credentialed(LOGIN, second.as_str(), &second_secret, json!({}))
        .await;
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn denials_do_not_reach_the_downstream_service() {
    let app = app().await;
    let (app_id, secret) = app.seed_app(&[], &[Scope::AuthLogin], 1).await;

    // Expect exactly one downstream call despite two gateway requests.
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"user_id": "u-1"})))
        .expect(1)
        .mount(&app.mock_server)
        .await;

    app.credentialed(LOGIN, app_id.as_str(), &secret, json!({}))
        .await;
    let denied = app
        .credentialed(LOGIN, app_id.as_str(), &secret, json!({}))
        .await;

    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
}
