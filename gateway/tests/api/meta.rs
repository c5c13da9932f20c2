use axum::body::Body;
use http::{Request, StatusCode};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::helpers::{app, app_with_unreachable_auth, body_json, request_id_header};

#[tokio::test]
async fn the_banner_and_info_endpoints_are_unauthenticated() {
    let app = app().await;

    let response = app
        .send(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    request_id_header(&response);
    assert_eq!(body_json(response).await["status"], "running");

    let response = app
        .send(
            Request::builder()
                .uri("/api/v1/gateway/info")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    assert_eq!(body["version"], "1.0.0");
    assert_eq!(body["supported_api_versions"], json!(["v1"]));
    assert_eq!(
        body["available_login_methods"],
        json!(["email", "phone", "wechat", "alipay", "google", "apple"])
    );
}

#[tokio::test]
async fn health_aggregates_local_components_and_downstream_services() {
    let app = app().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "healthy"})))
        .mount(&app.mock_server)
        .await;

    let response = app
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    assert_eq!(body["status"], "healthy");
    assert_eq!(body["components"]["database"]["status"], "healthy");
    assert_eq!(body["components"]["cache"]["status"], "healthy");
    assert_eq!(body["components"]["message_bus"]["status"], "not_configured");
    assert_eq!(body["components"]["downstream_auth"]["status"], "healthy");
    assert_eq!(body["components"]["downstream_user"]["status"], "healthy");
}

#[tokio::test]
async fn health_degrades_while_some_downstream_service_is_up() {
    let app = app_with_unreachable_auth().await;

    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "healthy"})))
        .mount(&app.mock_server)
        .await;

    let response = app
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;

    // The user service answers while auth does not: degraded, still 200.
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["components"]["downstream_auth"]["status"], "unhealthy");
}

#[tokio::test]
async fn health_is_503_when_every_downstream_service_is_unreachable() {
    let app = app().await;

    // No /health mock mounted: wiremock answers 404 to every probe, so all
    // downstream services read as unhealthy even though db and cache are up.
    let response = app
        .send(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["components"]["database"]["status"], "healthy");
}

#[tokio::test]
async fn unknown_routes_get_the_envelope_and_a_request_id() {
    let app = app().await;

    let response = app
        .send(
            Request::builder()
                .uri("/api/v1/gateway/unknown")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let header = request_id_header(&response);
    let body = body_json(response).await;
    assert_eq!(body["error_code"], "not_found");
    assert_eq!(body["request_id"], header);
}
