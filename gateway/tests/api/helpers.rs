use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::response::Response;
use axum::Router;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{Method, Request};
use serde_json::{Map, Value};
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::MockServer;

use gatehouse_common::backends::cache::InMemoryCache;
use gatehouse_common::claims::{Claim, TokenKeys};
use gatehouse_common::models::application::{AppId, LoginMethod, Scope};
use gatehouse_common::secrets::ConfigCipher;
use gatehouse_gateway::api::ApiBuilder;
use gatehouse_gateway::dal::{Dal, Sqlite};
use gatehouse_gateway::router::{Downstream, ServiceRouter};
use gatehouse_gateway::service::GatewayService;

/// Signing secret shared between the gateway under test and the fake
/// downstream issuer.
pub const JWT_SECRET: &[u8] = b"integration-test-secret";

pub struct TestApp {
    pub router: Router,
    pub mock_server: MockServer,
    pub service: Arc<GatewayService<Sqlite>>,
    pub dal: Arc<Sqlite>,
    pub tokens: TokenKeys,
}

/// Build a gateway over an in-memory store and cache, with every
/// downstream service pointed at one wiremock server.
pub async fn app() -> TestApp {
    let mock_server = MockServer::start().await;
    let downstreams = HashMap::from([
        (Downstream::Auth, mock_server.uri()),
        (Downstream::User, mock_server.uri()),
        (Downstream::Permission, mock_server.uri()),
    ]);

    app_with(mock_server, downstreams).await
}

/// Same as [`app`], but the auth service's base URL points at a port
/// nothing listens on.
pub async fn app_with_unreachable_auth() -> TestApp {
    let mock_server = MockServer::start().await;
    let downstreams = HashMap::from([
        (Downstream::Auth, "http://127.0.0.1:59999".to_string()),
        (Downstream::User, mock_server.uri()),
    ]);

    app_with(mock_server, downstreams).await
}

async fn app_with(mock_server: MockServer, downstreams: HashMap<Downstream, String>) -> TestApp {
    let dal = Arc::new(Sqlite::new_in_memory().await);
    let tokens = TokenKeys::from_secret(JWT_SECRET);

    let service = Arc::new(GatewayService::init(
        dal.clone(),
        Arc::new(InMemoryCache::new()),
        ServiceRouter::new(downstreams),
        tokens.clone(),
        ConfigCipher::new(&[5u8; 32]),
        64,
    ));

    let router = ApiBuilder::new().with_service(service.clone()).into_router();

    TestApp {
        router,
        mock_server,
        service,
        dal,
        tokens,
    }
}

impl TestApp {
    /// Register an application with the given methods and scopes, returning
    /// its id and plaintext secret.
    pub async fn seed_app(
        &self,
        methods: &[LoginMethod],
        scopes: &[Scope],
        rate_limit: u32,
    ) -> (AppId, String) {
        let (snapshot, secret) = self
            .service
            .admin_create_application("test app".to_string(), None, rate_limit)
            .await
            .unwrap();

        for method in methods {
            self.service
                .admin_upsert_login_method(&snapshot.app_id, *method, true, None)
                .await
                .unwrap();
        }
        for scope in scopes {
            self.service
                .admin_grant_scope(&snapshot.app_id, *scope)
                .await
                .unwrap();
        }

        (snapshot.app_id, secret)
    }

    pub async fn bind_user(&self, app_id: &AppId, user_id: &Uuid) {
        self.dal.provision_user(app_id, user_id, None).await.unwrap();
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to execute request.")
    }

    /// A request through the credential-gated surface.
    pub async fn credentialed(
        &self,
        uri: &str,
        app_id: &str,
        secret: &str,
        body: Value,
    ) -> Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("x-app-id", app_id)
            .header("x-app-secret", secret)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();

        self.send(request).await
    }

    /// A request through the bearer-gated surface.
    pub async fn bearer(
        &self,
        method: Method,
        uri: &str,
        token: &str,
        body: Option<Value>,
    ) -> Response {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {token}"));

        let body = match body {
            Some(value) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };

        self.send(builder.body(body).unwrap()).await
    }

    /// Mint an access token the way the gateway itself would after a
    /// rewrite: bound to `app_id`, subject `sub`.
    pub fn access_token(&self, sub: &str, app_id: Option<&AppId>) -> String {
        let claim = Claim::new_access(
            sub.to_string(),
            app_id.map(|app_id| app_id.to_string()),
            Map::new(),
        );

        self.tokens.encode(&claim).unwrap()
    }
}

pub async fn body_json(response: Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();

    serde_json::from_slice(&bytes).unwrap()
}

/// Assert the correlation invariant: a well-formed `X-Request-Id` header
/// that, on failure bodies, matches the body's `request_id`.
pub fn request_id_header(response: &Response) -> String {
    let header = response
        .headers()
        .get("x-request-id")
        .expect("every response must carry X-Request-Id")
        .to_str()
        .unwrap()
        .to_string();

    assert_eq!(header.len(), 36);
    assert!(header
        .chars()
        .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase() || c == '-'));

    header
}
