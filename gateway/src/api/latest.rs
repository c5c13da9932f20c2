use std::any::Any;
use std::sync::Arc;

use axum::body::{Bytes, Full};
use axum::extract::{Extension, FromRequestParts, Path, State};
use axum::headers::authorization::Bearer;
use axum::headers::{Authorization, HeaderMapExt};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::request::Parts;
use http::{header::CONTENT_TYPE, HeaderValue, Method, StatusCode};
use serde_json::{json, Value};
use strum::IntoEnumIterator;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use gatehouse_common::backends::headers::{XAppId, XAppSecret, X_REQUEST_ID};
use gatehouse_common::claims::Claim;
use gatehouse_common::models::application::{AppId, AppSnapshot, LoginMethod};
use gatehouse_common::models::error::{ApiError, ErrorCode};

use crate::audit::AuditLayer;
use crate::dal::Dal;
use crate::rate_limit::RateLimitResult;
use crate::router::{Downstream, Forwarded};
use crate::scopes;
use crate::service::GatewayService;
use crate::{Error, ErrorKind};

use super::request_id::{CorrelationLayer, RequestId};

pub const GATEWAY_VERSION: &str = "1.0.0";
pub const SUPPORTED_API_VERSIONS: &[&str] = &["v1"];

pub struct RouterState<D> {
    pub service: Arc<GatewayService<D>>,
}

// Derived `Clone` would demand `D: Clone`; only the `Arc` is cloned.
impl<D> Clone for RouterState<D> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

pub struct ApiBuilder<D: Dal> {
    router: Router<RouterState<D>>,
    service: Option<Arc<GatewayService<D>>>,
}

impl<D: Dal> ApiBuilder<D> {
    pub fn new() -> Self {
        let router = Router::new()
            .route("/", get(root))
            .route("/health", get(health))
            .route("/api/v1/gateway/info", get(info))
            .route("/api/v1/gateway/auth/register/email", post(register_email))
            .route("/api/v1/gateway/auth/register/phone", post(register_phone))
            .route("/api/v1/gateway/auth/login", post(login))
            .route("/api/v1/gateway/auth/oauth/:provider", post(oauth))
            .route("/api/v1/gateway/auth/refresh", post(refresh))
            .route(
                "/api/v1/gateway/auth/change-password",
                post(change_password),
            )
            .route("/api/v1/gateway/users/:user_id", get(get_user))
            .route("/api/v1/gateway/users/:user_id/roles", get(get_user_roles))
            .route(
                "/api/v1/gateway/users/:user_id/permissions/check",
                post(check_permission),
            )
            .fallback(fallback);

        Self {
            router,
            service: None,
        }
    }

    pub fn with_service(mut self, service: Arc<GatewayService<D>>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn into_router(self) -> Router {
        scopes::validate_rules().expect("scope rules should order specific patterns first");

        let service = self.service.expect("a gateway service is required");
        let audit = AuditLayer::new(service.audit().clone());

        self.router
            .with_state(RouterState { service })
            .layer(CorrelationLayer)
            .layer(CatchPanicLayer::custom(handle_panic))
            .layer(audit)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }
}

impl<D: Dal> Default for ApiBuilder<D> {
    fn default() -> Self {
        Self::new()
    }
}

/// Last-resort handler: a panic anywhere below becomes a plain 500
/// envelope, never the panic text.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> http::Response<Full<Bytes>> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(%detail, "request handler panicked");

    let request_id = Uuid::new_v4();
    let body = json!({
        "error_code": ErrorCode::InternalError.to_string(),
        "message": "gateway internal error",
        "request_id": request_id.to_string(),
    });

    http::Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(CONTENT_TYPE, "application/json")
        .header(X_REQUEST_ID.clone(), request_id.to_string())
        .body(Full::from(body.to_string()))
        .expect("the panic response should build")
}

/// An application whose `X-App-Id`/`X-App-Secret` headers verified against
/// the store. Missing headers are indistinguishable from bad ones.
pub(crate) struct VerifiedApp(pub AppSnapshot);

#[axum::async_trait]
impl<D: Dal> FromRequestParts<RouterState<D>> for VerifiedApp {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &RouterState<D>,
    ) -> Result<Self, Self::Rejection> {
        let request_id = parts.extensions.get::<RequestId>().copied();
        let attach = move |error: Error| match request_id {
            Some(request_id) => error.with_request_id(request_id.0),
            None => error,
        };

        let (Some(app_id), Some(secret)) = (
            parts.headers.typed_get::<XAppId>(),
            parts.headers.typed_get::<XAppSecret>(),
        ) else {
            return Err(attach(Error::from_kind(ErrorKind::InvalidCredentials)));
        };

        let app = state
            .service
            .verify_credentials(&AppId::from(app_id.0.as_str()), &secret.0)
            .await
            .map_err(attach)?;

        Ok(Self(app))
    }
}

/// A decoded bearer token together with the active application it is bound
/// to. Expired and malformed tokens are told apart here.
pub(crate) struct BoundToken {
    pub claim: Claim,
    pub app: AppSnapshot,
}

#[axum::async_trait]
impl<D: Dal> FromRequestParts<RouterState<D>> for BoundToken {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &RouterState<D>,
    ) -> Result<Self, Self::Rejection> {
        let request_id = parts.extensions.get::<RequestId>().copied();
        let attach = move |error: Error| match request_id {
            Some(request_id) => error.with_request_id(request_id.0),
            None => error,
        };

        let Some(bearer) = parts.headers.typed_get::<Authorization<Bearer>>() else {
            return Err(attach(Error::custom(
                ErrorKind::InvalidToken,
                "missing or malformed authorization header",
            )));
        };

        let claim = state
            .service
            .tokens()
            .decode(bearer.token())
            .map_err(|err| attach(Error::from(err)))?;

        let Some(app_id) = claim.app_id.clone().filter(|app_id| !app_id.is_empty()) else {
            return Err(attach(Error::custom(
                ErrorKind::InvalidToken,
                "token carries no application binding",
            )));
        };

        let app = state
            .service
            .load_bound_app(&AppId::from(app_id.as_str()))
            .await
            .map_err(attach)?;

        Ok(Self { claim, app })
    }
}

async fn fallback(Extension(request_id): Extension<RequestId>) -> Response {
    Error::from_kind(ErrorKind::NotFound)
        .with_request_id(request_id.0)
        .into_response()
}

async fn root() -> impl IntoResponse {
    Json(json!({ "service": "gatehouse api gateway", "status": "running" }))
}

async fn info() -> impl IntoResponse {
    Json(json!({
        "version": GATEWAY_VERSION,
        "supported_api_versions": SUPPORTED_API_VERSIONS,
        "available_login_methods": LoginMethod::iter()
            .map(|method| method.to_string())
            .collect::<Vec<_>>(),
    }))
}

async fn health<D: Dal>(State(state): State<RouterState<D>>) -> Response {
    let report = state.service.health().await;

    (report.status_code(), Json(report)).into_response()
}

/// Credential pipeline shared by every `X-App-Id`-gated endpoint:
/// method gate → scope gate → rate-limit admission.
async fn credential_gate<D: Dal>(
    service: &GatewayService<D>,
    app: &AppSnapshot,
    method: Option<LoginMethod>,
    endpoint: &str,
) -> Result<RateLimitResult, Error> {
    if let Some(method) = method {
        service.require_method(&app.app_id, method).await?;
    }
    service.check_scope(&app.app_id, endpoint).await?;
    service.admit(app).await
}

/// Bearer pipeline shared by every token-gated endpoint:
/// binding gate → scope gate → rate-limit admission.
async fn bearer_gate<D: Dal>(
    service: &GatewayService<D>,
    app: &AppSnapshot,
    claim: &Claim,
    target_user: Option<&str>,
    endpoint: &str,
) -> Result<RateLimitResult, Error> {
    let target = match target_user {
        Some(user_id) => user_id.to_string(),
        None => claim.sub.clone(),
    };
    if target.is_empty() {
        return Err(Error::custom(ErrorKind::InvalidToken, "token carries no subject"));
    }

    service.ensure_binding(&app.app_id, &target).await?;
    service.check_scope(&app.app_id, endpoint).await?;
    service.admit(app).await
}

fn set_request_id_header(response: &mut Response, request_id: RequestId) {
    response.headers_mut().insert(
        X_REQUEST_ID.clone(),
        HeaderValue::from_str(&request_id.0.to_string()).expect("a uuid is a valid header value"),
    );
}

fn merge_rate_headers(response: &mut Response, rate: Option<&RateLimitResult>) {
    if let Some(rate) = rate {
        for (name, value) in rate.headers().iter() {
            response.headers_mut().insert(name.clone(), value.clone());
        }
    }
}

fn rate_limited(rate: &RateLimitResult, request_id: RequestId) -> Response {
    let mut response = Error::from_kind(ErrorKind::RateLimitExceeded)
        .with_request_id(request_id.0)
        .into_response();
    merge_rate_headers(&mut response, Some(rate));

    response
}

/// Turn a normalized downstream response into the wire response: verbatim
/// success bodies get the request id injected, error bodies become the
/// unified envelope, and the quota headers ride along on both.
fn relay(forwarded: Forwarded, request_id: RequestId, rate: Option<&RateLimitResult>) -> Response {
    let mut response = if forwarded.is_success() {
        let mut body = forwarded.body;
        if let Some(object) = body.as_object_mut() {
            object.insert("request_id".to_string(), json!(request_id.0.to_string()));
        }

        (forwarded.status, Json(body)).into_response()
    } else {
        let error_code = forwarded.body["error_code"]
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| ErrorCode::default_for(forwarded.status).to_string());
        let message = forwarded.body["message"]
            .as_str()
            .unwrap_or("downstream request failed");

        (
            forwarded.status,
            Json(ApiError::new(error_code, message, request_id.0)),
        )
            .into_response()
    };

    set_request_id_header(&mut response, request_id);
    merge_rate_headers(&mut response, rate);

    response
}

/// Parse an inbound JSON body, mapping failure to the validation envelope.
/// Field names from the body never make it into the error message.
fn parse_body(bytes: &Bytes, request_id: RequestId) -> Result<Value, Box<Response>> {
    serde_json::from_slice(bytes).map_err(|_| {
        Box::new(
            Error::from_kind(ErrorKind::Validation)
                .with_request_id(request_id.0)
                .into_response(),
        )
    })
}

async fn register_email<D: Dal>(
    State(state): State<RouterState<D>>,
    Extension(request_id): Extension<RequestId>,
    VerifiedApp(app): VerifiedApp,
    body: Bytes,
) -> Response {
    register(
        state,
        request_id,
        app,
        LoginMethod::Email,
        "auth/register/email",
        "/api/v1/auth/register/email",
        body,
    )
    .await
}

async fn register_phone<D: Dal>(
    State(state): State<RouterState<D>>,
    Extension(request_id): Extension<RequestId>,
    VerifiedApp(app): VerifiedApp,
    body: Bytes,
) -> Response {
    register(
        state,
        request_id,
        app,
        LoginMethod::Phone,
        "auth/register/phone",
        "/api/v1/auth/register/phone",
        body,
    )
    .await
}

async fn register<D: Dal>(
    state: RouterState<D>,
    request_id: RequestId,
    app: AppSnapshot,
    method: LoginMethod,
    endpoint: &str,
    downstream_path: &str,
    body: Bytes,
) -> Response {
    let body = match parse_body(&body, request_id) {
        Ok(body) => body,
        Err(response) => return *response,
    };

    let rate = match credential_gate(&state.service, &app, Some(method), endpoint).await {
        Ok(rate) => rate,
        Err(error) => return error.with_request_id(request_id.0).into_response(),
    };
    if !rate.allowed {
        return rate_limited(&rate, request_id);
    }

    let forwarded = state
        .service
        .forward(Downstream::Auth, Method::POST, downstream_path, Some(&body))
        .await;

    if forwarded.is_success() {
        if let Some(user_id) = forwarded.body["user_id"].as_str() {
            state.service.provision(&app, user_id).await;
        }
    }

    relay(forwarded, request_id, Some(&rate))
}

async fn login<D: Dal>(
    State(state): State<RouterState<D>>,
    Extension(request_id): Extension<RequestId>,
    VerifiedApp(app): VerifiedApp,
    body: Bytes,
) -> Response {
    let body = match parse_body(&body, request_id) {
        Ok(body) => body,
        Err(response) => return *response,
    };

    // Login is method neutral: the identifier may be an email or a phone
    // number, and the auth service decides which.
    let rate = match credential_gate(&state.service, &app, None, "auth/login").await {
        Ok(rate) => rate,
        Err(error) => return error.with_request_id(request_id.0).into_response(),
    };
    if !rate.allowed {
        return rate_limited(&rate, request_id);
    }

    let mut forwarded = state
        .service
        .forward(Downstream::Auth, Method::POST, "/api/v1/auth/login", Some(&body))
        .await;

    if forwarded.is_success() {
        state.service.rewrite_tokens(&mut forwarded.body, &app.app_id);
    }

    relay(forwarded, request_id, Some(&rate))
}

async fn oauth<D: Dal>(
    State(state): State<RouterState<D>>,
    Extension(request_id): Extension<RequestId>,
    VerifiedApp(app): VerifiedApp,
    Path(provider): Path<String>,
    body: Bytes,
) -> Response {
    let Ok(provider) = provider.parse::<LoginMethod>() else {
        return Error::custom(
            ErrorKind::LoginMethodDisabled,
            format!("unknown oauth provider: {provider}"),
        )
        .with_request_id(request_id.0)
        .into_response();
    };

    let mut body = match parse_body(&body, request_id) {
        Ok(body) => body,
        Err(response) => return *response,
    };

    let endpoint = format!("auth/oauth/{provider}");
    let rate = match credential_gate(&state.service, &app, Some(provider), &endpoint).await {
        Ok(rate) => rate,
        Err(error) => return error.with_request_id(request_id.0).into_response(),
    };
    if !rate.allowed {
        return rate_limited(&rate, request_id);
    }

    // The application's configured OAuth credentials supersede anything the
    // caller put in the request body.
    match state.service.oauth_config(&app.app_id, provider).await {
        Ok(Some(config)) => {
            if let Some(object) = body.as_object_mut() {
                object.insert("client_id".to_string(), json!(config.client_id));
                object.insert("client_secret".to_string(), json!(config.client_secret));
            }
        }
        Ok(None) => {}
        Err(error) => return error.with_request_id(request_id.0).into_response(),
    }

    let mut forwarded = state
        .service
        .forward(
            Downstream::Auth,
            Method::POST,
            &format!("/api/v1/auth/oauth/{provider}"),
            Some(&body),
        )
        .await;

    if forwarded.is_success() {
        state.service.rewrite_tokens(&mut forwarded.body, &app.app_id);

        // A first-time OAuth user gets provisioned like a registration.
        if forwarded.body["is_new_user"].as_bool().unwrap_or(false) {
            if let Some(user_id) = forwarded.body.pointer("/user/id").and_then(Value::as_str) {
                state.service.provision(&app, user_id).await;
            }
        }
    }

    relay(forwarded, request_id, Some(&rate))
}

async fn refresh<D: Dal>(
    State(state): State<RouterState<D>>,
    Extension(request_id): Extension<RequestId>,
    VerifiedApp(app): VerifiedApp,
    body: Bytes,
) -> Response {
    let body = match parse_body(&body, request_id) {
        Ok(body) => body,
        Err(response) => return *response,
    };

    let rate = match credential_gate(&state.service, &app, None, "auth/refresh").await {
        Ok(rate) => rate,
        Err(error) => return error.with_request_id(request_id.0).into_response(),
    };
    if !rate.allowed {
        return rate_limited(&rate, request_id);
    }

    let mut forwarded = state
        .service
        .forward(Downstream::Auth, Method::POST, "/api/v1/auth/refresh", Some(&body))
        .await;

    if forwarded.is_success() {
        state.service.rewrite_tokens(&mut forwarded.body, &app.app_id);
    }

    relay(forwarded, request_id, Some(&rate))
}

async fn get_user<D: Dal>(
    State(state): State<RouterState<D>>,
    Extension(request_id): Extension<RequestId>,
    BoundToken { claim, app }: BoundToken,
    Path(user_id): Path<String>,
) -> Response {
    let endpoint = format!("users/{user_id}");
    let rate = match bearer_gate(&state.service, &app, &claim, Some(&user_id), &endpoint).await {
        Ok(rate) => rate,
        Err(error) => return error.with_request_id(request_id.0).into_response(),
    };
    if !rate.allowed {
        return rate_limited(&rate, request_id);
    }

    let forwarded = state
        .service
        .forward(
            Downstream::User,
            Method::GET,
            &format!("/api/v1/users/{user_id}"),
            None,
        )
        .await;

    relay(forwarded, request_id, Some(&rate))
}

async fn get_user_roles<D: Dal>(
    State(state): State<RouterState<D>>,
    Extension(request_id): Extension<RequestId>,
    BoundToken { claim, app }: BoundToken,
    Path(user_id): Path<String>,
) -> Response {
    let endpoint = format!("users/{user_id}/roles");
    let rate = match bearer_gate(&state.service, &app, &claim, Some(&user_id), &endpoint).await {
        Ok(rate) => rate,
        Err(error) => return error.with_request_id(request_id.0).into_response(),
    };
    if !rate.allowed {
        return rate_limited(&rate, request_id);
    }

    let forwarded = state
        .service
        .forward(
            Downstream::Permission,
            Method::GET,
            &format!("/api/v1/permissions/users/{user_id}/roles"),
            None,
        )
        .await;

    relay(forwarded, request_id, Some(&rate))
}

async fn check_permission<D: Dal>(
    State(state): State<RouterState<D>>,
    Extension(request_id): Extension<RequestId>,
    BoundToken { claim, app }: BoundToken,
    Path(user_id): Path<String>,
    body: Bytes,
) -> Response {
    let body = match parse_body(&body, request_id) {
        Ok(body) => body,
        Err(response) => return *response,
    };

    let endpoint = format!("users/{user_id}/permissions/check");
    let rate = match bearer_gate(&state.service, &app, &claim, Some(&user_id), &endpoint).await {
        Ok(rate) => rate,
        Err(error) => return error.with_request_id(request_id.0).into_response(),
    };
    if !rate.allowed {
        return rate_limited(&rate, request_id);
    }

    let forwarded = state
        .service
        .forward(
            Downstream::Permission,
            Method::POST,
            &format!("/api/v1/permissions/users/{user_id}/check"),
            Some(&body),
        )
        .await;

    relay(forwarded, request_id, Some(&rate))
}

async fn change_password<D: Dal>(
    State(state): State<RouterState<D>>,
    Extension(request_id): Extension<RequestId>,
    BoundToken { claim, app }: BoundToken,
    body: Bytes,
) -> Response {
    let body = match parse_body(&body, request_id) {
        Ok(body) => body,
        Err(response) => return *response,
    };

    // No path target here, so the binding gate runs against the token's
    // own subject.
    let rate = match bearer_gate(&state.service, &app, &claim, None, "auth/change-password").await {
        Ok(rate) => rate,
        Err(error) => return error.with_request_id(request_id.0).into_response(),
    };
    if !rate.allowed {
        return rate_limited(&rate, request_id);
    }

    let forwarded = state
        .service
        .forward(
            Downstream::Auth,
            Method::POST,
            "/api/v1/auth/change-password",
            Some(&body),
        )
        .await;

    relay(forwarded, request_id, Some(&rate))
}
