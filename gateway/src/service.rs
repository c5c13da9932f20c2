use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use http::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use gatehouse_common::backends::cache::CacheBackend;
use gatehouse_common::claims::TokenKeys;
use gatehouse_common::models::application::{
    AppId, AppSnapshot, AppStatus, LoginMethod, OAuthConfig, ProvisionRule, Scope,
};
use gatehouse_common::secrets::{hash_app_secret, ConfigCipher};

use crate::audit::AuditSink;
use crate::cache::ConfigCache;
use crate::dal::{Dal, NewApplication};
use crate::provision::{self, ProvisionOutcome};
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::resolver::AppResolver;
use crate::router::{Downstream, Forwarded, ServiceRouter};
use crate::scopes;
use crate::{Error, ErrorKind};

/// Composition root for the request pipeline: resolvers, rate limiter,
/// downstream router, token keys and the audit sink, over one DAL and one
/// cache backend.
pub struct GatewayService<D> {
    dal: Arc<D>,
    resolver: AppResolver<D>,
    limiter: RateLimiter,
    router: ServiceRouter,
    tokens: TokenKeys,
    cipher: ConfigCipher,
    audit: AuditSink,
}

impl<D: Dal> GatewayService<D> {
    /// Initialize `GatewayService` and its required dependencies.
    pub fn init(
        dal: Arc<D>,
        backend: Arc<dyn CacheBackend>,
        router: ServiceRouter,
        tokens: TokenKeys,
        cipher: ConfigCipher,
        audit_queue_size: usize,
    ) -> Self {
        let cache = ConfigCache::new(backend.clone());
        let resolver = AppResolver::new(dal.clone(), cache, cipher.clone());
        let limiter = RateLimiter::new(backend);
        let audit = AuditSink::start(dal.clone(), audit_queue_size);

        Self {
            dal,
            resolver,
            limiter,
            router,
            tokens,
            cipher,
            audit,
        }
    }

    pub fn tokens(&self) -> &TokenKeys {
        &self.tokens
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    pub fn resolver(&self) -> &AppResolver<D> {
        &self.resolver
    }

    pub async fn verify_credentials(
        &self,
        app_id: &AppId,
        secret: &str,
    ) -> Result<AppSnapshot, Error> {
        self.resolver.verify(app_id, secret).await
    }

    /// Resolve the application a bearer token claims to come from. An
    /// unknown id means the token is not one of ours.
    pub async fn load_bound_app(&self, app_id: &AppId) -> Result<AppSnapshot, Error> {
        let Some(snapshot) = self.resolver.load(app_id).await? else {
            return Err(Error::custom(
                ErrorKind::InvalidToken,
                "token references an unknown application",
            ));
        };

        if !snapshot.is_active() {
            return Err(Error::from_kind(ErrorKind::AppDisabled));
        }

        Ok(snapshot)
    }

    /// Gate an endpoint bound to a specific login method.
    pub async fn require_method(&self, app_id: &AppId, method: LoginMethod) -> Result<(), Error> {
        let enabled = self.resolver.enabled_methods(app_id).await?;
        if enabled.contains(&method) {
            return Ok(());
        }

        let mut names: Vec<String> = enabled.iter().map(LoginMethod::to_string).collect();
        names.sort();

        Err(Error::custom(
            ErrorKind::LoginMethodDisabled,
            format!(
                "login method {method} is not enabled (enabled: {})",
                names.join(", ")
            ),
        ))
    }

    /// Enforce the endpoint→scope table against the application's grants.
    pub async fn check_scope(&self, app_id: &AppId, endpoint: &str) -> Result<(), Error> {
        let Some(required) = scopes::required_scope(endpoint) else {
            return Ok(());
        };

        if self.resolver.granted_scopes(app_id).await?.contains(&required) {
            return Ok(());
        }

        Err(Error::custom(
            ErrorKind::InsufficientScope,
            format!("application has not been granted the required scope: {required}"),
        ))
    }

    /// Run the rate-limit admission for one request.
    pub async fn admit(&self, app: &AppSnapshot) -> Result<RateLimitResult, Error> {
        Ok(self.limiter.check(&app.app_id, app.rate_limit).await?)
    }

    /// Require an app↔user binding for the target user of a bearer call.
    pub async fn ensure_binding(&self, app_id: &AppId, user_id: &str) -> Result<(), Error> {
        let Ok(user_id) = Uuid::parse_str(user_id) else {
            return Err(Error::from_kind(ErrorKind::UserNotBound));
        };

        if self.dal.is_user_bound(app_id, &user_id).await? {
            Ok(())
        } else {
            Err(Error::from_kind(ErrorKind::UserNotBound))
        }
    }

    pub async fn forward(
        &self,
        service: Downstream,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Forwarded {
        self.router.forward(service, method, path, body).await
    }

    pub async fn oauth_config(
        &self,
        app_id: &AppId,
        provider: LoginMethod,
    ) -> Result<Option<OAuthConfig>, Error> {
        self.resolver.oauth_config(app_id, provider).await
    }

    /// Rewrite any tokens embedded in a downstream auth response so they
    /// carry the calling application's binding. A token that fails to
    /// decode is left as it arrived.
    pub fn rewrite_tokens(&self, body: &mut Value, app_id: &AppId) {
        let Some(object) = body.as_object_mut() else {
            return;
        };

        if let Some(token) = object.get("access_token").and_then(Value::as_str) {
            match self.tokens.rewrite_access(token, app_id) {
                Ok(rewritten) => {
                    object.insert("access_token".to_string(), Value::String(rewritten));
                }
                Err(error) => warn!(%error, "leaving access token unrewritten"),
            }
        }

        if let Some(token) = object.get("refresh_token").and_then(Value::as_str) {
            match self.tokens.rewrite_refresh(token, app_id) {
                Ok(rewritten) => {
                    object.insert("refresh_token".to_string(), Value::String(rewritten));
                }
                Err(error) => warn!(%error, "leaving refresh token unrewritten"),
            }
        }
    }

    /// Post-registration side effect; never fails the caller's request.
    pub async fn provision(&self, app: &AppSnapshot, user_id: &str) -> Option<ProvisionOutcome> {
        provision::apply(self.dal.as_ref(), &self.audit, app, user_id).await
    }

    /// Aggregated health of the local components and every downstream
    /// service.
    pub async fn health(&self) -> HealthReport {
        let mut components = BTreeMap::new();

        components.insert(
            "database".to_string(),
            match self.dal.ping().await {
                Ok(()) => ComponentHealth::healthy("configuration store is reachable"),
                Err(error) => {
                    error!(
                        error = &error as &dyn std::error::Error,
                        "database health probe failed"
                    );
                    ComponentHealth::unhealthy("configuration store is unreachable")
                }
            },
        );

        components.insert(
            "cache".to_string(),
            match self.resolver.cache().ping().await {
                Ok(()) => ComponentHealth::healthy("cache is reachable"),
                Err(error) => {
                    error!(
                        error = &error as &dyn std::error::Error,
                        "cache health probe failed"
                    );
                    ComponentHealth::unhealthy("cache is unreachable")
                }
            },
        );

        components.insert(
            "message_bus".to_string(),
            ComponentHealth {
                status: "not_configured".to_string(),
                message: "the gateway carries no bus client".to_string(),
                response_time_ms: None,
            },
        );

        for service in self.router.services() {
            let report = self.router.probe(service).await;
            components.insert(
                format!("downstream_{service}"),
                ComponentHealth {
                    status: if report.healthy { "healthy" } else { "unhealthy" }.to_string(),
                    message: report.message,
                    response_time_ms: Some(report.response_time_ms),
                },
            );
        }

        HealthReport::aggregate(components)
    }

    /// Startup probe: log downstream availability and keep going either
    /// way (degraded mode).
    pub async fn probe_downstream(&self) {
        for service in self.router.services() {
            let report = self.router.probe(service).await;
            if report.healthy {
                info!(%service, response_time_ms = report.response_time_ms, "downstream service reachable");
            } else {
                warn!(%service, message = %report.message, "downstream service unreachable, starting degraded");
            }
        }
    }

    // The admin plane: configuration mutations plus the cache invalidation
    // each one requires.

    /// Register an application. The plaintext secret exists only in this
    /// return value.
    pub async fn admin_create_application(
        &self,
        name: String,
        description: Option<String>,
        rate_limit: u32,
    ) -> Result<(AppSnapshot, String), Error> {
        let secret = generate_secret();
        let snapshot = self
            .dal
            .create_application(NewApplication {
                name,
                description,
                app_id: AppId::generate(),
                secret_hash: hash_app_secret(&secret)?,
                rate_limit,
            })
            .await?;

        Ok((snapshot, secret))
    }

    pub async fn admin_set_status(&self, app_id: &AppId, status: AppStatus) -> Result<(), Error> {
        self.dal.update_status(app_id, status).await?;
        self.resolver.cache().invalidate_snapshot(app_id).await?;

        Ok(())
    }

    pub async fn admin_set_rate_limit(&self, app_id: &AppId, rate_limit: u32) -> Result<(), Error> {
        self.dal.update_rate_limit(app_id, rate_limit).await?;
        self.resolver.cache().invalidate_snapshot(app_id).await?;

        Ok(())
    }

    /// Rotate the application secret, returning the new plaintext once.
    pub async fn admin_rotate_secret(&self, app_id: &AppId) -> Result<String, Error> {
        let secret = generate_secret();
        self.dal
            .update_secret_hash(app_id, &hash_app_secret(&secret)?)
            .await?;
        self.resolver.cache().purge_app(app_id).await?;

        Ok(secret)
    }

    pub async fn admin_delete_application(&self, app_id: &AppId) -> Result<(), Error> {
        self.dal.delete_application(app_id).await?;
        self.resolver.cache().purge_app(app_id).await?;

        Ok(())
    }

    pub async fn admin_upsert_login_method(
        &self,
        app_id: &AppId,
        method: LoginMethod,
        is_enabled: bool,
        oauth: Option<&OAuthConfig>,
    ) -> Result<(), Error> {
        let blob = oauth.map(|config| self.cipher.seal(config)).transpose()?;

        self.dal
            .upsert_login_method(app_id, method, is_enabled, blob.as_deref())
            .await?;
        self.resolver.cache().invalidate_methods(app_id).await?;
        self.resolver.cache().evict_oauth_blob(app_id, method).await?;

        Ok(())
    }

    pub async fn admin_grant_scope(&self, app_id: &AppId, scope: Scope) -> Result<(), Error> {
        self.dal.grant_scope(app_id, scope).await?;
        self.resolver.cache().invalidate_scopes(app_id).await?;

        Ok(())
    }

    pub async fn admin_revoke_scope(&self, app_id: &AppId, scope: Scope) -> Result<(), Error> {
        self.dal.revoke_scope(app_id, scope).await?;
        self.resolver.cache().invalidate_scopes(app_id).await?;

        Ok(())
    }

    pub async fn admin_set_provision_rule(
        &self,
        app_id: &AppId,
        rule: &ProvisionRule,
    ) -> Result<(), Error> {
        self.dal.set_provision_rule(app_id, rule).await?;

        Ok(())
    }
}

fn generate_secret() -> String {
    format!(
        "{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
}

impl ComponentHealth {
    fn healthy(message: &str) -> Self {
        Self {
            status: "healthy".to_string(),
            message: message.to_string(),
            response_time_ms: None,
        }
    }

    fn unhealthy(message: &str) -> Self {
        Self {
            status: "unhealthy".to_string(),
            message: message.to_string(),
            response_time_ms: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthReport {
    fn aggregate(components: BTreeMap<String, ComponentHealth>) -> Self {
        let probed = components
            .values()
            .filter(|component| component.status != "not_configured")
            .count();
        let healthy = components
            .values()
            .filter(|component| component.status == "healthy")
            .count();
        let downstream_reachable = components
            .iter()
            .filter(|(name, _)| name.starts_with("downstream_"))
            .any(|(_, component)| component.status == "healthy");

        let (status, message) = if !downstream_reachable {
            ("unhealthy", "no downstream service is reachable".to_string())
        } else if healthy == probed {
            ("healthy", "all components are running".to_string())
        } else {
            ("degraded", format!("{healthy}/{probed} components are running"))
        };

        Self {
            status: status.to_string(),
            message,
            timestamp: Utc::now(),
            components,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        if self.status == "unhealthy" {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        }
    }
}
