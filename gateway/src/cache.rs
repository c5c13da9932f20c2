use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use gatehouse_common::backends::cache::{CacheBackend, CacheError};
use gatehouse_common::models::application::{AppId, AppSnapshot, LoginMethod, Scope};

/// How long derived configuration lives in the cache.
pub const APP_CACHE_TTL: Duration = Duration::from_secs(300);

pub fn app_key(app_id: &AppId) -> String {
    format!("app:{app_id}")
}

pub fn methods_key(app_id: &AppId) -> String {
    format!("app:{app_id}:methods")
}

pub fn scopes_key(app_id: &AppId) -> String {
    format!("app:{app_id}:scopes")
}

pub fn oauth_key(app_id: &AppId, provider: LoginMethod) -> String {
    format!("app:{app_id}:oauth:{provider}")
}

pub fn rate_limit_key(app_id: &AppId) -> String {
    format!("rate_limit:{app_id}")
}

/// Typed access to the derived configuration keys.
///
/// Values parsed out of the cache are never trusted blindly: anything that
/// fails to parse is treated as corruption, evicted, and reported as a miss
/// so the caller falls back to the store.
#[derive(Clone)]
pub struct ConfigCache {
    backend: Arc<dyn CacheBackend>,
}

impl ConfigCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<dyn CacheBackend> {
        self.backend.clone()
    }

    pub async fn app_snapshot(&self, app_id: &AppId) -> Result<Option<AppSnapshot>, CacheError> {
        let key = app_key(app_id);
        let Some(raw) = self.backend.get(&key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(error) => {
                warn!(
                    error = &error as &dyn std::error::Error,
                    %key,
                    "evicting unparsable cached snapshot"
                );
                self.backend.delete(&key).await?;
                Ok(None)
            }
        }
    }

    pub async fn store_app_snapshot(&self, snapshot: &AppSnapshot) -> Result<(), CacheError> {
        let raw = serde_json::to_string(snapshot).expect("snapshot serialization is infallible");

        self.backend
            .set_ex(&app_key(&snapshot.app_id), &raw, APP_CACHE_TTL)
            .await
    }

    pub async fn enabled_methods(
        &self,
        app_id: &AppId,
    ) -> Result<Option<HashSet<LoginMethod>>, CacheError> {
        let members = self.backend.set_members(&methods_key(app_id)).await?;
        if members.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            members
                .iter()
                .filter_map(|member| member.parse().ok())
                .collect(),
        ))
    }

    pub async fn store_enabled_methods(
        &self,
        app_id: &AppId,
        methods: &HashSet<LoginMethod>,
    ) -> Result<(), CacheError> {
        let members = methods
            .iter()
            .map(|method| method.to_string())
            .collect::<Vec<_>>();

        self.backend
            .set_add(&methods_key(app_id), &members, APP_CACHE_TTL)
            .await
    }

    pub async fn granted_scopes(&self, app_id: &AppId) -> Result<Option<HashSet<Scope>>, CacheError> {
        let members = self.backend.set_members(&scopes_key(app_id)).await?;
        if members.is_empty() {
            return Ok(None);
        }

        Ok(Some(
            members
                .iter()
                .filter_map(|member| member.parse().ok())
                .collect(),
        ))
    }

    pub async fn store_granted_scopes(
        &self,
        app_id: &AppId,
        scopes: &HashSet<Scope>,
    ) -> Result<(), CacheError> {
        let members = scopes
            .iter()
            .map(|scope| scope.to_string())
            .collect::<Vec<_>>();

        self.backend
            .set_add(&scopes_key(app_id), &members, APP_CACHE_TTL)
            .await
    }

    /// The sealed OAuth blob; stored and returned verbatim, never decrypted
    /// in here.
    pub async fn oauth_blob(
        &self,
        app_id: &AppId,
        provider: LoginMethod,
    ) -> Result<Option<String>, CacheError> {
        self.backend.get(&oauth_key(app_id, provider)).await
    }

    pub async fn store_oauth_blob(
        &self,
        app_id: &AppId,
        provider: LoginMethod,
        blob: &str,
    ) -> Result<(), CacheError> {
        self.backend
            .set_ex(&oauth_key(app_id, provider), blob, APP_CACHE_TTL)
            .await
    }

    pub async fn evict_oauth_blob(
        &self,
        app_id: &AppId,
        provider: LoginMethod,
    ) -> Result<bool, CacheError> {
        self.backend.delete(&oauth_key(app_id, provider)).await
    }

    pub async fn invalidate_snapshot(&self, app_id: &AppId) -> Result<bool, CacheError> {
        self.backend.delete(&app_key(app_id)).await
    }

    pub async fn invalidate_methods(&self, app_id: &AppId) -> Result<bool, CacheError> {
        self.backend.delete(&methods_key(app_id)).await
    }

    pub async fn invalidate_scopes(&self, app_id: &AppId) -> Result<bool, CacheError> {
        self.backend.delete(&scopes_key(app_id)).await
    }

    /// Drop every key derived from an application. Used on deletion and on
    /// credential rotation.
    pub async fn purge_app(&self, app_id: &AppId) -> Result<u64, CacheError> {
        self.backend.delete_prefix(&format!("app:{app_id}")).await
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.backend.ping().await
    }
}
