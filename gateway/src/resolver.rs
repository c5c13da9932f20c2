use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use gatehouse_common::models::application::{
    AppId, AppSnapshot, LoginMethod, OAuthConfig, Scope,
};
use gatehouse_common::secrets::{verify_app_secret, ConfigCipher};

use crate::cache::ConfigCache;
use crate::dal::Dal;
use crate::{Error, ErrorKind};

/// Cache-aside resolution of per-application configuration: the snapshot
/// itself, the enabled login methods, the granted scopes and the OAuth
/// provider credentials.
pub struct AppResolver<D> {
    dal: Arc<D>,
    cache: ConfigCache,
    cipher: ConfigCipher,
}

impl<D: Dal> AppResolver<D> {
    pub fn new(dal: Arc<D>, cache: ConfigCache, cipher: ConfigCipher) -> Self {
        Self { dal, cache, cipher }
    }

    pub fn cache(&self) -> &ConfigCache {
        &self.cache
    }

    /// Load an application snapshot, populating the cache on a miss.
    /// Returns `None` only when the record does not exist.
    pub async fn load(&self, app_id: &AppId) -> Result<Option<AppSnapshot>, Error> {
        if let Some(snapshot) = self.cache.app_snapshot(app_id).await? {
            return Ok(Some(snapshot));
        }

        let Some(snapshot) = self.dal.get_application(app_id).await? else {
            return Ok(None);
        };

        self.cache.store_app_snapshot(&snapshot).await?;

        Ok(Some(snapshot))
    }

    /// Verify application credentials.
    ///
    /// Unknown ids and mismatched secrets are indistinguishable to the
    /// caller, and the secret is always checked before the status is: the
    /// error code must not become an oracle for application existence or
    /// state.
    pub async fn verify(&self, app_id: &AppId, secret: &str) -> Result<AppSnapshot, Error> {
        let Some(snapshot) = self.load(app_id).await? else {
            return Err(Error::from_kind(ErrorKind::InvalidCredentials));
        };

        if !verify_app_secret(secret, &snapshot.secret_hash) {
            return Err(Error::from_kind(ErrorKind::InvalidCredentials));
        }

        if !snapshot.is_active() {
            return Err(Error::from_kind(ErrorKind::AppDisabled));
        }

        Ok(snapshot)
    }

    /// The set of login methods enabled for an application. Empty for an
    /// unknown application; the empty set is never written back.
    pub async fn enabled_methods(&self, app_id: &AppId) -> Result<HashSet<LoginMethod>, Error> {
        if let Some(methods) = self.cache.enabled_methods(app_id).await? {
            return Ok(methods);
        }

        let methods: HashSet<LoginMethod> = self
            .dal
            .get_enabled_methods(app_id)
            .await?
            .into_iter()
            .collect();

        if !methods.is_empty() {
            self.cache.store_enabled_methods(app_id, &methods).await?;
        }

        Ok(methods)
    }

    /// The set of scopes granted to an application, same discipline as
    /// [`Self::enabled_methods`].
    pub async fn granted_scopes(&self, app_id: &AppId) -> Result<HashSet<Scope>, Error> {
        if let Some(scopes) = self.cache.granted_scopes(app_id).await? {
            return Ok(scopes);
        }

        let scopes: HashSet<Scope> = self.dal.get_scopes(app_id).await?.into_iter().collect();

        if !scopes.is_empty() {
            self.cache.store_granted_scopes(app_id, &scopes).await?;
        }

        Ok(scopes)
    }

    /// The decrypted OAuth credentials for an enabled provider.
    ///
    /// The cache holds ciphertext only. A cached blob that fails to decrypt
    /// is treated as corruption (or a rotated key): evict and fall back to
    /// the store.
    pub async fn oauth_config(
        &self,
        app_id: &AppId,
        provider: LoginMethod,
    ) -> Result<Option<OAuthConfig>, Error> {
        if let Some(blob) = self.cache.oauth_blob(app_id, provider).await? {
            match self.cipher.unseal(&blob) {
                Ok(config) => return Ok(Some(config)),
                Err(error) => {
                    warn!(
                        error = &error as &dyn std::error::Error,
                        %app_id,
                        %provider,
                        "cached oauth blob failed to decrypt, evicting"
                    );
                    self.cache.evict_oauth_blob(app_id, provider).await?;
                }
            }
        }

        let Some(blob) = self.dal.get_oauth_blob(app_id, provider).await? else {
            return Ok(None);
        };

        self.cache.store_oauth_blob(app_id, provider, &blob).await?;

        let config = self
            .cipher
            .unseal(&blob)
            .map_err(|err| Error::source(ErrorKind::Internal, err))?;

        Ok(Some(config))
    }
}
