use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::models::application::AppId;

/// Issuer written into every token the gateway signs.
const ISS: &str = "gatehouse";

/// Minutes before an access token expires.
pub const ACCESS_EXP_MINUTES: i64 = 15;

/// Days before a refresh token expires.
pub const REFRESH_EXP_DAYS: i64 = 14;

/// The two decode outcomes callers must tell apart: an expired signature is
/// reported to clients differently from every other decode failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is expired")]
    Expired,
    #[error("token is invalid")]
    Invalid,
}

/// The claims the gateway itself reads, plus everything else an upstream
/// issuer put in the token, preserved verbatim in `extra`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Claim {
    /// Expiration time (as UTC timestamp).
    pub exp: usize,
    /// Issued at (as UTC timestamp).
    pub iat: usize,
    /// Issuer.
    pub iss: String,
    /// Subject (whom the token refers to).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub: String,
    /// The application this token is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    /// Claims the gateway does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Claim {
    /// Create a new access token claim for a subject.
    pub fn new_access(sub: String, app_id: Option<String>, extra: Map<String, Value>) -> Self {
        Self::issued(sub, app_id, extra, Duration::minutes(ACCESS_EXP_MINUTES))
    }

    /// Create a new refresh token claim for a subject.
    pub fn new_refresh(sub: String, app_id: Option<String>, extra: Map<String, Value>) -> Self {
        Self::issued(sub, app_id, extra, Duration::days(REFRESH_EXP_DAYS))
    }

    fn issued(
        sub: String,
        app_id: Option<String>,
        extra: Map<String, Value>,
        validity: Duration,
    ) -> Self {
        let iat = Utc::now();
        let exp = iat + validity;

        Self {
            exp: exp.timestamp() as usize,
            iat: iat.timestamp() as usize,
            iss: ISS.to_string(),
            sub,
            app_id,
            extra,
        }
    }
}

/// Signs and verifies the bearer tokens the gateway issues and accepts.
///
/// The signing secret is shared process-wide configuration; downstream
/// token issuance uses the same secret, which is what allows the gateway to
/// decode a freshly issued token and re-sign it with the application
/// binding added.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn encode(&self, claim: &Claim) -> Result<String, jsonwebtoken::errors::Error> {
        encode(&Header::new(Algorithm::HS256), claim, &self.encoding)
    }

    pub fn decode(&self, token: &str) -> Result<Claim, TokenError> {
        let validation = Validation::new(Algorithm::HS256);

        decode::<Claim>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => {
                    debug!(
                        error = &err as &dyn std::error::Error,
                        "failed to decode token"
                    );
                    TokenError::Invalid
                }
            })
    }

    /// Re-sign an access token with the gateway's key, binding it to `app_id`.
    ///
    /// The JWT registered claims (`exp`, `iat`, `iss`) are replaced with the
    /// gateway's own; everything else the upstream issuer put in the token is
    /// carried over untouched.
    pub fn rewrite_access(&self, token: &str, app_id: &AppId) -> Result<String, TokenError> {
        let claim = self.decode(token)?;
        let reissued = Claim::new_access(claim.sub, Some(app_id.to_string()), claim.extra);

        self.encode(&reissued).map_err(|err| {
            debug!(
                error = &err as &dyn std::error::Error,
                "failed to re-sign access token"
            );
            TokenError::Invalid
        })
    }

    /// Same as [`Self::rewrite_access`] for refresh tokens.
    pub fn rewrite_refresh(&self, token: &str, app_id: &AppId) -> Result<String, TokenError> {
        let claim = self.decode(token)?;
        let reissued = Claim::new_refresh(claim.sub, Some(app_id.to_string()), claim.extra);

        self.encode(&reissued).map_err(|err| {
            debug!(
                error = &err as &dyn std::error::Error,
                "failed to re-sign refresh token"
            );
            TokenError::Invalid
        })
    }
}
