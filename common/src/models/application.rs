use std::fmt::{self, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};
use uuid::Uuid;

/// Externally visible identifier of a third party application.
///
/// Opaque to the gateway; the internal handle is the row's [`Uuid`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    /// Mint a fresh identifier for a new application.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AppId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for AppId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AppStatus {
    Active,
    Disabled,
}

/// A way a user can authenticate through an application.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum LoginMethod {
    Email,
    Phone,
    Wechat,
    Alipay,
    Google,
    Apple,
}

impl LoginMethod {
    /// Methods that authenticate through an external OAuth provider and
    /// therefore carry per-application client credentials.
    pub fn is_oauth(&self) -> bool {
        matches!(self, Self::Wechat | Self::Alipay | Self::Google | Self::Apple)
    }
}

/// A capability an application must hold to reach an endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum Scope {
    #[serde(rename = "user:read")]
    #[strum(serialize = "user:read")]
    UserRead,

    #[serde(rename = "user:write")]
    #[strum(serialize = "user:write")]
    UserWrite,

    #[serde(rename = "auth:login")]
    #[strum(serialize = "auth:login")]
    AuthLogin,

    #[serde(rename = "auth:register")]
    #[strum(serialize = "auth:register")]
    AuthRegister,

    #[serde(rename = "role:read")]
    #[strum(serialize = "role:read")]
    RoleRead,

    #[serde(rename = "role:write")]
    #[strum(serialize = "role:write")]
    RoleWrite,

    #[serde(rename = "org:read")]
    #[strum(serialize = "org:read")]
    OrgRead,

    #[serde(rename = "org:write")]
    #[strum(serialize = "org:write")]
    OrgWrite,
}

/// Projection of an application row holding everything the request pipeline
/// needs without going back to the store. This is the value cached under
/// `app:{app_id}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppSnapshot {
    pub id: Uuid,
    pub name: String,
    pub app_id: AppId,
    pub secret_hash: String,
    pub status: AppStatus,
    pub rate_limit: u32,
}

impl AppSnapshot {
    pub fn is_active(&self) -> bool {
        self.status == AppStatus::Active
    }
}

/// Decrypted per-application OAuth provider credentials.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// Recipe applied to a user the first time they register through an
/// application. At most one per application.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRule {
    pub role_ids: Vec<Uuid>,
    pub permission_ids: Vec<Uuid>,
    pub organization_id: Option<Uuid>,
    pub subscription_plan_id: Option<Uuid>,
    pub is_enabled: bool,
}
