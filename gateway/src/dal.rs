use std::fmt;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::migrate::{MigrateDatabase, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow};
use sqlx::{query, Row, SqlitePool};
use tracing::{error, info, warn};
use uuid::Uuid;

use gatehouse_common::models::application::{
    AppId, AppSnapshot, AppStatus, LoginMethod, ProvisionRule, Scope,
};

use crate::audit::AuditRecord;
use crate::provision::ProvisionOutcome;

pub static MIGRATIONS: Migrator = sqlx::migrate!("./migrations");

#[derive(thiserror::Error, Debug)]
pub enum DalError {
    Sqlx(#[from] sqlx::Error),
    ApplicationNotFound,
    Corrupt(&'static str),
}

// We are not using `thiserror`'s `#[error]` syntax to prevent sensitive
// details from bubbling up to callers. Instead we log the detail here and
// display a safe message only.
impl fmt::Display for DalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DalError::Sqlx(error) => {
                error!(error = error.to_string(), "database request failed");

                "failed to interact with the configuration store"
            }
            DalError::ApplicationNotFound => "application not found",
            DalError::Corrupt(column) => {
                error!(column, "configuration store row failed to parse");

                "configuration store row is corrupt"
            }
        };

        write!(f, "{msg}")
    }
}

/// Everything the gateway reads from, and the few things it writes to, the
/// shared configuration store.
#[async_trait]
pub trait Dal: Send + Sync + 'static {
    /// Load the snapshot of an application by its external id.
    async fn get_application(&self, app_id: &AppId) -> Result<Option<AppSnapshot>, DalError>;

    /// Login methods currently enabled for an application.
    async fn get_enabled_methods(&self, app_id: &AppId) -> Result<Vec<LoginMethod>, DalError>;

    /// Scopes granted to an application.
    async fn get_scopes(&self, app_id: &AppId) -> Result<Vec<Scope>, DalError>;

    /// The sealed OAuth blob for an enabled provider, verbatim.
    async fn get_oauth_blob(
        &self,
        app_id: &AppId,
        provider: LoginMethod,
    ) -> Result<Option<String>, DalError>;

    /// Whether a user is bound to an application's realm.
    async fn is_user_bound(&self, app_id: &AppId, user_id: &Uuid) -> Result<bool, DalError>;

    async fn get_provision_rule(&self, app_id: &AppId) -> Result<Option<ProvisionRule>, DalError>;

    /// Bind a user to an application and apply the provision rule, all in
    /// one transaction. Individual steps are idempotent and tolerated on
    /// failure; the outcome reports what actually happened.
    async fn provision_user(
        &self,
        app_id: &AppId,
        user_id: &Uuid,
        rule: Option<&ProvisionRule>,
    ) -> Result<ProvisionOutcome, DalError>;

    async fn insert_audit_record(&self, record: &AuditRecord) -> Result<(), DalError>;

    async fn ping(&self) -> Result<(), DalError>;

    // The admin plane. The gateway itself does not serve these; they back
    // the configuration surface and the cache invalidation that follows it.

    async fn create_application(&self, app: NewApplication) -> Result<AppSnapshot, DalError>;

    async fn update_status(&self, app_id: &AppId, status: AppStatus) -> Result<(), DalError>;

    async fn update_rate_limit(&self, app_id: &AppId, rate_limit: u32) -> Result<(), DalError>;

    async fn update_secret_hash(&self, app_id: &AppId, secret_hash: &str) -> Result<(), DalError>;

    /// Delete an application and everything it owns.
    async fn delete_application(&self, app_id: &AppId) -> Result<(), DalError>;

    async fn upsert_login_method(
        &self,
        app_id: &AppId,
        method: LoginMethod,
        is_enabled: bool,
        oauth_blob: Option<&str>,
    ) -> Result<(), DalError>;

    async fn grant_scope(&self, app_id: &AppId, scope: Scope) -> Result<(), DalError>;

    async fn revoke_scope(&self, app_id: &AppId, scope: Scope) -> Result<(), DalError>;

    async fn set_provision_rule(
        &self,
        app_id: &AppId,
        rule: &ProvisionRule,
    ) -> Result<(), DalError>;
}

/// Fields an admin supplies when registering a new application. The secret
/// arrives pre-hashed; the plaintext never crosses this boundary.
#[derive(Clone, Debug)]
pub struct NewApplication {
    pub name: String,
    pub description: Option<String>,
    pub app_id: AppId,
    pub secret_hash: String,
    pub rate_limit: u32,
}

#[derive(Clone)]
pub struct Sqlite {
    pool: SqlitePool,
}

impl Sqlite {
    /// This function creates all necessary tables and sets up a database
    /// connection pool.
    pub async fn new(path: &str) -> Self {
        if !Path::new(path).exists() {
            sqlx::Sqlite::create_database(path).await.unwrap();
        }

        info!(
            "state db: {}",
            std::fs::canonicalize(path).unwrap().to_string_lossy()
        );

        let sqlite_options = SqliteConnectOptions::from_str(path)
            .unwrap()
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(sqlite_options).await.unwrap();

        Self::from_pool(pool).await
    }

    /// A utility for creating and migrating an in-memory database for
    /// testing.
    pub async fn new_in_memory() -> Self {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Self {
        MIGRATIONS.run(&pool).await.unwrap();

        Self { pool }
    }

    async fn internal_id(&self, app_id: &AppId) -> Result<String, DalError> {
        query("SELECT id FROM applications WHERE app_id = ?1")
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.get("id"))
            .ok_or(DalError::ApplicationNotFound)
    }
}

fn snapshot_from_row(row: &SqliteRow) -> Result<AppSnapshot, DalError> {
    let id: String = row.get("id");

    Ok(AppSnapshot {
        id: Uuid::parse_str(&id).map_err(|_| DalError::Corrupt("applications.id"))?,
        name: row.get("name"),
        app_id: row.get("app_id"),
        secret_hash: row.get("app_secret_hash"),
        status: row.get("status"),
        rate_limit: row.get::<i64, _>("rate_limit") as u32,
    })
}

#[async_trait]
impl Dal for Sqlite {
    async fn get_application(&self, app_id: &AppId) -> Result<Option<AppSnapshot>, DalError> {
        query(
            "SELECT id, name, app_id, app_secret_hash, status, rate_limit FROM applications WHERE app_id = ?1",
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?
        .map(|row| snapshot_from_row(&row))
        .transpose()
    }

    async fn get_enabled_methods(&self, app_id: &AppId) -> Result<Vec<LoginMethod>, DalError> {
        let methods = query(
            "SELECT method FROM app_login_methods
             WHERE application_id = (SELECT id FROM applications WHERE app_id = ?1)
               AND is_enabled = TRUE",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.get("method"))
        .collect();

        Ok(methods)
    }

    async fn get_scopes(&self, app_id: &AppId) -> Result<Vec<Scope>, DalError> {
        query(
            "SELECT scope FROM app_scopes
             WHERE application_id = (SELECT id FROM applications WHERE app_id = ?1)",
        )
        .bind(app_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            row.get::<String, _>("scope")
                .parse()
                .map_err(|_| DalError::Corrupt("app_scopes.scope"))
        })
        .collect()
    }

    async fn get_oauth_blob(
        &self,
        app_id: &AppId,
        provider: LoginMethod,
    ) -> Result<Option<String>, DalError> {
        let blob = query(
            "SELECT oauth_config FROM app_login_methods
             WHERE application_id = (SELECT id FROM applications WHERE app_id = ?1)
               AND method = ?2
               AND is_enabled = TRUE",
        )
        .bind(app_id)
        .bind(provider)
        .fetch_optional(&self.pool)
        .await?
        .and_then(|row| row.get("oauth_config"));

        Ok(blob)
    }

    async fn is_user_bound(&self, app_id: &AppId, user_id: &Uuid) -> Result<bool, DalError> {
        let bound = query(
            "SELECT 1 FROM app_users
             WHERE application_id = (SELECT id FROM applications WHERE app_id = ?1)
               AND user_id = ?2",
        )
        .bind(app_id)
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .is_some();

        Ok(bound)
    }

    async fn get_provision_rule(&self, app_id: &AppId) -> Result<Option<ProvisionRule>, DalError> {
        let Some(row) = query(
            "SELECT role_ids, permission_ids, organization_id, subscription_plan_id, is_enabled
             FROM auto_provision_configs
             WHERE application_id = (SELECT id FROM applications WHERE app_id = ?1)",
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let role_ids: Vec<Uuid> = serde_json::from_str(&row.get::<String, _>("role_ids"))
            .map_err(|_| DalError::Corrupt("auto_provision_configs.role_ids"))?;
        let permission_ids: Vec<Uuid> =
            serde_json::from_str(&row.get::<String, _>("permission_ids"))
                .map_err(|_| DalError::Corrupt("auto_provision_configs.permission_ids"))?;
        let organization_id = row
            .get::<Option<String>, _>("organization_id")
            .map(|id| {
                Uuid::parse_str(&id).map_err(|_| DalError::Corrupt("auto_provision_configs.organization_id"))
            })
            .transpose()?;
        let subscription_plan_id = row
            .get::<Option<String>, _>("subscription_plan_id")
            .map(|id| {
                Uuid::parse_str(&id)
                    .map_err(|_| DalError::Corrupt("auto_provision_configs.subscription_plan_id"))
            })
            .transpose()?;

        Ok(Some(ProvisionRule {
            role_ids,
            permission_ids,
            organization_id,
            subscription_plan_id,
            is_enabled: row.get("is_enabled"),
        }))
    }

    async fn provision_user(
        &self,
        app_id: &AppId,
        user_id: &Uuid,
        rule: Option<&ProvisionRule>,
    ) -> Result<ProvisionOutcome, DalError> {
        let mut outcome = ProvisionOutcome::default();
        let mut tx = self.pool.begin().await?;

        let internal_id: String = query("SELECT id FROM applications WHERE app_id = ?1")
            .bind(app_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.get("id"))
            .ok_or(DalError::ApplicationNotFound)?;

        let user = user_id.to_string();

        // The binding is the one mandatory step; even it only warns on
        // failure since the downstream registration cannot be undone.
        match query("INSERT OR IGNORE INTO app_users (id, application_id, user_id) VALUES (?1, ?2, ?3)")
            .bind(Uuid::new_v4().to_string())
            .bind(&internal_id)
            .bind(&user)
            .execute(&mut *tx)
            .await
        {
            Ok(done) => outcome.newly_bound = done.rows_affected() > 0,
            Err(error) => {
                warn!(
                    error = &error as &dyn std::error::Error,
                    "failed to create app user binding"
                );
                outcome.failures.push("app_user_binding".to_string());
            }
        }

        if let Some(rule) = rule {
            if rule.is_enabled {
                for role_id in &rule.role_ids {
                    match query("INSERT OR IGNORE INTO user_roles (user_id, role_id) VALUES (?1, ?2)")
                        .bind(&user)
                        .bind(role_id.to_string())
                        .execute(&mut *tx)
                        .await
                    {
                        Ok(done) if done.rows_affected() > 0 => outcome.roles_assigned += 1,
                        Ok(_) => {}
                        Err(_) => outcome.failures.push(format!("role:{role_id}")),
                    }
                }

                for permission_id in &rule.permission_ids {
                    match query(
                        "INSERT OR IGNORE INTO user_permissions (user_id, permission_id) VALUES (?1, ?2)",
                    )
                    .bind(&user)
                    .bind(permission_id.to_string())
                    .execute(&mut *tx)
                    .await
                    {
                        Ok(done) if done.rows_affected() > 0 => outcome.permissions_assigned += 1,
                        Ok(_) => {}
                        Err(_) => outcome.failures.push(format!("permission:{permission_id}")),
                    }
                }

                if let Some(organization_id) = rule.organization_id {
                    match query(
                        "INSERT OR IGNORE INTO user_organizations (user_id, organization_id) VALUES (?1, ?2)",
                    )
                    .bind(&user)
                    .bind(organization_id.to_string())
                    .execute(&mut *tx)
                    .await
                    {
                        Ok(done) => outcome.organization_joined = done.rows_affected() > 0,
                        Err(_) => outcome.failures.push(format!("organization:{organization_id}")),
                    }
                }

                if let Some(plan_id) = rule.subscription_plan_id {
                    // Skip when a non-terminated subscription for this plan
                    // already exists.
                    match query(
                        "INSERT INTO user_subscriptions (id, user_id, plan_id, status)
                         SELECT ?1, ?2, ?3, 'active'
                         WHERE NOT EXISTS (
                             SELECT 1 FROM user_subscriptions
                             WHERE user_id = ?2 AND plan_id = ?3 AND status != 'terminated'
                         )",
                    )
                    .bind(Uuid::new_v4().to_string())
                    .bind(&user)
                    .bind(plan_id.to_string())
                    .execute(&mut *tx)
                    .await
                    {
                        Ok(done) => outcome.subscribed = done.rows_affected() > 0,
                        Err(_) => outcome.failures.push(format!("subscription:{plan_id}")),
                    }
                }
            }
        }

        tx.commit().await?;

        Ok(outcome)
    }

    async fn insert_audit_record(&self, record: &AuditRecord) -> Result<(), DalError> {
        let details = record
            .details
            .as_ref()
            .map(|details| details.to_string());

        query(
            "INSERT INTO audit_logs (id, request_id, app_id, action, method, path, status_code, elapsed_ms, ip_address, user_agent, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&record.request_id)
        .bind(&record.app_id)
        .bind(&record.action)
        .bind(&record.method)
        .bind(&record.path)
        .bind(record.status as i64)
        .bind(record.elapsed_ms as i64)
        .bind(&record.client_ip)
        .bind(&record.user_agent)
        .bind(details)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), DalError> {
        query("SELECT 1").execute(&self.pool).await?;

        Ok(())
    }

    async fn create_application(&self, app: NewApplication) -> Result<AppSnapshot, DalError> {
        let id = Uuid::new_v4();

        query(
            "INSERT INTO applications (id, name, description, app_id, app_secret_hash, rate_limit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(id.to_string())
        .bind(&app.name)
        .bind(&app.description)
        .bind(&app.app_id)
        .bind(&app.secret_hash)
        .bind(app.rate_limit as i64)
        .execute(&self.pool)
        .await?;

        Ok(AppSnapshot {
            id,
            name: app.name,
            app_id: app.app_id,
            secret_hash: app.secret_hash,
            status: AppStatus::Active,
            rate_limit: app.rate_limit,
        })
    }

    async fn update_status(&self, app_id: &AppId, status: AppStatus) -> Result<(), DalError> {
        let rows_affected = query(
            "UPDATE applications SET status = ?1, updated_at = CURRENT_TIMESTAMP WHERE app_id = ?2",
        )
        .bind(status)
        .bind(app_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected > 0 {
            Ok(())
        } else {
            Err(DalError::ApplicationNotFound)
        }
    }

    async fn update_rate_limit(&self, app_id: &AppId, rate_limit: u32) -> Result<(), DalError> {
        let rows_affected = query(
            "UPDATE applications SET rate_limit = ?1, updated_at = CURRENT_TIMESTAMP WHERE app_id = ?2",
        )
        .bind(rate_limit as i64)
        .bind(app_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected > 0 {
            Ok(())
        } else {
            Err(DalError::ApplicationNotFound)
        }
    }

    async fn update_secret_hash(&self, app_id: &AppId, secret_hash: &str) -> Result<(), DalError> {
        let rows_affected = query(
            "UPDATE applications SET app_secret_hash = ?1, updated_at = CURRENT_TIMESTAMP WHERE app_id = ?2",
        )
        .bind(secret_hash)
        .bind(app_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected > 0 {
            Ok(())
        } else {
            Err(DalError::ApplicationNotFound)
        }
    }

    async fn delete_application(&self, app_id: &AppId) -> Result<(), DalError> {
        let internal_id = self.internal_id(app_id).await?;
        let mut tx = self.pool.begin().await?;

        for table in [
            "app_login_methods",
            "app_scopes",
            "app_users",
            "auto_provision_configs",
        ] {
            query(&format!("DELETE FROM {table} WHERE application_id = ?1"))
                .bind(&internal_id)
                .execute(&mut *tx)
                .await?;
        }

        query("DELETE FROM applications WHERE id = ?1")
            .bind(&internal_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    async fn upsert_login_method(
        &self,
        app_id: &AppId,
        method: LoginMethod,
        is_enabled: bool,
        oauth_blob: Option<&str>,
    ) -> Result<(), DalError> {
        let internal_id = self.internal_id(app_id).await?;

        query(
            "INSERT INTO app_login_methods (id, application_id, method, is_enabled, oauth_config)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (application_id, method) DO UPDATE
             SET is_enabled = excluded.is_enabled,
                 oauth_config = excluded.oauth_config,
                 updated_at = CURRENT_TIMESTAMP",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&internal_id)
        .bind(method)
        .bind(is_enabled)
        .bind(oauth_blob)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn grant_scope(&self, app_id: &AppId, scope: Scope) -> Result<(), DalError> {
        let internal_id = self.internal_id(app_id).await?;

        query(
            "INSERT OR IGNORE INTO app_scopes (id, application_id, scope) VALUES (?1, ?2, ?3)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&internal_id)
        .bind(scope.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn revoke_scope(&self, app_id: &AppId, scope: Scope) -> Result<(), DalError> {
        let internal_id = self.internal_id(app_id).await?;

        query("DELETE FROM app_scopes WHERE application_id = ?1 AND scope = ?2")
            .bind(&internal_id)
            .bind(scope.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn set_provision_rule(
        &self,
        app_id: &AppId,
        rule: &ProvisionRule,
    ) -> Result<(), DalError> {
        let internal_id = self.internal_id(app_id).await?;

        let role_ids = serde_json::to_string(&rule.role_ids)
            .map_err(|_| DalError::Corrupt("auto_provision_configs.role_ids"))?;
        let permission_ids = serde_json::to_string(&rule.permission_ids)
            .map_err(|_| DalError::Corrupt("auto_provision_configs.permission_ids"))?;

        query(
            "INSERT INTO auto_provision_configs (id, application_id, role_ids, permission_ids, organization_id, subscription_plan_id, is_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (application_id) DO UPDATE
             SET role_ids = excluded.role_ids,
                 permission_ids = excluded.permission_ids,
                 organization_id = excluded.organization_id,
                 subscription_plan_id = excluded.subscription_plan_id,
                 is_enabled = excluded.is_enabled,
                 updated_at = CURRENT_TIMESTAMP",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&internal_id)
        .bind(role_ids)
        .bind(permission_ids)
        .bind(rule.organization_id.map(|id| id.to_string()))
        .bind(rule.subscription_plan_id.map(|id| id.to_string()))
        .bind(rule.is_enabled)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
