use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use gatehouse_common::models::application::AppSnapshot;

use crate::audit::{AuditRecord, AuditSink};
use crate::dal::Dal;

/// What a provisioning run actually did. Counters only cover rows created
/// by this run; rows that already existed are skipped silently.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProvisionOutcome {
    pub newly_bound: bool,
    pub roles_assigned: usize,
    pub permissions_assigned: usize,
    pub organization_joined: bool,
    pub subscribed: bool,
    /// Steps that failed; each is tolerated so the rest can proceed.
    pub failures: Vec<String>,
}

impl ProvisionOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }
}

/// Materialize the app↔user binding and apply the application's
/// auto-provision rule after a first successful registration.
///
/// The registration already succeeded downstream, so nothing here may fail
/// the caller's request: every problem is logged, and a partial run leaves
/// an audit record behind instead of an error.
pub async fn apply<D: Dal>(
    dal: &D,
    audit: &AuditSink,
    app: &AppSnapshot,
    user_id: &str,
) -> Option<ProvisionOutcome> {
    let Ok(user_id) = Uuid::parse_str(user_id) else {
        warn!(%user_id, "downstream returned a user id that is not a uuid, skipping provisioning");
        return None;
    };

    let rule = match dal.get_provision_rule(&app.app_id).await {
        Ok(rule) => rule,
        Err(error) => {
            warn!(
                error = &error as &dyn std::error::Error,
                "failed to load auto provision rule"
            );
            None
        }
    };

    let outcome = match dal.provision_user(&app.app_id, &user_id, rule.as_ref()).await {
        Ok(outcome) => outcome,
        Err(error) => {
            warn!(
                error = &error as &dyn std::error::Error,
                app_id = %app.app_id,
                %user_id,
                "auto provisioning failed entirely"
            );
            return None;
        }
    };

    info!(
        app_id = %app.app_id,
        %user_id,
        newly_bound = outcome.newly_bound,
        roles = outcome.roles_assigned,
        permissions = outcome.permissions_assigned,
        "applied auto provisioning"
    );

    if outcome.is_partial() {
        warn!(
            app_id = %app.app_id,
            %user_id,
            failures = ?outcome.failures,
            "auto provisioning left partial state"
        );
        audit.record(AuditRecord::provision(
            app.app_id.to_string(),
            json!({
                "user_id": user_id,
                "outcome": outcome,
            }),
        ));
    }

    Some(outcome)
}
