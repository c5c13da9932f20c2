use gatehouse_common::models::application::Scope;

/// One endpoint-to-scope rule. `pattern` is a glob over path segments
/// where `*` matches exactly one segment.
#[derive(Clone, Copy, Debug)]
pub struct ScopeRule {
    pub pattern: &'static str,
    pub scope: Scope,
}

/// The declared, ordered mapping of endpoint paths to required scopes.
///
/// Matching is first-match-wins, so more specific patterns must precede
/// more general ones; [`validate_rules`] rejects a table that violates
/// this at boot.
pub static SCOPE_RULES: &[ScopeRule] = &[
    ScopeRule {
        pattern: "auth/register/*",
        scope: Scope::AuthRegister,
    },
    ScopeRule {
        pattern: "auth/login",
        scope: Scope::AuthLogin,
    },
    ScopeRule {
        pattern: "auth/oauth/*",
        scope: Scope::AuthLogin,
    },
    ScopeRule {
        pattern: "auth/refresh",
        scope: Scope::AuthLogin,
    },
    ScopeRule {
        pattern: "auth/change-password",
        scope: Scope::UserWrite,
    },
    ScopeRule {
        pattern: "users/*/roles/assign",
        scope: Scope::RoleWrite,
    },
    ScopeRule {
        pattern: "users/*/roles/*/remove",
        scope: Scope::RoleWrite,
    },
    ScopeRule {
        pattern: "users/*/permissions",
        scope: Scope::RoleRead,
    },
    ScopeRule {
        pattern: "users/*/permissions/check",
        scope: Scope::RoleRead,
    },
    ScopeRule {
        pattern: "users/*/roles",
        scope: Scope::RoleRead,
    },
    ScopeRule {
        pattern: "users/*",
        scope: Scope::UserRead,
    },
];

/// Whether `path` matches `pattern`, segment by segment.
fn matches(pattern: &str, path: &str) -> bool {
    let mut pattern_segments = pattern.split('/');
    let mut path_segments = path.split('/');

    loop {
        match (pattern_segments.next(), path_segments.next()) {
            (None, None) => return true,
            (Some(pattern), Some(segment)) if pattern == "*" || pattern == segment => continue,
            _ => return false,
        }
    }
}

/// Whether every path matching `specific` also matches `general`.
fn shadows(general: &str, specific: &str) -> bool {
    let general: Vec<&str> = general.split('/').collect();
    let specific: Vec<&str> = specific.split('/').collect();

    general.len() == specific.len()
        && general
            .iter()
            .zip(&specific)
            .all(|(g, s)| *g == "*" || g == s)
}

/// The scope required to reach `endpoint` (the path with the gateway
/// prefix and surrounding slashes stripped), or `None` when the endpoint
/// is unguarded.
pub fn required_scope(endpoint: &str) -> Option<Scope> {
    let endpoint = endpoint.trim_matches('/');

    SCOPE_RULES
        .iter()
        .find(|rule| matches(rule.pattern, endpoint))
        .map(|rule| rule.scope)
}

/// Reject a rule table where an earlier, more general pattern makes a
/// later one unreachable. Run once at boot.
pub fn validate_rules() -> Result<(), String> {
    for (index, earlier) in SCOPE_RULES.iter().enumerate() {
        for later in &SCOPE_RULES[index + 1..] {
            if earlier.pattern != later.pattern && shadows(earlier.pattern, later.pattern) {
                return Err(format!(
                    "scope rule `{}` is unreachable behind `{}`",
                    later.pattern, earlier.pattern
                ));
            }
        }
    }

    Ok(())
}
