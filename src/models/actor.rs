//! Request-scoped caller identity.

use serde::{Deserialize, Serialize};

pub const ANONYMOUS_ROLE: &str = "anonymous";
pub const AUTHENTICATED_ROLE: &str = "authenticated";

/// Roles that bypass row-level ownership checks in the metadata store.
pub const ELEVATED_ROLES: [&str; 2] = ["service_role", "admin"];

/// The resolved caller of a single request.
///
/// Never persisted. `roles` is ordered and de-duplicated; the first entry is
/// the primary role.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActorIdentity {
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub authenticated: bool,
}

impl ActorIdentity {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            roles: vec![ANONYMOUS_ROLE.to_string()],
            authenticated: false,
        }
    }

    /// Authenticated identity. Falls back to the `authenticated` role when
    /// no roles were supplied.
    pub fn authenticated<I, S>(user_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered: Vec<String> = Vec::new();
        for role in roles.into_iter().map(Into::into) {
            let role = role.trim().to_string();
            if !role.is_empty() && !ordered.contains(&role) {
                ordered.push(role);
            }
        }
        if ordered.is_empty() {
            ordered.push(AUTHENTICATED_ROLE.to_string());
        }

        Self {
            user_id: Some(user_id.into()),
            roles: ordered,
            authenticated: true,
        }
    }

    /// Internal identity used by operational tooling (orphan reports).
    pub fn service() -> Self {
        Self {
            user_id: None,
            roles: vec![ELEVATED_ROLES[0].to_string()],
            authenticated: true,
        }
    }

    pub fn primary_role(&self) -> &str {
        self.roles.first().map(String::as_str).unwrap_or(ANONYMOUS_ROLE)
    }

    pub fn is_elevated(&self) -> bool {
        self.roles
            .iter()
            .any(|role| ELEVATED_ROLES.contains(&role.as_str()))
    }
}
