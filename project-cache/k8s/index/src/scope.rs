//! Restricts visibility by the scopes carried on a user's token.

use ahash::AHashSet as HashSet;
use project_cache_core::{RbacLister, UserInfo};

const USER_FULL: &str = "user:full";
const USER_LIST_PROJECTS: &str = "user:list-projects";
const ROLE_PREFIX: &str = "role:";
const ALL_NAMESPACES: &str = "*";

/// The namespaces a user's scopes permit it to see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Visible {
    All,
    Namespaces(HashSet<String>),
}

// === impl Visible ===

impl Visible {
    pub fn contains(&self, namespace: &str) -> bool {
        match self {
            Self::All => true,
            Self::Namespaces(nss) => nss.contains(namespace),
        }
    }
}

/// Resolves the namespaces a user's scopes allow it to see.
///
/// Role scopes only count when the referenced cluster role exists.
pub fn visible_namespaces(user: &UserInfo, cluster_roles: &dyn RbacLister) -> Visible {
    let scopes = user.scopes();
    if scopes.is_empty() {
        return Visible::All;
    }

    let mut namespaces = HashSet::new();
    for scope in scopes {
        match scope.as_str() {
            USER_FULL | USER_LIST_PROJECTS => return Visible::All,
            scope => {
                let Some(role) = scope.strip_prefix(ROLE_PREFIX) else {
                    // `user:info`, `user:check-access`, and unknown scopes grant no namespaces.
                    continue;
                };
                let Some((role_name, namespace)) = parse_role_scope(role) else {
                    tracing::debug!(%scope, "Ignoring malformed role scope");
                    continue;
                };
                if !cluster_roles.cluster_role_exists(role_name) {
                    tracing::debug!(%scope, "Ignoring scope for missing cluster role");
                    continue;
                }
                if namespace == ALL_NAMESPACES {
                    return Visible::All;
                }
                namespaces.insert(namespace.to_string());
            }
        }
    }

    Visible::Namespaces(namespaces)
}

/// Parses `<role>:<namespace>` with an optional trailing `:!`.
fn parse_role_scope(scope: &str) -> Option<(&str, &str)> {
    let scope = scope.strip_suffix(":!").unwrap_or(scope);
    let (role, namespace) = scope.rsplit_once(':')?;
    if role.is_empty() || namespace.is_empty() {
        return None;
    }
    Some((role, namespace))
}
