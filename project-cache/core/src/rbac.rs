use fnv::FnvHasher;
use std::{fmt, hash::Hasher};

/// The kinds of RBAC objects that contribute to namespace visibility.
///
/// The declaration order is the sort order used when hashing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RbacKind {
    ClusterRole,
    ClusterRoleBinding,
    Role,
    RoleBinding,
}

/// The identity of a single RBAC object.
///
/// Only identity and version are tracked; rule content is never inspected. Refs order by
/// `(kind, uid, resource_version)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RbacResourceRef {
    pub kind: RbacKind,
    pub uid: String,
    pub resource_version: String,
}

// === impl RbacKind ===

impl RbacKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterRole => "ClusterRole",
            Self::ClusterRoleBinding => "ClusterRoleBinding",
            Self::Role => "Role",
            Self::RoleBinding => "RoleBinding",
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        matches!(self, Self::ClusterRole | Self::ClusterRoleBinding)
    }
}

impl fmt::Display for RbacKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

// === impl RbacResourceRef ===

impl RbacResourceRef {
    pub fn new(kind: RbacKind, uid: impl Into<String>, resource_version: impl Into<String>) -> Self {
        Self {
            kind,
            uid: uid.into(),
            resource_version: resource_version.into(),
        }
    }
}

/// Computes an FNV-1a content hash over a set of refs.
///
/// The refs are sorted first so that the result does not depend on listing order.
pub fn hash_refs(mut refs: Vec<RbacResourceRef>) -> String {
    refs.sort();
    let mut hasher = FnvHasher::default();
    for r in &refs {
        write_field(&mut hasher, r.kind.as_str());
        write_field(&mut hasher, &r.uid);
        write_field(&mut hasher, &r.resource_version);
    }
    format!("{:016x}", hasher.finish())
}

/// Combines the cluster-scoped hash with a namespace's local hash.
pub fn combine_hashes(global: &str, local: &str) -> String {
    let mut hasher = FnvHasher::default();
    write_field(&mut hasher, global);
    write_field(&mut hasher, local);
    format!("{:016x}", hasher.finish())
}

// Fields are NUL-terminated so that adjacent fields cannot run together.
fn write_field(hasher: &mut FnvHasher, field: &str) {
    hasher.write(field.as_bytes());
    hasher.write_u8(0);
}
