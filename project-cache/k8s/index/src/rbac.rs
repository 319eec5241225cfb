//! Holds the identities of the cluster's RBAC objects.
//!
//! Only `(kind, uid, resourceVersion)` is retained for each object. Rule content is never
//! indexed: access decisions are delegated to a `Reviewer`, and this index exists purely so that
//! changes can be detected cheaply.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use kubert::index::{ClusterRemoved, NamespacedRemoved};
use anyhow::Result;
use parking_lot::RwLock;
use project_cache_core::{RbacKind, RbacLister, RbacResourceRef};
use project_cache_k8s_api::{self as k8s, ResourceExt};
use std::sync::Arc;

pub type SharedRbacIndex = Arc<RwLock<RbacIndex>>;

#[derive(Debug, Default)]
pub struct RbacIndex {
    cluster_roles: HashMap<String, RbacResourceRef>,
    cluster_role_bindings: HashMap<String, RbacResourceRef>,

    /// Roles and role bindings by namespace.
    namespaces: HashMap<String, NamespaceRbac>,

    /// Advances every time the objects of a kind change.
    versions: HashMap<RbacKind, u64>,

    /// Kinds whose initial listing has been received.
    synced: HashSet<RbacKind>,
}

#[derive(Debug, Default)]
struct NamespaceRbac {
    roles: HashMap<String, RbacResourceRef>,
    role_bindings: HashMap<String, RbacResourceRef>,
}

/// An RBAC resource type that can be stored in the index.
trait RbacObject: ResourceExt {
    const KIND: RbacKind;
}

impl RbacObject for k8s::ClusterRole {
    const KIND: RbacKind = RbacKind::ClusterRole;
}

impl RbacObject for k8s::ClusterRoleBinding {
    const KIND: RbacKind = RbacKind::ClusterRoleBinding;
}

impl RbacObject for k8s::Role {
    const KIND: RbacKind = RbacKind::Role;
}

impl RbacObject for k8s::RoleBinding {
    const KIND: RbacKind = RbacKind::RoleBinding;
}

// === impl RbacIndex ===

impl RbacIndex {
    pub fn shared() -> SharedRbacIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    fn store_mut(
        &mut self,
        kind: RbacKind,
        namespace: Option<&str>,
    ) -> Option<&mut HashMap<String, RbacResourceRef>> {
        match (kind, namespace) {
            (RbacKind::ClusterRole, _) => Some(&mut self.cluster_roles),
            (RbacKind::ClusterRoleBinding, _) => Some(&mut self.cluster_role_bindings),
            (RbacKind::Role, Some(ns)) => {
                Some(&mut self.namespaces.entry(ns.to_string()).or_default().roles)
            }
            (RbacKind::RoleBinding, Some(ns)) => Some(
                &mut self
                    .namespaces
                    .entry(ns.to_string())
                    .or_default()
                    .role_bindings,
            ),
            (_, None) => None,
        }
    }

    fn apply_ref<T: RbacObject>(&mut self, resource: &T) {
        let name = resource.name_unchecked();
        let namespace = resource.namespace();
        let rref = RbacResourceRef::new(
            T::KIND,
            resource.uid().unwrap_or_default(),
            resource.resource_version().unwrap_or_default(),
        );

        let Some(store) = self.store_mut(T::KIND, namespace.as_deref()) else {
            tracing::warn!(kind = %T::KIND, %name, "Ignoring namespaced resource without a namespace");
            return;
        };
        if store.get(&name) == Some(&rref) {
            tracing::trace!(kind = %T::KIND, %name, "no changes");
            return;
        }
        tracing::debug!(kind = %T::KIND, ?namespace, %name, uid = %rref.uid, resource_version = %rref.resource_version, "updating");
        store.insert(name, rref);
        self.bump(T::KIND);
    }

    fn delete_ref(&mut self, kind: RbacKind, namespace: Option<&str>, name: &str) {
        let removed = match self.store_mut(kind, namespace) {
            Some(store) => store.remove(name).is_some(),
            None => false,
        };

        if let Some(ns) = namespace {
            if self
                .namespaces
                .get(ns)
                .map(|rbac| rbac.roles.is_empty() && rbac.role_bindings.is_empty())
                .unwrap_or(false)
            {
                self.namespaces.remove(ns);
            }
        }

        if removed {
            tracing::debug!(%kind, ?namespace, %name, "deleted");
            self.bump(kind);
        }
    }

    fn reset_cluster<T: RbacObject>(&mut self, resources: Vec<T>, removed: ClusterRemoved) {
        for resource in &resources {
            self.apply_ref(resource);
        }
        for name in removed {
            self.delete_ref(T::KIND, None, &name);
        }
        self.mark_synced(T::KIND);
    }

    fn reset_namespaced<T: RbacObject>(&mut self, resources: Vec<T>, removed: NamespacedRemoved) {
        for resource in &resources {
            self.apply_ref(resource);
        }
        for (namespace, names) in removed {
            for name in names {
                self.delete_ref(T::KIND, Some(namespace.as_str()), &name);
            }
        }
        self.mark_synced(T::KIND);
    }

    fn mark_synced(&mut self, kind: RbacKind) {
        if self.synced.insert(kind) {
            tracing::debug!(%kind, "synced");
        }
    }

    fn bump(&mut self, kind: RbacKind) {
        *self.versions.entry(kind).or_default() += 1;
    }

    fn version(&self, kind: RbacKind) -> u64 {
        self.versions.get(&kind).copied().unwrap_or_default()
    }

    /// Returns the number of objects of the given kind in the index.
    pub fn len(&self, kind: RbacKind) -> usize {
        match kind {
            RbacKind::ClusterRole => self.cluster_roles.len(),
            RbacKind::ClusterRoleBinding => self.cluster_role_bindings.len(),
            RbacKind::Role => self.namespaces.values().map(|ns| ns.roles.len()).sum(),
            RbacKind::RoleBinding => self.namespaces.values().map(|ns| ns.role_bindings.len()).sum(),
        }
    }
}

impl kubert::index::IndexClusterResource<k8s::ClusterRole> for RbacIndex {
    fn apply(&mut self, resource: k8s::ClusterRole) {
        self.apply_ref(&resource);
    }

    fn delete(&mut self, name: String) {
        self.delete_ref(RbacKind::ClusterRole, None, &name);
    }

    fn reset(&mut self, resources: Vec<k8s::ClusterRole>, removed: ClusterRemoved) {
        self.reset_cluster(resources, removed);
    }
}

impl kubert::index::IndexClusterResource<k8s::ClusterRoleBinding> for RbacIndex {
    fn apply(&mut self, resource: k8s::ClusterRoleBinding) {
        self.apply_ref(&resource);
    }

    fn delete(&mut self, name: String) {
        self.delete_ref(RbacKind::ClusterRoleBinding, None, &name);
    }

    fn reset(&mut self, resources: Vec<k8s::ClusterRoleBinding>, removed: ClusterRemoved) {
        self.reset_cluster(resources, removed);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::Role> for RbacIndex {
    fn apply(&mut self, resource: k8s::Role) {
        self.apply_ref(&resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_ref(RbacKind::Role, Some(&namespace), &name);
    }

    fn reset(&mut self, resources: Vec<k8s::Role>, removed: NamespacedRemoved) {
        self.reset_namespaced(resources, removed);
    }
}

impl kubert::index::IndexNamespacedResource<k8s::RoleBinding> for RbacIndex {
    fn apply(&mut self, resource: k8s::RoleBinding) {
        self.apply_ref(&resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_ref(RbacKind::RoleBinding, Some(&namespace), &name);
    }

    fn reset(&mut self, resources: Vec<k8s::RoleBinding>, removed: NamespacedRemoved) {
        self.reset_namespaced(resources, removed);
    }
}

impl RbacLister for RbacIndex {
    fn last_sync_resource_version(&self, kind: RbacKind) -> String {
        self.version(kind).to_string()
    }

    fn list_cluster(&self, kind: RbacKind) -> Result<Vec<RbacResourceRef>> {
        let refs = match kind {
            RbacKind::ClusterRole => self.cluster_roles.values().cloned().collect(),
            RbacKind::ClusterRoleBinding => self.cluster_role_bindings.values().cloned().collect(),
            kind => anyhow::bail!("{kind} is not cluster-scoped"),
        };
        Ok(refs)
    }

    fn list_namespaced(&self, namespace: &str) -> Result<Vec<RbacResourceRef>> {
        let refs = self
            .namespaces
            .get(namespace)
            .map(|ns| {
                ns.roles
                    .values()
                    .chain(ns.role_bindings.values())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(refs)
    }

    fn cluster_role_exists(&self, name: &str) -> bool {
        self.cluster_roles.contains_key(name)
    }

    fn has_synced(&self) -> bool {
        [
            RbacKind::ClusterRole,
            RbacKind::ClusterRoleBinding,
            RbacKind::Role,
            RbacKind::RoleBinding,
        ]
        .iter()
        .all(|kind| self.synced.contains(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{mk_cluster_role, mk_role_binding};

    #[test]
    fn versions_advance_only_on_change() {
        use kubert::index::IndexClusterResource;

        let index = RbacIndex::shared();
        let version = || index.last_sync_resource_version(RbacKind::ClusterRole);
        let initial = version();

        index.write().apply(mk_cluster_role("admin", "uid-0", "1"));
        let applied = version();
        assert_ne!(initial, applied);

        // Reapplying an identical object is not a change.
        index.write().apply(mk_cluster_role("admin", "uid-0", "1"));
        assert_eq!(applied, version());

        index.write().apply(mk_cluster_role("admin", "uid-0", "2"));
        let updated = version();
        assert_ne!(applied, updated);

        IndexClusterResource::<k8s::ClusterRole>::delete(&mut *index.write(), "admin".to_string());
        assert_ne!(updated, version());
        assert!(index.list_cluster(RbacKind::ClusterRole).unwrap().is_empty());
        assert!(!index.cluster_role_exists("admin"));

        // Bindings are tracked separately.
        assert_eq!(
            index.last_sync_resource_version(RbacKind::ClusterRoleBinding),
            "0"
        );
    }

    #[test]
    fn namespaced_refs_are_scoped() {
        use kubert::index::IndexNamespacedResource;

        let index = RbacIndex::shared();
        index.write().apply(mk_role_binding("ns-0", "rb-0", "uid-0", "1"));
        index.write().apply(mk_role_binding("ns-1", "rb-0", "uid-1", "1"));

        assert_eq!(
            index.list_namespaced("ns-0").unwrap(),
            vec![RbacResourceRef::new(RbacKind::RoleBinding, "uid-0", "1")]
        );

        IndexNamespacedResource::<k8s::RoleBinding>::delete(
            &mut *index.write(),
            "ns-0".to_string(),
            "rb-0".to_string(),
        );
        assert!(index.list_namespaced("ns-0").unwrap().is_empty());
        assert_eq!(index.read().len(RbacKind::RoleBinding), 1);
        assert!(index.list_cluster(RbacKind::RoleBinding).is_err());
    }
}
