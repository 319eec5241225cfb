use crate::rbac::{RbacKind, RbacResourceRef};
use anyhow::Result;
use parking_lot::RwLock;
use project_cache_k8s_api::Namespace;

/// Reads RBAC object identities from a store.
pub trait RbacLister: Send + Sync {
    /// Returns an opaque version that changes whenever objects of the given kind change.
    fn last_sync_resource_version(&self, kind: RbacKind) -> String;

    /// Lists refs for all objects of a cluster-scoped kind.
    fn list_cluster(&self, kind: RbacKind) -> Result<Vec<RbacResourceRef>>;

    /// Lists refs for all roles and role bindings in a namespace.
    fn list_namespaced(&self, namespace: &str) -> Result<Vec<RbacResourceRef>>;

    fn cluster_role_exists(&self, name: &str) -> bool;

    /// Returns true once the store has received its initial listing of every RBAC kind.
    fn has_synced(&self) -> bool;
}

/// Reads namespaces from a store.
pub trait NamespaceLister: Send + Sync {
    fn list_names(&self) -> Result<Vec<String>>;

    fn get(&self, name: &str) -> Result<Option<Namespace>>;

    /// Returns true once the store has received its initial listing.
    fn has_synced(&self) -> bool;
}

impl<T: RbacLister> RbacLister for RwLock<T> {
    fn last_sync_resource_version(&self, kind: RbacKind) -> String {
        self.read().last_sync_resource_version(kind)
    }

    fn list_cluster(&self, kind: RbacKind) -> Result<Vec<RbacResourceRef>> {
        self.read().list_cluster(kind)
    }

    fn list_namespaced(&self, namespace: &str) -> Result<Vec<RbacResourceRef>> {
        self.read().list_namespaced(namespace)
    }

    fn cluster_role_exists(&self, name: &str) -> bool {
        self.read().cluster_role_exists(name)
    }

    fn has_synced(&self) -> bool {
        self.read().has_synced()
    }
}

impl<T: NamespaceLister> NamespaceLister for RwLock<T> {
    fn list_names(&self) -> Result<Vec<String>> {
        self.read().list_names()
    }

    fn get(&self, name: &str) -> Result<Option<Namespace>> {
        self.read().get(name)
    }

    fn has_synced(&self) -> bool {
        self.read().has_synced()
    }
}
