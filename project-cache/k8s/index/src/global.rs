//! Tracks cluster-scoped RBAC as a single content hash.
//!
//! Every namespace's visibility depends on cluster roles and cluster role bindings, so the cache
//! needs a cheap way to answer "has anything cluster-scoped changed?". The store's per-kind
//! versions are compared first; objects are only listed and hashed when a version moved.

use parking_lot::{Mutex, RwLock};
use project_cache_core::{hash_refs, RbacKind, RbacLister};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("cluster RBAC hash computation already in progress")]
    InProgress,

    #[error("failed to list {kind} objects: {error}")]
    List { kind: RbacKind, error: anyhow::Error },
}

pub struct GlobalRbacCache {
    rbac: Arc<dyn RbacLister>,
    state: Mutex<State>,

    /// The last successfully computed hash, readable while a computation holds `state`.
    last: RwLock<Option<String>>,
}

#[derive(Debug, Default)]
struct State {
    cluster_roles_version: Option<String>,
    cluster_role_bindings_version: Option<String>,
    hash: String,
}

// === impl GlobalRbacCache ===

impl GlobalRbacCache {
    pub fn new(rbac: Arc<dyn RbacLister>) -> Self {
        Self {
            rbac,
            state: Mutex::new(State::default()),
            last: RwLock::new(None),
        }
    }

    /// Returns the hash of all cluster-scoped RBAC objects.
    ///
    /// Fails with [`HashError::InProgress`] rather than blocking when another caller is already
    /// computing the hash.
    pub fn compute_hash(&self) -> Result<String, HashError> {
        let mut state = self.state.try_lock().ok_or(HashError::InProgress)?;

        let cluster_roles_version = self
            .rbac
            .last_sync_resource_version(RbacKind::ClusterRole);
        let cluster_role_bindings_version = self
            .rbac
            .last_sync_resource_version(RbacKind::ClusterRoleBinding);
        if state.cluster_roles_version.as_ref() == Some(&cluster_roles_version)
            && state.cluster_role_bindings_version.as_ref() == Some(&cluster_role_bindings_version)
        {
            return Ok(state.hash.clone());
        }

        let mut refs = Vec::new();
        for kind in [RbacKind::ClusterRole, RbacKind::ClusterRoleBinding] {
            let listed = self
                .rbac
                .list_cluster(kind)
                .map_err(|error| HashError::List { kind, error })?;
            refs.extend(listed);
        }
        let hash = hash_refs(refs);
        tracing::debug!(
            %hash,
            %cluster_roles_version,
            %cluster_role_bindings_version,
            "Recomputed cluster RBAC hash"
        );

        *state = State {
            cluster_roles_version: Some(cluster_roles_version),
            cluster_role_bindings_version: Some(cluster_role_bindings_version),
            hash: hash.clone(),
        };
        *self.last.write() = Some(hash.clone());
        Ok(hash)
    }

    /// Returns the hash of all cluster-scoped RBAC objects, falling back to the last computed
    /// hash while another caller is computing it.
    ///
    /// Fails with [`HashError::InProgress`] only if no hash has been computed yet.
    pub fn current_hash(&self) -> Result<String, HashError> {
        match self.compute_hash() {
            Err(HashError::InProgress) => self.last_hash().ok_or(HashError::InProgress),
            res => res,
        }
    }

    /// Returns the last successfully computed hash.
    pub fn last_hash(&self) -> Option<String> {
        self.last.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{mk_cluster_role, mk_cluster_role_binding, FailingRbac};
    use crate::RbacIndex;
    use kubert::index::IndexClusterResource;
    use project_cache_core::RbacResourceRef;
    use std::sync::atomic::Ordering;

    #[test]
    fn reuses_hash_until_versions_change() {
        let rbac = RbacIndex::shared();
        rbac.write().apply(mk_cluster_role("admin", "uid-0", "1"));
        let cache = GlobalRbacCache::new(rbac.clone());

        let first = cache.compute_hash().unwrap();
        assert_eq!(first, cache.compute_hash().unwrap());
        assert_eq!(
            first,
            hash_refs(vec![RbacResourceRef::new(RbacKind::ClusterRole, "uid-0", "1")])
        );

        rbac.write()
            .apply(mk_cluster_role_binding("admins", "uid-1", "4"));
        let second = cache.compute_hash().unwrap();
        assert_ne!(first, second);

        rbac.write().apply(mk_cluster_role("admin", "uid-0", "2"));
        assert_ne!(second, cache.compute_hash().unwrap());
    }

    #[test]
    fn unchanged_versions_skip_listing() {
        let rbac = Arc::new(FailingRbac::default());
        let cache = GlobalRbacCache::new(rbac.clone());

        cache.compute_hash().unwrap();
        let lists = rbac.cluster_lists.load(Ordering::SeqCst);
        cache.compute_hash().unwrap();
        assert_eq!(lists, rbac.cluster_lists.load(Ordering::SeqCst));
    }

    #[test]
    fn listing_errors_are_not_cached() {
        let rbac = Arc::new(FailingRbac::default());
        let cache = GlobalRbacCache::new(rbac.clone());

        rbac.fail_cluster.store(true, Ordering::SeqCst);
        assert!(matches!(
            cache.compute_hash(),
            Err(HashError::List {
                kind: RbacKind::ClusterRole,
                ..
            })
        ));

        // The versions were not recorded, so the next call lists again.
        rbac.fail_cluster.store(false, Ordering::SeqCst);
        assert!(cache.compute_hash().is_ok());
    }

    #[test]
    fn concurrent_compute_reports_in_progress() {
        let rbac = RbacIndex::shared();
        let cache = GlobalRbacCache::new(rbac);

        let _guard = cache.state.lock();
        assert!(matches!(cache.compute_hash(), Err(HashError::InProgress)));
        assert!(matches!(cache.current_hash(), Err(HashError::InProgress)));
    }

    #[test]
    fn current_hash_falls_back_while_in_progress() {
        let rbac = RbacIndex::shared();
        rbac.write().apply(mk_cluster_role("admin", "uid-0", "1"));
        let cache = GlobalRbacCache::new(rbac.clone());
        let computed = cache.compute_hash().unwrap();

        rbac.write().apply(mk_cluster_role("admin", "uid-0", "2"));
        let _guard = cache.state.lock();
        assert!(matches!(cache.compute_hash(), Err(HashError::InProgress)));
        assert_eq!(cache.current_hash().unwrap(), computed);
        assert_eq!(cache.last_hash(), Some(computed));
    }
}
