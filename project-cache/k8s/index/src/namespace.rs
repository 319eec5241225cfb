use ahash::AHashMap as HashMap;
use anyhow::Result;
use kubert::index::{ClusterRemoved, IndexClusterResource};
use parking_lot::RwLock;
use project_cache_core::NamespaceLister;
use project_cache_k8s_api::{self as k8s, ResourceExt};
use std::sync::Arc;

pub type SharedNamespaceIndex = Arc<RwLock<NamespaceIndex>>;

/// Holds the cluster's namespaces by name.
#[derive(Debug, Default)]
pub struct NamespaceIndex {
    index: HashMap<String, k8s::Namespace>,

    /// Set once the initial listing has been received.
    synced: bool,
}

// === impl NamespaceIndex ===

impl NamespaceIndex {
    pub fn shared() -> SharedNamespaceIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl IndexClusterResource<k8s::Namespace> for NamespaceIndex {
    fn apply(&mut self, ns: k8s::Namespace) {
        let name = ns.name_unchecked();
        tracing::debug!(namespace = %name, "updating");
        self.index.insert(name, ns);
    }

    fn delete(&mut self, name: String) {
        if self.index.remove(&name).is_some() {
            tracing::debug!(namespace = %name, "deleted");
        }
    }

    fn reset(&mut self, namespaces: Vec<k8s::Namespace>, removed: ClusterRemoved) {
        for ns in namespaces {
            self.apply(ns);
        }
        for name in removed {
            self.delete(name);
        }
        if !self.synced {
            tracing::debug!(namespaces = self.index.len(), "synced");
            self.synced = true;
        }
    }
}

impl NamespaceLister for NamespaceIndex {
    fn list_names(&self) -> Result<Vec<String>> {
        Ok(self.index.keys().cloned().collect())
    }

    fn get(&self, name: &str) -> Result<Option<k8s::Namespace>> {
        Ok(self.index.get(name).cloned())
    }

    fn has_synced(&self) -> bool {
        self.synced
    }
}
