#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod lister;
pub mod rbac;
mod review;
mod user;
mod watch;

pub use self::{
    lister::{NamespaceLister, RbacLister},
    rbac::{combine_hashes, hash_refs, RbacKind, RbacResourceRef},
    review::{Review, Reviewer},
    user::{UserInfo, SCOPES_EXTRA_KEY},
    watch::CacheWatcher,
};
use anyhow::Result;
use project_cache_k8s_api::{NamespaceList, Selector};
use std::{sync::Arc, time::Duration};

/// Lists the namespaces visible to a user.
pub trait Lister: Send + Sync {
    fn list(&self, user: &UserInfo, selector: &Selector) -> Result<NamespaceList>;
}

/// Models the lifecycle of a namespace visibility cache.
#[async_trait::async_trait]
pub trait AuthorizationCache: Lister {
    /// Synchronizes the cache every `period` until `shutdown` is signaled.
    async fn run(self: Arc<Self>, period: Duration, shutdown: drain::Watch);

    /// Returns true once the cache has completed its first synchronization.
    fn ready_for_access(&self) -> bool;

    fn add_watcher(&self, watcher: Arc<dyn CacheWatcher>);

    fn remove_watcher(&self, watcher: &Arc<dyn CacheWatcher>);

    fn cluster_role_lister(&self) -> Arc<dyn RbacLister>;
}
