//! Drives the cache from resource events.
//!
//! Store updates are translated into [`ChangeKey`]s and pushed onto a rate-limited work queue. A
//! pool of workers consumes the queue: a change to cluster-scoped RBAC synchronizes the whole
//! cache, while a change within a namespace only refreshes that namespace. A periodic full
//! synchronization still runs so that a lost event cannot leave the cache stale indefinitely.

use crate::{
    cache::AuthorizationCache,
    queue::{RateLimiter, WorkQueue},
};
use anyhow::Result;
use kubert::index::{
    ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved,
};
use parking_lot::RwLock;
use project_cache_core::{self as core, CacheWatcher, RbacLister, UserInfo};
use project_cache_k8s_api::{self as k8s, NamespaceList, ResourceExt, Selector};
use std::{fmt, sync::Arc, time::Duration};
use tokio::time;

/// Identifies the part of the cache affected by a change.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKey {
    /// Cluster-scoped RBAC changed.
    Global,

    /// A namespace or its roles or role bindings changed.
    Namespace(String),
}

#[derive(Clone, Debug)]
pub struct ReactiveConfig {
    pub workers: usize,

    /// The number of times a failed key is retried before it is dropped.
    pub max_retries: u32,

    pub rate_limiter: RateLimiter,

    /// Used only in diagnostics.
    pub queue_name: String,
}

pub struct ReactiveAuthorizationCache {
    cache: Arc<AuthorizationCache>,
    queue: WorkQueue<ChangeKey>,
    config: ReactiveConfig,
}

/// Wraps an index so that every update it receives also enqueues a [`ChangeKey`].
pub struct Reactive<T> {
    inner: Arc<RwLock<T>>,
    queue: WorkQueue<ChangeKey>,
}

/// Maps a resource to the key that its changes affect.
pub trait ChangeKeyed {
    fn change_key(namespace: Option<&str>, name: &str) -> ChangeKey;
}

impl ChangeKeyed for k8s::ClusterRole {
    fn change_key(_: Option<&str>, _: &str) -> ChangeKey {
        ChangeKey::Global
    }
}

impl ChangeKeyed for k8s::ClusterRoleBinding {
    fn change_key(_: Option<&str>, _: &str) -> ChangeKey {
        ChangeKey::Global
    }
}

impl ChangeKeyed for k8s::Namespace {
    fn change_key(_: Option<&str>, name: &str) -> ChangeKey {
        ChangeKey::Namespace(name.to_string())
    }
}

impl ChangeKeyed for k8s::Role {
    fn change_key(namespace: Option<&str>, _: &str) -> ChangeKey {
        ChangeKey::Namespace(namespace.unwrap_or_default().to_string())
    }
}

impl ChangeKeyed for k8s::RoleBinding {
    fn change_key(namespace: Option<&str>, _: &str) -> ChangeKey {
        ChangeKey::Namespace(namespace.unwrap_or_default().to_string())
    }
}

// === impl ChangeKey ===

impl fmt::Display for ChangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => "global".fmt(f),
            Self::Namespace(ns) => write!(f, "namespace:{ns}"),
        }
    }
}

// === impl ReactiveConfig ===

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 5,
            rate_limiter: RateLimiter::default(),
            queue_name: "authorization-cache".to_string(),
        }
    }
}

// === impl ReactiveAuthorizationCache ===

impl ReactiveAuthorizationCache {
    pub fn new(
        cache: Arc<AuthorizationCache>,
        config: ReactiveConfig,
        metrics: crate::metrics::QueueMetrics,
    ) -> Self {
        let queue = WorkQueue::new(config.queue_name.clone(), config.rate_limiter, metrics);
        Self {
            cache,
            queue,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<AuthorizationCache> {
        &self.cache
    }

    pub fn queue(&self) -> &WorkQueue<ChangeKey> {
        &self.queue
    }

    /// Wraps an index so that its updates are reflected in this cache.
    pub fn index<T>(&self, inner: Arc<RwLock<T>>) -> Arc<RwLock<Reactive<T>>> {
        Arc::new(RwLock::new(Reactive {
            inner,
            queue: self.queue.clone(),
        }))
    }

    /// Handles the next key from the queue.
    ///
    /// Returns false once the queue has been shut down and drained.
    pub async fn process_next(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.handle(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(error) => {
                let retries = self.queue.num_requeues(&key);
                if retries < self.config.max_retries {
                    tracing::warn!(%key, %error, retries, "Failed to process change; retrying");
                    self.queue.add_rate_limited(key.clone());
                } else {
                    tracing::error!(%key, %error, retries, "Failed to process change; dropping");
                    self.queue.drop_key(&key);
                }
            }
        }
        self.queue.done(&key);
        true
    }

    async fn handle(&self, key: &ChangeKey) -> Result<()> {
        match key {
            ChangeKey::Global => {
                let outcome = self.cache.synchronize().await?;
                tracing::debug!(?outcome, "Synchronized");
                Ok(())
            }
            ChangeKey::Namespace(ns) => self.cache.refresh_namespace(ns).await,
        }
    }
}

impl core::Lister for ReactiveAuthorizationCache {
    fn list(&self, user: &UserInfo, selector: &Selector) -> Result<NamespaceList> {
        self.cache.list(user, selector)
    }
}

#[async_trait::async_trait]
impl core::AuthorizationCache for ReactiveAuthorizationCache {
    /// Runs the worker pool and the periodic full synchronization until `shutdown` is signaled.
    ///
    /// On shutdown the queue stops accepting keys and workers finish the keys already queued.
    async fn run(self: Arc<Self>, period: Duration, shutdown: drain::Watch) {
        let mut workers = tokio::task::JoinSet::new();
        for _ in 0..self.config.workers.max(1) {
            let this = self.clone();
            workers.spawn(async move { while this.process_next().await {} });
        }
        tracing::info!(
            queue = %self.queue.name(),
            workers = self.config.workers.max(1),
            "Started"
        );

        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        let release = loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = self.cache.synchronize().await {
                        tracing::warn!(%error, "Failed to synchronize");
                    }
                }
                release = &mut shutdown => break release,
            }
        };

        self.queue.shut_down();
        while let Some(res) = workers.join_next().await {
            if let Err(error) = res {
                tracing::error!(%error, "Worker failed");
            }
        }
        tracing::debug!("Stopped");
        drop(release);
    }

    fn ready_for_access(&self) -> bool {
        self.cache.ready_for_access()
    }

    fn add_watcher(&self, watcher: Arc<dyn CacheWatcher>) {
        self.cache.add_watcher(watcher)
    }

    fn remove_watcher(&self, watcher: &Arc<dyn CacheWatcher>) {
        self.cache.remove_watcher(watcher)
    }

    fn cluster_role_lister(&self) -> Arc<dyn RbacLister> {
        self.cache.cluster_role_lister()
    }
}

// === impl Reactive ===

impl<T> Reactive<T> {
    /// Enqueues the keys touched by a relist.
    ///
    /// A full synchronization follows every relist, since the first one to complete over all
    /// stores is what makes the cache ready for access.
    fn enqueue_reset(&self, keys: Vec<ChangeKey>) {
        for key in keys {
            self.queue.add(key);
        }
        self.queue.add(ChangeKey::Global);
    }
}

impl<T, R> IndexClusterResource<R> for Reactive<T>
where
    T: IndexClusterResource<R>,
    R: ResourceExt + ChangeKeyed,
{
    fn apply(&mut self, resource: R) {
        let key = R::change_key(None, &resource.name_unchecked());
        self.inner.write().apply(resource);
        self.queue.add(key);
    }

    fn delete(&mut self, name: String) {
        let key = R::change_key(None, &name);
        self.inner.write().delete(name);
        self.queue.add(key);
    }

    fn reset(&mut self, resources: Vec<R>, removed: ClusterRemoved) {
        let keys = resources
            .iter()
            .map(|r| R::change_key(None, &r.name_unchecked()))
            .chain(removed.iter().map(|name| R::change_key(None, name)))
            .collect::<Vec<_>>();
        self.inner.write().reset(resources, removed);
        self.enqueue_reset(keys);
    }
}

impl<T, R> IndexNamespacedResource<R> for Reactive<T>
where
    T: IndexNamespacedResource<R>,
    R: ResourceExt + ChangeKeyed,
{
    fn apply(&mut self, resource: R) {
        let key = R::change_key(resource.namespace().as_deref(), &resource.name_unchecked());
        self.inner.write().apply(resource);
        self.queue.add(key);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = R::change_key(Some(&namespace), &name);
        self.inner.write().delete(namespace, name);
        self.queue.add(key);
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        let mut keys = resources
            .iter()
            .map(|r| R::change_key(r.namespace().as_deref(), &r.name_unchecked()))
            .collect::<Vec<_>>();
        for (namespace, names) in removed.iter() {
            keys.extend(names.iter().map(|name| R::change_key(Some(namespace.as_str()), name)));
        }
        self.inner.write().reset(resources, removed);
        self.enqueue_reset(keys);
    }
}
