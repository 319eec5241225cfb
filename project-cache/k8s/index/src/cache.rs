//! The namespace visibility cache.
//!
//! The cache materializes the answer to "which namespaces can this user see?" by storing, for
//! each namespace, the subjects a `Reviewer` reported along with a hash of the RBAC state that
//! answer was computed from. Inverted indices map each user and group to its visible namespaces
//! so that `list` only needs read locks.
//!
//! A namespace's hash combines the hash of all cluster-scoped RBAC objects with the hash of the
//! namespace's own roles and role bindings. Synchronization recomputes these hashes, which only
//! requires in-memory listing, and consults the reviewer only for namespaces whose hash moved.
//!
//! Locks are always acquired in the order `namespaces` then `subjects`.

use crate::{
    global::{GlobalRbacCache, HashError},
    metrics::{CacheMetrics, SyncOutcomeLabel},
    scope,
    subjects::SubjectIndex,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use project_cache_core::{
    self as core, combine_hashes, hash_refs, CacheWatcher, NamespaceLister, RbacLister, Reviewer,
    UserInfo,
};
use project_cache_k8s_api::{self as k8s, Labels, NamespaceList, Selector};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time;

pub struct AuthorizationCache {
    reviewer: Arc<dyn Reviewer>,
    rbac: Arc<dyn RbacLister>,
    namespaces: Arc<dyn NamespaceLister>,
    global: GlobalRbacCache,

    /// The cluster RBAC hash observed by the last synchronization.
    last_global_hash: Mutex<Option<String>>,

    /// Access records by namespace.
    records: RwLock<HashMap<String, AccessRecord>>,

    subjects: RwLock<SubjectIndex>,

    watchers: Mutex<Vec<Arc<dyn CacheWatcher>>>,

    /// Held for the duration of a synchronization.
    sync_lock: tokio::sync::Mutex<()>,

    ready: AtomicBool,
    metrics: CacheMetrics,
}

/// The last materialized review of a namespace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessRecord {
    pub users: HashSet<String>,
    pub groups: HashSet<String>,
    pub last_reviewed: DateTime<Utc>,

    /// The namespace hash that this review corresponds to.
    pub computed_hash: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing changed since the last synchronization.
    Skipped,

    /// Only namespaced RBAC or namespaces changed.
    Partial { refreshed: usize },

    /// Cluster-scoped RBAC changed.
    Full { refreshed: usize },

    /// Another synchronization was already running.
    InProgress,
}

/// Namespaces that need to be refreshed, with their current hash if it could be computed.
///
/// A `None` hash indicates that the namespace is gone or that its RBAC could not be listed.
type Changes = Vec<(String, Option<String>)>;

// === impl AuthorizationCache ===

impl AuthorizationCache {
    pub fn new(
        reviewer: Arc<dyn Reviewer>,
        rbac: Arc<dyn RbacLister>,
        namespaces: Arc<dyn NamespaceLister>,
        metrics: CacheMetrics,
    ) -> Self {
        Self {
            global: GlobalRbacCache::new(rbac.clone()),
            reviewer,
            rbac,
            namespaces,
            last_global_hash: Mutex::new(None),
            records: RwLock::new(HashMap::new()),
            subjects: RwLock::new(SubjectIndex::default()),
            watchers: Mutex::new(Vec::new()),
            sync_lock: tokio::sync::Mutex::new(()),
            ready: AtomicBool::new(false),
            metrics,
        }
    }

    /// Brings every namespace's access record up to date with the current RBAC state.
    ///
    /// Only namespaces whose hash changed are reviewed. Returns immediately with
    /// [`SyncOutcome::InProgress`] if another synchronization is running. Fails, leaving the
    /// cache untouched, when the cluster RBAC hash cannot be computed.
    pub async fn synchronize(&self) -> Result<SyncOutcome, HashError> {
        let Ok(_guard) = self.sync_lock.try_lock() else {
            tracing::debug!("Synchronization already in progress");
            self.metrics.sync(SyncOutcomeLabel::InProgress);
            return Ok(SyncOutcome::InProgress);
        };

        let (global, full, changes) = match self.should_skip_sync() {
            Ok(plan) => plan,
            Err(error) => {
                self.metrics.sync(SyncOutcomeLabel::Aborted);
                return Err(error);
            }
        };

        if changes.is_empty() {
            tracing::trace!("No changes");
            self.finish_sync(global);
            self.metrics.sync(SyncOutcomeLabel::Skip);
            return Ok(SyncOutcome::Skipped);
        }

        let refreshed = changes.len();
        tracing::debug!(full, namespaces = refreshed, "Synchronizing");
        for (namespace, hash) in changes {
            if let Err(error) = self.refresh_namespace_with_hash(&namespace, hash).await {
                tracing::warn!(%namespace, %error, "Failed to refresh namespace");
            }
        }
        self.finish_sync(global);

        if full {
            self.metrics.sync(SyncOutcomeLabel::Full);
            Ok(SyncOutcome::Full { refreshed })
        } else {
            self.metrics.sync(SyncOutcomeLabel::Partial);
            Ok(SyncOutcome::Partial { refreshed })
        }
    }

    /// Determines which namespaces need to be refreshed.
    ///
    /// Returns the current cluster RBAC hash, whether it changed since the last synchronization,
    /// and the namespaces whose hash differs from their access record (including cached
    /// namespaces that no longer exist). An empty change list means the sync can be skipped.
    fn should_skip_sync(&self) -> Result<(String, bool, Changes), HashError> {
        let global = self.global.compute_hash()?;
        let full = self.last_global_hash.lock().as_deref() != Some(global.as_str());

        let live = match self.namespaces.list_names() {
            Ok(names) => names,
            Err(error) => {
                // Without a namespace list nothing can be diffed; recheck what is cached.
                tracing::warn!(%error, "Failed to list namespaces");
                let records = self.records.read();
                return Ok((
                    global,
                    full,
                    records.keys().map(|ns| (ns.clone(), None)).collect(),
                ));
            }
        };

        let live_hashes = live
            .into_iter()
            .map(|ns| {
                let hash = match self.namespace_hash(&global, &ns) {
                    Ok(hash) => Some(hash),
                    Err(error) => {
                        tracing::warn!(namespace = %ns, %error, "Failed to list namespace RBAC");
                        None
                    }
                };
                (ns, hash)
            })
            .collect::<HashMap<_, _>>();

        let records = self.records.read();
        let mut changes = Changes::new();
        for (ns, hash) in &live_hashes {
            let cached = records.get(ns).map(|r| r.computed_hash.as_str());
            if hash.is_none() || cached != hash.as_deref() {
                changes.push((ns.clone(), hash.clone()));
            }
        }
        for ns in records.keys() {
            if !live_hashes.contains_key(ns) {
                changes.push((ns.clone(), None));
            }
        }
        Ok((global, full, changes))
    }

    /// Records the cluster RBAC hash a synchronization observed.
    ///
    /// The cache only becomes ready once the synchronization ran over stores that had received
    /// their initial listings.
    fn finish_sync(&self, global: String) {
        *self.last_global_hash.lock() = Some(global);
        if self.ready.load(Ordering::Acquire) {
            return;
        }
        if !self.rbac.has_synced() || !self.namespaces.has_synced() {
            tracing::debug!("Waiting for stores to sync");
            return;
        }
        if !self.ready.swap(true, Ordering::Release) {
            tracing::info!("Cache is ready for access");
        }
    }

    fn namespace_hash(&self, global: &str, namespace: &str) -> Result<String> {
        let local = hash_refs(self.rbac.list_namespaced(namespace)?);
        Ok(combine_hashes(global, &local))
    }

    /// Refreshes a single namespace, computing its hash from the current RBAC state.
    pub async fn refresh_namespace(&self, namespace: &str) -> Result<()> {
        self.refresh_namespace_with_hash(namespace, None).await
    }

    /// Refreshes a namespace whose current hash is `hash`.
    ///
    /// When `hash` is `None`, the namespace is removed if it no longer exists and its hash is
    /// computed otherwise. While another caller is computing the cluster RBAC hash, the last
    /// computed one is used; a synchronization reconciles namespaces once it changes. The reviewer is only called when the hash differs from the cached
    /// record. Review failures leave the previous record in place.
    pub async fn refresh_namespace_with_hash(
        &self,
        namespace: &str,
        hash: Option<String>,
    ) -> Result<()> {
        let hash = match hash {
            Some(hash) => hash,
            None => {
                if self.namespaces.get(namespace)?.is_none() {
                    self.delete_namespace(namespace);
                    return Ok(());
                }
                let global = self.global.current_hash()?;
                self.namespace_hash(&global, namespace)?
            }
        };

        let unchanged = self
            .records
            .read()
            .get(namespace)
            .map(|r| r.computed_hash == hash)
            .unwrap_or(false);
        if unchanged {
            tracing::trace!(%namespace, "Unchanged");
            return Ok(());
        }

        self.metrics.review();
        let review = match self.reviewer.review(namespace).await {
            Ok(review) => review,
            Err(error) => {
                self.metrics.review_failure();
                return Err(error.context(format!("failed to review namespace {namespace}")));
            }
        };
        if let Some(error) = review.evaluation_error() {
            self.metrics.review_failure();
            bail!("failed to evaluate access to namespace {namespace}: {error}");
        }

        let record = AccessRecord {
            users: review.users().iter().cloned().collect(),
            groups: review.groups().iter().cloned().collect(),
            last_reviewed: Utc::now(),
            computed_hash: hash,
        };
        if let Some((users, groups)) = self.apply_record(namespace, record) {
            self.notify(namespace, &users, &groups);
        }
        Ok(())
    }

    /// Replaces a namespace's access record and its index entries.
    ///
    /// Returns the new subject sets if they differ from the previous record's.
    fn apply_record(
        &self,
        namespace: &str,
        record: AccessRecord,
    ) -> Option<(HashSet<String>, HashSet<String>)> {
        let mut records = self.records.write();
        let mut subjects = self.subjects.write();

        let (old_users, old_groups) = records
            .get(namespace)
            .map(|r| (r.users.clone(), r.groups.clone()))
            .unwrap_or_default();

        // Remove before adding so that readers may briefly see too few namespaces but never a
        // namespace that is no longer granted.
        subjects.remove(namespace, &old_users, &old_groups);
        subjects.insert(namespace, &record.users, &record.groups);

        let changed = old_users != record.users || old_groups != record.groups;
        let new = changed.then(|| (record.users.clone(), record.groups.clone()));
        tracing::debug!(%namespace, users = record.users.len(), groups = record.groups.len(), changed, "Refreshed");
        records.insert(namespace.to_string(), record);

        self.metrics
            .set_sizes(records.len(), subjects.users_len(), subjects.groups_len());
        new
    }

    fn delete_namespace(&self, namespace: &str) {
        let had_subjects = {
            let mut records = self.records.write();
            let mut subjects = self.subjects.write();
            let Some(old) = records.remove(namespace) else {
                return;
            };
            subjects.scrub(namespace);
            self.metrics
                .set_sizes(records.len(), subjects.users_len(), subjects.groups_len());
            !old.users.is_empty() || !old.groups.is_empty()
        };

        tracing::debug!(%namespace, "Deleted");
        if had_subjects {
            self.notify(namespace, &HashSet::new(), &HashSet::new());
        }
    }

    fn notify(&self, namespace: &str, users: &HashSet<String>, groups: &HashSet<String>) {
        let watchers = self.watchers.lock().clone();
        for watcher in watchers {
            watcher.group_membership_changed(namespace, users, groups);
        }
    }

    /// Returns the access record for a namespace, if one has been materialized.
    pub fn access_record(&self, namespace: &str) -> Option<AccessRecord> {
        self.records.read().get(namespace).cloned()
    }

    #[cfg(test)]
    pub(crate) fn subjects_reference(&self, namespace: &str) -> bool {
        self.subjects.read().references(namespace)
    }
}

impl core::Lister for AuthorizationCache {
    /// Lists the namespaces visible to a user that match `selector`, sorted by name.
    ///
    /// Visibility comes from the materialized indices as they are now; this never waits for a
    /// synchronization. Namespaces that have since been deleted are omitted.
    fn list(&self, user: &UserInfo, selector: &Selector) -> Result<NamespaceList> {
        let names = self.subjects.read().visible(user);
        let allowed = scope::visible_namespaces(user, &*self.rbac);

        let mut items = Vec::with_capacity(names.len());
        for name in names {
            if !allowed.contains(&name) {
                continue;
            }
            let Some(ns) = self.namespaces.get(&name)? else {
                continue;
            };
            let labels = Labels::from(ns.metadata.labels.clone());
            if selector.matches(&labels) {
                items.push(ns);
            }
        }

        Ok(NamespaceList {
            items,
            metadata: k8s::ListMeta::default(),
        })
    }
}

#[async_trait::async_trait]
impl core::AuthorizationCache for AuthorizationCache {
    async fn run(self: Arc<Self>, period: Duration, shutdown: drain::Watch) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = self.synchronize().await {
                        tracing::warn!(%error, "Failed to synchronize");
                    }
                }
                _release = &mut shutdown => {
                    tracing::debug!("Stopping");
                    return;
                }
            }
        }
    }

    fn ready_for_access(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn add_watcher(&self, watcher: Arc<dyn CacheWatcher>) {
        self.watchers.lock().push(watcher);
    }

    fn remove_watcher(&self, watcher: &Arc<dyn CacheWatcher>) {
        self.watchers.lock().retain(|w| !Arc::ptr_eq(w, watcher));
    }

    fn cluster_role_lister(&self) -> Arc<dyn RbacLister> {
        self.rbac.clone()
    }
}
