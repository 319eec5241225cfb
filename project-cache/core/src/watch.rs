use ahash::AHashSet as HashSet;

/// Observes changes to the set of subjects that can see a namespace.
///
/// Notifications are delivered synchronously from the task that refreshed the namespace, so
/// implementations should not block.
pub trait CacheWatcher: Send + Sync {
    fn group_membership_changed(
        &self,
        namespace: &str,
        users: &HashSet<String>,
        groups: &HashSet<String>,
    );
}
