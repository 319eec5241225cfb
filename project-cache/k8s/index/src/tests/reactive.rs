use super::*;
use crate::{ChangeKey, QueueMetrics, RateLimiter, ReactiveAuthorizationCache, ReactiveConfig};
use kubert::index::{ClusterRemoved, NamespacedRemoved};
use project_cache_core::{AuthorizationCache as _, NamespaceLister};
use std::time::Duration;
use tokio::time;

fn mk_reactive(t: &TestCache, max_retries: u32) -> Arc<ReactiveAuthorizationCache> {
    let config = ReactiveConfig {
        workers: 2,
        max_retries,
        rate_limiter: RateLimiter {
            fast_delay: Duration::from_millis(1),
            slow_delay: Duration::from_millis(100),
            max_fast_attempts: 5,
        },
        queue_name: "test".to_string(),
    };
    Arc::new(ReactiveAuthorizationCache::new(
        t.cache.clone(),
        config,
        QueueMetrics::register(&mut Default::default()),
    ))
}

#[test]
fn default_retries_reach_the_slow_delay() {
    let config = ReactiveConfig::default();
    assert!(config.rate_limiter.max_fast_attempts < config.max_retries);
    assert_eq!(
        config.rate_limiter.delay(config.max_retries),
        config.rate_limiter.slow_delay
    );
}

#[tokio::test]
async fn events_enqueue_change_keys() {
    let t = mk_cache();
    let reactive = mk_reactive(&t, 3);
    let rbac = reactive.index(t.rbac.clone());
    let namespaces = reactive.index(t.namespaces.clone());

    IndexNamespacedResource::apply(&mut *rbac.write(), mk_role_binding("foo", "rb", "uid-0", "1"));
    IndexNamespacedResource::apply(&mut *rbac.write(), mk_role("foo", "r", "uid-1", "1"));
    IndexClusterResource::apply(
        &mut *rbac.write(),
        mk_cluster_role_binding("admins", "uid-2", "1"),
    );
    IndexClusterResource::apply(&mut *rbac.write(), mk_cluster_role("view", "uid-3", "1"));
    IndexClusterResource::apply(&mut *namespaces.write(), mk_namespace("bar", &[]));
    IndexClusterResource::<k8s::Namespace>::delete(&mut *namespaces.write(), "baz".to_string());

    // Keys are deduplicated while queued.
    let queue = reactive.queue();
    assert_eq!(queue.len(), 4);
    assert_eq!(
        queue.get().await,
        Some(ChangeKey::Namespace("foo".to_string()))
    );
    assert_eq!(queue.get().await, Some(ChangeKey::Global));
    assert_eq!(
        queue.get().await,
        Some(ChangeKey::Namespace("bar".to_string()))
    );
    assert_eq!(
        queue.get().await,
        Some(ChangeKey::Namespace("baz".to_string()))
    );

    // The wrapped stores were updated.
    assert_eq!(t.namespaces.read().len(), 1);
    assert_eq!(t.rbac.read().len(RbacKind::ClusterRole), 1);
    assert_eq!(t.rbac.list_namespaced("foo").unwrap().len(), 2);
}

#[tokio::test]
async fn resets_enqueue_live_and_removed_keys() {
    let t = mk_cache();
    t.apply_namespace(mk_namespace("gone", &[]));
    t.apply_namespaced(mk_role_binding("old", "rb", "uid-9", "1"));

    let reactive = mk_reactive(&t, 3);
    let rbac = reactive.index(t.rbac.clone());
    let namespaces = reactive.index(t.namespaces.clone());

    let removed: ClusterRemoved = ["gone".to_string()].into_iter().collect();
    IndexClusterResource::reset(
        &mut *namespaces.write(),
        vec![mk_namespace("foo", &[]), mk_namespace("bar", &[])],
        removed,
    );
    let removed: NamespacedRemoved = [("old".to_string(), ["rb".to_string()].into_iter().collect())]
        .into_iter()
        .collect();
    IndexNamespacedResource::reset(
        &mut *rbac.write(),
        vec![mk_role_binding("foo", "rb", "uid-0", "1")],
        removed,
    );

    // Every relist is followed by a full synchronization; keys are deduplicated while queued.
    let queue = reactive.queue();
    let mut keys = Vec::new();
    while !queue.is_empty() {
        keys.push(queue.get().await.unwrap());
    }
    assert_eq!(
        keys,
        [
            ChangeKey::Namespace("foo".to_string()),
            ChangeKey::Namespace("bar".to_string()),
            ChangeKey::Namespace("gone".to_string()),
            ChangeKey::Global,
            ChangeKey::Namespace("old".to_string()),
        ]
    );

    // The wrapped stores were reset.
    assert_eq!(t.namespaces.read().len(), 2);
    assert!(t.namespaces.read().has_synced());
    assert!(t.rbac.list_namespaced("old").unwrap().is_empty());
    assert_eq!(t.rbac.list_namespaced("foo").unwrap().len(), 1);
    assert_eq!(t.rbac.read().len(RbacKind::RoleBinding), 1);
}

#[tokio::test]
async fn namespace_changes_refresh_only_that_namespace() {
    let t = mk_cache();
    for ns in ["foo", "bar"] {
        t.apply_namespace(mk_namespace(ns, &[]));
        t.reviewer.set(ns, &["alice"], &[]);
    }
    t.cache.synchronize().await.unwrap();
    t.reviewer.take_calls();

    let reactive = mk_reactive(&t, 3);
    let rbac = reactive.index(t.rbac.clone());
    t.reviewer.set("foo", &["bob"], &[]);
    t.reviewer.set("bar", &["bob"], &[]);
    IndexNamespacedResource::apply(&mut *rbac.write(), mk_role_binding("foo", "rb", "uid-0", "1"));

    assert!(reactive.process_next().await);
    assert_eq!(t.reviewer.take_calls(), ["foo"]);
    assert_eq!(visible(&*reactive, &UserInfo::new("bob")), ["foo"]);
    assert_eq!(visible(&*reactive, &UserInfo::new("alice")), ["bar"]);
    assert!(reactive.queue().is_empty());
}

#[tokio::test]
async fn cluster_changes_synchronize_every_namespace() {
    let t = mk_cache();
    for ns in ["foo", "bar"] {
        t.apply_namespace(mk_namespace(ns, &[]));
    }
    t.cache.synchronize().await.unwrap();
    t.reviewer.take_calls();

    let reactive = mk_reactive(&t, 3);
    let rbac = reactive.index(t.rbac.clone());
    IndexClusterResource::apply(&mut *rbac.write(), mk_cluster_role("view", "uid-0", "1"));

    assert!(reactive.process_next().await);
    assert_eq!(t.reviewer.take_calls(), ["bar", "foo"]);
}

#[tokio::test]
async fn namespace_deletion_is_processed() {
    let t = mk_cache();
    t.apply_namespace(mk_namespace("foo", &[]));
    t.reviewer.set("foo", &["alice"], &[]);
    t.cache.synchronize().await.unwrap();

    let reactive = mk_reactive(&t, 3);
    let namespaces = reactive.index(t.namespaces.clone());
    IndexClusterResource::<k8s::Namespace>::delete(&mut *namespaces.write(), "foo".to_string());

    assert!(reactive.process_next().await);
    assert!(t.cache.access_record("foo").is_none());
    assert!(!t.cache.subjects_reference("foo"));
}

#[tokio::test(start_paused = true)]
async fn failed_keys_are_retried_then_dropped() {
    let t = mk_cache();
    t.apply_namespace(mk_namespace("foo", &[]));
    t.reviewer.fail("foo", "connection refused");

    let reactive = mk_reactive(&t, 2);
    let rbac = reactive.index(t.rbac.clone());
    IndexNamespacedResource::apply(&mut *rbac.write(), mk_role_binding("foo", "rb", "uid-0", "1"));
    let key = ChangeKey::Namespace("foo".to_string());

    for attempt in 1..=2 {
        assert!(reactive.process_next().await);
        assert_eq!(reactive.queue().num_requeues(&key), attempt);
        assert!(reactive.queue().is_empty());
        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(reactive.queue().len(), 1);
    }

    // The last attempt exhausts the retry budget.
    assert!(reactive.process_next().await);
    assert_eq!(reactive.queue().num_requeues(&key), 0);
    time::sleep(Duration::from_secs(1)).await;
    assert!(reactive.queue().is_empty());
    assert_eq!(t.reviewer.take_calls(), ["foo", "foo", "foo"]);
    assert!(t.cache.access_record("foo").is_none());
}

#[tokio::test]
async fn successful_retries_reset_failures() {
    let t = mk_cache();
    t.apply_namespace(mk_namespace("foo", &[]));
    t.reviewer.fail("foo", "connection refused");

    let reactive = mk_reactive(&t, 3);
    let key = ChangeKey::Namespace("foo".to_string());
    reactive.queue().add(key.clone());
    assert!(reactive.process_next().await);
    assert_eq!(reactive.queue().num_requeues(&key), 1);

    t.reviewer.set("foo", &["alice"], &[]);
    time::sleep(Duration::from_millis(10)).await;
    assert!(reactive.process_next().await);
    assert_eq!(reactive.queue().num_requeues(&key), 0);
    assert_eq!(visible(&*reactive, &UserInfo::new("alice")), ["foo"]);
}

#[tokio::test(start_paused = true)]
async fn run_processes_events_until_shutdown() {
    let t = mk_cache();
    t.apply_namespace(mk_namespace("foo", &[]));
    t.reviewer.set("foo", &["alice"], &[]);

    let reactive = mk_reactive(&t, 3);
    let rbac = reactive.index(t.rbac.clone());
    let (signal, shutdown) = drain::channel();
    let task = tokio::spawn(
        reactive
            .clone()
            .run(Duration::from_secs(3600), shutdown),
    );

    // The first tick synchronizes immediately.
    while !reactive.ready_for_access() {
        time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(visible(&*reactive, &UserInfo::new("alice")), ["foo"]);

    t.reviewer.set("foo", &["bob"], &[]);
    IndexNamespacedResource::apply(&mut *rbac.write(), mk_role_binding("foo", "rb", "uid-0", "1"));
    while visible(&*reactive, &UserInfo::new("bob")).is_empty() {
        time::sleep(Duration::from_millis(1)).await;
    }
    assert!(visible(&*reactive, &UserInfo::new("alice")).is_empty());

    signal.drain().await;
    task.await.unwrap();
    assert!(reactive.queue().is_shutting_down());
}
