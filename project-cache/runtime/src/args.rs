use crate::{
    core::AuthorizationCache as _,
    index::{
        AuthorizationCache, CacheMetrics, NamespaceIndex, QueueMetrics, RateLimiter, RbacIndex,
        ReactiveAuthorizationCache, ReactiveConfig,
    },
    k8s,
    projects::Projects,
    review::AccessReviewer,
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "project-cache", about = "Caches the namespaces each user may see")]
pub struct Args {
    #[clap(
        long,
        default_value = "project_cache=info,warn",
        env = "PROJECT_CACHE_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// How often every namespace is checked for changes, regardless of watch events.
    #[clap(long, default_value = "30")]
    resync_period_secs: u64,

    /// The number of tasks processing change events.
    #[clap(long, default_value = "4")]
    workers: usize,

    #[clap(long, default_value = "5")]
    queue_fast_delay_ms: u64,

    #[clap(long, default_value = "10000")]
    queue_slow_delay_ms: u64,

    /// The number of failures after which retries use the slow delay.
    #[clap(long, default_value = "3")]
    queue_max_fast_attempts: u32,

    /// The number of times a failed change is retried before it is dropped.
    #[clap(long, default_value = "5")]
    max_retries: u32,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            resync_period_secs,
            workers,
            queue_fast_delay_ms,
            queue_slow_delay_ms,
            queue_max_fast_attempts,
            max_retries,
        } = self;

        let mut prom = <Registry>::default();
        let cache_metrics =
            CacheMetrics::register(prom.sub_registry_with_prefix("authorization_cache"));
        let queue_metrics =
            QueueMetrics::register(prom.sub_registry_with_prefix("authorization_cache_queue"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_server(server)
            .build()
            .await?;

        // Build the stores that the cache reads from. Every update is also fed to the cache's work
        // queue so that changes are picked up without waiting for the next resync.
        let rbac = RbacIndex::shared();
        let namespaces = NamespaceIndex::shared();
        let cache = Arc::new(AuthorizationCache::new(
            Arc::new(AccessReviewer::new(runtime.client())),
            rbac.clone(),
            namespaces.clone(),
            cache_metrics,
        ));
        let reactive = Arc::new(ReactiveAuthorizationCache::new(
            cache,
            ReactiveConfig {
                workers,
                max_retries,
                rate_limiter: RateLimiter {
                    fast_delay: Duration::from_millis(queue_fast_delay_ms),
                    slow_delay: Duration::from_millis(queue_slow_delay_ms),
                    max_fast_attempts: queue_max_fast_attempts,
                },
                ..Default::default()
            },
            queue_metrics,
        ));
        let rbac = reactive.index(rbac);
        let namespaces = reactive.index(namespaces);

        // Spawn resource watches.

        let cluster_roles = runtime.watch_all::<k8s::ClusterRole>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(rbac.clone(), cluster_roles)
                .instrument(info_span!("clusterroles")),
        );

        let cluster_role_bindings =
            runtime.watch_all::<k8s::ClusterRoleBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(rbac.clone(), cluster_role_bindings)
                .instrument(info_span!("clusterrolebindings")),
        );

        let roles = runtime.watch_all::<k8s::Role>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(rbac.clone(), roles).instrument(info_span!("roles")),
        );

        let role_bindings = runtime.watch_all::<k8s::RoleBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(rbac, role_bindings).instrument(info_span!("rolebindings")),
        );

        let nss = runtime.watch_all::<k8s::Namespace>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(namespaces, nss).instrument(info_span!("namespaces")),
        );

        // Run the cache's workers and periodic resync until the runtime begins shutting down.
        tokio::spawn(
            reactive
                .clone()
                .run(
                    Duration::from_secs(resync_period_secs),
                    runtime.shutdown_handle(),
                )
                .instrument(info_span!("authorization_cache")),
        );

        info!(workers, resync_period_secs, "Serving projects");
        let runtime = runtime.spawn_server(Projects::new(reactive.clone()));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
