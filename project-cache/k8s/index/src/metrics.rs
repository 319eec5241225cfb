use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct CacheMetrics {
    syncs: Family<SyncLabels, Counter>,
    reviews: Counter,
    review_failures: Counter,
    namespaces: Gauge,
    users: Gauge,
    groups: Gauge,
}

#[derive(Clone, Debug)]
pub struct QueueMetrics {
    adds: Counter,
    retries: Counter,
    drops: Counter,
    depth: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SyncLabels {
    outcome: SyncOutcomeLabel,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub(crate) enum SyncOutcomeLabel {
    Skip,
    Partial,
    Full,
    Aborted,
    InProgress,
}

// === impl CacheMetrics ===

impl CacheMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let syncs = Family::default();
        prom.register(
            "synchronizations",
            "Count of cache synchronizations by outcome",
            syncs.clone(),
        );

        let reviews = Counter::default();
        prom.register(
            "reviews",
            "Count of namespace access reviews",
            reviews.clone(),
        );

        let review_failures = Counter::default();
        prom.register(
            "review_failures",
            "Count of namespace access reviews that failed or reported evaluation errors",
            review_failures.clone(),
        );

        let namespaces = Gauge::default();
        prom.register(
            "namespaces",
            "The number of namespaces with materialized access records",
            namespaces.clone(),
        );

        let users = Gauge::default();
        prom.register(
            "users",
            "The number of users that can see at least one namespace",
            users.clone(),
        );

        let groups = Gauge::default();
        prom.register(
            "groups",
            "The number of groups that can see at least one namespace",
            groups.clone(),
        );

        Self {
            syncs,
            reviews,
            review_failures,
            namespaces,
            users,
            groups,
        }
    }

    pub(crate) fn sync(&self, outcome: SyncOutcomeLabel) {
        self.syncs.get_or_create(&SyncLabels { outcome }).inc();
    }

    pub(crate) fn review(&self) {
        self.reviews.inc();
    }

    pub(crate) fn review_failure(&self) {
        self.review_failures.inc();
    }

    pub(crate) fn set_sizes(&self, namespaces: usize, users: usize, groups: usize) {
        self.namespaces.set(namespaces as i64);
        self.users.set(users as i64);
        self.groups.set(groups as i64);
    }
}

// === impl QueueMetrics ===

impl QueueMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let adds = Counter::default();
        prom.register("adds", "Count of keys added to the queue", adds.clone());

        let retries = Counter::default();
        prom.register(
            "retries",
            "Count of keys requeued after a failure",
            retries.clone(),
        );

        let drops = Counter::default();
        prom.register(
            "drops",
            "Count of keys dropped after exhausting retries",
            drops.clone(),
        );

        let depth = Gauge::default();
        prom.register("depth", "The number of keys waiting in the queue", depth.clone());

        Self {
            adds,
            retries,
            drops,
            depth,
        }
    }

    pub(crate) fn add(&self) {
        self.adds.inc();
    }

    pub(crate) fn retry(&self) {
        self.retries.inc();
    }

    pub(crate) fn drop_key(&self) {
        self.drops.inc();
    }

    pub(crate) fn set_depth(&self, depth: usize) {
        self.depth.set(depth as i64);
    }
}
