//! A rate-limited work queue.
//!
//! The queue holds each key at most once and never hands the same key to two workers at once: a
//! key that is added while it is being processed is marked dirty and requeued when the worker
//! calls [`WorkQueue::done`].

use crate::metrics::QueueMetrics;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, hash::Hash, sync::Arc, time::Duration};
use tokio::{sync::Notify, time};

/// Delays retries of failed keys: quickly at first, then slowly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimiter {
    pub fast_delay: Duration,
    pub slow_delay: Duration,
    pub max_fast_attempts: u32,
}

pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    name: String,
    limiter: RateLimiter,
    state: Mutex<State<K>>,
    notify: Notify,

    /// Wakes delayed adds on shutdown.
    closed: Notify,

    metrics: QueueMetrics,
}

struct State<K> {
    queue: VecDeque<K>,

    /// Keys that need processing, whether queued or waiting for a worker to finish.
    dirty: HashSet<K>,

    /// Keys currently held by workers.
    processing: HashSet<K>,

    failures: HashMap<K, u32>,
    shutting_down: bool,
}

// === impl RateLimiter ===

impl RateLimiter {
    pub(crate) fn delay(&self, failures: u32) -> Duration {
        if failures <= self.max_fast_attempts {
            self.fast_delay
        } else {
            self.slow_delay
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            fast_delay: Duration::from_millis(5),
            slow_delay: Duration::from_secs(10),
            max_fast_attempts: 3,
        }
    }
}

// === impl WorkQueue ===

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, limiter: RateLimiter, metrics: QueueMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                limiter,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                closed: Notify::new(),
                metrics,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Marks a key for processing.
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        self.inner.metrics.add();
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        self.inner.metrics.set_depth(state.queue.len());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds a key once `delay` has elapsed, unless the queue shuts down first.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            return self.add(key);
        }
        let queue = self.clone();
        tokio::spawn(async move {
            let closed = queue.inner.closed.notified();
            if queue.is_shutting_down() {
                return;
            }
            tokio::select! {
                _ = time::sleep(delay) => queue.add(key),
                _ = closed => {
                    tracing::trace!(queue = %queue.inner.name, ?key, "Dropping delayed key");
                }
            }
        });
    }

    /// Adds a key after a delay determined by how many times it has failed.
    pub fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            *failures += 1;
            self.inner.limiter.delay(*failures)
        };
        self.inner.metrics.retry();
        tracing::trace!(queue = %self.inner.name, ?key, ?delay, "Rate limiting");
        self.add_after(key, delay);
    }

    /// Clears a key's failure history.
    pub fn forget(&self, key: &K) {
        self.inner.state.lock().failures.remove(key);
    }

    /// Records that a key was abandoned after exhausting its retries.
    pub fn drop_key(&self, key: &K) {
        self.forget(key);
        self.inner.metrics.drop_key();
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or_default()
    }

    /// Waits for the next key.
    ///
    /// Returns `None` once the queue has been shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Register for wakeups before inspecting the state so that an add that races with
            // this check is not missed.
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    self.inner.metrics.set_depth(state.queue.len());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Releases a key obtained from [`WorkQueue::get`].
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            self.inner.metrics.set_depth(state.queue.len());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stops accepting new keys. Workers drain the keys already queued.
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
        self.inner.closed.notify_waiters();
        tracing::debug!(queue = %self.inner.name, "Shutting down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
