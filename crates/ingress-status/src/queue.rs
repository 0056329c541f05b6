//! Deduplicating work queue with per-key exponential backoff
//!
//! A key is either pending, being processed, or both (dirty): adding a key
//! that is being processed schedules exactly one more run after the current
//! handler returns. At most one handler invocation per key is in flight.
//!
//! Failed keys are re-added after `base * 2^(failures - 1)`, capped at `cap`,
//! until they succeed or the queue shuts down.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Base delay for exponential backoff
const BASE_DELAY: Duration = Duration::from_secs(1);

/// Maximum delay between retries
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Delay before the `attempt`-th retry (1-based)
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exp).min(cap)
}

struct QueueState<K> {
    /// FIFO of keys ready to be handed to a worker
    queue: VecDeque<K>,
    /// Keys waiting to be processed, whether queued or held back by processing
    dirty: HashSet<K>,
    processing: HashSet<K>,
    /// Consecutive failures per key
    failures: HashMap<K, u32>,
    /// Keys with a delayed retry scheduled
    retrying: HashSet<K>,
    shutting_down: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            failures: HashMap::new(),
            retrying: HashSet::new(),
            shutting_down: false,
        }
    }
}

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    ready: Notify,
    cancel: CancellationToken,
    base_delay: Duration,
    max_delay: Duration,
}

/// Cloneable handle to a shared work queue
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_backoff(BASE_DELAY, MAX_DELAY)
    }

    pub fn with_backoff(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                ready: Notify::new(),
                cancel: CancellationToken::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    /// Add a key. Returns `false` if it was dropped because the queue is shutting down.
    pub fn add(&self, key: K) -> bool {
        let mut state = self.inner.state.lock();
        if state.shutting_down {
            return false;
        }
        if !state.dirty.insert(key.clone()) {
            return true;
        }
        if state.processing.contains(&key) {
            debug!(key = ?key, "Key is being processed, will run again");
            return true;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.ready.notify_one();
        true
    }

    /// Add a key after `delay`, unless a delayed add for it is already scheduled.
    fn add_after(&self, key: K, delay: Duration) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down || !state.retrying.insert(key.clone()) {
                return;
            }
        }

        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    queue.inner.state.lock().retrying.remove(&key);
                    queue.add(key);
                }
            }
        });
    }

    /// Wait for the next key, `None` once shut down and drained of pending work
    async fn next(&self) -> Option<K> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.inner.ready.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark a key as processed, scheduling a retry if the handler failed
    fn done(&self, key: K, failed: bool) -> Option<(u32, Duration)> {
        let mut state = self.inner.state.lock();
        state.processing.remove(&key);

        let retry = if failed {
            let attempts = state.failures.entry(key.clone()).or_insert(0);
            *attempts += 1;
            let attempt = *attempts;
            Some((
                attempt,
                backoff_delay(self.inner.base_delay, self.inner.max_delay, attempt),
            ))
        } else {
            state.failures.remove(&key);
            None
        };

        if state.dirty.contains(&key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.ready.notify_one();
        } else {
            drop(state);
        }

        if let Some((_, delay)) = retry {
            self.add_after(key, delay);
        }

        retry
    }

    /// Process keys with `workers` concurrent workers until the queue shuts down.
    ///
    /// In-flight handlers are always allowed to finish.
    pub async fn run<F, Fut, E>(&self, workers: usize, handler: F)
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut tasks = JoinSet::new();

        for worker in 0..workers.max(1) {
            let queue = self.clone();
            let handler = handler.clone();
            tasks.spawn(async move {
                debug!(worker, "Work queue worker started");
                while let Some(key) = queue.next().await {
                    let result = (handler.as_ref())(key.clone()).await;
                    match result {
                        Ok(()) => {
                            queue.done(key, false);
                        }
                        Err(e) => {
                            if let Some((attempt, delay)) = queue.done(key.clone(), true) {
                                warn!(
                                    key = ?key,
                                    error = %e,
                                    attempt,
                                    delay_secs = delay.as_secs_f64(),
                                    "Handler failed, scheduling retry with exponential backoff"
                                );
                            }
                        }
                    }
                }
                debug!(worker, "Work queue worker stopped");
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Work queue worker terminated abnormally");
            }
        }
    }

    /// Stop accepting keys, cancel scheduled retries and release idle workers.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.queue.clear();
            state.dirty.clear();
            state.retrying.clear();
        }
        self.inner.cancel.cancel();
        self.inner.ready.notify_waiters();
        debug!("Work queue shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of keys waiting to be handed to a worker
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consecutive failures recorded for a key
    pub fn failures(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}
