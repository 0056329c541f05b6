//! Status synchronization loop
//!
//! [`StatusSync`] ties the pieces together: while this replica leads, every
//! change notification and every periodic tick enqueues the single sync key;
//! the queue worker resolves the running addresses and writes them into the
//! owned Ingresses. On shutdown the addresses are withdrawn, so clients stop
//! being pointed at an instance that is going away.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::address::AddressSet;
use crate::cluster::ClusterReader;
use crate::config::SyncConfig;
use crate::election::{LeaderElection, LeaderElector, LeadershipObserver};
use crate::ingress::{IngressClassFilter, IngressStore};
use crate::queue::WorkQueue;
use crate::resolver::{AddressResolver, ResolverError};
use crate::updater::{StatusUpdater, UpdateError};

/// The only key ever enqueued; every trigger asks for the same full sync.
pub const SYNC_KEY: &str = "sync status";

/// Lifecycle of a [`StatusSync`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Electing,
    Leading,
    ShuttingDown,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncState::Idle => "idle",
            SyncState::Electing => "electing",
            SyncState::Leading => "leading",
            SyncState::ShuttingDown => "shutting-down",
        };
        f.write_str(s)
    }
}

/// What prompted a sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    PublishService,
    Ingress,
    ControllerPod,
    Node,
}

impl fmt::Display for ChangeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeSource::PublishService => "publish-service",
            ChangeSource::Ingress => "ingress",
            ChangeSource::ControllerPod => "controller-pod",
            ChangeSource::Node => "node",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Resolve(#[from] ResolverError),
    #[error(transparent)]
    Update(#[from] UpdateError),
}

/// Queue key for a sync request
pub fn keyfunc(item: &str) -> String {
    item.to_string()
}

#[derive(Default)]
struct Tasks {
    workers: Option<JoinHandle<()>>,
    election: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

pub struct StatusSync {
    config: SyncConfig,
    resolver: AddressResolver,
    updater: StatusUpdater,
    election: LeaderElection,
    queue: WorkQueue<String>,
    state: watch::Sender<SyncState>,
    tasks: Mutex<Tasks>,
    /// Fired when shutdown begins
    stopping: CancellationToken,
    /// Fired once the election task must release the lease
    election_cancel: CancellationToken,
    /// Fired when shutdown has completed
    finished: CancellationToken,
}

impl StatusSync {
    pub fn new(
        config: SyncConfig,
        cluster: Arc<dyn ClusterReader>,
        ingresses: Arc<dyn IngressStore>,
        elector: Arc<dyn LeaderElector>,
    ) -> Arc<Self> {
        let resolver = AddressResolver::new(
            cluster,
            &config.publish_status_addresses,
            config.publish_service.clone(),
            config.controller.clone(),
        );
        let updater = StatusUpdater::new(ingresses, IngressClassFilter::new(&config.ingress_class));
        let election = LeaderElection::new(elector, config.leader_election.renew_interval());
        let (state, _) = watch::channel(SyncState::Idle);

        Arc::new(Self {
            config,
            resolver,
            updater,
            election,
            queue: WorkQueue::new(),
            state,
            tasks: Mutex::new(Tasks::default()),
            stopping: CancellationToken::new(),
            election_cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Start electing and syncing, then shut down once `stop` resolves or
    /// [`shutdown`](Self::shutdown) is called.
    pub async fn run(self: Arc<Self>, stop: impl Future<Output = ()>) {
        if !self.transition(|s| s == SyncState::Idle, SyncState::Electing) {
            warn!(state = %self.state(), "Status sync already started");
            return;
        }

        info!(
            lease = %self.config.lease_name(),
            holder = %self.config.controller.name,
            ingress_class = %self.config.ingress_class,
            "Starting status sync"
        );

        self.spawn_tasks();

        tokio::select! {
            _ = stop => info!("Stop requested"),
            _ = self.stopping.cancelled() => {}
        }

        self.shutdown().await;
        self.finished.cancelled().await;
    }

    fn spawn_tasks(self: &Arc<Self>) {
        let workers = {
            let queue = self.queue.clone();
            let this = self.clone();
            tokio::spawn(async move {
                queue
                    .run(1, move |key: String| {
                        let this = this.clone();
                        async move { this.sync(&key).await }
                    })
                    .await;
            })
        };

        let election = {
            let this = self.clone();
            let cancel = self.election_cancel.clone();
            tokio::spawn(async move {
                this.election.run(&*this, cancel).await;
            })
        };

        let ticker = {
            let this = self.clone();
            tokio::spawn(async move {
                let period = this.config.sync_period;
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = this.stopping.cancelled() => break,
                        _ = interval.tick() => {
                            debug!("Periodic resync");
                            this.enqueue();
                        }
                    }
                }
            })
        };

        let mut tasks = self.tasks.lock();
        tasks.workers = Some(workers);
        tasks.election = Some(election);
        tasks.ticker = Some(ticker);
    }

    /// Request a sync because something the published addresses depend on changed.
    ///
    /// Ignored unless this replica is leading.
    pub fn trigger(&self, source: ChangeSource) {
        debug!(source = %source, state = %self.state(), "Change notification");
        self.enqueue();
    }

    fn enqueue(&self) {
        if self.state() == SyncState::Leading {
            self.queue.add(keyfunc(SYNC_KEY));
        }
    }

    /// Publish the current running addresses into every owned Ingress.
    ///
    /// A no-op when not leading at invocation. Lease loss during the call is
    /// not detected; the writes are idempotent and the next leader corrects them.
    #[instrument(skip(self))]
    pub async fn sync(&self, key: &str) -> Result<(), SyncError> {
        if self.state() != SyncState::Leading {
            debug!(state = %self.state(), "Not leading, skipping sync");
            return Ok(());
        }

        let addresses = self.resolver.resolve().await?;
        let summary = self.updater.apply(&addresses).await?;

        debug!(
            addresses = addresses.len(),
            owned = summary.owned,
            updated = summary.updated,
            "Sync complete"
        );
        Ok(())
    }

    /// Stop syncing, withdraw published addresses if configured, release the lease.
    ///
    /// Only the first call does anything; later calls return immediately.
    pub async fn shutdown(&self) {
        let previous = self.state();
        if !self.transition(|s| s != SyncState::ShuttingDown, SyncState::ShuttingDown) {
            debug!("Shutdown already in progress");
            return;
        }

        info!(previous = %previous, "Shutting down status sync");
        self.stopping.cancel();
        self.queue.shutdown();

        let (workers, election, ticker) = {
            let mut tasks = self.tasks.lock();
            (
                tasks.workers.take(),
                tasks.election.take(),
                tasks.ticker.take(),
            )
        };

        for task in [workers, ticker].into_iter().flatten() {
            if let Err(e) = task.await {
                warn!(error = %e, "Status sync task terminated abnormally");
            }
        }

        if self.config.update_status_on_shutdown {
            info!("Removing this controller's addresses from ingress status");
            match self.updater.apply(&AddressSet::new()).await {
                Ok(summary) => info!(updated = summary.updated, "Ingress status cleared"),
                Err(e) => warn!(error = %e, "Failed to clear ingress status"),
            }
        } else {
            info!("Leaving ingress status in place");
        }

        self.election_cancel.cancel();
        if let Some(task) = election {
            if let Err(e) = task.await {
                warn!(error = %e, "Leader election task terminated abnormally");
            }
        }

        info!("Status sync stopped");
        self.finished.cancel();
    }

    /// Move to `next` if the current state satisfies `allowed`.
    fn transition(&self, allowed: impl Fn(SyncState) -> bool, next: SyncState) -> bool {
        let mut previous = None;
        let changed = self.state.send_if_modified(|state| {
            if *state == next || !allowed(*state) {
                return false;
            }
            previous = Some(*state);
            *state = next;
            true
        });

        if let Some(previous) = previous {
            debug!(from = %previous, to = %next, "State transition");
        }
        changed
    }
}

impl LeadershipObserver for StatusSync {
    fn on_started_leading(&self) {
        if self.transition(|s| s == SyncState::Electing, SyncState::Leading) {
            info!("Started leading, publishing ingress status");
            self.enqueue();
        }
    }

    fn on_stopped_leading(&self) {
        if self.transition(|s| s == SyncState::Leading, SyncState::Electing) {
            info!("Stopped leading, no longer publishing ingress status");
        }
    }
}
