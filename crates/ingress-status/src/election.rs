//! Leader election over a Kubernetes Lease.
//!
//! Only the replica holding the lease publishes status. Unlike a process that
//! exits on lease loss, [`LeaderElection::run`] keeps campaigning and reports
//! each transition to a [`LeadershipObserver`], so a replica that loses the
//! lease simply goes back to standby.
//!
//! ```text
//!   Electing ──acquired──▶ Leading
//!      ▲                     │
//!      └──lost / 3 failed────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LeaderElectionConfig;

/// Consecutive renewal failures tolerated while leading.
/// Allows recovery from transient network issues.
const MAX_RENEWAL_FAILURES: u32 = 3;

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("lease operation failed: {0}")]
    Lease(String),
}

/// Result of one acquire-or-renew attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseStatus {
    /// Whether this replica holds the lease after the attempt
    pub held: bool,
    /// Current holder identity, if known
    pub holder: Option<String>,
}

impl LeaseStatus {
    fn holder(&self) -> &str {
        self.holder.as_deref().unwrap_or("unknown")
    }
}

/// Trait for lease operations
///
/// This trait allows for mocking in tests while keeping the concrete
/// implementation for production use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaderElector: Send + Sync {
    async fn try_acquire_or_renew(&self) -> Result<LeaseStatus, ElectionError>;

    /// Release the lease so another replica can take over without waiting for expiry
    async fn step_down(&self) -> Result<(), ElectionError>;
}

/// [`LeaderElector`] backed by a `coordination.k8s.io` Lease
pub struct LeaseElector {
    lease_lock: LeaseLock,
}

impl LeaseElector {
    pub fn new(
        client: Client,
        namespace: &str,
        holder_id: impl Into<String>,
        lease_name: impl Into<String>,
        config: &LeaderElectionConfig,
    ) -> Self {
        let lease_lock = LeaseLock::new(
            client,
            namespace,
            LeaseLockParams {
                holder_id: holder_id.into(),
                lease_name: lease_name.into(),
                lease_ttl: config.lease_duration(),
            },
        );

        Self { lease_lock }
    }
}

fn lease_status(result: LeaseLockResult) -> LeaseStatus {
    let holder = result
        .lease
        .as_ref()
        .and_then(|l| l.spec.as_ref())
        .and_then(|s| s.holder_identity.clone());

    LeaseStatus {
        held: result.acquired_lease,
        holder,
    }
}

#[async_trait]
impl LeaderElector for LeaseElector {
    async fn try_acquire_or_renew(&self) -> Result<LeaseStatus, ElectionError> {
        self.lease_lock
            .try_acquire_or_renew()
            .await
            .map(lease_status)
            .map_err(|e| ElectionError::Lease(e.to_string()))
    }

    async fn step_down(&self) -> Result<(), ElectionError> {
        self.lease_lock
            .step_down()
            .await
            .map_err(|e| ElectionError::Lease(e.to_string()))
    }
}

/// Elector for a single replica: always leads, nothing to release.
#[derive(Debug, Clone, Default)]
pub struct SoleLeader;

#[async_trait]
impl LeaderElector for SoleLeader {
    async fn try_acquire_or_renew(&self) -> Result<LeaseStatus, ElectionError> {
        Ok(LeaseStatus {
            held: true,
            holder: None,
        })
    }

    async fn step_down(&self) -> Result<(), ElectionError> {
        Ok(())
    }
}

/// Receives leadership transitions from [`LeaderElection::run`]
pub trait LeadershipObserver: Send + Sync {
    fn on_started_leading(&self);
    fn on_stopped_leading(&self);
}

/// Campaign loop driving a [`LeaderElector`]
pub struct LeaderElection {
    elector: Arc<dyn LeaderElector>,
    renew_interval: Duration,
}

impl LeaderElection {
    pub fn new(elector: Arc<dyn LeaderElector>, renew_interval: Duration) -> Self {
        Self {
            elector,
            renew_interval,
        }
    }

    /// Acquire and renew the lease every `renew_interval` until `cancel` fires.
    ///
    /// On cancellation the lease is released if held. The observer is not
    /// notified of that final release.
    pub async fn run(&self, observer: &dyn LeadershipObserver, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.renew_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut leading = false;
        let mut consecutive_failures: u32 = 0;

        info!(
            interval_secs = self.renew_interval.as_secs(),
            max_failures = MAX_RENEWAL_FAILURES,
            "Starting leader election"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.elector.try_acquire_or_renew().await {
                Ok(status) if status.held => {
                    if consecutive_failures > 0 {
                        info!(
                            previous_failures = consecutive_failures,
                            "Lease renewed after transient failures"
                        );
                    }
                    consecutive_failures = 0;

                    if !leading {
                        leading = true;
                        info!("Leadership acquired");
                        observer.on_started_leading();
                    } else {
                        tracing::trace!("Lease renewed");
                    }
                }
                Ok(status) => {
                    consecutive_failures = 0;

                    if leading {
                        leading = false;
                        warn!(new_holder = %status.holder(), "Leadership lost to another replica");
                        observer.on_stopped_leading();
                    } else {
                        debug!(current_holder = %status.holder(), "Another replica is leader, waiting");
                    }
                }
                Err(e) => {
                    consecutive_failures += 1;

                    if leading && consecutive_failures >= MAX_RENEWAL_FAILURES {
                        leading = false;
                        error!(
                            error = %e,
                            consecutive_failures,
                            "Lease renewal failed too many times, giving up leadership"
                        );
                        observer.on_stopped_leading();
                    } else {
                        warn!(
                            error = %e,
                            consecutive_failures,
                            leading,
                            "Failed to acquire or renew lease"
                        );
                    }
                }
            }
        }

        if leading {
            match self.elector.step_down().await {
                Ok(()) => info!("Stepped down from leadership"),
                Err(e) => warn!(error = %e, "Failed to release lease, it will expire"),
            }
        }
    }
}
