//! Ingress status updater
//!
//! Writes the desired addresses into every owned Ingress whose current status
//! differs from them as a set. Unchanged Ingresses are never written.

use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::address::{status_equal, AddressSet, StatusEntry};
use crate::cluster::ClusterError;
use crate::ingress::{IngressClassFilter, IngressRef, IngressStore};

/// Maximum number of status writes in flight at once
const UPDATE_CONCURRENCY: usize = 10;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("failed to list ingresses: {0}")]
    List(#[source] ClusterError),
    #[error("failed to update status of {} ingress(es): {}", .0.len(), WriteFailures(.0))]
    Writes(Vec<WriteFailure>),
}

/// A status write that failed
#[derive(Debug)]
pub struct WriteFailure {
    pub ingress: IngressRef,
    pub error: ClusterError,
}

struct WriteFailures<'a>(&'a [WriteFailure]);

impl fmt::Display for WriteFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}: {}", failure.ingress, failure.error)?;
        }
        Ok(())
    }
}

/// Outcome of a successful [`StatusUpdater::apply`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Ingresses accepted by the class filter
    pub owned: usize,
    /// Ingresses whose status was written
    pub updated: usize,
    /// Ingresses already carrying the desired status
    pub unchanged: usize,
}

pub struct StatusUpdater {
    store: Arc<dyn IngressStore>,
    filter: IngressClassFilter,
}

impl StatusUpdater {
    pub fn new(store: Arc<dyn IngressStore>, filter: IngressClassFilter) -> Self {
        Self { store, filter }
    }

    /// Publish `desired` into every owned Ingress that does not already carry it.
    ///
    /// Failed writes do not stop the others; they are reported together.
    #[instrument(skip(self, desired), fields(addresses = desired.len()))]
    pub async fn apply(&self, desired: &AddressSet) -> Result<UpdateSummary, UpdateError> {
        let ingresses = self.store.list().await.map_err(UpdateError::List)?;
        let status = desired.to_status();

        let owned: Vec<_> = ingresses
            .into_iter()
            .filter(|ing| self.filter.is_managed(ing))
            .collect();

        let mut summary = UpdateSummary {
            owned: owned.len(),
            ..Default::default()
        };

        let stale: Vec<IngressRef> = owned
            .iter()
            .filter(|ing| {
                let equal = status_equal(&ing.status, &status);
                if equal {
                    debug!(ingress = %ing.reference(), "Status unchanged");
                }
                !equal
            })
            .map(|ing| ing.reference())
            .collect();

        summary.unchanged = summary.owned - stale.len();

        let results: Vec<(IngressRef, Result<(), ClusterError>)> = stream::iter(stale)
            .map(|target| self.write(target, status.clone()))
            .buffer_unordered(UPDATE_CONCURRENCY)
            .collect()
            .await;

        let mut failures = Vec::new();
        for (ingress, result) in results {
            match result {
                Ok(()) => summary.updated += 1,
                Err(error) => {
                    warn!(ingress = %ingress, error = %error, "Failed to update ingress status");
                    failures.push(WriteFailure { ingress, error });
                }
            }
        }

        if !failures.is_empty() {
            return Err(UpdateError::Writes(failures));
        }

        if summary.updated > 0 {
            info!(
                owned = summary.owned,
                updated = summary.updated,
                unchanged = summary.unchanged,
                "Updated ingress status"
            );
        }

        Ok(summary)
    }

    async fn write(
        &self,
        target: IngressRef,
        status: Vec<StatusEntry>,
    ) -> (IngressRef, Result<(), ClusterError>) {
        debug!(ingress = %target, status = ?status, "Writing ingress status");
        let result = self.store.update_status(&target, status).await;
        (target, result)
    }
}
