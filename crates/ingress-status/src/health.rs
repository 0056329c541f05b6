//! Health check HTTP server for Kubernetes probes.
//!
//! Provides `/healthz` (liveness), `/readyz` (readiness) and `/leader`, which
//! reports the status sync state of this replica.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::sync::SyncState;

/// Default port for health check server.
pub const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Default bind address. Kubelet probes target the pod IP, so loopback is not enough.
pub const DEFAULT_HEALTH_BIND_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

/// Shared state for health check endpoints.
pub struct HealthState {
    /// Whether the controller has completed startup.
    started: AtomicBool,
    sync_state: watch::Receiver<SyncState>,
}

impl HealthState {
    pub fn new(sync_state: watch::Receiver<SyncState>) -> Self {
        Self {
            started: AtomicBool::new(false),
            sync_state,
        }
    }

    /// Mark the controller as started and ready.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        info!("Health check: controller marked as started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn sync_state(&self) -> SyncState {
        *self.sync_state.borrow()
    }
}

/// Port from `HEALTH_PORT`, falling back to [`DEFAULT_HEALTH_PORT`].
pub fn health_port_from_env() -> u16 {
    match std::env::var("HEALTH_PORT") {
        Ok(v) => v.parse::<u16>().unwrap_or_else(|e| {
            tracing::warn!(
                env_var = "HEALTH_PORT",
                value = %v,
                error = %e,
                default = DEFAULT_HEALTH_PORT,
                "Failed to parse health port, using default"
            );
            DEFAULT_HEALTH_PORT
        }),
        Err(_) => DEFAULT_HEALTH_PORT,
    }
}

/// Address from `HEALTH_BIND_ADDR` and `HEALTH_PORT`, with defaults for each.
pub fn health_addr_from_env() -> SocketAddr {
    let ip = match std::env::var("HEALTH_BIND_ADDR") {
        Ok(v) => v.parse::<IpAddr>().unwrap_or_else(|e| {
            tracing::warn!(
                env_var = "HEALTH_BIND_ADDR",
                value = %v,
                error = %e,
                default = %DEFAULT_HEALTH_BIND_ADDR,
                "Failed to parse health bind address, using default"
            );
            DEFAULT_HEALTH_BIND_ADDR
        }),
        Err(_) => DEFAULT_HEALTH_BIND_ADDR,
    };

    SocketAddr::new(ip, health_port_from_env())
}

fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/leader", get(leader))
        .with_state(state)
}

/// Run the health check HTTP server.
///
/// The controller is marked as started only after the server binds, so
/// readiness probes cannot succeed before it is listening.
pub async fn run_health_server(state: Arc<HealthState>, addr: SocketAddr) -> std::io::Result<()> {
    let app = router(state.clone());

    let listener = TcpListener::bind(addr).await?;

    info!(addr = %listener.local_addr()?, "Health check server listening");

    state.mark_started();

    axum::serve(listener, app).await
}

/// Liveness probe endpoint.
async fn healthz() -> StatusCode {
    debug!("Liveness probe: OK");
    StatusCode::OK
}

/// Readiness probe endpoint.
///
/// Returns 503 Service Unavailable before startup completes and once the
/// status sync is shutting down.
async fn readyz(State(state): State<Arc<HealthState>>) -> StatusCode {
    if !state.is_started() {
        debug!("Readiness probe: NOT READY (startup incomplete)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    if state.sync_state() == SyncState::ShuttingDown {
        debug!("Readiness probe: NOT READY (shutting down)");
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    debug!("Readiness probe: OK");
    StatusCode::OK
}

async fn leader(State(state): State<Arc<HealthState>>) -> (StatusCode, String) {
    (StatusCode::OK, state.sync_state().to_string())
}
