use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use ingress_status::cluster::KubeCluster;
use ingress_status::config::SyncConfig;
use ingress_status::election::{LeaderElector, LeaseElector, SoleLeader};
use ingress_status::health::{health_addr_from_env, run_health_server, HealthState};
use ingress_status::ingress::KubeIngressStore;
use ingress_status::sync::StatusSync;
use ingress_status::watch::watch_changes;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON formatting for production
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("ingress-status starting");

    let mut config = SyncConfig::from_env().context("Invalid configuration")?;

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    let pod_labels = controller_labels(&kube_client, &config)
        .await
        .context("Failed to read controller pod")?;
    config.controller.set_pod_labels(pod_labels);

    info!(
        pod = %config.controller.name,
        namespace = %config.controller.namespace,
        selector = %config.controller.label_selector(),
        publish_service = ?config.publish_service.as_ref().map(ToString::to_string),
        static_addresses = config.publish_status_addresses.len(),
        ingress_class = %config.ingress_class,
        "Loaded configuration"
    );

    let elector: Arc<dyn LeaderElector> = if config.leader_election.enabled() {
        info!(
            lease = %config.lease_name(),
            lease_duration_secs = config.leader_election.lease_duration().as_secs(),
            renew_interval_secs = config.leader_election.renew_interval().as_secs(),
            "Leader election enabled"
        );
        Arc::new(LeaseElector::new(
            kube_client.clone(),
            &config.controller.namespace,
            config.controller.name.clone(),
            config.lease_name(),
            &config.leader_election,
        ))
    } else {
        warn!("Leader election disabled, this replica always publishes status");
        Arc::new(SoleLeader)
    };

    let sync = StatusSync::new(
        config.clone(),
        Arc::new(KubeCluster::new(kube_client.clone())),
        Arc::new(KubeIngressStore::new(kube_client.clone())),
        elector,
    );

    let stop = CancellationToken::new();

    let health_state = Arc::new(HealthState::new(sync.subscribe()));
    let health = {
        let stop = stop.clone();
        let addr = health_addr_from_env();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, addr).await {
                error!(error = %e, addr = %addr, "Health check server failed");
                stop.cancel();
            }
        })
    };

    let watches = tokio::spawn(watch_changes(
        kube_client.clone(),
        config,
        sync.clone(),
        stop.clone(),
    ));

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    let shutdown_signal = {
        let stop = stop.clone();
        async move {
            select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
                _ = stop.cancelled() => warn!("Internal failure, shutting down"),
            }
        }
    };

    sync.run(shutdown_signal).await;

    stop.cancel();
    health.abort();
    handle_task_exit("Change watches", watches.await)?;

    info!("Shutdown complete");
    Ok(())
}

/// Labels of the controller's own pod, used to find its sibling replicas
async fn controller_labels(client: &Client, config: &SyncConfig) -> Result<BTreeMap<String, String>> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), &config.controller.namespace);
    let pod = pods.get(&config.controller.name).await.with_context(|| {
        format!(
            "Pod {}/{} not found",
            config.controller.namespace, config.controller.name
        )
    })?;

    Ok(pod.metadata.labels.unwrap_or_default())
}

/// Check how a background task ended after shutdown
fn handle_task_exit(
    name: &str,
    result: std::result::Result<(), tokio::task::JoinError>,
) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_panic() => {
            error!(task = name, "Task panicked");
            bail!("{} task panicked: {:?}", name, e.into_panic())
        }
        Err(e) => {
            error!(task = name, error = ?e, "Task failed");
            bail!("{} task failed: {}", name, e)
        }
    }
}
