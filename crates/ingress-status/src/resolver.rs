//! Running address resolution
//!
//! Computes the addresses this controller is reachable at, in order of
//! precedence:
//! 1. Statically configured publish addresses
//! 2. The publish Service (ExternalName or load balancer ingress)
//! 3. External (else internal) addresses of nodes running controller pods

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::address::AddressSet;
use crate::cluster::{ClusterError, ClusterReader, NodeInfo, PodInfo, ServiceInfo};
use crate::config::{ControllerIdentity, ServiceRef};

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("failed to read publish service {service}: {source}")]
    PublishService {
        service: ServiceRef,
        #[source]
        source: ClusterError,
    },
    #[error("failed to list controller pods in {namespace}: {source}")]
    ListPods {
        namespace: String,
        #[source]
        source: ClusterError,
    },
    #[error("failed to read node {node}: {source}")]
    Node {
        node: String,
        #[source]
        source: ClusterError,
    },
}

/// Where running addresses come from
#[derive(Debug, Clone)]
enum AddressSource {
    Static(AddressSet),
    PublishService(ServiceRef),
    ControllerPods(ControllerIdentity),
}

/// Resolves the set of running addresses from a fresh read of the cluster
pub struct AddressResolver {
    cluster: Arc<dyn ClusterReader>,
    source: AddressSource,
}

impl AddressResolver {
    pub fn new(
        cluster: Arc<dyn ClusterReader>,
        publish_status_addresses: &[String],
        publish_service: Option<ServiceRef>,
        controller: ControllerIdentity,
    ) -> Self {
        let source = if !publish_status_addresses.is_empty() {
            AddressSource::Static(publish_status_addresses.iter().cloned().collect())
        } else if let Some(service) = publish_service {
            AddressSource::PublishService(service)
        } else {
            AddressSource::ControllerPods(controller)
        };

        Self { cluster, source }
    }

    /// Compute the current running addresses
    #[instrument(skip(self))]
    pub async fn resolve(&self) -> Result<AddressSet, ResolverError> {
        match &self.source {
            AddressSource::Static(addresses) => Ok(addresses.clone()),
            AddressSource::PublishService(service) => self.from_service(service).await,
            AddressSource::ControllerPods(controller) => self.from_pods(controller).await,
        }
    }

    async fn from_service(&self, service: &ServiceRef) -> Result<AddressSet, ResolverError> {
        let svc = self
            .cluster
            .get_service(&service.namespace, &service.name)
            .await
            .map_err(|source| ResolverError::PublishService {
                service: service.clone(),
                source,
            })?;

        let Some(svc) = svc else {
            warn!(service = %service, "Publish service not found, publishing no addresses");
            return Ok(AddressSet::new());
        };

        let addresses = service_addresses(&svc);
        debug!(service = %service, count = addresses.len(), "Resolved addresses from publish service");
        Ok(addresses)
    }

    async fn from_pods(&self, controller: &ControllerIdentity) -> Result<AddressSet, ResolverError> {
        let selector = controller.label_selector();
        let pods = self
            .cluster
            .list_pods(&controller.namespace, &selector)
            .await
            .map_err(|source| ResolverError::ListPods {
                namespace: controller.namespace.clone(),
                source,
            })?;

        let mut addresses = AddressSet::new();
        // Nodes are looked up at most once per pass; nothing survives the call.
        let mut nodes: HashMap<String, Option<NodeInfo>> = HashMap::new();

        for pod in pods.iter().filter(|p| is_controller_pod(p, controller)) {
            let Some(node_name) = pod.node_name.as_deref() else {
                warn!(pod = %pod.name, "Controller pod is not scheduled on a node, skipping");
                continue;
            };

            if !nodes.contains_key(node_name) {
                let node = self
                    .cluster
                    .get_node(node_name)
                    .await
                    .map_err(|source| ResolverError::Node {
                        node: node_name.to_string(),
                        source,
                    })?;
                nodes.insert(node_name.to_string(), node);
            }

            match nodes.get(node_name).and_then(Option::as_ref) {
                Some(node) => match node.preferred_address() {
                    Some(address) => {
                        addresses.insert(address);
                    }
                    None => {
                        warn!(pod = %pod.name, node = %node_name, "Node has no internal or external address, skipping");
                    }
                },
                None => {
                    warn!(pod = %pod.name, node = %node_name, "Node not found, skipping");
                }
            }
        }

        debug!(
            namespace = %controller.namespace,
            selector = %selector,
            count = addresses.len(),
            "Resolved addresses from controller pods"
        );
        Ok(addresses)
    }
}

/// Addresses advertised by a publish service
fn service_addresses(svc: &ServiceInfo) -> AddressSet {
    if let Some(external_name) = &svc.external_name {
        return [external_name.as_str()].into_iter().collect();
    }

    svc.load_balancer
        .iter()
        .filter_map(|entry| entry.address())
        .collect()
}

/// Whether a listed pod is another replica of this controller
fn is_controller_pod(pod: &PodInfo, controller: &ControllerIdentity) -> bool {
    pod.namespace == controller.namespace
        && controller
            .labels
            .iter()
            .all(|(k, v)| pod.labels.get(k) == Some(v))
}
