//! Read access to cluster state used for address resolution
//!
//! [`ClusterReader`] is the seam between the resolver and the Kubernetes API.
//! Lookups return strongly typed snapshots; a missing object is `Ok(None)`,
//! never an error.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::api::ListParams;
use kube::{Api, Client};
use thiserror::Error;
use tracing::instrument;

use crate::address::StatusEntry;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

/// Service fields relevant to address publication
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceInfo {
    pub namespace: String,
    pub name: String,
    /// `spec.externalName` when the service is of type `ExternalName`
    pub external_name: Option<String>,
    /// `status.loadBalancer.ingress`
    pub load_balancer: Vec<StatusEntry>,
}

/// Pod fields relevant to address publication
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PodInfo {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub node_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAddressType {
    InternalIp,
    ExternalIp,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeAddress {
    pub kind: NodeAddressType,
    pub address: String,
}

/// Node fields relevant to address publication
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInfo {
    pub name: String,
    pub addresses: Vec<NodeAddress>,
}

impl NodeInfo {
    /// The address advertised for this node: external IP, else internal IP.
    pub fn preferred_address(&self) -> Option<&str> {
        self.first_of(NodeAddressType::ExternalIp)
            .or_else(|| self.first_of(NodeAddressType::InternalIp))
    }

    fn first_of(&self, kind: NodeAddressType) -> Option<&str> {
        self.addresses
            .iter()
            .find(|a| a.kind == kind && !a.address.is_empty())
            .map(|a| a.address.as_str())
    }
}

/// Trait for cluster reads
///
/// This trait allows for mocking in tests while keeping the concrete
/// implementation for production use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Fetch a service, `None` if it does not exist
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceInfo>, ClusterError>;

    /// List pods in a namespace matching a label selector
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodInfo>, ClusterError>;

    /// Fetch a node, `None` if it does not exist
    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>, ClusterError>;
}

/// [`ClusterReader`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Map a 404 response to `None`
fn found<T>(result: Result<T, kube::Error>) -> Result<Option<T>, ClusterError> {
    match result {
        Ok(object) => Ok(Some(object)),
        Err(kube::Error::Api(ref ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl ClusterReader for KubeCluster {
    #[instrument(skip(self))]
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceInfo>, ClusterError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(found(services.get(name).await)?.map(service_info))
    }

    #[instrument(skip(self))]
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodInfo>, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(label_selector);
        let list = pods.list(&params).await?;
        Ok(list.items.into_iter().map(pod_info).collect())
    }

    #[instrument(skip(self))]
    async fn get_node(&self, name: &str) -> Result<Option<NodeInfo>, ClusterError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        Ok(found(nodes.get(name).await)?.map(node_info))
    }
}

pub(crate) fn service_info(svc: Service) -> ServiceInfo {
    let external_name = svc
        .spec
        .as_ref()
        .filter(|spec| spec.type_.as_deref() == Some("ExternalName"))
        .and_then(|spec| spec.external_name.clone())
        .filter(|name| !name.is_empty());

    let load_balancer = svc
        .status
        .and_then(|status| status.load_balancer)
        .and_then(|lb| lb.ingress)
        .unwrap_or_default()
        .into_iter()
        .map(|ingress| StatusEntry::from_parts(ingress.ip, ingress.hostname))
        .collect();

    ServiceInfo {
        namespace: svc.metadata.namespace.unwrap_or_default(),
        name: svc.metadata.name.unwrap_or_default(),
        external_name,
        load_balancer,
    }
}

pub(crate) fn pod_info(pod: Pod) -> PodInfo {
    PodInfo {
        namespace: pod.metadata.namespace.unwrap_or_default(),
        name: pod.metadata.name.unwrap_or_default(),
        labels: pod.metadata.labels.unwrap_or_default(),
        node_name: pod
            .spec
            .and_then(|spec| spec.node_name)
            .filter(|n| !n.is_empty()),
    }
}

pub(crate) fn node_info(node: Node) -> NodeInfo {
    let addresses = node
        .status
        .and_then(|status| status.addresses)
        .unwrap_or_default()
        .into_iter()
        .map(|a| NodeAddress {
            kind: match a.type_.as_str() {
                "InternalIP" => NodeAddressType::InternalIp,
                "ExternalIP" => NodeAddressType::ExternalIp,
                _ => NodeAddressType::Other,
            },
            address: a.address,
        })
        .collect();

    NodeInfo {
        name: node.metadata.name.unwrap_or_default(),
        addresses,
    }
}
