//! Managed Ingress resources
//!
//! [`IngressStore`] lists Ingresses and writes their status subresource.
//! [`IngressClassFilter`] decides which of them this controller owns.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use tracing::instrument;

use crate::address::StatusEntry;
use crate::cluster::ClusterError;

/// Legacy class annotation, still honored before `spec.ingressClassName`
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Namespace and name of an Ingress
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IngressRef {
    pub namespace: String,
    pub name: String,
}

impl IngressRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for IngressRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Snapshot of an Ingress as seen by the status updater
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManagedIngress {
    pub namespace: String,
    pub name: String,
    /// Class from the annotation, else from `spec.ingressClassName`
    pub class: Option<String>,
    /// Current `status.loadBalancer.ingress`
    pub status: Vec<StatusEntry>,
}

impl ManagedIngress {
    pub fn reference(&self) -> IngressRef {
        IngressRef::new(&self.namespace, &self.name)
    }
}

/// Selects the Ingresses handled by this controller
#[derive(Debug, Clone)]
pub struct IngressClassFilter {
    class: String,
}

impl IngressClassFilter {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
        }
    }

    /// Unclassified Ingresses are managed; classified ones only when the class matches.
    pub fn is_managed(&self, ingress: &ManagedIngress) -> bool {
        match ingress.class.as_deref() {
            None | Some("") => true,
            Some(class) => class == self.class,
        }
    }
}

/// Trait for Ingress list and status writes
///
/// This trait allows for mocking in tests while keeping the concrete
/// implementation for production use.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IngressStore: Send + Sync {
    /// List Ingresses in all namespaces
    async fn list(&self) -> Result<Vec<ManagedIngress>, ClusterError>;

    /// Replace `status.loadBalancer.ingress` of one Ingress
    async fn update_status(
        &self,
        target: &IngressRef,
        status: Vec<StatusEntry>,
    ) -> Result<(), ClusterError>;
}

/// [`IngressStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeIngressStore {
    client: Client,
}

impl KubeIngressStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IngressStore for KubeIngressStore {
    #[instrument(skip(self))]
    async fn list(&self) -> Result<Vec<ManagedIngress>, ClusterError> {
        let api: Api<Ingress> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(managed_ingress).collect())
    }

    #[instrument(skip(self, status), fields(ingress = %target))]
    async fn update_status(
        &self,
        target: &IngressRef,
        status: Vec<StatusEntry>,
    ) -> Result<(), ClusterError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &target.namespace);

        // Merge patch replaces lists wholesale, so an empty list clears the status.
        let patch = serde_json::json!({
            "status": {
                "loadBalancer": {
                    "ingress": status
                }
            }
        });

        api.patch_status(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }
}

pub(crate) fn managed_ingress(ingress: Ingress) -> ManagedIngress {
    let class = ingress
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(INGRESS_CLASS_ANNOTATION).cloned())
        .or_else(|| {
            ingress
                .spec
                .as_ref()
                .and_then(|spec| spec.ingress_class_name.clone())
        });

    let status = ingress
        .status
        .and_then(|s| s.load_balancer)
        .and_then(|lb| lb.ingress)
        .unwrap_or_default()
        .into_iter()
        .map(|entry| StatusEntry::from_parts(entry.ip, entry.hostname))
        .collect();

    ManagedIngress {
        namespace: ingress.metadata.namespace.unwrap_or_default(),
        name: ingress.metadata.name.unwrap_or_default(),
        class,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::{
        IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressSpec, IngressStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn test_ingress(annotations: BTreeMap<String, String>, class_name: Option<&str>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("foo_ingress_1".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: class_name.map(str::to_string),
                ..Default::default()
            }),
            status: Some(IngressStatus {
                load_balancer: Some(IngressLoadBalancerStatus {
                    ingress: Some(vec![IngressLoadBalancerIngress {
                        ip: Some("10.0.0.1".to_string()),
                        hostname: Some("foo1".to_string()),
                        ..Default::default()
                    }]),
                }),
            }),
        }
    }

    fn with_class(class: Option<&str>) -> ManagedIngress {
        ManagedIngress {
            namespace: "default".to_string(),
            name: "test".to_string(),
            class: class.map(str::to_string),
            status: vec![],
        }
    }

    #[test]
    fn test_managed_ingress_reads_status() {
        let managed = managed_ingress(test_ingress(BTreeMap::new(), None));

        assert_eq!(managed.reference(), IngressRef::new("default", "foo_ingress_1"));
        assert_eq!(managed.class, None);
        assert_eq!(
            managed.status,
            vec![StatusEntry::from_parts(
                Some("10.0.0.1".into()),
                Some("foo1".into())
            )]
        );
    }

    #[test]
    fn test_annotation_takes_precedence_over_class_name() {
        let annotations = BTreeMap::from([(
            INGRESS_CLASS_ANNOTATION.to_string(),
            "no-nginx".to_string(),
        )]);
        let managed = managed_ingress(test_ingress(annotations, Some("nginx")));
        assert_eq!(managed.class.as_deref(), Some("no-nginx"));

        let managed = managed_ingress(test_ingress(BTreeMap::new(), Some("nginx")));
        assert_eq!(managed.class.as_deref(), Some("nginx"));
    }

    #[test]
    fn test_managed_ingress_without_status() {
        let ingress = Ingress {
            metadata: ObjectMeta {
                name: Some("bare".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: None,
            status: None,
        };

        let managed = managed_ingress(ingress);
        assert!(managed.status.is_empty());
        assert_eq!(managed.class, None);
    }

    #[test]
    fn test_class_filter() {
        let filter = IngressClassFilter::new("nginx");

        assert!(filter.is_managed(&with_class(None)));
        assert!(filter.is_managed(&with_class(Some(""))));
        assert!(filter.is_managed(&with_class(Some("nginx"))));
        assert!(!filter.is_managed(&with_class(Some("no-nginx"))));
    }

    #[test]
    fn test_ingress_ref_display() {
        assert_eq!(
            IngressRef::new("default", "foo").to_string(),
            "default/foo"
        );
    }
}
