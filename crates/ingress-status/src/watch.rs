//! Change notifications
//!
//! Watches the resources the published addresses depend on and turns every
//! change into a [`StatusSync::trigger`]. Events carry no payload downstream:
//! the sync always re-reads the cluster.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::sync::{ChangeSource, StatusSync};

/// Watch everything that affects the published addresses until `stop` fires.
pub async fn watch_changes(
    client: Client,
    config: SyncConfig,
    sync: Arc<StatusSync>,
    stop: CancellationToken,
) {
    let mut watches = Vec::new();

    let ingresses: Api<Ingress> = Api::all(client.clone());
    watches.push(forward(
        ingresses,
        watcher::Config::default(),
        ChangeSource::Ingress,
        is_change,
        sync.clone(),
        stop.clone(),
    ));

    if !config.publish_status_addresses.is_empty() {
        debug!("Static status addresses configured, not watching services or pods");
    } else if let Some(service) = &config.publish_service {
        let services: Api<Service> = Api::namespaced(client.clone(), &service.namespace);
        watches.push(forward(
            services,
            watcher::Config::default().fields(&format!("metadata.name={}", service.name)),
            ChangeSource::PublishService,
            is_change,
            sync.clone(),
            stop.clone(),
        ));
    } else {
        let controller = &config.controller;
        let pods: Api<Pod> = Api::namespaced(client.clone(), &controller.namespace);
        let selector = controller.label_selector();
        let pod_config = if selector.is_empty() {
            watcher::Config::default()
        } else {
            watcher::Config::default().labels(&selector)
        };
        let hosts = Arc::new(ControllerNodes::default());
        let pod_hosts = hosts.clone();
        watches.push(forward(
            pods,
            pod_config,
            ChangeSource::ControllerPod,
            move |event: &Event<Pod>| {
                pod_hosts.observe(event);
                is_change(event)
            },
            sync.clone(),
            stop.clone(),
        ));

        // Other nodes cannot change the published addresses
        let nodes: Api<Node> = Api::all(client);
        watches.push(forward(
            nodes,
            watcher::Config::default(),
            ChangeSource::Node,
            move |event: &Event<Node>| hosts.is_relevant(event),
            sync,
            stop,
        ));
    }

    info!(watches = watches.len(), "Starting change watches");
    future::join_all(watches).await;
    info!("Change watches stopped");
}

fn forward<K, F>(
    api: Api<K>,
    config: watcher::Config,
    source: ChangeSource,
    relevant: F,
    sync: Arc<StatusSync>,
    stop: CancellationToken,
) -> future::BoxFuture<'static, ()>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    F: Fn(&Event<K>) -> bool + Send + 'static,
{
    Box::pin(async move {
        let stream = watcher(api, config)
            .default_backoff()
            .take_until(stop.cancelled_owned());
        futures::pin_mut!(stream);

        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    if relevant(&event) {
                        sync.trigger(source);
                    }
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "Watch stream error, retrying");
                }
            }
        }
    })
}

/// Initial listing is reported once, when it completes.
fn is_change<K>(event: &Event<K>) -> bool {
    match event {
        Event::Apply(_) | Event::Delete(_) | Event::InitDone => true,
        Event::Init | Event::InitApply(_) => false,
    }
}

/// Nodes hosting controller pods, as seen by the controller pod watch
#[derive(Debug, Default)]
struct ControllerNodes {
    /// Pod name to node name
    pods: Mutex<HashMap<String, String>>,
}

impl ControllerNodes {
    fn observe(&self, event: &Event<Pod>) {
        let mut pods = self.pods.lock();
        match event {
            Event::Init => pods.clear(),
            Event::InitApply(pod) | Event::Apply(pod) => {
                match pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
                    Some(node) => {
                        pods.insert(pod.name_any(), node);
                    }
                    None => {
                        pods.remove(&pod.name_any());
                    }
                }
            }
            Event::Delete(pod) => {
                pods.remove(&pod.name_any());
            }
            Event::InitDone => {}
        }
    }

    fn hosts(&self, node: &str) -> bool {
        self.pods.lock().values().any(|n| n == node)
    }

    /// Node changes matter only for nodes running a controller pod.
    fn is_relevant(&self, event: &Event<Node>) -> bool {
        match event {
            Event::Apply(node) | Event::Delete(node) => self.hosts(&node.name_any()),
            Event::InitDone => true,
            Event::Init | Event::InitApply(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_initial_listing_triggers_once() {
        let events: Vec<Event<Pod>> = vec![
            Event::Init,
            Event::InitApply(Pod::default()),
            Event::InitApply(Pod::default()),
            Event::InitDone,
        ];

        let changes = events.iter().filter(|e| is_change(e)).count();

        assert_eq!(changes, 1);
    }

    #[test]
    fn test_updates_and_deletes_are_changes() {
        assert!(is_change(&Event::Apply(Node::default())));
        assert!(is_change(&Event::Delete(Node::default())));
    }

    fn pod_on(name: &str, node: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_only_nodes_hosting_controller_pods_are_relevant() {
        let hosts = ControllerNodes::default();
        hosts.observe(&Event::Init);
        hosts.observe(&Event::InitApply(pod_on("ingress-0", Some("n1"))));
        hosts.observe(&Event::InitApply(pod_on("ingress-1", None)));
        hosts.observe(&Event::InitDone);

        assert!(hosts.is_relevant(&Event::Apply(node("n1"))));
        assert!(!hosts.is_relevant(&Event::Apply(node("n2"))));
        assert!(!hosts.is_relevant(&Event::InitApply(node("n1"))));
        assert!(hosts.is_relevant(&Event::InitDone));

        // Scheduling a pod makes its node relevant
        hosts.observe(&Event::Apply(pod_on("ingress-1", Some("n2"))));
        assert!(hosts.is_relevant(&Event::Apply(node("n2"))));
    }

    #[test]
    fn test_deleted_pod_releases_its_node() {
        let hosts = ControllerNodes::default();
        hosts.observe(&Event::Apply(pod_on("ingress-0", Some("n1"))));
        hosts.observe(&Event::Apply(pod_on("ingress-1", Some("n1"))));

        hosts.observe(&Event::Delete(pod_on("ingress-0", Some("n1"))));
        assert!(hosts.is_relevant(&Event::Delete(node("n1"))));

        hosts.observe(&Event::Delete(pod_on("ingress-1", Some("n1"))));
        assert!(!hosts.is_relevant(&Event::Delete(node("n1"))));
    }

    #[test]
    fn test_relist_forgets_previous_pods() {
        let hosts = ControllerNodes::default();
        hosts.observe(&Event::Apply(pod_on("ingress-0", Some("n1"))));

        hosts.observe(&Event::Init);
        hosts.observe(&Event::InitApply(pod_on("ingress-2", Some("n3"))));
        hosts.observe(&Event::InitDone);

        assert!(!hosts.is_relevant(&Event::Apply(node("n1"))));
        assert!(hosts.is_relevant(&Event::Apply(node("n3"))));
    }
}
