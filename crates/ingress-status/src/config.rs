//! Status sync configuration
//!
//! Everything is read from the environment of the controller pod. Use
//! [`SyncConfig::from_env()`] in the binary and the plain constructors in tests.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Ingress class assumed when none is configured
pub const DEFAULT_INGRESS_CLASS: &str = "nginx";

/// Election ID prefix assumed when none is configured
pub const DEFAULT_ELECTION_ID: &str = "ingress-controller-leader";

/// Default resync period
pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid service reference '{0}', expected <namespace>/<name>")]
    InvalidServiceRef(String),
    #[error("{0} cannot be empty")]
    Empty(&'static str),
    #[error("renew_interval ({renew:?}) must be less than lease_duration ({lease:?})")]
    RenewNotBeforeExpiry { renew: Duration, lease: Duration },
}

/// Reference to a Service as `namespace/name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    pub namespace: String,
    pub name: String,
}

impl FromStr for ServiceRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            _ => Err(ConfigError::InvalidServiceRef(s.to_string())),
        }
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Labels set per revision by workload controllers; replicas of different
/// revisions must still select each other.
pub const REVISION_LABELS: &[&str] = &[
    "pod-template-hash",
    "controller-revision-hash",
    "pod-template-generation",
];

/// The controller pod this process runs in
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerIdentity {
    pub name: String,
    pub namespace: String,
    /// Labels shared by all replicas of the controller
    pub labels: BTreeMap<String, String>,
}

impl ControllerIdentity {
    /// Keep the labels of the controller pod that all its replicas share.
    pub fn set_pod_labels(&mut self, labels: BTreeMap<String, String>) {
        self.labels = labels
            .into_iter()
            .filter(|(k, _)| !REVISION_LABELS.contains(&k.as_str()))
            .collect();
    }

    /// Equality-based label selector matching the controller replicas
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Configuration for leader election.
///
/// Fields are private to enforce invariants. Use [`LeaderElectionConfig::new()`]
/// for validated construction.
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    enabled: bool,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl LeaderElectionConfig {
    /// # Errors
    ///
    /// Returns an error if `renew_interval >= lease_duration`, which would
    /// let the lease expire between renewals.
    pub fn new(lease_duration: Duration, renew_interval: Duration) -> Result<Self, ConfigError> {
        if renew_interval >= lease_duration {
            return Err(ConfigError::RenewNotBeforeExpiry {
                renew: renew_interval,
                lease: lease_duration,
            });
        }

        Ok(Self {
            enabled: true,
            lease_duration,
            renew_interval,
        })
    }

    /// Every replica considers itself the leader.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }

    /// Environment variables:
    /// - `LEADER_ELECTION_ENABLED`: "false" to disable (default: true)
    /// - `LEADER_ELECTION_LEASE_DURATION`: TTL in seconds (default: 15)
    /// - `LEADER_ELECTION_RENEW_INTERVAL`: Renewal interval in seconds (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        if !parse_bool_env("LEADER_ELECTION_ENABLED", true) {
            return Ok(Self::disabled());
        }

        Self::new(
            parse_duration_env("LEADER_ELECTION_LEASE_DURATION", Duration::from_secs(15)),
            parse_duration_env("LEADER_ELECTION_RENEW_INTERVAL", Duration::from_secs(5)),
        )
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_duration: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
        }
    }
}

/// Immutable configuration of a [`StatusSync`](crate::sync::StatusSync)
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Service whose load balancer addresses are mirrored into Ingress status
    pub publish_service: Option<ServiceRef>,
    /// Fixed addresses published instead of discovering them
    pub publish_status_addresses: Vec<String>,
    pub controller: ControllerIdentity,
    pub election_id: String,
    pub ingress_class: String,
    /// Clear the status of managed Ingresses when this instance shuts down
    pub update_status_on_shutdown: bool,
    /// Interval of the periodic resync while leading
    pub sync_period: Duration,
    pub leader_election: LeaderElectionConfig,
}

impl SyncConfig {
    pub fn new(controller: ControllerIdentity) -> Self {
        Self {
            publish_service: None,
            publish_status_addresses: Vec::new(),
            controller,
            election_id: DEFAULT_ELECTION_ID.to_string(),
            ingress_class: DEFAULT_INGRESS_CLASS.to_string(),
            update_status_on_shutdown: true,
            sync_period: DEFAULT_SYNC_PERIOD,
            leader_election: LeaderElectionConfig::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `POD_NAME`, `POD_NAMESPACE`: controller identity (required)
    /// - `PUBLISH_SERVICE`: `namespace/name` of the publish service
    /// - `PUBLISH_STATUS_ADDRESS`: comma-separated fixed addresses
    /// - `INGRESS_CLASS`: managed ingress class (default: nginx)
    /// - `ELECTION_ID`: lease name prefix (default: ingress-controller-leader)
    /// - `UPDATE_STATUS_ON_SHUTDOWN`: "false" to keep status on exit (default: true)
    /// - `SYNC_PERIOD`: resync interval in seconds (default: 60)
    ///
    /// Pod labels are not part of the environment; fill
    /// `controller.labels` from the pod object afterwards.
    pub fn from_env() -> Result<Self, ConfigError> {
        let name = non_empty_env("POD_NAME")?;
        let namespace = non_empty_env("POD_NAMESPACE")?;

        let publish_service = match std::env::var("PUBLISH_SERVICE") {
            Ok(v) if !v.trim().is_empty() => Some(v.trim().parse()?),
            _ => None,
        };

        let publish_status_addresses = std::env::var("PUBLISH_STATUS_ADDRESS")
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let ingress_class = std::env::var("INGRESS_CLASS")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_INGRESS_CLASS.to_string());

        let election_id = std::env::var("ELECTION_ID")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_ELECTION_ID.to_string());

        Ok(Self {
            publish_service,
            publish_status_addresses,
            controller: ControllerIdentity {
                name,
                namespace,
                labels: BTreeMap::new(),
            },
            election_id,
            ingress_class,
            update_status_on_shutdown: parse_bool_env("UPDATE_STATUS_ON_SHUTDOWN", true),
            sync_period: parse_duration_env("SYNC_PERIOD", DEFAULT_SYNC_PERIOD),
            leader_election: LeaderElectionConfig::from_env()?,
        })
    }

    /// Name of the Lease; one election per ingress class.
    pub fn lease_name(&self) -> String {
        format!("{}-{}", self.election_id, self.ingress_class)
    }
}

fn non_empty_env(var_name: &'static str) -> Result<String, ConfigError> {
    let value = std::env::var(var_name).map_err(|_| ConfigError::Missing(var_name))?;
    if value.is_empty() {
        return Err(ConfigError::Empty(var_name));
    }
    Ok(value)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool_env(var_name: &str, default: bool) -> bool {
    match std::env::var(var_name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "true" | "1" | "yes" => true,
            "false" | "0" | "no" => false,
            _ => {
                warn!(env_var = var_name, value = %v, default, "Failed to parse boolean env var, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Parse a duration in seconds from an environment variable with logging on failure.
fn parse_duration_env(var_name: &str, default: Duration) -> Duration {
    match std::env::var(var_name) {
        Ok(v) => match v.parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            Ok(_) => {
                warn!(env_var = var_name, default_secs = default.as_secs(), "Zero duration env var, using default");
                default
            }
            Err(e) => {
                warn!(
                    env_var = var_name,
                    value = %v,
                    error = %e,
                    default_secs = default.as_secs(),
                    "Failed to parse duration env var, using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "POD_NAME",
        "POD_NAMESPACE",
        "PUBLISH_SERVICE",
        "PUBLISH_STATUS_ADDRESS",
        "INGRESS_CLASS",
        "ELECTION_ID",
        "UPDATE_STATUS_ON_SHUTDOWN",
        "SYNC_PERIOD",
        "LEADER_ELECTION_ENABLED",
        "LEADER_ELECTION_LEASE_DURATION",
        "LEADER_ELECTION_RENEW_INTERVAL",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_service_ref_parse() {
        let svc: ServiceRef = "ingress-nginx/ingress-nginx-controller".parse().unwrap();
        assert_eq!(svc.namespace, "ingress-nginx");
        assert_eq!(svc.name, "ingress-nginx-controller");
        assert_eq!(svc.to_string(), "ingress-nginx/ingress-nginx-controller");
    }

    #[test]
    fn test_service_ref_parse_rejects_malformed() {
        for bad in ["foo", "/foo", "foo/", "a/b/c", ""] {
            assert!(bad.parse::<ServiceRef>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_set_pod_labels_drops_revision_labels() {
        let mut controller = ControllerIdentity::default();
        controller.set_pod_labels(BTreeMap::from([
            ("app".to_string(), "ingress".to_string()),
            ("pod-template-hash".to_string(), "7d9f8b".to_string()),
            ("controller-revision-hash".to_string(), "5c4d".to_string()),
            ("pod-template-generation".to_string(), "3".to_string()),
        ]));

        assert_eq!(
            controller.labels,
            BTreeMap::from([("app".to_string(), "ingress".to_string())])
        );
        assert_eq!(controller.label_selector(), "app=ingress");
    }

    #[test]
    fn test_label_selector() {
        let identity = ControllerIdentity {
            name: "pod".to_string(),
            namespace: "default".to_string(),
            labels: BTreeMap::from([
                ("app".to_string(), "ingress".to_string()),
                ("tier".to_string(), "edge".to_string()),
            ]),
        };
        assert_eq!(identity.label_selector(), "app=ingress,tier=edge");
    }

    #[test]
    fn test_lease_name_includes_class() {
        let mut config = SyncConfig::new(ControllerIdentity::default());
        config.ingress_class = "internal".to_string();
        assert_eq!(config.lease_name(), "ingress-controller-leader-internal");
    }

    #[test]
    fn test_leader_election_validates_duration_relationship() {
        let result = LeaderElectionConfig::new(Duration::from_secs(10), Duration::from_secs(15));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("renew_interval"));

        let config =
            LeaderElectionConfig::new(Duration::from_secs(15), Duration::from_secs(5)).unwrap();
        assert!(config.enabled());
    }

    #[test]
    #[serial]
    fn test_from_env_requires_pod_identity() {
        clear_env();

        let result = SyncConfig::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("POD_NAME"))));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        std::env::set_var("POD_NAME", "foo1");
        std::env::set_var("POD_NAMESPACE", "default");

        let config = SyncConfig::from_env().unwrap();
        assert_eq!(config.controller.name, "foo1");
        assert_eq!(config.controller.namespace, "default");
        assert_eq!(config.publish_service, None);
        assert!(config.publish_status_addresses.is_empty());
        assert_eq!(config.ingress_class, DEFAULT_INGRESS_CLASS);
        assert_eq!(config.election_id, DEFAULT_ELECTION_ID);
        assert!(config.update_status_on_shutdown);
        assert_eq!(config.sync_period, DEFAULT_SYNC_PERIOD);
        assert!(config.leader_election.enabled());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_with_all_vars() {
        clear_env();
        std::env::set_var("POD_NAME", "foo1");
        std::env::set_var("POD_NAMESPACE", "default");
        std::env::set_var("PUBLISH_SERVICE", "default/foo");
        std::env::set_var("PUBLISH_STATUS_ADDRESS", "10.0.0.1, lb.example.com,");
        std::env::set_var("INGRESS_CLASS", "internal");
        std::env::set_var("ELECTION_ID", "status-leader");
        std::env::set_var("UPDATE_STATUS_ON_SHUTDOWN", "false");
        std::env::set_var("SYNC_PERIOD", "30");
        std::env::set_var("LEADER_ELECTION_LEASE_DURATION", "30");
        std::env::set_var("LEADER_ELECTION_RENEW_INTERVAL", "10");

        let config = SyncConfig::from_env().unwrap();
        assert_eq!(
            config.publish_service,
            Some(ServiceRef {
                namespace: "default".to_string(),
                name: "foo".to_string(),
            })
        );
        assert_eq!(
            config.publish_status_addresses,
            vec!["10.0.0.1", "lb.example.com"]
        );
        assert_eq!(config.lease_name(), "status-leader-internal");
        assert!(!config.update_status_on_shutdown);
        assert_eq!(config.sync_period, Duration::from_secs(30));
        assert_eq!(
            config.leader_election.lease_duration(),
            Duration::from_secs(30)
        );
        assert_eq!(
            config.leader_election.renew_interval(),
            Duration::from_secs(10)
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_publish_service() {
        clear_env();
        std::env::set_var("POD_NAME", "foo1");
        std::env::set_var("POD_NAMESPACE", "default");
        std::env::set_var("PUBLISH_SERVICE", "no-slash");

        let result = SyncConfig::from_env();
        assert!(matches!(result, Err(ConfigError::InvalidServiceRef(_))));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_durations_fall_back_to_defaults() {
        clear_env();
        std::env::set_var("POD_NAME", "foo1");
        std::env::set_var("POD_NAMESPACE", "default");
        std::env::set_var("SYNC_PERIOD", "soon");
        std::env::set_var("LEADER_ELECTION_LEASE_DURATION", "invalid");
        std::env::set_var("LEADER_ELECTION_RENEW_INTERVAL", "also-invalid");

        let config = SyncConfig::from_env().unwrap();
        assert_eq!(config.sync_period, DEFAULT_SYNC_PERIOD);
        assert_eq!(
            config.leader_election.lease_duration(),
            Duration::from_secs(15)
        );
        assert_eq!(
            config.leader_election.renew_interval(),
            Duration::from_secs(5)
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_leader_election_can_be_disabled() {
        clear_env();
        std::env::set_var("LEADER_ELECTION_ENABLED", "false");

        let config = LeaderElectionConfig::from_env().unwrap();
        assert!(!config.enabled());

        clear_env();
    }
}
