//! Running addresses and their Ingress status representation
//!
//! An [`AddressSet`] is what the resolver discovers; a list of [`StatusEntry`]
//! is what gets written to `status.loadBalancer.ingress` of each Ingress.

use std::collections::HashSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// An IPv4/IPv6 literal or a DNS hostname.
pub type Address = String;

/// One item of an Ingress load balancer status.
///
/// Exactly one of `ip` or `hostname` is set for entries produced by this crate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl StatusEntry {
    pub fn from_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            hostname: None,
        }
    }

    pub fn from_hostname(hostname: impl Into<String>) -> Self {
        Self {
            ip: None,
            hostname: Some(hostname.into()),
        }
    }

    /// Build an entry from raw cluster fields, treating empty strings as unset.
    pub fn from_parts(ip: Option<String>, hostname: Option<String>) -> Self {
        Self {
            ip: ip.filter(|s| !s.is_empty()),
            hostname: hostname.filter(|s| !s.is_empty()),
        }
    }

    /// The single address this entry contributes: IP first, hostname otherwise.
    pub fn address(&self) -> Option<&str> {
        self.ip.as_deref().or(self.hostname.as_deref())
    }
}

/// Deduplicated set of addresses, remembering discovery order.
///
/// Equality ignores order.
#[derive(Clone, Debug, Default)]
pub struct AddressSet {
    addresses: Vec<Address>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an address, returning `false` if it was already present.
    pub fn insert(&mut self, address: impl Into<Address>) -> bool {
        let address = address.into();
        if self.addresses.contains(&address) {
            return false;
        }
        self.addresses.push(address);
        true
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.iter().any(|a| a == address)
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.addresses.iter().map(String::as_str)
    }

    /// Serialize into the ordered status written to Ingresses.
    ///
    /// Hostnames come first in discovery order, followed by IP literals sorted
    /// lexicographically.
    pub fn to_status(&self) -> Vec<StatusEntry> {
        let (ips, hostnames): (Vec<&str>, Vec<&str>) =
            self.iter().partition(|a| a.parse::<IpAddr>().is_ok());

        let mut ips = ips;
        ips.sort_unstable();

        hostnames
            .into_iter()
            .map(StatusEntry::from_hostname)
            .chain(ips.into_iter().map(StatusEntry::from_ip))
            .collect()
    }
}

impl PartialEq for AddressSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|a| other.contains(a))
    }
}

impl Eq for AddressSet {}

impl<A: Into<Address>> FromIterator<A> for AddressSet {
    fn from_iter<I: IntoIterator<Item = A>>(iter: I) -> Self {
        let mut set = AddressSet::new();
        for address in iter {
            set.insert(address);
        }
        set
    }
}

impl<A: Into<Address>> Extend<A> for AddressSet {
    fn extend<I: IntoIterator<Item = A>>(&mut self, iter: I) {
        for address in iter {
            self.insert(address);
        }
    }
}

/// Compare two status lists as sets.
///
/// Entries are assumed unique within each list.
pub fn status_equal(lhs: &[StatusEntry], rhs: &[StatusEntry]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let lhs: HashSet<&StatusEntry> = lhs.iter().collect();
    rhs.iter().all(|entry| lhs.contains(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_balancer_entries() -> Vec<StatusEntry> {
        vec![
            StatusEntry::from_parts(Some("10.0.0.1".into()), Some("foo1".into())),
            StatusEntry::from_parts(Some("10.0.0.2".into()), Some("foo2".into())),
            StatusEntry::from_parts(Some("10.0.0.3".into()), Some(String::new())),
            StatusEntry::from_parts(Some(String::new()), Some("foo4".into())),
        ]
    }

    #[test]
    fn test_to_status_orders_hostnames_then_ips() {
        let set: AddressSet = ["10.0.0.1", "2001:db8::68", "opensource-k8s-ingress"]
            .into_iter()
            .collect();

        let status = set.to_status();

        assert_eq!(
            status,
            vec![
                StatusEntry::from_hostname("opensource-k8s-ingress"),
                StatusEntry::from_ip("10.0.0.1"),
                StatusEntry::from_ip("2001:db8::68"),
            ]
        );
    }

    #[test]
    fn test_to_status_keeps_hostname_discovery_order() {
        let set: AddressSet = ["zeta.example.com", "10.0.0.9", "alpha.example.com", "10.0.0.10"]
            .into_iter()
            .collect();

        let status = set.to_status();

        assert_eq!(
            status,
            vec![
                StatusEntry::from_hostname("zeta.example.com"),
                StatusEntry::from_hostname("alpha.example.com"),
                StatusEntry::from_ip("10.0.0.10"),
                StatusEntry::from_ip("10.0.0.9"),
            ]
        );
    }

    #[test]
    fn test_to_status_empty() {
        assert!(AddressSet::new().to_status().is_empty());
    }

    #[test]
    fn test_address_set_deduplicates() {
        let mut set = AddressSet::new();
        assert!(set.insert("11.0.0.2"));
        assert!(!set.insert("11.0.0.2"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_address_set_equality_ignores_order() {
        let a: AddressSet = ["10.0.0.1", "foo"].into_iter().collect();
        let b: AddressSet = ["foo", "10.0.0.1"].into_iter().collect();
        let c: AddressSet = ["foo"].into_iter().collect();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_from_parts_normalizes_empty_strings() {
        let entry = StatusEntry::from_parts(Some(String::new()), Some("foo4".into()));
        assert_eq!(entry, StatusEntry::from_hostname("foo4"));
        assert_eq!(entry.address(), Some("foo4"));

        let entry = StatusEntry::from_parts(Some(String::new()), None);
        assert_eq!(entry.address(), None);
    }

    #[test]
    fn test_status_equal() {
        let fk1 = load_balancer_entries();
        let mut fk2 = load_balancer_entries();
        fk2.push(StatusEntry::from_parts(
            Some("10.0.0.5".into()),
            Some("foo5".into()),
        ));
        let mut fk3 = load_balancer_entries();
        fk3[0].hostname = Some("foo_no_01".into());
        let mut fk4 = load_balancer_entries();
        fk4[2].ip = Some("11.0.0.3".into());
        let mut reversed = load_balancer_entries();
        reversed.reverse();

        let empty: Vec<StatusEntry> = Vec::new();

        let cases = [
            (fk1.as_slice(), fk1.as_slice(), true),
            (fk2.as_slice(), fk1.as_slice(), false),
            (fk3.as_slice(), fk1.as_slice(), false),
            (fk4.as_slice(), fk1.as_slice(), false),
            (fk1.as_slice(), empty.as_slice(), false),
            (empty.as_slice(), empty.as_slice(), true),
            (reversed.as_slice(), fk1.as_slice(), true),
        ];

        for (lhs, rhs, expected) in cases {
            assert_eq!(
                status_equal(lhs, rhs),
                expected,
                "lhs={lhs:?} rhs={rhs:?}"
            );
        }
    }

    #[test]
    fn test_status_entry_serializes_like_ingress_status() {
        let json = serde_json::to_value(vec![
            StatusEntry::from_hostname("lb.example.com"),
            StatusEntry::from_ip("10.0.0.1"),
        ])
        .expect("status should serialize");

        assert_eq!(
            json,
            serde_json::json!([{"hostname": "lb.example.com"}, {"ip": "10.0.0.1"}])
        );
    }
}
