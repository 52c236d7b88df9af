//! Monitored hosts: user-defined targets plus discovered gateways.

mod gateway;

pub use gateway::*;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for ids derived from a host's address, so discovered and
/// built-in hosts keep the same id from one discovery to the next.
const HOST_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6e65_7470_756c_7365_8000_0000_0000_0001);

/// Hosts probed when neither discovery nor the user supplies any.
const FALLBACK_HOSTS: [(&str, &str); 2] = [("1.1.1.1", "Cloudflare DNS"), ("8.8.8.8", "Google DNS")];

/// Opaque host identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(Uuid);

impl HostId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Stable id for a host that is not persisted.
    pub fn derived(address: &str, interface: Option<&str>) -> Self {
        let key = format!("{}|{}", address, interface.unwrap_or(""));
        Self(Uuid::new_v5(&HOST_ID_NAMESPACE, key.as_bytes()))
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for HostId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A network endpoint subject to periodic latency measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub address: String,
    pub label: String,
    pub enabled: bool,
    pub user_defined: bool,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_true")]
    pub notify_on_issue: bool,
}

fn default_true() -> bool {
    true
}

impl Host {
    pub fn user(address: &str, label: &str) -> Self {
        let address = address.trim().to_string();
        let label = match label.trim() {
            "" => address.clone(),
            l => l.to_string(),
        };
        Self {
            id: HostId::random(),
            address,
            label,
            enabled: true,
            user_defined: true,
            interface: None,
            notify_on_issue: true,
        }
    }

    pub fn gateway(info: &GatewayInfo) -> Self {
        Self {
            id: HostId::derived(&info.address, Some(&info.interface)),
            address: info.address.clone(),
            label: format!("Gateway ({})", info.interface),
            enabled: true,
            user_defined: false,
            interface: Some(info.interface.clone()),
            notify_on_issue: true,
        }
    }

    fn fallback(address: &str, label: &str) -> Self {
        Self {
            id: HostId::derived(address, None),
            address: address.to_string(),
            label: label.to_string(),
            enabled: true,
            user_defined: false,
            interface: None,
            notify_on_issue: true,
        }
    }
}

/// The built-in hosts used when the monitored list would otherwise be empty.
pub fn fallback_hosts() -> Vec<Host> {
    FALLBACK_HOSTS
        .iter()
        .map(|(address, label)| Host::fallback(address, label))
        .collect()
}

/// Authoritative list of monitored hosts.
///
/// Only the user-defined subset is mutable; gateways come from the
/// [`GatewayCache`] and are rebuilt on every listing.
pub struct HostRegistry {
    user_hosts: Vec<Host>,
    gateways: GatewayCache,
    auto_discover: bool,
}

impl HostRegistry {
    pub fn new(user_hosts: Vec<Host>, gateways: GatewayCache, auto_discover: bool) -> Self {
        Self {
            user_hosts,
            gateways,
            auto_discover,
        }
    }

    pub fn user_hosts(&self) -> &[Host] {
        &self.user_hosts
    }

    pub fn auto_discover(&self) -> bool {
        self.auto_discover
    }

    pub fn set_auto_discover(&mut self, enabled: bool) {
        self.auto_discover = enabled;
    }

    /// Gateways first, then user hosts; the fallback pair if both are empty.
    pub async fn list_monitored_hosts(&mut self) -> Vec<Host> {
        self.list(false).await
    }

    /// Like [`HostRegistry::list_monitored_hosts`] but bypasses the gateway
    /// cache.
    pub async fn refresh(&mut self) -> Vec<Host> {
        self.list(true).await
    }

    async fn list(&mut self, force_refresh: bool) -> Vec<Host> {
        let mut hosts = Vec::new();

        if self.auto_discover {
            let gateways = self.gateways.discover(force_refresh).await;
            hosts.extend(gateways.iter().map(Host::gateway));
        }

        hosts.extend(self.user_hosts.iter().cloned());

        if hosts.is_empty() {
            return fallback_hosts();
        }
        hosts
    }

    /// Add a user-defined host. Returns `None` if the address is blank.
    pub fn add_host(&mut self, address: &str, label: &str) -> Option<Host> {
        if address.trim().is_empty() {
            return None;
        }
        let host = Host::user(address, label);
        self.user_hosts.push(host.clone());
        Some(host)
    }

    pub fn update_host(&mut self, id: HostId, address: &str, label: &str) -> bool {
        let address = address.trim();
        if address.is_empty() {
            return false;
        }
        match self.user_host_mut(id) {
            Some(host) => {
                host.address = address.to_string();
                host.label = match label.trim() {
                    "" => address.to_string(),
                    l => l.to_string(),
                };
                true
            }
            None => false,
        }
    }

    pub fn remove_host(&mut self, id: HostId) -> bool {
        let before = self.user_hosts.len();
        self.user_hosts.retain(|h| h.id != id);
        self.user_hosts.len() != before
    }

    pub fn toggle_host(&mut self, id: HostId) -> bool {
        match self.user_host_mut(id) {
            Some(host) => {
                host.enabled = !host.enabled;
                true
            }
            None => false,
        }
    }

    pub fn toggle_host_notification(&mut self, id: HostId) -> bool {
        match self.user_host_mut(id) {
            Some(host) => {
                host.notify_on_issue = !host.notify_on_issue;
                true
            }
            None => false,
        }
    }

    fn user_host_mut(&mut self, id: HostId) -> Option<&mut Host> {
        self.user_hosts.iter_mut().find(|h| h.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    struct StaticRoutes(Option<&'static str>);

    #[async_trait]
    impl RouteSource for StaticRoutes {
        async fn query_default_routes(&self) -> Result<String, RouteError> {
            self.0.map(str::to_string).ok_or(RouteError::Unreadable)
        }
    }

    fn registry(routes: Option<&'static str>, user_hosts: Vec<Host>, auto: bool) -> HostRegistry {
        let cache = GatewayCache::new(Arc::new(StaticRoutes(routes)));
        HostRegistry::new(user_hosts, cache, auto)
    }

    #[test]
    fn test_gateways_come_first() {
        let mut reg = registry(
            Some("default 192.168.1.1 UGScg en0"),
            vec![Host::user("example.com", "Example")],
            true,
        );
        let hosts = tokio_test::block_on(reg.list_monitored_hosts());
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].address, "192.168.1.1");
        assert_eq!(hosts[0].label, "Gateway (en0)");
        assert!(!hosts[0].user_defined);
        assert_eq!(hosts[1].label, "Example");
    }

    #[test]
    fn test_discovery_disabled_skips_gateways() {
        let mut reg = registry(
            Some("default 192.168.1.1 UGScg en0"),
            vec![Host::user("example.com", "")],
            false,
        );
        let hosts = tokio_test::block_on(reg.list_monitored_hosts());
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].label, "example.com");
    }

    #[test]
    fn test_empty_list_uses_fallback_hosts() {
        let mut reg = registry(None, Vec::new(), true);
        let hosts = tokio_test::block_on(reg.list_monitored_hosts());
        let addresses: Vec<&str> = hosts.iter().map(|h| h.address.as_str()).collect();
        assert_eq!(addresses, vec!["1.1.1.1", "8.8.8.8"]);
    }

    #[test]
    fn test_gateway_ids_are_stable() {
        let info = GatewayInfo {
            address: "10.0.0.1".to_string(),
            interface: "en0".to_string(),
        };
        assert_eq!(Host::gateway(&info).id, Host::gateway(&info).id);
        assert_eq!(fallback_hosts()[0].id, fallback_hosts()[0].id);
    }

    #[test]
    fn test_mutations_touch_user_hosts_only() {
        let mut reg = registry(None, Vec::new(), false);
        let host = reg.add_host(" 9.9.9.9 ", "Quad9").unwrap();
        assert_eq!(host.address, "9.9.9.9");
        assert!(reg.add_host("   ", "blank").is_none());

        assert!(reg.toggle_host(host.id));
        assert!(!reg.user_hosts()[0].enabled);
        assert!(reg.toggle_host_notification(host.id));
        assert!(!reg.user_hosts()[0].notify_on_issue);
        assert!(reg.update_host(host.id, "149.112.112.112", ""));
        assert_eq!(reg.user_hosts()[0].label, "149.112.112.112");

        let gateway_id = fallback_hosts()[0].id;
        assert!(!reg.toggle_host(gateway_id));
        assert!(!reg.remove_host(HostId::random()));

        assert!(reg.remove_host(host.id));
        assert!(reg.user_hosts().is_empty());
    }

    #[test]
    fn test_host_id_parses_from_display() {
        let id = HostId::random();
        let parsed: HostId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
