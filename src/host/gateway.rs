//! Default gateway discovery from the OS routing table.
//!
//! The routing table is read through a [`RouteSource`] and the result is cached
//! for [`GATEWAY_CACHE_TTL`].

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::Instant;

/// How long a non-empty discovery result is served from the cache.
pub const GATEWAY_CACHE_TTL: Duration = Duration::from_secs(30);

/// Upper bound on one routing-table query.
pub const ROUTE_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Routing-table query error types.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: &'static str,
        source: std::io::Error,
    },
    #[error("{command} exited with {status}")]
    Failed {
        command: &'static str,
        status: std::process::ExitStatus,
    },
    #[error("route output is not valid UTF-8")]
    Unreadable,
    #[error("route query timed out after {0:?}")]
    Timeout(Duration),
}

/// A default route's next hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub address: String,
    pub interface: String,
}

/// Something that can dump the default routes as text.
///
/// Lines are expected in the BSD `netstat -rn` shape:
/// `default <gateway> <flags> <interface> ...`.
#[async_trait]
pub trait RouteSource: Send + Sync {
    async fn query_default_routes(&self) -> Result<String, RouteError>;
}

/// Reads default routes by shelling out to the platform's routing tool.
#[derive(Debug, Clone, Default)]
pub struct CommandRouteSource;

#[async_trait]
impl RouteSource for CommandRouteSource {
    async fn query_default_routes(&self) -> Result<String, RouteError> {
        if cfg!(target_os = "linux") {
            let v4 = run_route_command("ip", &["-4", "route", "show", "default"]).await?;
            // No IPv6 default route is fine.
            let v6 = run_route_command("ip", &["-6", "route", "show", "default"])
                .await
                .unwrap_or_default();
            Ok(normalize_ip_route(&format!("{}\n{}", v4, v6)))
        } else {
            run_route_command("netstat", &["-rn"]).await
        }
    }
}

async fn run_route_command(command: &'static str, args: &[&str]) -> Result<String, RouteError> {
    let run = Command::new(command)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(ROUTE_QUERY_TIMEOUT, run)
        .await
        .map_err(|_| RouteError::Timeout(ROUTE_QUERY_TIMEOUT))?
        .map_err(|source| RouteError::Spawn { command, source })?;

    if !output.status.success() {
        return Err(RouteError::Failed {
            command,
            status: output.status,
        });
    }

    String::from_utf8(output.stdout).map_err(|_| RouteError::Unreadable)
}

/// Rewrite iproute2 lines (`default via 192.168.1.1 dev eth0 proto dhcp`) into
/// the `default <gateway> <flags> <interface>` shape the parser expects.
fn normalize_ip_route(output: &str) -> String {
    let mut lines = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.first() != Some(&"default") {
            continue;
        }
        let value_after = |key: &str| {
            fields
                .iter()
                .position(|f| *f == key)
                .and_then(|i| fields.get(i + 1))
                .copied()
        };
        if let (Some(gateway), Some(dev)) = (value_after("via"), value_after("dev")) {
            lines.push(format!("default {} UG {}", gateway, dev));
        }
    }
    lines.join("\n")
}

/// Parse routing-table output into the set of usable gateways, sorted by
/// interface name.
pub fn parse_default_routes(output: &str) -> Vec<GatewayInfo> {
    let mut found = BTreeSet::new();

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[0] != "default" {
            continue;
        }

        let address = fields[1];
        if !is_plausible_gateway(address) {
            continue;
        }

        found.insert((fields[3].to_string(), address.to_string()));
    }

    found
        .into_iter()
        .map(|(interface, address)| GatewayInfo { address, interface })
        .collect()
}

fn is_plausible_gateway(token: &str) -> bool {
    if !token.contains('.') && !token.contains(':') {
        return false;
    }
    if token.starts_with("link#") {
        return false;
    }
    if token.to_ascii_lowercase().starts_with("fe80::") {
        return false;
    }

    // Strip an IPv6 zone before asking std about loopback.
    let bare = token.split('%').next().unwrap_or(token);
    match bare.parse::<IpAddr>() {
        Ok(ip) => !ip.is_loopback(),
        Err(_) => true,
    }
}

/// TTL cache in front of a [`RouteSource`].
pub struct GatewayCache {
    source: Arc<dyn RouteSource>,
    ttl: Duration,
    cached: Vec<GatewayInfo>,
    fetched_at: Option<Instant>,
}

impl GatewayCache {
    pub fn new(source: Arc<dyn RouteSource>) -> Self {
        Self::with_ttl(source, GATEWAY_CACHE_TTL)
    }

    pub fn with_ttl(source: Arc<dyn RouteSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cached: Vec::new(),
            fetched_at: None,
        }
    }

    /// Current gateways, re-querying the routing table when the cache is
    /// empty, stale, or `force_refresh` is set. A failed or hung query yields
    /// an empty set after at most [`ROUTE_QUERY_TIMEOUT`].
    pub async fn discover(&mut self, force_refresh: bool) -> Vec<GatewayInfo> {
        if !force_refresh && self.is_fresh() {
            return self.cached.clone();
        }

        let query = tokio::time::timeout(ROUTE_QUERY_TIMEOUT, self.source.query_default_routes());
        let result = query
            .await
            .unwrap_or(Err(RouteError::Timeout(ROUTE_QUERY_TIMEOUT)));
        let gateways = match result {
            Ok(output) => parse_default_routes(&output),
            Err(e) => {
                tracing::warn!("Gateway discovery failed: {}", e);
                Vec::new()
            }
        };

        if gateways != self.cached {
            tracing::info!("Gateway discovery: {} gateway(s) found", gateways.len());
        }

        self.cached = gateways.clone();
        self.fetched_at = Some(Instant::now());
        gateways
    }

    fn is_fresh(&self) -> bool {
        match self.fetched_at {
            Some(at) => !self.cached.is_empty() && at.elapsed() < self.ttl,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRoutes {
        output: Option<String>,
        calls: AtomicUsize,
    }

    impl FakeRoutes {
        fn new(output: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                output: output.map(str::to_string),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RouteSource for FakeRoutes {
        async fn query_default_routes(&self) -> Result<String, RouteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.output.clone().ok_or(RouteError::Unreadable)
        }
    }

    #[test]
    fn test_parse_macos_default_route() {
        let gateways = parse_default_routes("default 192.168.1.1 UGScg en0");
        assert_eq!(
            gateways,
            vec![GatewayInfo {
                address: "192.168.1.1".to_string(),
                interface: "en0".to_string(),
            }]
        );
    }

    #[test]
    fn test_parse_excludes_link_local() {
        assert!(parse_default_routes("default fe80::1%en0 UGcIg en0").is_empty());
        assert!(parse_default_routes("default FE80::1%en0 UGcIg en0").is_empty());
    }

    #[test]
    fn test_parse_netstat_table() {
        let output = r#"Routing tables

Internet:
Destination        Gateway            Flags           Netif Expire
default            192.168.1.1        UGScg             en0
default            link#17            UCSIg         bridge0
default            10.0.0.1           UGScIg            en7
default            192.168.1.1        UGScg             en0
127                127.0.0.1          UCS               lo0
default            127.0.0.1          UGS               lo0
default            wat                UGS               en3

Internet6:
default            fe80::%utun0       UGcIg           utun0
default            2001:db8::1        UGcg              en0
default            ::1                UGcg              lo0
"#;
        let gateways = parse_default_routes(output);
        let pairs: Vec<(&str, &str)> = gateways
            .iter()
            .map(|g| (g.interface.as_str(), g.address.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("en0", "192.168.1.1"),
                ("en0", "2001:db8::1"),
                ("en7", "10.0.0.1"),
            ]
        );
    }

    #[test]
    fn test_parse_skips_short_lines() {
        assert!(parse_default_routes("default 192.168.1.1 UG").is_empty());
        assert!(parse_default_routes("").is_empty());
    }

    #[test]
    fn test_normalize_ip_route() {
        let output = "default via 192.168.1.254 dev wlan0 proto dhcp metric 600\n\
                      default dev tun0 scope link\n";
        let normalized = normalize_ip_route(output);
        assert_eq!(normalized, "default 192.168.1.254 UG wlan0");
        assert_eq!(
            parse_default_routes(&normalized),
            vec![GatewayInfo {
                address: "192.168.1.254".to_string(),
                interface: "wlan0".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_cache_serves_fresh_result() {
        let source = FakeRoutes::new(Some("default 192.168.1.1 UGScg en0"));
        let mut cache = GatewayCache::new(source.clone());

        assert_eq!(cache.discover(false).await.len(), 1);
        assert_eq!(cache.discover(false).await.len(), 1);
        assert_eq!(source.calls(), 1);

        cache.discover(true).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let source = FakeRoutes::new(Some("default 192.168.1.1 UGScg en0"));
        let mut cache = GatewayCache::new(source.clone());

        cache.discover(false).await;
        tokio::time::advance(GATEWAY_CACHE_TTL - Duration::from_secs(1)).await;
        cache.discover(false).await;
        assert_eq!(source.calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.discover(false).await;
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_query_yields_empty_and_retries() {
        let source = FakeRoutes::new(None);
        let mut cache = GatewayCache::new(source.clone());

        assert!(cache.discover(false).await.is_empty());
        assert!(cache.discover(false).await.is_empty());
        assert_eq!(source.calls(), 2);
    }

    struct StuckRoutes;

    #[async_trait]
    impl RouteSource for StuckRoutes {
        async fn query_default_routes(&self) -> Result<String, RouteError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_query_times_out() {
        let mut cache = GatewayCache::new(Arc::new(StuckRoutes));

        let started = Instant::now();
        assert!(cache.discover(false).await.is_empty());
        let elapsed = started.elapsed();
        assert!(elapsed >= ROUTE_QUERY_TIMEOUT && elapsed < GATEWAY_CACHE_TTL);
    }
}
