//! Reachability probes.
//!
//! Supports ICMP echo (native socket or `ping` command) and TCP connect probes.
//! The monitor only sees the [`Prober`] trait: a latency in milliseconds, or
//! `None` when the host did not answer in time.

mod ping;
mod tcp;

pub use ping::*;
pub use tcp::*;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// A capability that measures round-trip time to an address.
///
/// Implementations must be safe to call concurrently for different hosts and
/// must return within `timeout`.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str, timeout: Duration) -> Option<f64>;
}

/// Which probe the binary uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    Icmp,
    Tcp(u16),
}

impl ProbeMethod {
    /// Parse `icmp` or `tcp:<port>`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "icmp" | "ping" => Some(ProbeMethod::Icmp),
            other => other
                .strip_prefix("tcp:")
                .and_then(|port| port.parse().ok())
                .filter(|port| *port != 0)
                .map(ProbeMethod::Tcp),
        }
    }

    pub fn build(self) -> std::sync::Arc<dyn Prober> {
        match self {
            ProbeMethod::Icmp => std::sync::Arc::new(PingProber),
            ProbeMethod::Tcp(port) => std::sync::Arc::new(TcpProber::new(port)),
        }
    }
}

/// Convert a probe result into the monitor's view, logging failures.
fn into_latency(address: &str, result: Result<Duration, ProbeError>) -> Option<f64> {
    match result {
        Ok(rtt) => Some(rtt.as_secs_f64() * 1000.0),
        Err(ProbeError::Timeout(_)) => None,
        Err(e) => {
            tracing::debug!("Probe failed for {}: {}", address, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_method() {
        assert_eq!(ProbeMethod::parse("icmp"), Some(ProbeMethod::Icmp));
        assert_eq!(ProbeMethod::parse("PING"), Some(ProbeMethod::Icmp));
        assert_eq!(ProbeMethod::parse("tcp:443"), Some(ProbeMethod::Tcp(443)));
        assert_eq!(ProbeMethod::parse("tcp:0"), None);
        assert_eq!(ProbeMethod::parse("tcp:http"), None);
        assert_eq!(ProbeMethod::parse("dns"), None);
    }

    #[test]
    fn test_into_latency_converts_to_ms() {
        let ms = into_latency("x", Ok(Duration::from_micros(12_500))).unwrap();
        assert!((ms - 12.5).abs() < 1e-9);
        assert_eq!(into_latency("x", Err(ProbeError::Timeout(Duration::from_secs(2)))), None);
        assert_eq!(into_latency("x", Err(ProbeError::Network("down".into()))), None);
    }
}
