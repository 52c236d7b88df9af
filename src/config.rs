//! Process configuration for netpulse.
//!
//! Loads configuration from environment variables with sensible defaults.
//! User-facing preferences live in [`crate::settings`] instead.

use std::env;

use crate::notify::AlertMode;
use crate::probe::ProbeMethod;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "netpulse.db")
    pub db_path: String,
    /// How hosts are probed (default: ICMP echo)
    pub probe: ProbeMethod,
    /// Where alerts are delivered (default: desktop notifications)
    pub alerts: AlertMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "netpulse.db".to_string(),
            probe: ProbeMethod::Icmp,
            alerts: AlertMode::Desktop,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `NETPULSE_HTTP_PORT`: HTTP port (default: 8080)
    /// - `NETPULSE_DB_PATH`: Database file path (default: "netpulse.db")
    /// - `NETPULSE_PROBE`: `icmp` or `tcp:<port>` (default: `icmp`)
    /// - `NETPULSE_ALERTS`: `desktop` or `log` (default: `desktop`)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(port_str) = lookup("NETPULSE_HTTP_PORT") {
            match port_str.parse() {
                Ok(port) => cfg.http_port = port,
                Err(_) => tracing::warn!("Ignoring invalid NETPULSE_HTTP_PORT {:?}", port_str),
            }
        }

        if let Some(db_path) = lookup("NETPULSE_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(probe) = lookup("NETPULSE_PROBE") {
            match ProbeMethod::parse(&probe) {
                Some(method) => cfg.probe = method,
                None => tracing::warn!("Ignoring invalid NETPULSE_PROBE {:?}", probe),
            }
        }

        if let Some(alerts) = lookup("NETPULSE_ALERTS") {
            match AlertMode::parse(&alerts) {
                Some(mode) => cfg.alerts = mode,
                None => tracing::warn!("Ignoring invalid NETPULSE_ALERTS {:?}", alerts),
            }
        }

        cfg
    }
}
