//! User settings with write-through persistence.
//!
//! Every value is read once at startup (falling back to its default when
//! missing or unreadable) and written back synchronously by its setter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::{Host, HostId};
use crate::status::Thresholds;

pub const KEY_POLL_INTERVAL: &str = "poll_interval_secs";
pub const KEY_USER_HOSTS: &str = "user_hosts";
pub const KEY_THRESHOLDS: &str = "thresholds";
pub const KEY_NOTIFICATIONS: &str = "notifications";
pub const KEY_DISPLAY_MODE: &str = "display_mode";
pub const KEY_LATENCY_SOURCE: &str = "latency_source";
pub const KEY_MOVING_AVERAGE: &str = "moving_average_secs";
pub const KEY_AUTO_DISCOVER: &str = "auto_discover";
pub const KEY_PINNED_HOST: &str = "pinned_host";
pub const KEY_RETENTION_DAYS: &str = "history_retention_days";

/// Settings store error types.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Durable key/value persistence for settings.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SettingsError>;
    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError>;
}

/// In-memory store, used by tests and when no database is available.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, SettingsError> {
        let values = self
            .values
            .lock()
            .map_err(|_| SettingsError::Storage("memory store lock poisoned".into()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| SettingsError::Storage("memory store lock poisoned".into()))?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Poll period, restricted to a fixed set of choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct PollInterval(u64);

impl PollInterval {
    pub const OPTIONS: [u64; 7] = [1, 2, 3, 5, 10, 30, 60];

    pub fn from_secs(secs: u64) -> Option<Self> {
        Self::OPTIONS.contains(&secs).then_some(Self(secs))
    }

    pub fn secs(self) -> u64 {
        self.0
    }

    pub fn as_duration(self) -> std::time::Duration {
        std::time::Duration::from_secs(self.0)
    }
}

impl Default for PollInterval {
    fn default() -> Self {
        Self(3)
    }
}

impl TryFrom<u64> for PollInterval {
    type Error = String;

    fn try_from(secs: u64) -> Result<Self, Self::Error> {
        Self::from_secs(secs).ok_or_else(|| format!("{}s is not a supported poll interval", secs))
    }
}

impl From<PollInterval> for u64 {
    fn from(p: PollInterval) -> u64 {
        p.0
    }
}

/// Which alerts are enabled and how long a problem must last before firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationPrefs {
    pub on_poor: bool,
    pub on_offline: bool,
    pub on_recovery: bool,
    pub sound: bool,
    pub delay_secs: u64,
}

impl Default for NotificationPrefs {
    fn default() -> Self {
        Self {
            on_poor: true,
            on_offline: true,
            on_recovery: true,
            sound: true,
            delay_secs: 0,
        }
    }
}

impl NotificationPrefs {
    pub fn delay(&self) -> chrono::Duration {
        i64::try_from(self.delay_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    StatusOnly,
    LatencyOnly,
    #[default]
    StatusAndLatency,
}

/// Whether the headline latency is the latest sample or the moving average.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencySource {
    #[default]
    Instant,
    MovingAverage,
}

const DEFAULT_MOVING_AVERAGE_SECS: u64 = 30;
const MAX_MOVING_AVERAGE_SECS: u64 = 600;
const DEFAULT_RETENTION_DAYS: u32 = 7;

/// Longest accepted alert delay: one day.
pub const MAX_ALERT_DELAY_SECS: u64 = 86_400;

/// Current settings plus the store they are written to.
pub struct Settings {
    store: Arc<dyn KeyValueStore>,
    poll_interval: PollInterval,
    user_hosts: Vec<Host>,
    thresholds: Thresholds,
    notifications: NotificationPrefs,
    display_mode: DisplayMode,
    latency_source: LatencySource,
    moving_average_secs: u64,
    auto_discover: bool,
    pinned_host: Option<HostId>,
    retention_days: u32,
}

impl Settings {
    /// Read every setting from `store`, using defaults for anything missing.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let mut notifications: NotificationPrefs =
            read_or_default(store.as_ref(), KEY_NOTIFICATIONS, NotificationPrefs::default());
        if notifications.delay_secs > MAX_ALERT_DELAY_SECS {
            tracing::warn!(
                "Clamping stored alert delay of {}s to {}s",
                notifications.delay_secs,
                MAX_ALERT_DELAY_SECS
            );
            notifications.delay_secs = MAX_ALERT_DELAY_SECS;
        }

        let mut moving_average_secs =
            read_or_default(store.as_ref(), KEY_MOVING_AVERAGE, DEFAULT_MOVING_AVERAGE_SECS);
        if !(1..=MAX_MOVING_AVERAGE_SECS).contains(&moving_average_secs) {
            tracing::warn!("Ignoring out of range moving average window {}s", moving_average_secs);
            moving_average_secs = DEFAULT_MOVING_AVERAGE_SECS;
        }

        Self {
            poll_interval: read_or_default(store.as_ref(), KEY_POLL_INTERVAL, PollInterval::default()),
            user_hosts: read_or_default(store.as_ref(), KEY_USER_HOSTS, Vec::new()),
            thresholds: read_or_default(store.as_ref(), KEY_THRESHOLDS, Thresholds::default()),
            notifications,
            display_mode: read_or_default(store.as_ref(), KEY_DISPLAY_MODE, DisplayMode::default()),
            latency_source: read_or_default(store.as_ref(), KEY_LATENCY_SOURCE, LatencySource::default()),
            moving_average_secs,
            auto_discover: read_or_default(store.as_ref(), KEY_AUTO_DISCOVER, true),
            pinned_host: read_or_default(store.as_ref(), KEY_PINNED_HOST, None),
            retention_days: read_or_default(store.as_ref(), KEY_RETENTION_DAYS, DEFAULT_RETENTION_DAYS),
            store,
        }
    }

    pub fn poll_interval(&self) -> PollInterval {
        self.poll_interval
    }

    pub fn user_hosts(&self) -> &[Host] {
        &self.user_hosts
    }

    /// Stored thresholds, possibly invalid; see [`Thresholds::validated`].
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn notifications(&self) -> NotificationPrefs {
        self.notifications
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode
    }

    pub fn latency_source(&self) -> LatencySource {
        self.latency_source
    }

    pub fn moving_average_window(&self) -> chrono::Duration {
        i64::try_from(self.moving_average_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }

    pub fn moving_average_secs(&self) -> u64 {
        self.moving_average_secs
    }

    pub fn auto_discover(&self) -> bool {
        self.auto_discover
    }

    pub fn pinned_host(&self) -> Option<HostId> {
        self.pinned_host
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn set_poll_interval(&mut self, interval: PollInterval) -> Result<(), SettingsError> {
        self.poll_interval = interval;
        self.write(KEY_POLL_INTERVAL, &interval)
    }

    /// Persist the user-defined hosts. Non user-defined entries are dropped.
    pub fn set_user_hosts(&mut self, hosts: &[Host]) -> Result<(), SettingsError> {
        self.user_hosts = hosts.iter().filter(|h| h.user_defined).cloned().collect();
        self.write(KEY_USER_HOSTS, &self.user_hosts)
    }

    /// Thresholds are stored as given, even if not ascending, so an editor can
    /// show what the user typed; classification uses the validated view.
    pub fn set_thresholds(&mut self, thresholds: Thresholds) -> Result<(), SettingsError> {
        let values = [thresholds.excellent, thresholds.good, thresholds.fair];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(SettingsError::Invalid {
                key: KEY_THRESHOLDS,
                reason: "thresholds must be finite numbers".into(),
            });
        }
        self.thresholds = thresholds;
        self.write(KEY_THRESHOLDS, &thresholds)
    }

    pub fn set_notifications(&mut self, prefs: NotificationPrefs) -> Result<(), SettingsError> {
        if prefs.delay_secs > MAX_ALERT_DELAY_SECS {
            return Err(SettingsError::Invalid {
                key: KEY_NOTIFICATIONS,
                reason: format!("delay of {}s exceeds {}s", prefs.delay_secs, MAX_ALERT_DELAY_SECS),
            });
        }
        self.notifications = prefs;
        self.write(KEY_NOTIFICATIONS, &prefs)
    }

    pub fn set_display_mode(&mut self, mode: DisplayMode) -> Result<(), SettingsError> {
        self.display_mode = mode;
        self.write(KEY_DISPLAY_MODE, &mode)
    }

    pub fn set_latency_source(&mut self, source: LatencySource) -> Result<(), SettingsError> {
        self.latency_source = source;
        self.write(KEY_LATENCY_SOURCE, &source)
    }

    pub fn set_moving_average_secs(&mut self, secs: u64) -> Result<(), SettingsError> {
        if !(1..=MAX_MOVING_AVERAGE_SECS).contains(&secs) {
            return Err(SettingsError::Invalid {
                key: KEY_MOVING_AVERAGE,
                reason: format!("{}s is outside 1..={}", secs, MAX_MOVING_AVERAGE_SECS),
            });
        }
        self.moving_average_secs = secs;
        self.write(KEY_MOVING_AVERAGE, &secs)
    }

    pub fn set_auto_discover(&mut self, enabled: bool) -> Result<(), SettingsError> {
        self.auto_discover = enabled;
        self.write(KEY_AUTO_DISCOVER, &enabled)
    }

    pub fn set_pinned_host(&mut self, host: Option<HostId>) -> Result<(), SettingsError> {
        self.pinned_host = host;
        self.write(KEY_PINNED_HOST, &host)
    }

    pub fn set_retention_days(&mut self, days: u32) -> Result<(), SettingsError> {
        if days == 0 {
            return Err(SettingsError::Invalid {
                key: KEY_RETENTION_DAYS,
                reason: "retention must be at least one day".into(),
            });
        }
        self.retention_days = days;
        self.write(KEY_RETENTION_DAYS, &days)
    }

    fn write<T: Serialize>(&self, key: &'static str, value: &T) -> Result<(), SettingsError> {
        let encoded = serde_json::to_string(value)?;
        self.store.set(key, &encoded)
    }
}

fn read_or_default<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str, default: T) -> T {
    match store.get(key) {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Ignoring unreadable setting {}: {}", key, e);
                default
            }
        },
        Ok(None) => default,
        Err(e) => {
            tracing::warn!("Failed to read setting {}: {}", key, e);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(store: &MemoryStore) -> Settings {
        Settings::load(Arc::new(store.clone()))
    }

    #[test]
    fn test_defaults_when_empty() {
        let settings = load(&MemoryStore::new());
        assert_eq!(settings.poll_interval().secs(), 3);
        assert!(settings.user_hosts().is_empty());
        assert_eq!(settings.thresholds(), Thresholds::default());
        assert_eq!(settings.notifications(), NotificationPrefs::default());
        assert_eq!(settings.display_mode(), DisplayMode::StatusAndLatency);
        assert_eq!(settings.latency_source(), LatencySource::Instant);
        assert_eq!(settings.moving_average_secs(), 30);
        assert!(settings.auto_discover());
        assert_eq!(settings.pinned_host(), None);
        assert_eq!(settings.retention_days(), 7);
    }

    #[test]
    fn test_setters_write_through() {
        let store = MemoryStore::new();
        let mut settings = load(&store);

        settings.set_poll_interval(PollInterval::from_secs(10).unwrap()).unwrap();
        settings.set_thresholds(Thresholds::new(20.0, 40.0, 80.0)).unwrap();
        settings.set_auto_discover(false).unwrap();
        let host = Host::user("example.com", "Example");
        settings.set_user_hosts(std::slice::from_ref(&host)).unwrap();
        settings.set_pinned_host(Some(host.id)).unwrap();
        settings
            .set_notifications(NotificationPrefs {
                delay_secs: 15,
                sound: false,
                ..Default::default()
            })
            .unwrap();

        let reloaded = load(&store);
        assert_eq!(reloaded.poll_interval().secs(), 10);
        assert_eq!(reloaded.thresholds(), Thresholds::new(20.0, 40.0, 80.0));
        assert!(!reloaded.auto_discover());
        assert_eq!(reloaded.user_hosts(), &[host.clone()]);
        assert_eq!(reloaded.pinned_host(), Some(host.id));
        assert_eq!(reloaded.notifications().delay_secs, 15);
        assert!(!reloaded.notifications().sound);
    }

    #[test]
    fn test_invalid_thresholds_are_stored_as_typed() {
        let store = MemoryStore::new();
        let mut settings = load(&store);
        settings.set_thresholds(Thresholds::new(300.0, 200.0, 100.0)).unwrap();
        assert_eq!(load(&store).thresholds(), Thresholds::new(300.0, 200.0, 100.0));

        assert!(settings.set_thresholds(Thresholds::new(f64::NAN, 1.0, 2.0)).is_err());
    }

    #[test]
    fn test_unreadable_value_falls_back() {
        let store = MemoryStore::new();
        store.set(KEY_POLL_INTERVAL, "7").unwrap();
        store.set(KEY_THRESHOLDS, "not json").unwrap();
        let settings = load(&store);
        assert_eq!(settings.poll_interval(), PollInterval::default());
        assert_eq!(settings.thresholds(), Thresholds::default());
    }

    #[test]
    fn test_gateway_hosts_are_not_persisted() {
        let store = MemoryStore::new();
        let mut settings = load(&store);
        let mut gateway = Host::user("192.168.1.1", "gw");
        gateway.user_defined = false;
        settings
            .set_user_hosts(&[gateway, Host::user("example.com", "")])
            .unwrap();
        assert_eq!(load(&store).user_hosts().len(), 1);
    }

    #[test]
    fn test_poll_interval_options() {
        assert!(PollInterval::from_secs(4).is_none());
        assert_eq!(PollInterval::from_secs(60).map(|p| p.secs()), Some(60));
        assert!(serde_json::from_str::<PollInterval>("4").is_err());
    }

    #[test]
    fn test_range_checked_setters() {
        let mut settings = load(&MemoryStore::new());
        assert!(settings.set_moving_average_secs(0).is_err());
        assert!(settings.set_moving_average_secs(601).is_err());
        assert!(settings.set_retention_days(0).is_err());
        settings.set_moving_average_secs(10).unwrap();
        assert_eq!(settings.moving_average_window(), chrono::Duration::seconds(10));
    }

    #[test]
    fn test_alert_delay_is_bounded() {
        let store = MemoryStore::new();
        let mut settings = load(&store);
        let huge = NotificationPrefs {
            delay_secs: 10_000_000_000_000_000,
            ..Default::default()
        };
        assert!(matches!(
            settings.set_notifications(huge),
            Err(SettingsError::Invalid { .. })
        ));
        assert_eq!(settings.notifications(), NotificationPrefs::default());
        assert_eq!(huge.delay(), chrono::Duration::MAX);

        // Values written by an older build are clamped on load.
        store
            .set(KEY_NOTIFICATIONS, &serde_json::to_string(&huge).unwrap())
            .unwrap();
        store.set(KEY_MOVING_AVERAGE, "10000000000000000").unwrap();
        let reloaded = load(&store);
        assert_eq!(reloaded.notifications().delay_secs, MAX_ALERT_DELAY_SECS);
        assert_eq!(reloaded.moving_average_secs(), 30);
        assert_eq!(reloaded.moving_average_window(), chrono::Duration::seconds(30));
    }
}
