//! The monitoring orchestrator.
//!
//! [`Monitor`] owns the host list, the latest readings, the history window and
//! the debouncer. It is driven by the [`Scheduler`] timeline, which is the only
//! writer; everyone else reads [`MonitorSnapshot`]s and sends [`Command`]s.

mod debounce;
mod history;
mod scheduler;

pub use debounce::*;
pub use history::*;
pub use scheduler::*;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;

use crate::host::{GatewayCache, Host, HostId, HostRegistry};
use crate::notify::AlertSink;
use crate::probe::Prober;
use crate::settings::{
    DisplayMode, LatencySource, NotificationPrefs, PollInterval, Settings, SettingsError,
};
use crate::status::{classify, Status, ThresholdConfig, Thresholds};

/// Upper bound on a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Orchestrator error types.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("host address must not be empty")]
    InvalidAddress,
    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),
    #[error("monitor is not running")]
    Stopped,
}

/// Durable storage for readings. Fire-and-forget: implementations log their
/// own failures and never surface them to the poll cycle.
pub trait ReadingSink: Send + Sync {
    fn append(&self, readings: Vec<Reading>);
    fn prune(&self, older_than_days: u32);
    fn record_count(&self) -> i64;
    fn storage_size(&self) -> i64;
    fn date_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)>;
    fn clear_all(&self);
}

/// A state change requested by the presentation layer.
#[derive(Debug, Clone)]
pub enum Command {
    AddHost { address: String, label: String },
    UpdateHost { id: HostId, address: String, label: String },
    RemoveHost(HostId),
    ToggleHost(HostId),
    ToggleHostNotification(HostId),
    SetThresholds(Thresholds),
    BeginThresholdEdit,
    EndThresholdEdit,
    SetNotifications(NotificationPrefs),
    SetPollInterval(PollInterval),
    SetDisplay {
        mode: DisplayMode,
        latency_source: LatencySource,
        moving_average_secs: u64,
    },
    SetAutoDiscover(bool),
    SetPinnedHost(Option<HostId>),
    SetRetentionDays(u32),
    RefreshGateways,
    ClearHistory,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Done,
    HostAdded(Host),
}

/// A monitored host as the presentation layer sees it.
#[derive(Debug, Clone, Serialize)]
pub struct HostView {
    #[serde(flatten)]
    pub host: Host,
    pub latest: Option<Reading>,
    /// Status under the effective (possibly frozen) thresholds.
    pub display_status: Status,
    pub alert: AlertState,
    /// Retained latency series, oldest first.
    pub recent: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StateDuration {
    pub status: Status,
    pub seconds: f64,
}

/// Read-only copy of the monitor's state.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub taken_at: DateTime<Utc>,
    pub hosts: Vec<HostView>,
    /// Worst status of the last cycle under the live thresholds.
    pub overall_status: Status,
    /// Status for the indicator: the pinned host's, or the worst host's,
    /// under the effective thresholds.
    pub display_status: Status,
    pub worst_latency: Option<f64>,
    pub moving_average: Option<f64>,
    /// The latency the indicator should show, per `latency_source`.
    pub headline_latency: Option<f64>,
    pub time_in_state: Vec<StateDuration>,
    pub history_entries: usize,
    pub thresholds: ThresholdConfig,
    pub poll_interval: PollInterval,
    pub notifications: NotificationPrefs,
    pub display_mode: DisplayMode,
    pub latency_source: LatencySource,
    pub moving_average_secs: u64,
    pub auto_discover: bool,
    pub pinned_host: Option<HostId>,
    pub retention_days: u32,
}

pub struct Monitor {
    registry: HostRegistry,
    settings: Settings,
    thresholds: ThresholdConfig,
    prober: Arc<dyn Prober>,
    sink: Arc<dyn ReadingSink>,
    alerts: Arc<dyn AlertSink>,
    hosts: Vec<Host>,
    latest: HashMap<HostId, Reading>,
    history: History,
    debouncer: Debouncer,
    probe_timeout: Duration,
}

impl Monitor {
    pub fn new(
        settings: Settings,
        gateways: GatewayCache,
        prober: Arc<dyn Prober>,
        sink: Arc<dyn ReadingSink>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        let registry = HostRegistry::new(
            settings.user_hosts().to_vec(),
            gateways,
            settings.auto_discover(),
        );
        Self {
            registry,
            thresholds: ThresholdConfig::new(settings.thresholds()),
            settings,
            prober,
            sink,
            alerts,
            hosts: Vec::new(),
            latest: HashMap::new(),
            history: History::new(),
            debouncer: Debouncer::new(),
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn poll_interval(&self) -> PollInterval {
        self.settings.poll_interval()
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Re-list the monitored hosts and drop state for hosts that are gone.
    pub async fn refresh_hosts(&mut self, force: bool) {
        self.hosts = if force {
            self.registry.refresh().await
        } else {
            self.registry.list_monitored_hosts().await
        };

        let ids: HashSet<HostId> = self.hosts.iter().map(|h| h.id).collect();
        self.latest.retain(|id, _| ids.contains(id));
        self.debouncer.retain_hosts(&ids);
    }

    /// Run one poll cycle now. Returns the recorded entry, or `None` when no
    /// host is enabled and the cycle was skipped.
    pub async fn run_cycle(&mut self) -> Option<HistoryEntry> {
        self.cycle(Utc::now()).await
    }

    async fn cycle(&mut self, now: DateTime<Utc>) -> Option<HistoryEntry> {
        self.refresh_hosts(false).await;

        let enabled: Vec<Host> = self.hosts.iter().filter(|h| h.enabled).cloned().collect();
        // A disabled host starts a fresh episode when it comes back.
        let enabled_ids: HashSet<HostId> = enabled.iter().map(|h| h.id).collect();
        self.debouncer.retain_hosts(&enabled_ids);
        if enabled.is_empty() {
            tracing::debug!("No enabled hosts, skipping cycle");
            return None;
        }

        let latencies = self.probe_all(&enabled).await;
        // The wall clock can step backwards; history must stay ordered.
        let now = match self.history.latest() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        let thresholds = self.thresholds.live();

        let readings: Vec<Reading> = enabled
            .iter()
            .zip(latencies)
            .map(|(host, latency)| Reading {
                host_id: host.id,
                host_label: host.label.clone(),
                host_address: host.address.clone(),
                latency,
                status: classify(latency, &thresholds),
                timestamp: now,
            })
            .collect();

        let previous_overall = self
            .history
            .latest()
            .map(|e| e.overall_status)
            .unwrap_or(Status::Unknown);

        let entry = HistoryEntry::new(readings.clone(), now);
        self.history.record(entry.clone());
        for reading in &readings {
            self.latest.insert(reading.host_id, reading.clone());
        }
        self.sink.append(readings);

        let prefs = self.settings.notifications();
        for (host, reading) in enabled.iter().zip(&entry.readings) {
            if let Some(alert) = self.debouncer.observe(host, reading, &thresholds, &prefs, now) {
                self.alerts.notify(&alert);
            }
        }
        if let Some(alert) = self
            .debouncer
            .check_recovery(previous_overall, entry.overall_status, &prefs)
        {
            self.alerts.notify(&alert);
        }

        if entry.overall_status != previous_overall {
            tracing::info!("Overall status: {} -> {}", previous_overall, entry.overall_status);
        }

        Some(entry)
    }

    /// Probe every host concurrently; the result is in `hosts` order.
    async fn probe_all(&self, hosts: &[Host]) -> Vec<Option<f64>> {
        let mut tasks = JoinSet::new();
        for (index, host) in hosts.iter().enumerate() {
            let prober = self.prober.clone();
            let address = host.address.clone();
            let timeout = self.probe_timeout;
            tasks.spawn(async move {
                let latency = tokio::time::timeout(timeout, prober.probe(&address, timeout))
                    .await
                    .ok()
                    .flatten();
                (index, latency)
            });
        }

        let mut latencies = vec![None; hosts.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, latency)) => latencies[index] = latency,
                Err(e) => tracing::warn!("Probe task failed: {}", e),
            }
        }
        latencies
    }

    /// Apply retention to persisted readings.
    pub fn prune_persisted(&self) {
        self.sink.prune(self.settings.retention_days());
    }

    pub async fn apply(&mut self, command: Command) -> Result<CommandOutcome, MonitorError> {
        match command {
            Command::AddHost { address, label } => {
                let host = self
                    .registry
                    .add_host(&address, &label)
                    .ok_or(MonitorError::InvalidAddress)?;
                tracing::info!("Added host {} ({})", host.label, host.address);
                self.hosts_changed().await?;
                return Ok(CommandOutcome::HostAdded(host));
            }
            Command::UpdateHost { id, address, label } => {
                if address.trim().is_empty() {
                    return Err(MonitorError::InvalidAddress);
                }
                if self.registry.update_host(id, &address, &label) {
                    self.hosts_changed().await?;
                }
            }
            Command::RemoveHost(id) => {
                if self.registry.remove_host(id) {
                    tracing::info!("Removed host {}", id);
                    self.hosts_changed().await?;
                }
            }
            Command::ToggleHost(id) => {
                if self.registry.toggle_host(id) {
                    self.hosts_changed().await?;
                }
            }
            Command::ToggleHostNotification(id) => {
                if self.registry.toggle_host_notification(id) {
                    self.hosts_changed().await?;
                }
            }
            Command::SetThresholds(thresholds) => {
                self.settings.set_thresholds(thresholds)?;
                self.thresholds.committed = thresholds;
                if !thresholds.is_valid() {
                    tracing::warn!("Thresholds {:?} are not ascending, classifying with defaults", thresholds);
                }
            }
            Command::BeginThresholdEdit => self.thresholds.begin_edit(),
            Command::EndThresholdEdit => self.thresholds.end_edit(),
            Command::SetNotifications(prefs) => self.settings.set_notifications(prefs)?,
            Command::SetPollInterval(interval) => {
                self.settings.set_poll_interval(interval)?;
            }
            Command::SetDisplay {
                mode,
                latency_source,
                moving_average_secs,
            } => {
                self.settings.set_moving_average_secs(moving_average_secs)?;
                self.settings.set_display_mode(mode)?;
                self.settings.set_latency_source(latency_source)?;
            }
            Command::SetAutoDiscover(enabled) => {
                self.settings.set_auto_discover(enabled)?;
                self.registry.set_auto_discover(enabled);
                self.refresh_hosts(false).await;
            }
            Command::SetPinnedHost(host) => self.settings.set_pinned_host(host)?,
            Command::SetRetentionDays(days) => {
                self.settings.set_retention_days(days)?;
                self.prune_persisted();
            }
            Command::RefreshGateways => self.refresh_hosts(true).await,
            Command::ClearHistory => {
                self.history.clear();
                self.sink.clear_all();
            }
        }
        Ok(CommandOutcome::Done)
    }

    async fn hosts_changed(&mut self) -> Result<(), MonitorError> {
        self.refresh_hosts(false).await;
        self.settings.set_user_hosts(self.registry.user_hosts())?;
        Ok(())
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> MonitorSnapshot {
        let effective = self.thresholds.effective();
        let pinned = self.settings.pinned_host();

        let hosts: Vec<HostView> = self
            .hosts
            .iter()
            .map(|host| {
                let latest = self.latest.get(&host.id).cloned();
                let display_status = latest
                    .as_ref()
                    .map(|r| classify(r.latency, &effective))
                    .unwrap_or(Status::Unknown);
                HostView {
                    host: host.clone(),
                    latest,
                    display_status,
                    alert: self.debouncer.state_of(host.id),
                    recent: self
                        .history
                        .host_latencies(host.id)
                        .into_iter()
                        .map(|(_, latency)| latency)
                        .collect(),
                }
            })
            .collect();

        let last_entry = self.history.latest();
        let pinned_reading = pinned.and_then(|id| last_entry.and_then(|e| e.reading_for(id)));

        let display_status = match pinned_reading {
            Some(r) => classify(r.latency, &effective),
            None => last_entry
                .and_then(|e| e.readings.iter().map(|r| classify(r.latency, &effective)).max())
                .unwrap_or(Status::Unknown),
        };

        let worst_latency = self.history.worst_latency();
        let moving_average =
            self.history
                .moving_average(now, self.settings.moving_average_window(), pinned);
        let instant = match pinned {
            Some(_) => pinned_reading.and_then(|r| r.latency),
            None => worst_latency,
        };
        let headline_latency = match self.settings.latency_source() {
            LatencySource::Instant => instant,
            LatencySource::MovingAverage => moving_average,
        };

        MonitorSnapshot {
            taken_at: now,
            hosts,
            overall_status: last_entry.map(|e| e.overall_status).unwrap_or(Status::Unknown),
            display_status,
            worst_latency,
            moving_average,
            headline_latency,
            time_in_state: self
                .history
                .time_in_state(now)
                .into_iter()
                .map(|(status, span)| StateDuration {
                    status,
                    seconds: span.num_milliseconds() as f64 / 1000.0,
                })
                .collect(),
            history_entries: self.history.len(),
            thresholds: self.thresholds,
            poll_interval: self.settings.poll_interval(),
            notifications: self.settings.notifications(),
            display_mode: self.settings.display_mode(),
            latency_source: self.settings.latency_source(),
            moving_average_secs: self.settings.moving_average_secs(),
            auto_discover: self.settings.auto_discover(),
            pinned_host: pinned,
            retention_days: self.settings.retention_days(),
        }
    }
}
