//! Per-host alert debouncing and overall recovery detection.
//!
//! A host has to stay problematic for the configured delay before its alert
//! fires, and fires at most once per problematic episode. Recovery is judged
//! on the overall status only, so a single host that is still degraded holds
//! back the "all clear".

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::host::{Host, HostId};
use crate::notify::{Alert, AlertKind};
use crate::settings::NotificationPrefs;
use crate::status::{Status, Thresholds};

use super::Reading;

/// Where a host is in its alert lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AlertState {
    Normal,
    PendingAlert { since: DateTime<Utc>, target: Status },
    Alerted,
}

#[derive(Debug, Clone, Copy)]
struct HostTrack {
    state: AlertState,
    previous: Status,
}

impl Default for HostTrack {
    fn default() -> Self {
        Self {
            state: AlertState::Normal,
            previous: Status::Unknown,
        }
    }
}

#[derive(Debug, Default)]
pub struct Debouncer {
    hosts: HashMap<HostId, HostTrack>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_of(&self, host: HostId) -> AlertState {
        self.hosts
            .get(&host)
            .map(|t| t.state)
            .unwrap_or(AlertState::Normal)
    }

    /// Feed one cycle's reading for `host` and return the alert to show, if
    /// any.
    ///
    /// A host seen for the first time has `Unknown` as its previous status,
    /// which counts as not problematic: a host that is down from the very
    /// first cycle enters the pending state like any other.
    pub fn observe(
        &mut self,
        host: &Host,
        reading: &Reading,
        thresholds: &Thresholds,
        prefs: &NotificationPrefs,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let track = self.hosts.entry(host.id).or_default();
        let status = reading.status;
        let previous = std::mem::replace(&mut track.previous, status);

        if !status.is_problematic() {
            if let AlertState::PendingAlert { target, .. } = track.state {
                tracing::debug!("{} recovered before its {} alert fired", host.label, target);
            }
            track.state = AlertState::Normal;
            return None;
        }

        if track.state == AlertState::Normal && !previous.is_problematic() {
            track.state = AlertState::PendingAlert {
                since: now,
                target: status,
            };
        }

        match track.state {
            AlertState::PendingAlert { since, .. } if now - since >= prefs.delay() => {
                track.state = AlertState::Alerted;
                issue_alert(host, reading, thresholds, prefs)
            }
            _ => None,
        }
    }

    /// Alert when the overall status goes from problematic to healthy.
    pub fn check_recovery(
        &self,
        previous_overall: Status,
        new_overall: Status,
        prefs: &NotificationPrefs,
    ) -> Option<Alert> {
        let recovered = previous_overall.is_problematic()
            && !new_overall.is_problematic()
            && new_overall != Status::Unknown;

        (recovered && prefs.on_recovery).then(|| Alert {
            kind: AlertKind::Recovered,
            title: "Connection recovered".to_string(),
            body: "All monitored hosts are responding normally".to_string(),
            sound: prefs.sound,
        })
    }

    /// Forget hosts that are no longer monitored.
    pub fn retain_hosts(&mut self, monitored: &HashSet<HostId>) {
        self.hosts.retain(|id, _| monitored.contains(id));
    }
}

fn issue_alert(
    host: &Host,
    reading: &Reading,
    thresholds: &Thresholds,
    prefs: &NotificationPrefs,
) -> Option<Alert> {
    if !host.notify_on_issue {
        tracing::debug!("Alert for {} suppressed, host is muted", host.label);
        return None;
    }

    match reading.status {
        Status::Poor if prefs.on_poor => Some(Alert {
            kind: AlertKind::Degraded,
            title: format!("High latency: {}", host.label),
            body: format!(
                "{} ({}) is at {:.0} ms, above the {:.0} ms threshold",
                host.label,
                host.address,
                reading.latency.unwrap_or_default(),
                thresholds.fair
            ),
            sound: prefs.sound,
        }),
        Status::Offline if prefs.on_offline => Some(Alert {
            kind: AlertKind::Unreachable,
            title: format!("{} unreachable", host.label),
            body: format!("No response from {}", host.address),
            sound: prefs.sound,
        }),
        _ => None,
    }
}
