//! Alert delivery.

use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Degraded,
    Unreachable,
    Recovered,
}

/// A user-visible notification requested by the monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub title: String,
    pub body: String,
    pub sound: bool,
}

/// Where alerts go. Delivery is fire-and-forget: implementations log their own
/// failures and never report back.
pub trait AlertSink: Send + Sync {
    fn notify(&self, alert: &Alert);
}

/// Writes alerts to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, alert: &Alert) {
        tracing::info!("Alert [{:?}] {}: {}", alert.kind, alert.title, alert.body);
    }
}

/// Shows desktop notifications via `osascript` (macOS) or `notify-send`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DesktopAlertSink;

impl AlertSink for DesktopAlertSink {
    fn notify(&self, alert: &Alert) {
        LogAlertSink.notify(alert);

        let mut command = if cfg!(target_os = "macos") {
            let sound = if alert.sound { " sound name \"default\"" } else { "" };
            let script = format!(
                "display notification \"{}\" with title \"{}\"{}",
                escape_applescript(&alert.body),
                escape_applescript(&alert.title),
                sound
            );
            let mut c = Command::new("osascript");
            c.args(["-e", &script]);
            c
        } else {
            let mut c = Command::new("notify-send");
            c.args(notify_send_args(alert));
            c
        };
        command.stdout(Stdio::null()).stderr(Stdio::null());

        let title = alert.title.clone();
        tokio::spawn(async move {
            match command.status().await {
                Ok(status) if status.success() => {}
                Ok(status) => tracing::warn!("Notification '{}' exited with {}", title, status),
                Err(e) => tracing::warn!("Failed to deliver notification '{}': {}", title, e),
            }
        });
    }
}

/// Which [`AlertSink`] the binary installs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AlertMode {
    #[default]
    Desktop,
    Log,
}

impl AlertMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desktop" => Some(AlertMode::Desktop),
            "log" => Some(AlertMode::Log),
            _ => None,
        }
    }

    pub fn build(self) -> Arc<dyn AlertSink> {
        match self {
            AlertMode::Desktop => Arc::new(DesktopAlertSink),
            AlertMode::Log => Arc::new(LogAlertSink),
        }
    }
}

/// Arguments for `notify-send`. Sound is requested through the freedesktop
/// `sound-name` hint.
fn notify_send_args(alert: &Alert) -> Vec<String> {
    let mut args = vec!["--app-name=netpulse".to_string()];
    if alert.sound {
        args.push("--hint=string:sound-name:message-new-instant".to_string());
    }
    args.push(alert.title.clone());
    args.push(alert.body.clone());
    args
}

fn escape_applescript(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
