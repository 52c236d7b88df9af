//! HTTP request handlers.

use super::AppState;
use crate::host::HostId;
use crate::monitor::{Command, CommandOutcome, MonitorError};
use crate::settings::{DisplayMode, LatencySource, NotificationPrefs, PollInterval, SettingsError};
use crate::status::Thresholds;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Status
// ============================================================================

pub async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor.snapshot().as_ref().clone())
}

// ============================================================================
// API: Hosts
// ============================================================================

pub async fn handle_get_hosts(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor.snapshot().hosts.clone())
}

#[derive(Debug, Deserialize)]
pub struct HostRequest {
    pub address: String,
    #[serde(default)]
    pub label: String,
}

pub async fn handle_create_host(
    State(state): State<AppState>,
    Json(req): Json<HostRequest>,
) -> Response {
    let command = Command::AddHost {
        address: req.address,
        label: req.label,
    };
    match state.monitor.send(command).await {
        Ok(CommandOutcome::HostAdded(host)) => (StatusCode::CREATED, Json(host)).into_response(),
        Ok(CommandOutcome::Done) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn handle_update_host(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
    Json(req): Json<HostRequest>,
) -> Response {
    let command = Command::UpdateHost {
        id,
        address: req.address,
        label: req.label,
    };
    run(&state, command).await
}

pub async fn handle_delete_host(State(state): State<AppState>, Path(id): Path<HostId>) -> Response {
    run(&state, Command::RemoveHost(id)).await
}

pub async fn handle_toggle_host(State(state): State<AppState>, Path(id): Path<HostId>) -> Response {
    run(&state, Command::ToggleHost(id)).await
}

pub async fn handle_toggle_host_notification(
    State(state): State<AppState>,
    Path(id): Path<HostId>,
) -> Response {
    run(&state, Command::ToggleHostNotification(id)).await
}

pub async fn handle_refresh_gateways(State(state): State<AppState>) -> Response {
    run(&state, Command::RefreshGateways).await
}

// ============================================================================
// API: Settings
// ============================================================================

pub async fn handle_set_thresholds(
    State(state): State<AppState>,
    Json(thresholds): Json<Thresholds>,
) -> Response {
    run(&state, Command::SetThresholds(thresholds)).await
}

pub async fn handle_begin_threshold_edit(State(state): State<AppState>) -> Response {
    run(&state, Command::BeginThresholdEdit).await
}

pub async fn handle_end_threshold_edit(State(state): State<AppState>) -> Response {
    run(&state, Command::EndThresholdEdit).await
}

#[derive(Debug, Deserialize)]
pub struct IntervalRequest {
    pub secs: u64,
}

pub async fn handle_set_interval(
    State(state): State<AppState>,
    Json(req): Json<IntervalRequest>,
) -> Response {
    match PollInterval::from_secs(req.secs) {
        Some(interval) => run(&state, Command::SetPollInterval(interval)).await,
        None => (
            StatusCode::BAD_REQUEST,
            format!("Interval must be one of {:?} seconds", PollInterval::OPTIONS),
        )
            .into_response(),
    }
}

pub async fn handle_set_notifications(
    State(state): State<AppState>,
    Json(prefs): Json<NotificationPrefs>,
) -> Response {
    run(&state, Command::SetNotifications(prefs)).await
}

#[derive(Debug, Deserialize)]
pub struct DisplayRequest {
    pub mode: DisplayMode,
    pub latency_source: LatencySource,
    pub moving_average_secs: u64,
}

pub async fn handle_set_display(
    State(state): State<AppState>,
    Json(req): Json<DisplayRequest>,
) -> Response {
    let command = Command::SetDisplay {
        mode: req.mode,
        latency_source: req.latency_source,
        moving_average_secs: req.moving_average_secs,
    };
    run(&state, command).await
}

#[derive(Debug, Deserialize)]
pub struct PinnedRequest {
    pub host: Option<HostId>,
}

pub async fn handle_set_pinned(
    State(state): State<AppState>,
    Json(req): Json<PinnedRequest>,
) -> Response {
    run(&state, Command::SetPinnedHost(req.host)).await
}

#[derive(Debug, Deserialize)]
pub struct DiscoveryRequest {
    pub enabled: bool,
}

pub async fn handle_set_discovery(
    State(state): State<AppState>,
    Json(req): Json<DiscoveryRequest>,
) -> Response {
    run(&state, Command::SetAutoDiscover(req.enabled)).await
}

#[derive(Debug, Deserialize)]
pub struct RetentionRequest {
    pub days: u32,
}

pub async fn handle_set_retention(
    State(state): State<AppState>,
    Json(req): Json<RetentionRequest>,
) -> Response {
    run(&state, Command::SetRetentionDays(req.days)).await
}

// ============================================================================
// API: Persisted history
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HistoryStats {
    pub record_count: i64,
    pub storage_bytes: i64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub retention_days: u32,
}

pub async fn handle_get_history(State(state): State<AppState>) -> impl IntoResponse {
    let range = state.readings.date_range();
    Json(HistoryStats {
        record_count: state.readings.record_count(),
        storage_bytes: state.readings.storage_size(),
        oldest: range.map(|(oldest, _)| oldest),
        newest: range.map(|(_, newest)| newest),
        retention_days: state.monitor.snapshot().retention_days,
    })
}

pub async fn handle_clear_history(State(state): State<AppState>) -> Response {
    run(&state, Command::ClearHistory).await
}

// ============================================================================
// Helpers
// ============================================================================

async fn run(state: &AppState, command: Command) -> Response {
    match state.monitor.send(command).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: MonitorError) -> Response {
    let status = match &e {
        MonitorError::InvalidAddress => StatusCode::BAD_REQUEST,
        MonitorError::Settings(SettingsError::Invalid { .. }) => StatusCode::BAD_REQUEST,
        MonitorError::Settings(_) => StatusCode::INTERNAL_SERVER_ERROR,
        MonitorError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, e.to_string()).into_response()
}
