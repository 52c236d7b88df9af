//! JSON API server.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::monitor::{MonitorHandle, ReadingSink};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub monitor: MonitorHandle,
    pub readings: Arc<dyn ReadingSink>,
}

/// Web server for netpulse.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, monitor: MonitorHandle, readings: Arc<dyn ReadingSink>) -> Self {
        Self {
            state: AppState {
                config,
                monitor,
                readings,
            },
        }
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = routes(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

/// Build the router with all routes.
pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/status", get(handlers::handle_get_status))
        // Hosts
        .route(
            "/api/hosts",
            get(handlers::handle_get_hosts).post(handlers::handle_create_host),
        )
        .route(
            "/api/hosts/{id}",
            put(handlers::handle_update_host).delete(handlers::handle_delete_host),
        )
        .route("/api/hosts/{id}/toggle", post(handlers::handle_toggle_host))
        .route("/api/hosts/{id}/notify", post(handlers::handle_toggle_host_notification))
        .route("/api/gateways/refresh", post(handlers::handle_refresh_gateways))
        // Settings
        .route("/api/settings/thresholds", put(handlers::handle_set_thresholds))
        .route(
            "/api/settings/thresholds/edit",
            post(handlers::handle_begin_threshold_edit).delete(handlers::handle_end_threshold_edit),
        )
        .route("/api/settings/interval", put(handlers::handle_set_interval))
        .route("/api/settings/notifications", put(handlers::handle_set_notifications))
        .route("/api/settings/display", put(handlers::handle_set_display))
        .route("/api/settings/pinned", put(handlers::handle_set_pinned))
        .route("/api/settings/discovery", put(handlers::handle_set_discovery))
        .route("/api/settings/retention", put(handlers::handle_set_retention))
        // Persisted history
        .route(
            "/api/history",
            get(handlers::handle_get_history).delete(handlers::handle_clear_history),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(64 * 1024))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::testing::Fixture;
    use crate::monitor::Scheduler;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(fx: &Fixture, scheduler: &Scheduler) -> Router {
        routes(AppState {
            config: ServerConfig::default(),
            monitor: scheduler.handle(),
            readings: fx.sink.clone(),
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test(start_paused = true)]
    async fn test_host_crud() {
        let fx = Fixture::new();
        let scheduler = Scheduler::start(fx.monitor());
        let app = app(&fx, &scheduler);

        let (status, host) = call(
            &app,
            "POST",
            "/api/hosts",
            Some(json!({"address": "192.0.2.7", "label": "Printer"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(host["label"], "Printer");
        let id = host["id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, "POST", &format!("/api/hosts/{}/toggle", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(
            &app,
            "PUT",
            &format!("/api/hosts/{}", id),
            Some(json!({"address": "192.0.2.8", "label": ""})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, hosts) = call(&app, "GET", "/api/hosts", None).await;
        assert_eq!(status, StatusCode::OK);
        let hosts = hosts.as_array().unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0]["label"], "192.0.2.8");
        assert_eq!(hosts[0]["enabled"], false);

        let (status, _) = call(&app, "DELETE", &format!("/api/hosts/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_invalid_input() {
        let fx = Fixture::new();
        let scheduler = Scheduler::start(fx.monitor());
        let app = app(&fx, &scheduler);

        let (status, _) = call(&app, "POST", "/api/hosts", Some(json!({"address": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "PUT", "/api/settings/interval", Some(json!({"secs": 7}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            "PUT",
            "/api/settings/display",
            Some(json!({"mode": "status_only", "latency_source": "instant", "moving_average_secs": 0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &app,
            "PUT",
            "/api/settings/notifications",
            Some(json!({"delay_secs": 10_000_000_000_000_000u64})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(scheduler.handle().snapshot().notifications.delay_secs, 0);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_settings_show_up_in_status() {
        let fx = Fixture::new();
        let scheduler = Scheduler::start(fx.monitor());
        let app = app(&fx, &scheduler);

        let (status, _) = call(&app, "PUT", "/api/settings/interval", Some(json!({"secs": 10}))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "POST", "/api/settings/thresholds/edit", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(
            &app,
            "PUT",
            "/api/settings/thresholds",
            Some(json!({"excellent": 20.0, "good": 40.0, "fair": 80.0})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["poll_interval"], 10);
        assert_eq!(body["thresholds"]["committed"]["fair"], 80.0);
        assert_eq!(body["thresholds"]["frozen"]["fair"], 200.0);

        let (status, body) = call(&app, "GET", "/api/history", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["retention_days"], 7);

        scheduler.stop().await;
    }
}
