//! netpulse - Network Latency Monitor

use netpulse::config::ServerConfig;
use netpulse::db::{BatchedSink, Store};
use netpulse::host::{CommandRouteSource, GatewayCache};
use netpulse::monitor::{Monitor, ReadingSink, Scheduler};
use netpulse::settings::Settings;
use netpulse::web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netpulse=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting netpulse on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);
    tracing::info!("Probe: {:?}, alerts: {:?}", cfg.probe, cfg.alerts);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let settings = Settings::load(store.clone());
    let readings: Arc<dyn ReadingSink> = Arc::new(BatchedSink::new(store));

    let monitor = Monitor::new(
        settings,
        GatewayCache::new(Arc::new(CommandRouteSource)),
        cfg.probe.build(),
        readings.clone(),
        cfg.alerts.build(),
    );

    // Start the poll timeline
    let scheduler = Scheduler::start(monitor);

    // Start web server
    let server = Server::new(cfg, scheduler.handle(), readings);
    let served = server.start().await;

    scheduler.stop().await;
    served
}
