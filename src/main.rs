//! ==============================================================================
//! main.rs - telemetry gateway entry point
//! ==============================================================================
//!
//! responsibilities:
//!     - load configuration and initialise logging
//!     - open the sample store
//!     - start the serial reader thread and its ingest task
//!     - serve the http api until ctrl-c
//!
//! architecture:
//!
//!     ┌──────────────┐  lines   ┌──────────────┐
//!     │ device       │ ───────► │ local ingest │ ──┐
//!     │ reader (os   │  mpsc    │ task         │   │
//!     │ thread)      │          └──────────────┘   │   ┌──────────┐
//!     └──────────────┘                             ├─► │ gateway  │──► store
//!     ┌──────────────┐                             │   │          │──► arbiter
//!     │ http pushes  │ ────────────────────────────┘   │          │──► hub ──► /stream
//!     └──────────────┘                                 └──────────┘
//!
//! ==============================================================================

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use telemetry_gateway::{
    config::GatewayConfig,
    device::{DeviceReader, ReaderTiming, SerialLink},
    gateway::{self, Gateway, GatewayOptions},
    server::{self, AppState},
    store::SampleStore,
};

/// parsed lines buffered between the reader thread and the ingest task
const LINE_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Telemetry Gateway");
    println!("  serial + http ingestion, sqlite history, live feed");
    println!("===========================================================");

    // step 1: configuration, then logging at the configured level
    let config = GatewayConfig::load_or_default();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    config.print_summary();

    // step 2: sample store
    let store = SampleStore::open(&config.storage.database)
        .await
        .with_context(|| format!("opening sample store {}", config.storage.database.display()))?;
    tracing::info!(path = %store.path().display(), rows = store.count().await.unwrap_or(0), "sample store ready");

    let gateway = Gateway::new(
        store,
        GatewayOptions {
            freshness: config.arbitration.freshness(),
            queue_capacity: config.live.queue_capacity,
            timestamp_policy: config.ingest.invalid_timestamp,
            show_sensor_data: config.logging.show_sensor_data,
        },
    );

    // step 3: serial reader feeding the local ingest task
    let device = if config.device.enabled {
        let (tx, rx) = mpsc::channel(LINE_QUEUE);
        let (reader, state) = DeviceReader::new(
            SerialLink::new(config.device.explicit_path()),
            config.device.baud_rate,
            ReaderTiming::from(&config.device),
            tx,
        );
        reader.spawn().context("spawning device reader thread")?;
        tokio::spawn(gateway::run_local_ingest(gateway.clone(), rx));
        Some(state)
    } else {
        tracing::info!("serial device disabled, accepting http pushes only");
        None
    };

    // step 4: http api
    let app = server::router(AppState { gateway: gateway.clone(), device }, &config.server.static_dir);
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("binding {}", config.server.bind))?;
    tracing::info!(addr = %config.server.bind, "http api listening");

    let hub = gateway.hub().clone();
    server::run_server(listener, app, async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        tracing::info!("shutting down");
        // open live feeds would otherwise hold the server up
        hub.close_all();
    })
    .await?;

    Ok(())
}
