//! # Telemetry Distribution Server
//!
//! Serves live sensor readings to WebSocket clients, each at its own cadence,
//! and exposes a small REST surface for inserting and querying readings.
//!
//! ## Startup
//! 1. Load `.env`, resolve settings (defaults, layered JSON files, env, CLI).
//! 2. Initialise `tracing` output.
//! 3. Open the readings store: PostgreSQL when a database URL is configured,
//!    otherwise an in-memory store.
//! 4. Start the broadcast gateway, and the upstream link if one is configured.
//! 5. Serve HTTP/WebSocket traffic until Ctrl-C or SIGTERM, then shut the
//!    engine down.

mod telemetry_logic;

use anyhow::{Context, Result};
use lib_telemetry::connections::{MemoryStore, PostgresStore, ReadingsStore};
use lib_telemetry::core::BroadcastGateway;
use lib_telemetry::ingestors::WsUpstreamLink;
use lib_telemetry::loggers::init_logging;
use std::net::SocketAddr;
use std::sync::Arc;
use telemetry_logic::config::{APP_NAME, Settings, load_settings};
use telemetry_logic::downstream::{AppState, router};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = load_settings()?;
    let _log_guard = init_logging(APP_NAME, &settings.logger)?;
    info!(port = settings.port, cadence = %settings.default_cadence, "Starting {}", APP_NAME);

    let store = open_store(&settings).await?;
    let gateway = Arc::new(BroadcastGateway::new(settings.engine.clone(), store));
    gateway.start()?;

    if let Some(link) = WsUpstreamLink::from_config(&settings.engine.upstream) {
        info!(url = link.url(), "Upstream link configured");
        gateway.engine().start_upstream(Arc::new(link))?;
    }

    let app = router(AppState {
        gateway: gateway.clone(),
        default_cadence: settings.default_cadence,
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Listening on http://{}", addr);

    let signal_gateway = gateway.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        warn!("Shutdown signal received. Closing streams...");
        // Ends every stream so open sockets return and serve can finish.
        signal_gateway.shutdown().await;
    })
    .await?;

    gateway.shutdown().await;
    info!("Server stopped");
    Ok(())
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn ReadingsStore>> {
    if settings.engine.store.database_url.is_none() {
        warn!("No database URL configured, readings are kept in memory only");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let store = PostgresStore::new(&settings.engine.store)?;
    if let Err(e) = store.ensure_schema().await {
        // Not fatal: the health monitor keeps retrying and workers send ERROR batches.
        warn!(error = %e, "Could not prepare the readings table");
    }
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
