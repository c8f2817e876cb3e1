//! ==============================================================================
//! main.rs - pulse hub entry point
//! ==============================================================================
//!
//! purpose:
//!     this is the hub that sits between the Pi fleet and the dashboard.
//!     every Pi runs small sse services (pi-pulse system metrics, sen66 air
//!     quality); the hub subscribes to all of them, keeps a rolling 60-sample
//!     history per metric and serves snapshots to the rendering layer.
//!
//! responsibilities:
//!     - load hub.toml (static device list)
//!     - build the shared StateStore
//!     - start one supervised stream consumer per endpoint
//!     - serve the snapshot api
//!     - on ctrl-c: cancel the session and wait for every consumer to exit
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                    rust hub (this file)                      │
//!     │  ┌──────────────────────┐         ┌─────────────────────┐   │
//!     │  │ session supervisor   │         │ snapshot api        │   │
//!     │  │ (1 task per stream)  │         │ (port 8009)         │   │
//!     │  └──────────┬───────────┘         └──────────┬──────────┘   │
//!     │             │ apply_sample                   │ snapshot     │
//!     │             └───────────┐       ┌────────────┘              │
//!     │                   ┌─────┴───────┴─────┐                     │
//!     │                   │    state store    │ <- state.rs         │
//!     │                   └───────────────────┘                     │
//!     └─────────────────────────────────────────────────────────────┘
//!                  ▲ sse            ▲ sse             ▲ sse
//!           ┌──────┴─────┐   ┌──────┴─────┐    ┌──────┴───────┐
//!           │ pi-pulse   │   │ sen66      │    │ sen66 nc     │
//!           └────────────┘   └────────────┘    └──────────────┘
//!
//! ==============================================================================

use anyhow::{Context, Result};
use pulse_hub::config::HubConfig;
use pulse_hub::{api, HttpConnector, SessionSupervisor, StateStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration (logs go to a provisional subscriber first)
    let config = {
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::fmt().with_env_filter(EnvFilter::new("info")).finish(),
        );
        HubConfig::load_or_default()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("===========================================================");
    tracing::info!("  Pulse Hub - live Pi telemetry");
    tracing::info!("===========================================================");
    config.log_summary();

    // step 2: initialize shared state
    let descriptors = config.descriptors();
    if descriptors.is_empty() {
        tracing::warn!("[STARTUP] No devices configured; serving an empty store");
    }
    let store = StateStore::new(&descriptors, config.history.capacity)?;

    // step 3: start the stream consumers for this session
    let connector = HttpConnector::new(config.connect_timeout())?;
    let session = CancellationToken::new();
    let supervisor = SessionSupervisor::start(
        &descriptors,
        store.clone(),
        Arc::new(connector),
        config.supervisor_settings(),
        session.clone(),
    );

    // step 4: serve the snapshot api until the session ends
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    tracing::info!("[STARTUP] ✓ Snapshot API live at http://{}", config.server.bind);

    let server_session = session.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, api::router(store))
            .with_graceful_shutdown(async move { server_session.cancelled().await })
            .await
    });

    // step 5: ctrl-c ends the session
    let signal_session = session.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("[SHUTDOWN] Ctrl-C received");
                signal_session.cancel();
            }
            Err(e) => tracing::error!("[SHUTDOWN] Failed to listen for Ctrl-C: {}", e),
        }
    });

    let exited = supervisor.wait().await;
    tracing::info!("[SHUTDOWN] {} consumers stopped", exited);

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("[ERROR] Web server error: {}", e),
        Err(e) => tracing::error!("[ERROR] Web server task failed: {}", e),
    }
    Ok(())
}
