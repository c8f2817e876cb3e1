//! ==============================================================================
//! api.rs - read-only snapshot api for the rendering layer
//! ==============================================================================
//!
//! routes:
//!     GET /api/devices              configured devices (id, label, stream kinds)
//!     GET /api/snapshot             every device snapshot
//!     GET /api/snapshot/:device_id  one device snapshot (404 if unknown)
//!     GET /api/updates              sse feed of "device updated" notifications
//!
//! the rendering side polls the snapshot routes or listens on /api/updates and
//! re-fetches the device that changed. nothing here mutates state.
//!
//! ==============================================================================

use crate::state::{DeviceInfo, DeviceSnapshot, DeviceUpdate, StateStore};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::stream::{Stream, StreamExt};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;

pub fn router(store: StateStore) -> Router {
    Router::new()
        .route("/api/devices", get(devices_handler))
        .route("/api/snapshot", get(snapshot_all_handler))
        .route("/api/snapshot/:device_id", get(snapshot_handler))
        .route("/api/updates", get(updates_handler))
        .layer(CorsLayer::permissive())
        .with_state(store)
}

async fn devices_handler(State(store): State<StateStore>) -> Json<Vec<DeviceInfo>> {
    Json(store.devices())
}

async fn snapshot_all_handler(State(store): State<StateStore>) -> Json<BTreeMap<String, DeviceSnapshot>> {
    Json(store.snapshot_all())
}

async fn snapshot_handler(State(store): State<StateStore>, Path(device_id): Path<String>) -> Response {
    match store.snapshot(&device_id) {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            tracing::debug!("[API] Snapshot request for {}: {}", device_id, e);
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"status": "error", "message": e.to_string()})),
            )
                .into_response()
        }
    }
}

async fn updates_handler(State(store): State<StateStore>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(update_events(store.subscribe()))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

/// one `device` event per applied batch or disconnect
fn update_events(updates: broadcast::Receiver<DeviceUpdate>) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(updates).filter_map(|update| async move {
        match update {
            Ok(update) => Event::default().event("device").json_data(&update).ok().map(Ok),
            // the next update still arrives
            Err(e) => {
                tracing::debug!("[API] Slow /api/updates client: {}", e);
                None
            }
        }
    })
}
