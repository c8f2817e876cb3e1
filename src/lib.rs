//! pulse-hub: live telemetry ingestion for the Pi dashboard
//!
//! stream consumers (one per sse endpoint) feed a shared, per-device locked
//! StateStore; the rendering side reads snapshots of it.

pub mod api;
pub mod backoff;
pub mod config;
pub mod consumer;
pub mod domain;
pub mod error;
pub mod history;
pub mod sse;
pub mod state;
pub mod supervisor;

pub use consumer::{HttpConnector, StreamConnector, StreamConsumer};
pub use domain::{EndpointDescriptor, EndpointKind, Sample};
pub use state::{DeviceSnapshot, StateStore};
pub use supervisor::{SessionSupervisor, SupervisorSettings};
