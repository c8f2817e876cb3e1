//! typed errors for the ingestion core
//!
//! none of these are fatal: connection errors send a consumer into backoff,
//! payload errors drop one event, unknown-device errors drop one sample.

use std::time::Duration;
use thiserror::Error;

/// connection-level failures; every variant sends the consumer into backoff
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("unexpected http status {0}")]
    Status(u16),

    #[error("stream read failed: {0}")]
    StreamRead(String),

    #[error("no data received for {0:?}")]
    ReadTimeout(Duration),

    #[error("sse event larger than {0} bytes")]
    EventTooLarge(usize),

    #[error("consumer crashed: {0}")]
    Crashed(String),
}

impl From<reqwest::Error> for ConsumerError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => ConsumerError::Status(status.as_u16()),
            None if e.is_body() || e.is_decode() => ConsumerError::StreamRead(e.to_string()),
            None => ConsumerError::Connect(e.to_string()),
        }
    }
}

/// a single malformed event; the connection stays up
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a json object")]
    NotAnObject,

    #[error("payload has no numeric fields")]
    NoNumericFields,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown device: {0}")]
    UnknownDevice(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("history capacity must be greater than zero")]
    ZeroCapacity,
}
