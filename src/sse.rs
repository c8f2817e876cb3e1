//! ==============================================================================
//! sse.rs - server-sent-events framing and payload parsing
//! ==============================================================================
//!
//! purpose:
//!     turns the raw byte chunks of an sse response into event payloads, and
//!     one payload into samples (one per numeric json field).
//!
//! wire format (what the pi-pulse / sen66 services emit):
//!
//! ```text
//!     data: {"cpu": 12.5, "mem": 41.0, "temp": 48.2}
//!     <blank line>
//! ```
//!
//! chunks from the network do not respect line or event boundaries, so the
//! decoder buffers raw bytes and only decodes complete lines.
//!
//! relationships:
//!     - used by: consumer.rs (one decoder per connection)
//!
//! ==============================================================================

use crate::domain::{EndpointKind, Sample};
use crate::error::{ConsumerError, PayloadError};
use chrono::{DateTime, Utc};

/// upper bound on one event: the unterminated line plus its data lines
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

/// incremental sse event decoder
#[derive(Debug)]
pub struct SseDecoder {
    /// bytes of the current, not yet terminated line
    pending: Vec<u8>,
    /// data lines of the event being assembled
    data: Vec<String>,
    data_bytes: usize,
    limit: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_EVENT_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            data: Vec::new(),
            data_bytes: 0,
            limit,
        }
    }

    /// feed one network chunk; returns the data of every event it completed
    ///
    /// an event that outgrows the limit before it is dispatched is an error
    /// and the partial event is discarded.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, ConsumerError> {
        let mut events = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.pending);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                if let Some(event) = self.process_line(&String::from_utf8_lossy(&line)) {
                    events.push(event);
                }
            } else {
                self.pending.push(byte);
            }
            if self.pending.len() + self.data_bytes > self.limit {
                self.clear();
                return Err(ConsumerError::EventTooLarge(self.limit));
            }
        }
        Ok(events)
    }

    fn process_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            self.data_bytes = 0;
            return Some(std::mem::take(&mut self.data).join("\n"));
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        // event / id / retry carry nothing the hub uses
        if field == "data" {
            // +1 for the joining newline
            self.data_bytes += value.len() + 1;
            self.data.push(value.to_string());
        }
        None
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.data.clear();
        self.data_bytes = 0;
    }
}

/// parse one event payload into samples
///
/// the payload must be a flat json object. every numeric field becomes a
/// sample; strings, booleans, nulls and nested values are skipped.
pub fn parse_payload(
    device_id: &str,
    source: EndpointKind,
    payload: &str,
    received_at: DateTime<Utc>,
) -> Result<Vec<Sample>, PayloadError> {
    let value: serde_json::Value = serde_json::from_str(payload)?;
    let object = value.as_object().ok_or(PayloadError::NotAnObject)?;

    let samples: Vec<Sample> = object
        .iter()
        .filter_map(|(metric, v)| {
            v.as_f64().map(|value| Sample {
                device_id: device_id.to_string(),
                source,
                metric: metric.clone(),
                value,
                received_at,
            })
        })
        .collect();

    if samples.is_empty() {
        return Err(PayloadError::NoNumericFields);
    }
    Ok(samples)
}
