//! ==============================================================================
//! consumer.rs - one long-lived sse subscription with reconnect
//! ==============================================================================
//!
//! purpose:
//!     owns the connection to a single endpoint (one pi-pulse or sen66 stream),
//!     decodes its events into samples and keeps reconnecting with bounded
//!     exponential backoff until the session cancels it.
//!
//! state machine:
//!
//! ```text
//!     Idle ─> Connecting ──ok──> Streaming ──read error / eof──┐
//!                 ^   └──err──┐                                 │
//!                 │           v                                 │
//!                 └──────── Backoff <───────────────────────────┘
//!
//!     Cancelled is reachable from every state. both suspension points
//!     (awaiting bytes, waiting out a backoff) race against the session's
//!     cancellation token, so teardown never waits out a 30s delay.
//! ```
//!
//! the consumer never touches shared state. it reports what happened as
//! ConsumerEvents and the supervisor applies them to the store.
//!
//! relationships:
//!     - used by: supervisor.rs (one consumer task per descriptor)
//!     - uses: sse.rs (framing + payload parsing), backoff.rs
//!
//! ==============================================================================

use crate::backoff::{Backoff, BackoffPolicy};
use crate::domain::{EndpointDescriptor, Sample};
use crate::error::ConsumerError;
use crate::sse::{parse_payload, SseDecoder, MAX_EVENT_BYTES};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub type ByteStream = BoxStream<'static, Result<Bytes, ConsumerError>>;

// ==============================================================================
// transport seam
// ==============================================================================

/// opens the byte stream behind an endpoint url
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<ByteStream, ConsumerError>;
}

/// reqwest-backed connector used in production
#[derive(Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new(connect_timeout: Duration) -> Result<Self, ConsumerError> {
        // no overall request timeout: the response body never ends
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ConsumerError::Connect(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl StreamConnector for HttpConnector {
    async fn connect(&self, url: &str) -> Result<ByteStream, ConsumerError> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(ConsumerError::from)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConsumerError::Status(status.as_u16()));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ConsumerError::StreamRead(e.to_string())))
            .boxed())
    }
}

// ==============================================================================
// consumer
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Idle,
    Connecting,
    Streaming,
    Backoff,
    Cancelled,
}

#[derive(Debug)]
pub enum ConsumerEvent {
    /// http stream is open; no sample has arrived yet
    Connected,
    /// all samples parsed from one sse event
    Samples(Vec<Sample>),
    /// the consumer entered backoff
    Disconnected {
        error: ConsumerError,
        retry_in: Duration,
        /// the failed connection had reached Streaming
        was_streaming: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerExit {
    Cancelled,
    /// nobody is listening to the events any more
    ReceiverClosed,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub backoff: BackoffPolicy,
    /// a stream silent for this long counts as dropped; none disables
    pub read_timeout: Option<Duration>,
    /// a single sse event larger than this drops the connection
    pub max_event_bytes: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            read_timeout: Some(Duration::from_secs(60)),
            max_event_bytes: MAX_EVENT_BYTES,
        }
    }
}

/// why a connection attempt or a streaming run ended
enum Stop {
    Cancelled,
    ReceiverClosed,
    Failed(ConsumerError),
}

pub struct StreamConsumer {
    descriptor: EndpointDescriptor,
    connector: Arc<dyn StreamConnector>,
    settings: ConsumerSettings,
    backoff: Backoff,
    state: watch::Sender<ConsumerState>,
    tag: String,
}

impl StreamConsumer {
    pub fn new(
        descriptor: EndpointDescriptor,
        connector: Arc<dyn StreamConnector>,
        settings: ConsumerSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Idle);
        Self {
            tag: descriptor.tag(),
            backoff: Backoff::new(settings.backoff),
            descriptor,
            connector,
            settings,
            state,
        }
    }

    /// observe state transitions
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    /// run until cancelled (or until the event receiver goes away)
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        events: mpsc::Sender<ConsumerEvent>,
    ) -> ConsumerExit {
        loop {
            self.set_state(ConsumerState::Connecting);
            tracing::debug!("[STREAM] {} connecting to {}", self.tag, self.descriptor.url);

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.finish(ConsumerExit::Cancelled),
                attempt = self.connector.connect(&self.descriptor.url) => attempt,
            };

            let (error, was_streaming) = match attempt {
                Ok(stream) => {
                    self.set_state(ConsumerState::Streaming);
                    self.backoff.reset();
                    tracing::info!("[STREAM] {} connected", self.tag);

                    let stop = match self.emit(&cancel, &events, ConsumerEvent::Connected).await {
                        Ok(()) => self.pump(stream, &cancel, &events).await,
                        Err(stop) => stop,
                    };
                    match stop {
                        Stop::Failed(error) => (error, true),
                        Stop::Cancelled => return self.finish(ConsumerExit::Cancelled),
                        Stop::ReceiverClosed => return self.finish(ConsumerExit::ReceiverClosed),
                    }
                }
                Err(error) => (error, false),
            };

            let retry_in = self.backoff.next_delay();
            self.set_state(ConsumerState::Backoff);
            tracing::warn!(
                "[STREAM] Stream error [{}] ({}); reconnecting in {}s",
                self.tag,
                error,
                retry_in.as_secs_f64()
            );

            let event = ConsumerEvent::Disconnected { error, retry_in, was_streaming };
            match self.emit(&cancel, &events, event).await {
                Ok(()) => {}
                Err(Stop::ReceiverClosed) => return self.finish(ConsumerExit::ReceiverClosed),
                Err(_) => return self.finish(ConsumerExit::Cancelled),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.finish(ConsumerExit::Cancelled),
                _ = tokio::time::sleep(retry_in) => {}
            }
        }
    }

    fn finish(&self, exit: ConsumerExit) -> ConsumerExit {
        self.set_state(ConsumerState::Cancelled);
        tracing::debug!("[STREAM] {} stopped ({:?})", self.tag, exit);
        exit
    }

    /// read one connection until it fails; never returns on success
    async fn pump(
        &self,
        mut stream: ByteStream,
        cancel: &CancellationToken,
        events: &mpsc::Sender<ConsumerEvent>,
    ) -> Stop {
        let mut decoder = SseDecoder::with_limit(self.settings.max_event_bytes);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Stop::Cancelled,
                next = self.next_chunk(&mut stream) => next,
            };
            let chunk = match next {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    return Stop::Failed(ConsumerError::StreamRead("stream closed by server".into()))
                }
                Err(error) => return Stop::Failed(error),
            };

            let payloads = match decoder.feed(&chunk) {
                Ok(payloads) => payloads,
                Err(error) => return Stop::Failed(error),
            };
            for payload in payloads {
                let parsed = parse_payload(
                    &self.descriptor.device_id,
                    self.descriptor.kind,
                    &payload,
                    Utc::now(),
                );
                match parsed {
                    Ok(samples) => {
                        tracing::debug!("[STREAM] {} +{} samples", self.tag, samples.len());
                        if let Err(stop) = self.emit(cancel, events, ConsumerEvent::Samples(samples)).await {
                            return stop;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("[STREAM] Malformed SSE packet [{}], skipping: {} ({:?})", self.tag, e, payload);
                    }
                }
            }
        }
    }

    async fn next_chunk(&self, stream: &mut ByteStream) -> Result<Option<Bytes>, ConsumerError> {
        let next = match self.settings.read_timeout {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| ConsumerError::ReadTimeout(limit))?,
            None => stream.next().await,
        };
        next.transpose()
    }

    async fn emit(
        &self,
        cancel: &CancellationToken,
        events: &mpsc::Sender<ConsumerEvent>,
        event: ConsumerEvent,
    ) -> Result<(), Stop> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Stop::Cancelled),
            sent = events.send(event) => sent.map_err(|_| Stop::ReceiverClosed),
        }
    }
}

// ==============================================================================
// scripted transport for tests
// ==============================================================================
