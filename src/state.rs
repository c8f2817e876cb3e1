//! ==============================================================================
//! state.rs - shared per-device state (the only shared mutable resource)
//! ==============================================================================
//!
//! purpose:
//!     holds the latest readings and rolling history of every configured device,
//!     written by the stream consumers (via the supervisor) and read by the
//!     snapshot api.
//!
//! locking:
//!     the device map is built once from the endpoint descriptors and never
//!     changes shape afterwards, so it needs no lock of its own. each device
//!     sits behind its own mutex:
//!
//! ```text
//!         StateStore ─┬─ "10" ─ Mutex<Option<DeviceState>>
//!                     └─ "11" ─ Mutex<Option<DeviceState>>
//!
//!     critical sections are O(1) (one ring push) or O(60 x metrics) for a
//!     snapshot copy. no i/o and no await ever happens while a lock is held.
//! ```
//!
//! relationships:
//!     - used by: supervisor.rs (writes), api.rs (reads)
//!     - uses: history.rs (one HistoryBuffer per metric)
//!
//! ==============================================================================

use crate::domain::{EndpointDescriptor, EndpointKind, Sample};
use crate::error::{HistoryError, StoreError};
use crate::history::HistoryBuffer;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// live state of one device; only ever touched under its slot lock
#[derive(Debug)]
pub struct DeviceState {
    pub last_update: DateTime<Utc>,
    /// live flag per stream that has delivered at least one sample
    pub links: BTreeMap<EndpointKind, bool>,
    pub metrics: BTreeMap<String, HistoryBuffer>,
}

impl DeviceState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            last_update: now,
            links: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// every stream that has ever streamed is currently live
    pub fn connected(&self) -> bool {
        !self.links.is_empty() && self.links.values().all(|live| *live)
    }
}

/// registry entry: static facts about a configured device
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kinds: Vec<EndpointKind>,
}

impl DeviceInfo {
    pub fn is_sensor(&self) -> bool {
        self.kinds.iter().any(|k| k.is_sensor())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    pub latest: f64,
    pub history: Vec<f64>,
    /// arrival time of each history entry
    pub timestamps: Vec<DateTime<Utc>>,
    pub min: f64,
    pub max: f64,
}

/// point-in-time copy of a device, safe to hand to the rendering side
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub label: String,
    pub kinds: Vec<EndpointKind>,
    pub connected: bool,
    /// none until the first sample arrives
    pub last_update: Option<DateTime<Utc>>,
    pub streams: BTreeMap<EndpointKind, bool>,
    pub metrics: BTreeMap<String, MetricSnapshot>,
}

/// published after every applied batch and every disconnect
#[derive(Debug, Clone, Serialize)]
pub struct DeviceUpdate {
    pub device_id: String,
    pub connected: bool,
    pub last_update: DateTime<Utc>,
}

struct DeviceSlot {
    info: DeviceInfo,
    state: Mutex<Option<DeviceState>>,
}

struct StoreInner {
    slots: HashMap<String, DeviceSlot>,
    /// cloned for every new metric
    empty_history: HistoryBuffer,
    updates: broadcast::Sender<DeviceUpdate>,
}

/// clone-able handle to the shared device map
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    /// build the device registry from the static descriptor list
    pub fn new(
        descriptors: &[EndpointDescriptor],
        history_capacity: usize,
    ) -> Result<Self, HistoryError> {
        let empty_history = HistoryBuffer::new(history_capacity)?;

        let mut slots: HashMap<String, DeviceSlot> = HashMap::new();
        for d in descriptors {
            let slot = slots.entry(d.device_id.clone()).or_insert_with(|| DeviceSlot {
                info: DeviceInfo {
                    device_id: d.device_id.clone(),
                    label: d.label.clone(),
                    kinds: Vec::new(),
                },
                state: Mutex::new(None),
            });
            if !slot.info.kinds.contains(&d.kind) {
                slot.info.kinds.push(d.kind);
                slot.info.kinds.sort();
            }
        }

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(StoreInner {
                slots,
                empty_history,
                updates,
            }),
        })
    }

    fn slot(&self, device_id: &str) -> Result<&DeviceSlot, StoreError> {
        self.inner
            .slots
            .get(device_id)
            .ok_or_else(|| StoreError::UnknownDevice(device_id.to_string()))
    }

    /// record one sample; marks its stream live
    pub fn apply_sample(&self, sample: &Sample) -> Result<(), StoreError> {
        let slot = self.slot(&sample.device_id)?;

        let mut guard = slot.state.lock();
        let state = guard.get_or_insert_with(|| DeviceState::new(sample.received_at));
        if !state.metrics.contains_key(&sample.metric) {
            state
                .metrics
                .insert(sample.metric.clone(), self.inner.empty_history.clone());
        }
        if let Some(buffer) = state.metrics.get_mut(&sample.metric) {
            buffer.push(sample.received_at, sample.value);
        }
        if sample.received_at > state.last_update {
            state.last_update = sample.received_at;
        }
        state.links.insert(sample.source, true);
        Ok(())
    }

    /// apply a whole payload's samples (each one atomically) and notify
    ///
    /// returns how many samples were applied.
    pub fn apply_batch(&self, samples: &[Sample]) -> usize {
        let mut applied = 0;
        let mut touched: Option<&str> = None;
        for sample in samples {
            match self.apply_sample(sample) {
                Ok(()) => {
                    applied += 1;
                    touched = Some(sample.device_id.as_str());
                }
                Err(e) => {
                    tracing::warn!("[STATE] Dropping sample {}={}: {}", sample.metric, sample.value, e);
                }
            }
        }
        if let Some(device_id) = touched {
            self.publish(device_id);
        }
        applied
    }

    /// flag one stream of a device as down; history is kept
    pub fn mark_disconnected(&self, device_id: &str, kind: EndpointKind) -> Result<(), StoreError> {
        let slot = self.slot(device_id)?;
        let changed = {
            let mut guard = slot.state.lock();
            match guard.as_mut().and_then(|s| s.links.get_mut(&kind)) {
                Some(live) if *live => {
                    *live = false;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.publish(device_id);
        }
        Ok(())
    }

    fn publish(&self, device_id: &str) {
        let update = {
            let Some(slot) = self.inner.slots.get(device_id) else {
                return;
            };
            let guard = slot.state.lock();
            match guard.as_ref() {
                Some(state) => DeviceUpdate {
                    device_id: device_id.to_string(),
                    connected: state.connected(),
                    last_update: state.last_update,
                },
                None => return,
            }
        };
        // no subscribers is fine
        let _ = self.inner.updates.send(update);
    }

    pub fn snapshot(&self, device_id: &str) -> Result<DeviceSnapshot, StoreError> {
        let slot = self.slot(device_id)?;
        let guard = slot.state.lock();
        let mut snapshot = DeviceSnapshot {
            device_id: slot.info.device_id.clone(),
            label: slot.info.label.clone(),
            kinds: slot.info.kinds.clone(),
            connected: false,
            last_update: None,
            streams: BTreeMap::new(),
            metrics: BTreeMap::new(),
        };
        if let Some(state) = guard.as_ref() {
            snapshot.connected = state.connected();
            snapshot.last_update = Some(state.last_update);
            snapshot.streams = state.links.clone();
            snapshot.metrics = state
                .metrics
                .iter()
                .filter_map(|(name, buffer)| {
                    let points = buffer.points();
                    Some((
                        name.clone(),
                        MetricSnapshot {
                            latest: buffer.latest()?,
                            history: points.iter().map(|p| p.value).collect(),
                            timestamps: points.iter().map(|p| p.at).collect(),
                            min: buffer.min()?,
                            max: buffer.max()?,
                        },
                    ))
                })
                .collect();
        }
        Ok(snapshot)
    }

    /// snapshots of every configured device, keyed by id
    pub fn snapshot_all(&self) -> BTreeMap<String, DeviceSnapshot> {
        self.inner
            .slots
            .keys()
            .filter_map(|id| self.snapshot(id).ok().map(|s| (id.clone(), s)))
            .collect()
    }

    /// configured devices in id order
    pub fn devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<DeviceInfo> = self.inner.slots.values().map(|s| s.info.clone()).collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceUpdate> {
        self.inner.updates.subscribe()
    }
}
