//! ==============================================================================
//! supervisor.rs - session-scoped lifecycle of all stream consumers
//! ==============================================================================
//!
//! purpose:
//!     spawns one consumer per endpoint descriptor for the lifetime of a
//!     session, applies their events to the StateStore, and tears all of them
//!     down when the session ends.
//!
//! fault boundary:
//!
//! ```text
//!     SessionSupervisor
//!       ├─ supervise(pulse-10)   ── JoinSet ── StreamConsumer
//!       ├─ supervise(pulse-11)   ── JoinSet ── StreamConsumer
//!       └─ supervise(sen66-11)   ── JoinSet ── StreamConsumer
//!
//!     every consumer runs in its own task. a panic surfaces as a JoinError in
//!     its supervise loop only; that loop logs it, marks the stream down and
//!     starts a fresh consumer (fresh backoff). siblings never notice.
//! ```
//!
//! cancellation:
//!     one CancellationToken per session. consumers get child tokens. the
//!     forwarder checks the token before applying anything, so nothing is
//!     written to the store once cancellation is observed. dropping the
//!     supervisor cancels the session as well.
//!
//! relationships:
//!     - used by: main.rs (one session for the hub process)
//!     - uses: consumer.rs, state.rs
//!
//! ==============================================================================

use crate::consumer::{ConsumerEvent, ConsumerSettings, StreamConnector, StreamConsumer};
use crate::domain::EndpointDescriptor;
use crate::error::ConsumerError;
use crate::state::StateStore;

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub consumer: ConsumerSettings,
    /// how long shutdown waits before aborting stragglers
    pub shutdown_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            consumer: ConsumerSettings::default(),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

pub struct SessionSupervisor {
    session: CancellationToken,
    tasks: JoinSet<String>,
    shutdown_grace: Duration,
    _cancel_on_drop: DropGuard,
}

impl SessionSupervisor {
    /// spawn one supervised consumer per descriptor
    pub fn start(
        descriptors: &[EndpointDescriptor],
        store: StateStore,
        connector: Arc<dyn StreamConnector>,
        settings: SupervisorSettings,
        session: CancellationToken,
    ) -> Self {
        let mut tasks = JoinSet::new();
        for descriptor in descriptors {
            tasks.spawn(supervise(
                descriptor.clone(),
                store.clone(),
                connector.clone(),
                settings.consumer.clone(),
                session.clone(),
            ));
        }
        tracing::info!("[SUPERVISOR] Started {} stream consumers", tasks.len());

        Self {
            _cancel_on_drop: session.clone().drop_guard(),
            session,
            tasks,
            shutdown_grace: settings.shutdown_grace,
        }
    }

    pub fn session(&self) -> CancellationToken {
        self.session.clone()
    }

    /// number of consumers still running
    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// wait for the session to end, then tear down
    pub async fn wait(self) -> usize {
        self.session.cancelled().await;
        self.shutdown().await
    }

    /// cancel every consumer and wait for all of them to exit
    ///
    /// returns the number of consumer exits observed.
    pub async fn shutdown(mut self) -> usize {
        self.session.cancel();
        let mut exited = 0;

        let deadline = tokio::time::sleep(self.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = self.tasks.join_next() => match joined {
                    Some(Ok(tag)) => {
                        tracing::debug!("[SUPERVISOR] {} exited", tag);
                        exited += 1;
                    }
                    Some(Err(e)) => {
                        tracing::warn!("[SUPERVISOR] Consumer task failed during shutdown: {}", e);
                        exited += 1;
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    tracing::warn!(
                        "[SUPERVISOR] {} consumers still running after {:?}; aborting",
                        self.tasks.len(),
                        self.shutdown_grace
                    );
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {
                        exited += 1;
                    }
                    break;
                }
            }
        }

        tracing::info!("[SUPERVISOR] Session closed, {} consumers exited", exited);
        exited
    }
}

/// restart loop for one endpoint; returns the endpoint tag once the session ends
async fn supervise(
    descriptor: EndpointDescriptor,
    store: StateStore,
    connector: Arc<dyn StreamConnector>,
    settings: ConsumerSettings,
    session: CancellationToken,
) -> String {
    let tag = descriptor.tag();
    loop {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let consumer = StreamConsumer::new(descriptor.clone(), connector.clone(), settings.clone());

        // the set aborts the consumer if this task is itself aborted
        let mut running = JoinSet::new();
        running.spawn(consumer.run(session.child_token(), tx));

        loop {
            tokio::select! {
                biased;
                _ = session.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => apply_event(&descriptor, &store, event),
                    None => break,
                },
            }
        }
        drop(rx);

        match running.join_next().await {
            Some(Err(e)) if e.is_panic() => {
                let error = ConsumerError::Crashed(panic_message(e.into_panic()));
                tracing::error!("[SUPERVISOR] Consumer {} crashed ({}); restarting", tag, error);
                if let Err(e) = store.mark_disconnected(&descriptor.device_id, descriptor.kind) {
                    tracing::warn!("[SUPERVISOR] {}: {}", tag, e);
                }
            }
            Some(Ok(exit)) => {
                tracing::debug!("[SUPERVISOR] Consumer {} finished: {:?}", tag, exit);
                return tag;
            }
            _ => return tag,
        }

        if session.is_cancelled() {
            return tag;
        }
        tokio::select! {
            biased;
            _ = session.cancelled() => return tag,
            _ = tokio::time::sleep(settings.backoff.initial) => {}
        }
    }
}

fn apply_event(descriptor: &EndpointDescriptor, store: &StateStore, event: ConsumerEvent) {
    match event {
        // connected only flips once real data arrives
        ConsumerEvent::Connected => {
            tracing::debug!("[SUPERVISOR] {} streaming", descriptor.tag());
        }
        ConsumerEvent::Samples(samples) => {
            store.apply_batch(&samples);
        }
        ConsumerEvent::Disconnected { was_streaming, .. } => {
            if was_streaming {
                if let Err(e) = store.mark_disconnected(&descriptor.device_id, descriptor.kind) {
                    tracing::warn!("[SUPERVISOR] {}: {}", descriptor.tag(), e);
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::scripted::{Ending, Plan, ScriptedConnector};
    use crate::domain::EndpointKind;
    use crate::history::DEFAULT_CAPACITY;

    fn descriptor(id: &str, kind: EndpointKind) -> EndpointDescriptor {
        EndpointDescriptor {
            device_id: id.to_string(),
            label: id.to_string(),
            kind,
            url: format!("http://pi-{}/{}", id, kind),
        }
    }

    fn url(id: &str, kind: EndpointKind) -> String {
        descriptor(id, kind).url
    }

    async fn wait_until(store: &StateStore, mut done: impl FnMut(&StateStore) -> bool) {
        let mut updates = store.subscribe();
        tokio::time::timeout(Duration::from_secs(600), async {
            while !done(store) {
                let _ = updates.recv().await;
            }
        })
        .await
        .expect("store never reached the expected state");
    }

    fn history(store: &StateStore, id: &str, metric: &str) -> Vec<f64> {
        store
            .snapshot(id)
            .ok()
            .and_then(|s| s.metrics.get(metric).map(|m| m.history.clone()))
            .unwrap_or_default()
    }

    fn start(
        descriptors: &[EndpointDescriptor],
        connector: ScriptedConnector,
    ) -> (StateStore, SessionSupervisor) {
        let store = StateStore::new(descriptors, DEFAULT_CAPACITY).unwrap();
        let supervisor = SessionSupervisor::start(
            descriptors,
            store.clone(),
            Arc::new(connector),
            SupervisorSettings::default(),
            CancellationToken::new(),
        );
        (store, supervisor)
    }

    #[tokio::test(start_paused = true)]
    async fn two_events_end_to_end() {
        let kind = EndpointKind::SystemMetrics;
        let descriptors = [descriptor("10", kind)];
        let connector = ScriptedConnector::new().script(
            &url("10", kind),
            vec![Plan::Stream(
                vec!["data: {\"cpu\": 10.0}\n\n", "data: {\"cpu\": 20.0}\n\n"],
                Ending::Hang,
            )],
        );
        let (store, supervisor) = start(&descriptors, connector);

        wait_until(&store, |s| history(s, "10", "cpu").len() == 2).await;
        let snapshot = store.snapshot("10").unwrap();
        assert!(snapshot.connected);
        let cpu = &snapshot.metrics["cpu"];
        assert_eq!((cpu.latest, cpu.min, cpu.max), (20.0, 10.0, 20.0));
        assert_eq!(cpu.history, vec![10.0, 20.0]);
        assert_eq!(cpu.timestamps.len(), 2);
        assert!(cpu.timestamps[0] <= cpu.timestamps[1]);

        assert_eq!(supervisor.shutdown().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_every_consumer_and_all_writes() {
        let kind = EndpointKind::SystemMetrics;
        let descriptors = [descriptor("10", kind), descriptor("11", kind), descriptor("12", kind)];
        let mut connector = ScriptedConnector::new();
        for d in &descriptors {
            connector = connector.script(
                &d.url,
                vec![Plan::Ticker("data: {\"cpu\": 1.0}\n\n", Duration::from_millis(100))],
            );
        }
        let (store, supervisor) = start(&descriptors, connector);
        assert_eq!(supervisor.active(), 3);

        wait_until(&store, |s| ["10", "11", "12"].iter().all(|id| history(s, id, "cpu").len() >= 5)).await;
        assert_eq!(supervisor.shutdown().await, 3);

        let frozen: Vec<_> = ["10", "11", "12"].iter().map(|id| store.snapshot(id).unwrap().last_update).collect();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let after: Vec<_> = ["10", "11", "12"].iter().map(|id| store.snapshot(id).unwrap().last_update).collect();
        assert_eq!(frozen, after);
    }

    #[tokio::test(start_paused = true)]
    async fn outage_keeps_history_and_toggles_connected() {
        let kind = EndpointKind::SystemMetrics;
        let descriptors = [descriptor("10", kind)];
        let connector = ScriptedConnector::new().script(
            &url("10", kind),
            vec![
                Plan::Stream(
                    vec!["data: {\"temp\": 1}\n\n", "data: {\"temp\": 2}\n\n", "data: {\"temp\": 3}\n\n"],
                    Ending::Close,
                ),
                Plan::Refuse,
                Plan::Refuse,
                Plan::Refuse,
                Plan::Refuse,
                Plan::Refuse,
                Plan::Stream(vec!["data: {\"temp\": 4}\n\n"], Ending::Hang),
            ],
        );
        let store = StateStore::new(&descriptors, DEFAULT_CAPACITY).unwrap();
        let mut updates = store.subscribe();
        let supervisor = SessionSupervisor::start(
            &descriptors,
            store.clone(),
            Arc::new(connector),
            SupervisorSettings::default(),
            CancellationToken::new(),
        );

        let mut flags = Vec::new();
        tokio::time::timeout(Duration::from_secs(600), async {
            while let Ok(update) = updates.recv().await {
                flags.push(update.connected);
                if flags.len() == 5 {
                    break;
                }
            }
        })
        .await
        .expect("missing updates");

        // three samples, the drop, then the first sample after recovery
        assert_eq!(flags, vec![true, true, true, false, true]);
        assert_eq!(history(&store, "10", "temp"), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(store.snapshot("10").unwrap().connected);

        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_consumer_restarts_without_hurting_siblings() {
        let descriptors = [
            descriptor("10", EndpointKind::SystemMetrics),
            descriptor("11", EndpointKind::SensorMain),
        ];
        let connector = ScriptedConnector::new()
            .script(
                &url("10", EndpointKind::SystemMetrics),
                vec![Plan::Panic, Plan::Stream(vec!["data: {\"cpu\": 5}\n\n"], Ending::Hang)],
            )
            .script(
                &url("11", EndpointKind::SensorMain),
                vec![Plan::Stream(vec!["data: {\"co2_ppm\": 600}\n\n"], Ending::Hang)],
            );
        let (store, supervisor) = start(&descriptors, connector);

        wait_until(&store, |s| {
            history(s, "10", "cpu") == vec![5.0] && history(s, "11", "co2_ppm") == vec![600.0]
        })
        .await;
        assert_eq!(supervisor.active(), 2);
        assert_eq!(supervisor.shutdown().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_supervisor_cancels_the_session() {
        let descriptors = [descriptor("10", EndpointKind::SystemMetrics)];
        let (_store, supervisor) = start(&descriptors, ScriptedConnector::new());
        let session = supervisor.session();
        drop(supervisor);
        assert!(session.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_once_the_session_is_cancelled() {
        let descriptors = [descriptor("10", EndpointKind::SystemMetrics)];
        let (_store, supervisor) = start(&descriptors, ScriptedConnector::new());
        let session = supervisor.session();
        let waiter = tokio::spawn(supervisor.wait());

        tokio::time::sleep(Duration::from_secs(45)).await;
        session.cancel();
        assert_eq!(waiter.await.unwrap(), 1);
    }
}
