//! Ingestion worker: one per observed gateway.
//!
//! Reads the connection's inbound queue in order, decodes `json` telemetry
//! into the gateway's registry and emits [`FleetEvent`]s. A bad message is
//! logged and skipped; it never stops the loop.
//!
//! ```text
//! Idle ──spawn──▶ Running ──[cancel | connection closed]──▶ Draining ──▶ Stopped
//! ```

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::connection::{Inbound, RawMessage};
use crate::events::FleetEvent;
use crate::registry::{DeviceSnapshot, SharedRegistry};
use crate::topic::{classify, TopicClass};

/// Payload key carrying the telemetry cadence. Never stored as a field.
pub const TYPE_KEY: &str = "type";

/// `type` value marking high-rate telemetry.
pub const FAST_TYPE: &str = "fast";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Running,
    Draining,
    Stopped,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct IngestWorker {
    namespace: String,
    gateway: String,
    registry: SharedRegistry,
    events: broadcast::Sender<FleetEvent>,
    state: watch::Sender<WorkerState>,
}

impl IngestWorker {
    pub fn new(
        namespace: &str,
        gateway: &str,
        registry: SharedRegistry,
        events: broadcast::Sender<FleetEvent>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            namespace: namespace.to_string(),
            gateway: gateway.to_string(),
            registry,
            events,
            state,
        }
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Run on a new task. The returned handle reports state and joins.
    pub fn spawn(self, inbound: Inbound, cancel: CancellationToken) -> WorkerHandle {
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run(inbound, cancel));
        WorkerHandle { state, task }
    }

    /// Consume `inbound` until `cancel` fires or the connection closes.
    ///
    /// Cancellation is observed between messages, so a message already
    /// being applied is finished before the worker stops. On the way out
    /// `cancel` is fired, stopping every task that shares it.
    pub async fn run(self, mut inbound: Inbound, cancel: CancellationToken) {
        self.state.send_replace(WorkerState::Running);
        info!(gateway = %self.gateway, "ingestion started");

        loop {
            let msg = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                msg = inbound.next() => match msg {
                    Some(msg) => msg,
                    None => {
                        info!(gateway = %self.gateway, "connection closed");
                        break;
                    }
                },
            };

            if let Err(e) = self.handle(&msg).await {
                warn!(
                    gateway = %self.gateway,
                    topic = %msg.topic,
                    seq = msg.seq,
                    "dropping message: {e:#}"
                );
            }
        }

        self.state.send_replace(WorkerState::Draining);
        cancel.cancel();
        drop(inbound);
        self.state.send_replace(WorkerState::Stopped);
        info!(gateway = %self.gateway, "ingestion stopped");
    }

    /// Apply one raw message. Only malformed telemetry is an error.
    pub async fn handle(&self, msg: &RawMessage) -> Result<()> {
        let class = classify(&self.namespace, &msg.topic);
        let TopicClass::Device {
            address,
            subchannel,
        } = class
        else {
            debug!(gateway = %self.gateway, topic = %msg.topic, "not a device topic");
            return Ok(());
        };

        if !class.is_telemetry() {
            debug!(gateway = %self.gateway, address, subchannel, "device message not decoded");
            return Ok(());
        }

        let payload: Map<String, Value> =
            serde_json::from_slice(&msg.payload).context("telemetry payload is not a JSON object")?;
        let fast = payload.get(TYPE_KEY).and_then(Value::as_str) == Some(FAST_TYPE);
        let address = address.to_ascii_lowercase();

        let Some(snapshot) = self.apply(&address, &payload).await else {
            return Ok(());
        };

        if fast {
            self.emit(FleetEvent::FastUpdate {
                gateway: self.gateway.clone(),
                snapshot: snapshot.clone(),
            });
        }
        self.emit(FleetEvent::DeviceUpdated {
            gateway: self.gateway.clone(),
            snapshot,
        });
        Ok(())
    }

    async fn apply(&self, address: &str, payload: &Map<String, Value>) -> Option<DeviceSnapshot> {
        let mut reg = self.registry.write().await;
        reg.get_or_create(address);

        for (name, value) in payload {
            if name == TYPE_KEY {
                continue;
            }
            match reg.set_attribute(address, name, value) {
                Ok(true) => {}
                Ok(false) => trace!(gateway = %self.gateway, address, field = %name, "unrecognized field"),
                Err(e) => warn!(gateway = %self.gateway, address, "{e}"),
            }
        }

        reg.touch(address);
        reg.snapshot(address)
    }

    fn emit(&self, event: FleetEvent) {
        // No subscribers is fine; nobody is looking at this gateway yet.
        let _ = self.events.send(event);
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

pub struct WorkerHandle {
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the worker task to end.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("ingestion worker task failed: {e}");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
