//! The set of active gateways and who is observing them.
//!
//! Gateways that connected at startup stay in the active set for the life of
//! the fleet. Observing a gateway starts its ingestion worker and staleness
//! monitor under a child cancellation token; unobserving cancels the token
//! and waits for both. The observer and capture maps are the only state
//! shared across gateways and each sits behind its own mutex. The observer
//! map stays locked until a stopped worker has been joined, so its slot is
//! never reused while the old worker still holds the inbound queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chart::{self, ChartView, FastChart, SharedChart};
use crate::commands::{validate_address, CommandDispatcher, CommandError, OperatorCommand};
use crate::config::Config;
use crate::connection::{ConnectionError, GatewayConnection};
use crate::events::FleetEvent;
use crate::registry::{DeviceRegistry, DeviceSnapshot, SharedRegistry};
use crate::schema::TelemetrySchema;
use crate::staleness::StalenessMonitor;
use crate::worker::{IngestWorker, WorkerHandle, WorkerState};

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("unknown gateway '{0}'")]
    UnknownGateway(String),
    #[error("no fast capture for {address} on '{gateway}'")]
    NoCapture { gateway: String, address: String },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub namespace: String,
    pub stale_timeout: Duration,
    pub stale_tick: Duration,
    pub event_capacity: usize,
    pub chart_capacity: usize,
    pub settle_delay: Duration,
    pub find_window: Duration,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            namespace: crate::config::DEFAULT_NAMESPACE.to_string(),
            stale_timeout: Duration::from_secs(65),
            stale_tick: Duration::from_secs(1),
            event_capacity: 1024,
            chart_capacity: chart::DEFAULT_CAPACITY,
            settle_delay: Duration::from_secs(3),
            find_window: Duration::from_secs(5),
        }
    }
}

impl FleetSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            namespace: config.namespace.clone(),
            stale_timeout: config.stale_timeout(),
            stale_tick: config.stale_tick(),
            event_capacity: config.monitor.event_capacity,
            chart_capacity: config.monitor.chart_capacity,
            settle_delay: config.settle_delay(),
            find_window: config.find_window(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status (what /api/status serializes)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub namespace: String,
    pub header: Vec<String>,
    pub gateways: Vec<GatewayStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub name: String,
    pub endpoint: String,
    pub connected: bool,
    pub observed: bool,
    pub worker: Option<WorkerState>,
    pub devices: Vec<DeviceRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRow {
    #[serde(flatten)]
    pub snapshot: DeviceSnapshot,
    pub stale: bool,
}

// ---------------------------------------------------------------------------
// Fleet
// ---------------------------------------------------------------------------

struct Gateway {
    conn: Arc<GatewayConnection>,
    registry: SharedRegistry,
}

struct Observer {
    cancel: CancellationToken,
    worker: WorkerHandle,
    staleness: JoinHandle<()>,
}

struct Capture {
    chart: SharedChart,
    cancel: CancellationToken,
}

pub struct Fleet {
    settings: FleetSettings,
    schema: Arc<TelemetrySchema>,
    header: Vec<String>,
    dispatcher: CommandDispatcher,
    events: broadcast::Sender<FleetEvent>,
    shutdown: CancellationToken,
    gateways: Vec<Gateway>,
    observers: Mutex<HashMap<String, Observer>>,
    captures: Mutex<HashMap<(String, String), Capture>>,
}

impl Fleet {
    /// Connect every configured gateway concurrently. A gateway that fails
    /// to connect is logged and left out; the fleet still starts.
    pub async fn connect(config: &Config) -> Result<Self> {
        let schema = config.schema()?;
        let header = config.header(&schema);
        let opts = config.connect_options();

        let attempts: Vec<_> = config
            .gateways
            .iter()
            .map(|g| {
                let (g, opts) = (g.clone(), opts.clone());
                tokio::spawn(async move {
                    let res = GatewayConnection::connect(&g.name, &g.host, g.port, &opts).await;
                    (g, res)
                })
            })
            .collect();

        let mut conns = Vec::new();
        for attempt in attempts {
            match attempt.await {
                Ok((g, Ok(conn))) => {
                    info!(gateway = %g.name, host = %g.host, port = g.port, "gateway connected");
                    conns.push(conn);
                }
                Ok((g, Err(e))) => {
                    warn!(gateway = %g.name, "gateway unavailable: {e:#}");
                }
                Err(e) => error!("connect task failed: {e}"),
            }
        }

        if conns.is_empty() {
            warn!("no gateway could be reached; the active set is empty");
        }

        Ok(Self::from_connections(
            FleetSettings::from_config(config),
            schema,
            header,
            conns,
        ))
    }

    /// Build a fleet over already-open connections.
    pub fn from_connections(
        settings: FleetSettings,
        schema: TelemetrySchema,
        header: Vec<String>,
        conns: Vec<Arc<GatewayConnection>>,
    ) -> Self {
        let schema = Arc::new(schema);
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let dispatcher = CommandDispatcher::new(
            &settings.namespace,
            settings.settle_delay,
            settings.find_window,
        );
        let gateways = conns
            .into_iter()
            .map(|conn| Gateway {
                registry: DeviceRegistry::shared(conn.name(), Arc::clone(&schema)),
                conn,
            })
            .collect();

        Self {
            settings,
            schema,
            header,
            dispatcher,
            events,
            shutdown: CancellationToken::new(),
            gateways,
            observers: Mutex::new(HashMap::new()),
            captures: Mutex::new(HashMap::new()),
        }
    }

    fn gateway(&self, name: &str) -> Result<&Gateway, FleetError> {
        self.gateways
            .iter()
            .find(|g| g.conn.name() == name)
            .ok_or_else(|| FleetError::UnknownGateway(name.to_string()))
    }

    /// Names of the active gateways, in configuration order.
    pub fn gateway_names(&self) -> Vec<String> {
        self.gateways
            .iter()
            .map(|g| g.conn.name().to_string())
            .collect()
    }

    pub fn connection(&self, name: &str) -> Result<Arc<GatewayConnection>, FleetError> {
        self.gateway(name).map(|g| Arc::clone(&g.conn))
    }

    pub fn registry(&self, name: &str) -> Result<SharedRegistry, FleetError> {
        self.gateway(name).map(|g| Arc::clone(&g.registry))
    }

    pub fn schema(&self) -> &TelemetrySchema {
        &self.schema
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Observation
    // -----------------------------------------------------------------------

    /// Start ingesting `name`. Idempotent while observed; a worker that
    /// stopped on its own (connection closed) is replaced.
    pub async fn observe(&self, name: &str) -> Result<SharedRegistry, FleetError> {
        let gw = self.gateway(name)?;
        let mut observers = self.observers.lock().await;

        if let Some(existing) = observers.get(name) {
            if !existing.worker.is_finished() {
                return Ok(Arc::clone(&gw.registry));
            }
        }
        if let Some(old) = observers.remove(name) {
            old.cancel.cancel();
            old.staleness.abort();
        }

        let inbound = gw.conn.inbound()?;
        let cancel = self.shutdown.child_token();

        let worker = IngestWorker::new(
            &self.settings.namespace,
            name,
            Arc::clone(&gw.registry),
            self.events.clone(),
        )
        .spawn(inbound, cancel.clone());

        let monitor = StalenessMonitor::new(
            name,
            Arc::clone(&gw.registry),
            self.settings.stale_timeout,
            self.events.clone(),
        );
        let staleness = tokio::spawn(monitor.run(self.settings.stale_tick, cancel.clone()));

        observers.insert(
            name.to_string(),
            Observer {
                cancel,
                worker,
                staleness,
            },
        );
        info!(gateway = name, "observing");
        Ok(Arc::clone(&gw.registry))
    }

    /// Stop ingesting `name`. Returns `false` if it was not observed.
    pub async fn unobserve(&self, name: &str) -> Result<bool, FleetError> {
        self.gateway(name)?;
        let mut observers = self.observers.lock().await;
        let Some(observer) = observers.remove(name) else {
            return Ok(false);
        };

        stop_observer(name, observer).await;
        drop(observers);
        info!(gateway = name, "no longer observing");
        Ok(true)
    }

    pub async fn is_observed(&self, name: &str) -> bool {
        self.observers.lock().await.contains_key(name)
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub async fn execute(&self, gateway: &str, command: &OperatorCommand) -> Result<(), FleetError> {
        let gw = self.gateway(gateway)?;
        self.dispatcher.execute(&gw.conn, command).await?;
        Ok(())
    }

    /// Search every active gateway for `address`.
    pub async fn find_unit(&self, address: &str) -> Result<Option<String>, FleetError> {
        let conns: Vec<_> = self.gateways.iter().map(|g| Arc::clone(&g.conn)).collect();
        Ok(self.dispatcher.find_unit(&conns, address).await?)
    }

    /// Switch `address` to fast telemetry and record its fast updates.
    /// Restarting a capture discards the previous samples.
    pub async fn start_fast_capture(
        &self,
        gateway: &str,
        address: &str,
    ) -> Result<SharedChart, FleetError> {
        let gw = self.gateway(gateway)?;
        let address = validate_address(address)?;

        let chart = FastChart::shared(gateway, &address, self.settings.chart_capacity);
        let cancel = self.shutdown.child_token();
        // Subscribe before the device is told to speed up.
        let events = self.events.subscribe();

        self.dispatcher.enable_fast(&gw.conn, &address)?;
        tokio::spawn(chart::collect(
            Arc::clone(&chart),
            Arc::clone(&self.schema),
            events,
            cancel.clone(),
        ));

        let previous = self.captures.lock().await.insert(
            (gateway.to_string(), address.clone()),
            Capture {
                chart: Arc::clone(&chart),
                cancel,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        info!(gateway, address = %address, "fast capture started");
        Ok(chart)
    }

    /// Switch `address` back to normal telemetry. Samples stay readable
    /// through [`Fleet::fast_series`]. Without a capture nothing is sent.
    pub async fn stop_fast_capture(
        &self,
        gateway: &str,
        address: &str,
    ) -> Result<ChartView, FleetError> {
        let gw = self.gateway(gateway)?;
        let address = validate_address(address)?;

        let captures = self.captures.lock().await;
        let capture = captures
            .get(&(gateway.to_string(), address.clone()))
            .ok_or_else(|| FleetError::NoCapture {
                gateway: gateway.to_string(),
                address: address.clone(),
            })?;

        self.dispatcher.disable_fast(&gw.conn, &address)?;
        capture.cancel.cancel();
        let view = capture.chart.read().await.view();
        info!(gateway, address = %address, samples = view.times.len(), "fast capture stopped");
        Ok(view)
    }

    pub async fn fast_series(&self, gateway: &str, address: &str) -> Result<ChartView, FleetError> {
        self.gateway(gateway)?;
        let address = validate_address(address)?;
        let chart = {
            let captures = self.captures.lock().await;
            captures
                .get(&(gateway.to_string(), address.clone()))
                .map(|c| Arc::clone(&c.chart))
        };
        match chart {
            Some(chart) => Ok(chart.read().await.view()),
            None => Err(FleetError::NoCapture {
                gateway: gateway.to_string(),
                address,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Status + shutdown
    // -----------------------------------------------------------------------

    pub async fn status(&self) -> FleetStatus {
        let now = Instant::now();
        let observers = self.observers.lock().await;
        let mut gateways = Vec::with_capacity(self.gateways.len());

        for gw in &self.gateways {
            let reg = gw.registry.read().await;
            let devices = reg
                .devices()
                .zip(reg.snapshots())
                .map(|(device, snapshot)| DeviceRow {
                    stale: device.is_stale(now, self.settings.stale_timeout),
                    snapshot,
                })
                .collect();
            let observer = observers.get(gw.conn.name());

            gateways.push(GatewayStatus {
                name: gw.conn.name().to_string(),
                endpoint: gw.conn.endpoint().to_string(),
                connected: gw.conn.is_connected(),
                observed: observer.is_some(),
                worker: observer.map(|o| o.worker.state()),
                devices,
            });
        }

        FleetStatus {
            namespace: self.settings.namespace.clone(),
            header: self.header.clone(),
            gateways,
        }
    }

    /// Stop every observer and capture, then disconnect every gateway.
    pub async fn shutdown(&self) {
        let mut observers = self.observers.lock().await;
        self.shutdown.cancel();

        let stopping: Vec<_> = observers.drain().collect();
        for (name, observer) in stopping {
            stop_observer(&name, observer).await;
        }
        drop(observers);
        self.captures.lock().await.clear();

        for gw in &self.gateways {
            gw.conn.disconnect();
        }
        info!("fleet shut down");
    }
}

async fn stop_observer(name: &str, observer: Observer) {
    observer.cancel.cancel();
    observer.worker.join().await;
    if let Err(e) = observer.staleness.await {
        error!(gateway = name, "staleness monitor task failed: {e}");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
