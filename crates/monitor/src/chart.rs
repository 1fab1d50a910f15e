//! Fast-telemetry chart data for one device.
//!
//! Samples are recovered from the rendered snapshot cells with
//! [`parse_display_number`], the same text an operator sees in the table.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::FleetEvent;
use crate::registry::DeviceSnapshot;
use crate::schema::{parse_display_number, TelemetrySchema};

/// Fields plotted while fast telemetry is on.
pub const FAST_SERIES: [&str; 10] = [
    "VPV", "IPV", "P_PV", "VBAT", "IBAT", "P_BAT", "VOUT", "IOUT", "P_OUT", "VCOM",
];

/// Samples kept per series before the oldest is dropped.
pub const DEFAULT_CAPACITY: usize = 600;

pub type SharedChart = Arc<RwLock<FastChart>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub name: String,
    /// `None` where the cell could not be parsed back to a number.
    pub points: Vec<Option<f64>>,
}

/// Serializable copy of a chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartView {
    pub gateway: String,
    pub address: String,
    pub times: Vec<String>,
    pub series: Vec<Series>,
}

#[derive(Debug)]
pub struct FastChart {
    gateway: String,
    address: String,
    capacity: usize,
    times: VecDeque<String>,
    series: Vec<(&'static str, VecDeque<Option<f64>>)>,
}

impl FastChart {
    pub fn new(gateway: &str, address: &str, capacity: usize) -> Self {
        Self {
            gateway: gateway.to_string(),
            address: address.to_string(),
            capacity: capacity.max(1),
            times: VecDeque::new(),
            series: FAST_SERIES.iter().map(|&n| (n, VecDeque::new())).collect(),
        }
    }

    pub fn shared(gateway: &str, address: &str, capacity: usize) -> SharedChart {
        Arc::new(RwLock::new(Self::new(gateway, address, capacity)))
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn record(&mut self, schema: &TelemetrySchema, snapshot: &DeviceSnapshot) {
        if self.times.len() == self.capacity {
            self.times.pop_front();
            for (_, points) in &mut self.series {
                points.pop_front();
            }
        }

        self.times.push_back(snapshot.updated_at.clone());
        for (name, points) in &mut self.series {
            let value = snapshot.value(schema, name).and_then(parse_display_number);
            points.push_back(value);
        }
    }

    pub fn view(&self) -> ChartView {
        ChartView {
            gateway: self.gateway.clone(),
            address: self.address.clone(),
            times: self.times.iter().cloned().collect(),
            series: self
                .series
                .iter()
                .map(|(name, points)| Series {
                    name: name.to_string(),
                    points: points.iter().copied().collect(),
                })
                .collect(),
        }
    }
}

/// Feed `chart` from fast updates for its device until `cancel` fires or
/// the event channel closes.
pub async fn collect(
    chart: SharedChart,
    schema: Arc<TelemetrySchema>,
    mut events: broadcast::Receiver<FleetEvent>,
    cancel: CancellationToken,
) {
    let (gateway, address) = {
        let c = chart.read().await;
        (c.gateway.clone(), c.address.clone())
    };
    debug!(gateway = %gateway, address = %address, "fast capture started");

    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(FleetEvent::FastUpdate {
                gateway: g,
                snapshot,
            }) if g == gateway && snapshot.address == address => {
                chart.write().await.record(&schema, &snapshot);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => {
                warn!(gateway = %gateway, address = %address, skipped = n, "fast capture fell behind")
            }
            Err(RecvError::Closed) => break,
        }
    }

    debug!(gateway = %gateway, address = %address, "fast capture stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
