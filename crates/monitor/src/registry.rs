//! Per-gateway device registry.
//!
//! One [`Device`] per hardware address, created on the first telemetry
//! message and never evicted. Display indices are handed out in first-seen
//! order starting at 1.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::schema::{AttributeError, FieldValue, TelemetrySchema};

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// Registry shared between a gateway's ingestion worker (the only writer),
/// its staleness monitor and any presentation layer.
pub type SharedRegistry = Arc<RwLock<DeviceRegistry>>;

// ---------------------------------------------------------------------------
// Device
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Device {
    address: String,
    gateway: String,
    index: usize,
    values: Vec<FieldValue>,
    last_update: Instant,
    updated_at: OffsetDateTime,
}

impl Device {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn value(&self, slot: usize) -> Option<&FieldValue> {
        self.values.get(slot)
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    /// True once more than `threshold` has passed since the last update.
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_update) > threshold
    }

    fn touch(&mut self, now: Instant, at: OffsetDateTime) {
        self.last_update = now;
        self.updated_at = at;
    }
}

// ---------------------------------------------------------------------------
// Snapshot (what presentation layers consume)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub index: usize,
    pub gateway: String,
    pub address: String,
    /// One rendered cell per schema field, in schema order.
    pub fields: Vec<String>,
    /// Wall-clock time of the last update, `HH:MM:SS` UTC.
    pub updated_at: String,
}

impl DeviceSnapshot {
    /// Rendered cell for the field `name`.
    pub fn value(&self, schema: &TelemetrySchema, name: &str) -> Option<&str> {
        schema
            .position(name)
            .and_then(|i| self.fields.get(i))
            .map(String::as_str)
    }

    /// Canonical row: index, gateway, address, every field, update time.
    pub fn to_row(&self) -> Vec<String> {
        let mut row = Vec::with_capacity(self.fields.len() + 4);
        row.push(format!("{:>2}", self.index));
        row.push(self.gateway.clone());
        row.push(format!("{:<12}", self.address));
        row.extend(self.fields.iter().cloned());
        row.push(format!("{:<8}", self.updated_at));
        row
    }
}

/// `HH:MM:SS` in UTC. The local offset cannot be read reliably once the
/// runtime has spawned threads.
fn clock_time(at: OffsetDateTime) -> String {
    at.to_offset(UtcOffset::UTC)
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct DeviceRegistry {
    gateway: String,
    schema: Arc<TelemetrySchema>,
    devices: Vec<Device>,
    by_address: HashMap<String, usize>,
}

impl DeviceRegistry {
    pub fn new(gateway: &str, schema: Arc<TelemetrySchema>) -> Self {
        Self {
            gateway: gateway.to_string(),
            schema,
            devices: Vec::new(),
            by_address: HashMap::new(),
        }
    }

    pub fn shared(gateway: &str, schema: Arc<TelemetrySchema>) -> SharedRegistry {
        Arc::new(RwLock::new(Self::new(gateway, schema)))
    }

    pub fn gateway(&self) -> &str {
        &self.gateway
    }

    pub fn schema(&self) -> &TelemetrySchema {
        &self.schema
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, address: &str) -> Option<&Device> {
        self.by_address.get(address).map(|&i| &self.devices[i])
    }

    /// Devices in display-index order.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    /// Return the device for `address`, creating it with the next display
    /// index if this is the first time it has been seen.
    pub fn get_or_create(&mut self, address: &str) -> &mut Device {
        let i = match self.by_address.get(address) {
            Some(&i) => i,
            None => {
                let i = self.devices.len();
                self.devices.push(Device {
                    address: address.to_string(),
                    gateway: self.gateway.clone(),
                    index: i + 1,
                    values: self.schema.defaults(),
                    last_update: Instant::now(),
                    updated_at: OffsetDateTime::now_utc(),
                });
                self.by_address.insert(address.to_string(), i);
                tracing::info!(gateway = %self.gateway, address, index = i + 1, "new device");
                i
            }
        };
        &mut self.devices[i]
    }

    /// Write one telemetry field. Returns `Ok(false)` without touching the
    /// device when `name` is not a recognized field or the device is unknown.
    pub fn set_attribute(
        &mut self,
        address: &str,
        name: &str,
        value: &Value,
    ) -> Result<bool, AttributeError> {
        let Some(slot) = self.schema.slot(name) else {
            return Ok(false);
        };
        let Some(&i) = self.by_address.get(address) else {
            return Ok(false);
        };
        let converted = self.schema.convert(slot, value)?;
        self.devices[i].values[slot] = converted;
        Ok(true)
    }

    /// Mark `address` as updated now.
    pub fn touch(&mut self, address: &str) {
        if let Some(&i) = self.by_address.get(address) {
            self.devices[i].touch(Instant::now(), OffsetDateTime::now_utc());
        }
    }

    pub fn snapshot(&self, address: &str) -> Option<DeviceSnapshot> {
        self.get(address).map(|d| self.render(d))
    }

    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        self.devices.iter().map(|d| self.render(d)).collect()
    }

    fn render(&self, device: &Device) -> DeviceSnapshot {
        DeviceSnapshot {
            index: device.index,
            gateway: device.gateway.clone(),
            address: device.address.clone(),
            fields: device
                .values
                .iter()
                .enumerate()
                .map(|(slot, v)| self.schema.format(slot, v))
                .collect(),
            updated_at: clock_time(device.updated_at),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
