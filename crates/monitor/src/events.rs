use serde::Serialize;

use crate::registry::DeviceSnapshot;

/// Everything a presentation layer can observe about the fleet.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    /// A telemetry message was applied to a device.
    DeviceUpdated {
        gateway: String,
        snapshot: DeviceSnapshot,
    },
    /// The update came from fast-cadence telemetry. Always followed by the
    /// matching `DeviceUpdated`.
    FastUpdate {
        gateway: String,
        snapshot: DeviceSnapshot,
    },
    StalenessChanged {
        gateway: String,
        address: String,
        stale: bool,
    },
}

impl FleetEvent {
    pub fn gateway(&self) -> &str {
        match self {
            FleetEvent::DeviceUpdated { gateway, .. }
            | FleetEvent::FastUpdate { gateway, .. }
            | FleetEvent::StalenessChanged { gateway, .. } => gateway,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            FleetEvent::DeviceUpdated { snapshot, .. } | FleetEvent::FastUpdate { snapshot, .. } => {
                &snapshot.address
            }
            FleetEvent::StalenessChanged { address, .. } => address,
        }
    }
}
