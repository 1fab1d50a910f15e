//! Periodic staleness scan over one gateway's registry.
//!
//! Display state only: a stale device keeps every attribute and stays in the
//! registry. Events are emitted only when a device's flag flips.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::FleetEvent;
use crate::registry::SharedRegistry;

pub struct StalenessMonitor {
    gateway: String,
    registry: SharedRegistry,
    threshold: Duration,
    events: broadcast::Sender<FleetEvent>,
    /// Last flag reported per address. Absent means fresh.
    flags: HashMap<String, bool>,
}

impl StalenessMonitor {
    pub fn new(
        gateway: &str,
        registry: SharedRegistry,
        threshold: Duration,
        events: broadcast::Sender<FleetEvent>,
    ) -> Self {
        Self {
            gateway: gateway.to_string(),
            registry,
            threshold,
            events,
            flags: HashMap::new(),
        }
    }

    pub fn is_stale(&self, address: &str) -> bool {
        self.flags.get(address).copied().unwrap_or(false)
    }

    /// Compare every device against `now` and return the flags that changed
    /// since the previous scan, in display-index order.
    pub async fn scan(&mut self, now: Instant) -> Vec<(String, bool)> {
        let reg = self.registry.read().await;
        let mut changed = Vec::new();

        for device in reg.devices() {
            let stale = device.is_stale(now, self.threshold);
            let previous = self
                .flags
                .insert(device.address().to_string(), stale)
                .unwrap_or(false);
            if previous != stale {
                changed.push((device.address().to_string(), stale));
            }
        }
        changed
    }

    /// Scan once and publish a `StalenessChanged` per flipped flag.
    pub async fn tick(&mut self) {
        for (address, stale) in self.scan(Instant::now()).await {
            info!(gateway = %self.gateway, address = %address, stale, "staleness changed");
            let _ = self.events.send(FleetEvent::StalenessChanged {
                gateway: self.gateway.clone(),
                address,
                stale,
            });
        }
    }

    /// Scan every `interval` until `cancel` fires.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            gateway = %self.gateway,
            threshold_sec = self.threshold.as_secs(),
            "staleness monitor started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        debug!(gateway = %self.gateway, "staleness monitor stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
