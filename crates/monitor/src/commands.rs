//! Operator commands translated into publishes on a gateway connection.
//!
//! Every input is validated before the first publish, so a rejected command
//! never leaves a half-sent sequence behind. Two-step commands sleep for the
//! settle delay in the caller's task; ingestion is unaffected.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionError, GatewayConnection, RawMessage};
use crate::topic::{
    broadcast_command_topic, classify, device_command_topic, TopicClass, ADDRESS_LEN,
    COMMAND_SUBCHANNEL,
};

/// Suffix every firmware image name must carry.
const IMAGE_SUFFIX: &str = ".bin";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("invalid device address '{0}': expected 12 alphanumeric characters")]
    InvalidAddress(String),
    #[error("SSID must not be empty")]
    EmptySsid,
    #[error("invalid firmware image '{0}': expected a .bin file name")]
    InvalidImage(String),
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
    #[error("value '{0}' is not an integer")]
    InvalidValue(String),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

// ---------------------------------------------------------------------------
// Command vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Query {
    Version,
    FwCrc,
    SlStatus,
}

impl Query {
    pub fn payload(self) -> &'static str {
        match self {
            Query::Version => "version",
            Query::FwCrc => "get FW_CRC",
            Query::SlStatus => "get sl_status",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareComponent {
    /// Power converter MCU: load, settle, apply.
    S32k,
    /// Radio MCU: single over-the-air command.
    Esp32,
    /// Battery management: load, settle, apply.
    Bms,
}

impl FirmwareComponent {
    fn load_verb(self) -> &'static str {
        match self {
            FirmwareComponent::S32k => "pcimage",
            FirmwareComponent::Esp32 => "ota",
            FirmwareComponent::Bms => "bmsimage",
        }
    }

    fn apply_command(self) -> Option<&'static str> {
        match self {
            FirmwareComponent::S32k => Some("pcupdate"),
            FirmwareComponent::Esp32 => None,
            FirmwareComponent::Bms => Some("bmsupdate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameter {
    PortOn,
    PortOff,
    OutputPowerMin,
    OutputPowerMax,
}

impl Parameter {
    pub fn name(self) -> &'static str {
        match self {
            Parameter::PortOn => "port_on",
            Parameter::PortOff => "port_off",
            Parameter::OutputPowerMin => "P_OUT_MIN",
            Parameter::OutputPowerMax => "P_OUT_MAX",
        }
    }
}

impl FromStr for Parameter {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "port_on" => Ok(Parameter::PortOn),
            "port_off" => Ok(Parameter::PortOff),
            "P_OUT_MIN" => Ok(Parameter::OutputPowerMin),
            "P_OUT_MAX" => Ok(Parameter::OutputPowerMax),
            other => Err(CommandError::UnknownParameter(other.to_string())),
        }
    }
}

/// Operator intent as received from the HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum OperatorCommand {
    Identify,
    Query {
        query: Query,
    },
    Fast {
        address: String,
        enabled: bool,
    },
    Ssid {
        address: String,
        ssid: String,
    },
    Firmware {
        address: String,
        component: FirmwareComponent,
        image: String,
    },
    Parameter {
        address: String,
        name: String,
        value: String,
    },
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Exactly [`ADDRESS_LEN`] ASCII alphanumerics, returned lowercase.
pub fn validate_address(address: &str) -> Result<String, CommandError> {
    let trimmed = address.trim();
    if trimmed.len() != ADDRESS_LEN || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(CommandError::InvalidAddress(address.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}

fn validate_image(image: &str) -> Result<&str, CommandError> {
    let image = image.trim();
    let valid = image.len() > IMAGE_SUFFIX.len()
        && image.ends_with(IMAGE_SUFFIX)
        && !image.chars().any(char::is_whitespace);
    if valid {
        Ok(image)
    } else {
        Err(CommandError::InvalidImage(image.to_string()))
    }
}

fn validate_integer(value: &str) -> Result<i64, CommandError> {
    value
        .trim()
        .parse()
        .map_err(|_| CommandError::InvalidValue(value.to_string()))
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    namespace: String,
    settle_delay: Duration,
    find_window: Duration,
}

impl CommandDispatcher {
    pub fn new(namespace: &str, settle_delay: Duration, find_window: Duration) -> Self {
        Self {
            namespace: namespace.to_string(),
            settle_delay,
            find_window,
        }
    }

    fn broadcast(&self, conn: &GatewayConnection, payload: &str) -> Result<(), CommandError> {
        conn.publish(&broadcast_command_topic(&self.namespace), payload)?;
        Ok(())
    }

    fn to_device(
        &self,
        conn: &GatewayConnection,
        address: &str,
        payload: &str,
    ) -> Result<(), CommandError> {
        conn.publish(&device_command_topic(&self.namespace, address), payload)?;
        Ok(())
    }

    /// Ask every leaf on the gateway to announce itself.
    pub fn identify_all(&self, conn: &GatewayConnection) -> Result<(), CommandError> {
        info!(gateway = conn.name(), "identify all");
        self.broadcast(conn, "getid")
    }

    pub fn query(&self, conn: &GatewayConnection, query: Query) -> Result<(), CommandError> {
        info!(gateway = conn.name(), query = query.payload(), "query");
        self.broadcast(conn, query.payload())
    }

    pub fn enable_fast(&self, conn: &GatewayConnection, address: &str) -> Result<(), CommandError> {
        self.set_fast(conn, address, true)
    }

    pub fn disable_fast(&self, conn: &GatewayConnection, address: &str) -> Result<(), CommandError> {
        self.set_fast(conn, address, false)
    }

    pub fn set_fast(
        &self,
        conn: &GatewayConnection,
        address: &str,
        enabled: bool,
    ) -> Result<(), CommandError> {
        let address = validate_address(address)?;
        info!(gateway = conn.name(), address = %address, enabled, "fast telemetry");
        let payload = if enabled {
            "set fast_period 1"
        } else {
            "set fast_period 0"
        };
        self.to_device(conn, &address, payload)
    }

    /// `inv ssid <ssid>`, settle, `inv commit`.
    pub async fn change_ssid(
        &self,
        conn: &GatewayConnection,
        address: &str,
        ssid: &str,
    ) -> Result<(), CommandError> {
        let address = validate_address(address)?;
        let ssid = ssid.trim();
        if ssid.is_empty() {
            return Err(CommandError::EmptySsid);
        }

        info!(gateway = conn.name(), address = %address, ssid, "changing ssid");
        self.to_device(conn, &address, &format!("inv ssid {ssid}"))?;
        sleep(self.settle_delay).await;
        self.to_device(conn, &address, "inv commit")
    }

    pub async fn update_firmware(
        &self,
        conn: &GatewayConnection,
        address: &str,
        component: FirmwareComponent,
        image: &str,
    ) -> Result<(), CommandError> {
        let address = validate_address(address)?;
        let image = validate_image(image)?;

        info!(gateway = conn.name(), address = %address, ?component, image, "firmware update");
        self.to_device(conn, &address, &format!("{} {image}", component.load_verb()))?;
        if let Some(apply) = component.apply_command() {
            sleep(self.settle_delay).await;
            self.to_device(conn, &address, apply)?;
        }
        Ok(())
    }

    /// Publish `<name> <value>`; `value` must be an integer.
    pub fn set_parameter(
        &self,
        conn: &GatewayConnection,
        address: &str,
        name: &str,
        value: &str,
    ) -> Result<(), CommandError> {
        let address = validate_address(address)?;
        let parameter: Parameter = name.parse()?;
        let value = validate_integer(value)?;

        info!(gateway = conn.name(), address = %address, parameter = parameter.name(), value, "set parameter");
        self.to_device(conn, &address, &format!("{} {value}", parameter.name()))
    }

    pub async fn execute(
        &self,
        conn: &GatewayConnection,
        command: &OperatorCommand,
    ) -> Result<(), CommandError> {
        match command {
            OperatorCommand::Identify => self.identify_all(conn),
            OperatorCommand::Query { query } => self.query(conn, *query),
            OperatorCommand::Fast { address, enabled } => self.set_fast(conn, address, *enabled),
            OperatorCommand::Ssid { address, ssid } => self.change_ssid(conn, address, ssid).await,
            OperatorCommand::Firmware {
                address,
                component,
                image,
            } => self.update_firmware(conn, address, *component, image).await,
            OperatorCommand::Parameter {
                address,
                name,
                value,
            } => self.set_parameter(conn, address, name, value),
        }
    }

    // -----------------------------------------------------------------------
    // Find unit
    // -----------------------------------------------------------------------

    /// Locate the gateway a leaf reports through.
    ///
    /// Gateways are tried in order: broadcast `getid`, then watch that
    /// gateway's traffic for up to the find window. The first device-topic
    /// message from `address` (any subchannel except our own `cmd`) ends the
    /// search; later gateways are not asked. Traffic is read from the
    /// connection's tap, so an ingestion worker on the same gateway keeps
    /// every message.
    pub async fn find_unit(
        &self,
        gateways: &[Arc<GatewayConnection>],
        address: &str,
    ) -> Result<Option<String>, CommandError> {
        let target = validate_address(address)?;
        info!(address = %target, gateways = gateways.len(), "looking for unit");

        for conn in gateways {
            let mut tap = conn.tap();
            if let Err(e) = self.broadcast(conn, "getid") {
                warn!(gateway = conn.name(), "skipping gateway: {e}");
                continue;
            }

            let deadline = Instant::now() + self.find_window;
            if self.watch_for(conn.name(), &mut tap, &target, deadline).await {
                info!(address = %target, gateway = conn.name(), "unit found");
                return Ok(Some(conn.name().to_string()));
            }
            debug!(address = %target, gateway = conn.name(), "unit not on gateway");
        }

        info!(address = %target, "unit not found on any gateway");
        Ok(None)
    }

    async fn watch_for(
        &self,
        gateway: &str,
        tap: &mut Receiver<RawMessage>,
        target: &str,
        deadline: Instant,
    ) -> bool {
        loop {
            let received = tokio::select! {
                biased;
                r = tap.recv() => r,
                _ = sleep_until(deadline) => break,
            };
            match received {
                Ok(msg) if self.is_reply_from(&msg, target) => return true,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(gateway, skipped = n, "find-unit fell behind"),
                Err(RecvError::Closed) => return false,
            }
        }

        // Window closed; whatever already arrived still counts.
        loop {
            match tap.try_recv() {
                Ok(msg) if self.is_reply_from(&msg, target) => return true,
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(_) => return false,
            }
        }
    }

    fn is_reply_from(&self, msg: &RawMessage, target: &str) -> bool {
        match classify(&self.namespace, &msg.topic) {
            TopicClass::Device {
                address,
                subchannel,
            } => subchannel != COMMAND_SUBCHANNEL && address.eq_ignore_ascii_case(target),
            TopicClass::NotDevice => false,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
