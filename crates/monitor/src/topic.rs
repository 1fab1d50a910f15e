//! Topic classification and command-topic construction.
//!
//! Device topics look like `<namespace>/<address>/<subchannel>`, where the
//! address is exactly [`ADDRESS_LEN`] characters. Only the `json`
//! subchannel carries decodable telemetry.

/// Length of a leaf hardware address, in characters.
pub const ADDRESS_LEN: usize = 12;

/// Subchannel whose payload is a flat JSON telemetry object.
pub const TELEMETRY_SUBCHANNEL: &str = "json";

/// Subchannel leaves listen on for per-device commands.
pub const COMMAND_SUBCHANNEL: &str = "cmd";

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicClass<'a> {
    /// Anything outside the device topic shape. Not an error.
    NotDevice,
    Device {
        address: &'a str,
        subchannel: &'a str,
    },
}

impl TopicClass<'_> {
    pub fn is_telemetry(&self) -> bool {
        matches!(self, TopicClass::Device { subchannel, .. } if *subchannel == TELEMETRY_SUBCHANNEL)
    }
}

/// Classify `topic` under `namespace`.
///
/// The address is matched positionally: any 12 characters other than `/`
/// are accepted, hex or not. The subchannel is everything after the
/// address and may itself contain `/`.
pub fn classify<'a>(namespace: &str, topic: &'a str) -> TopicClass<'a> {
    let Some(rest) = topic
        .strip_prefix(namespace)
        .and_then(|r| r.strip_prefix('/'))
    else {
        return TopicClass::NotDevice;
    };

    let Some((address, subchannel)) = rest.split_once('/') else {
        return TopicClass::NotDevice;
    };

    if address.chars().count() != ADDRESS_LEN || subchannel.is_empty() {
        return TopicClass::NotDevice;
    }

    TopicClass::Device {
        address,
        subchannel,
    }
}

// ---------------------------------------------------------------------------
// Topic builders
// ---------------------------------------------------------------------------

/// Wildcard filter covering every topic under the namespace.
pub fn subscription_filter(namespace: &str) -> String {
    format!("{namespace}/#")
}

/// Topic every leaf on a gateway listens to.
pub fn broadcast_command_topic(namespace: &str) -> String {
    format!("{namespace}/{COMMAND_SUBCHANNEL}")
}

/// Topic a single leaf listens to.
pub fn device_command_topic(namespace: &str, address: &str) -> String {
    format!("{namespace}/{address}/{COMMAND_SUBCHANNEL}")
}

// ===========================================================================
// Tests
// ===========================================================================
