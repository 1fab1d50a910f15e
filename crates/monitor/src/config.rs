//! TOML config file loading and validation: gateways, engine timings,
//! command delays and the telemetry schema.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::connection::ConnectOptions;
use crate::schema::{builtin_fields, Align, FieldDef, FieldKind, TelemetrySchema, Unit};
use crate::worker::TYPE_KEY;

pub const DEFAULT_NAMESPACE: &str = "Yotta";
pub const DEFAULT_MQTT_PORT: u16 = 1883;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub gateways: Vec<GatewayEntry>,
    #[serde(default)]
    pub monitor: MonitorSection,
    #[serde(default)]
    pub commands: CommandSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_port() -> u16 {
    DEFAULT_MQTT_PORT
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEntry {
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorSection {
    pub stale_timeout_sec: u64,
    pub stale_tick_ms: u64,
    pub event_capacity: usize,
    pub connect_timeout_ms: u64,
    pub keep_alive_sec: u64,
    /// Samples kept per fast-capture series.
    pub chart_capacity: usize,
    /// Gateways observed as soon as the fleet is up.
    pub observe: Vec<String>,
}

impl Default for MonitorSection {
    fn default() -> Self {
        Self {
            stale_timeout_sec: 65,
            stale_tick_ms: 1000,
            event_capacity: 1024,
            connect_timeout_ms: 5000,
            keep_alive_sec: 30,
            chart_capacity: 600,
            observe: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CommandSection {
    pub settle_delay_ms: u64,
    pub find_window_ms: u64,
}

impl Default for CommandSection {
    fn default() -> Self {
        Self {
            settle_delay_ms: 3000,
            find_window_ms: 5000,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TelemetrySection {
    /// Display labels. Presentation only; never used to match payload keys.
    pub header: Option<Vec<String>>,
    /// Payload keys to extract. Defaults to every schema field.
    pub names: Option<Vec<String>>,
    /// Fields appended after the built-in ones.
    #[serde(default)]
    pub fields: Vec<FieldEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldEntry {
    pub name: String,
    /// Present for numeric fields; absent means text.
    pub unit: Option<Unit>,
    pub width: Option<usize>,
    pub align: Option<Align>,
}

impl FieldEntry {
    fn to_def(&self) -> FieldDef {
        match self.unit {
            Some(unit) => FieldDef {
                name: self.name.clone(),
                kind: FieldKind::Number {
                    unit,
                    width: self.width.unwrap_or(unit.default_width()),
                },
            },
            None => FieldDef::text(
                &self.name,
                self.width.unwrap_or(0),
                self.align.unwrap_or_default(),
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_namespace(&mut errors);
        self.validate_gateways(&mut errors);
        self.validate_monitor(&mut errors);
        self.validate_telemetry(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_namespace(&self, errors: &mut Vec<String>) {
        if self.namespace.trim().is_empty() {
            errors.push("namespace is empty".to_string());
        } else if self.namespace.contains(['/', '+', '#']) {
            errors.push(format!(
                "namespace '{}' must not contain '/', '+' or '#'",
                self.namespace
            ));
        }
    }

    fn validate_gateways(&self, errors: &mut Vec<String>) {
        if self.gateways.is_empty() {
            errors.push("no gateways configured".to_string());
            return;
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for (i, g) in self.gateways.iter().enumerate() {
            let ctx = || {
                if g.name.is_empty() {
                    format!("gateways[{i}]")
                } else {
                    format!("gateway '{}'", g.name)
                }
            };

            if g.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen.insert(g.name.as_str()) {
                errors.push(format!("{}: duplicate name", ctx()));
            }
            if g.host.trim().is_empty() {
                errors.push(format!("{}: host is empty", ctx()));
            }
            if g.port == 0 {
                errors.push(format!("{}: port must be non-zero", ctx()));
            }
        }

        for name in &self.monitor.observe {
            if !seen.contains(name.as_str()) {
                errors.push(format!(
                    "monitor.observe: '{name}' does not match any configured gateway"
                ));
            }
        }
    }

    fn validate_monitor(&self, errors: &mut Vec<String>) {
        let m = &self.monitor;
        let positive = [
            ("monitor.stale_timeout_sec", m.stale_timeout_sec),
            ("monitor.stale_tick_ms", m.stale_tick_ms),
            ("monitor.event_capacity", m.event_capacity as u64),
            ("monitor.connect_timeout_ms", m.connect_timeout_ms),
            ("monitor.keep_alive_sec", m.keep_alive_sec),
            ("monitor.chart_capacity", m.chart_capacity as u64),
            ("commands.find_window_ms", self.commands.find_window_ms),
        ];
        for (key, value) in positive {
            if value == 0 {
                errors.push(format!("{key} must be positive"));
            }
        }
    }

    fn validate_telemetry(&self, errors: &mut Vec<String>) {
        let mut known: HashSet<String> = builtin_fields().into_iter().map(|f| f.name).collect();

        for (i, f) in self.telemetry.fields.iter().enumerate() {
            let name = f.name.trim();
            if name.is_empty() {
                errors.push(format!("telemetry.fields[{i}]: name is empty"));
                continue;
            }
            if name != f.name {
                errors.push(format!(
                    "telemetry.fields[{i}]: name {:?} has surrounding whitespace",
                    f.name
                ));
                continue;
            }
            if name == TYPE_KEY {
                errors.push(format!(
                    "telemetry field '{TYPE_KEY}' is reserved for the telemetry cadence"
                ));
                continue;
            }
            if !known.insert(name.to_string()) {
                errors.push(format!("telemetry field '{name}': duplicate name"));
            }
            if f.unit.is_some() && f.width == Some(0) {
                errors.push(format!("telemetry field '{name}': numeric width must be positive"));
            }
        }

        if let Some(names) = &self.telemetry.names {
            let mut seen: HashSet<&str> = HashSet::new();
            for name in names {
                if !known.contains(name) {
                    errors.push(format!(
                        "telemetry.names: '{name}' is not a telemetry field"
                    ));
                } else if !seen.insert(name.as_str()) {
                    errors.push(format!("telemetry.names: duplicate '{name}'"));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Derived settings
// ---------------------------------------------------------------------------

impl Config {
    /// Built-in fields plus configured extras, with the recognized names
    /// resolved to slots.
    pub fn schema(&self) -> Result<TelemetrySchema> {
        let mut fields = builtin_fields();
        fields.extend(self.telemetry.fields.iter().map(FieldEntry::to_def));

        let recognized = match &self.telemetry.names {
            Some(names) => names.clone(),
            None => fields.iter().map(|f| f.name.clone()).collect(),
        };
        TelemetrySchema::new(fields, &recognized).context("invalid telemetry schema")
    }

    pub fn header(&self, schema: &TelemetrySchema) -> Vec<String> {
        self.telemetry
            .header
            .clone()
            .unwrap_or_else(|| schema.default_header())
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            namespace: self.namespace.clone(),
            keep_alive: Duration::from_secs(self.monitor.keep_alive_sec),
            connect_timeout: Duration::from_millis(self.monitor.connect_timeout_ms),
        }
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.stale_timeout_sec)
    }

    pub fn stale_tick(&self) -> Duration {
        Duration::from_millis(self.monitor.stale_tick_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.commands.settle_delay_ms)
    }

    pub fn find_window(&self) -> Duration {
        Duration::from_millis(self.commands.find_window_ms)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn gateway(name: &str) -> GatewayEntry {
        GatewayEntry {
            name: name.into(),
            host: "10.0.0.21".into(),
            port: 1883,
        }
    }

    fn valid_config() -> Config {
        Config {
            namespace: DEFAULT_NAMESPACE.into(),
            gateways: vec![gateway("gw1")],
            monitor: MonitorSection::default(),
            commands: CommandSection::default(),
            telemetry: TelemetrySection::default(),
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
namespace = "Yotta"

[[gateways]]
name = "gw1"
host = "10.0.0.21"

[[gateways]]
name = "gw2"
host = "10.0.0.22"
port = 1884

[monitor]
stale_timeout_sec = 90
observe = ["gw2"]

[commands]
settle_delay_ms = 1500

[telemetry]
names = ["BMS_SOC", "VPV", "T_AMB"]

[[telemetry.fields]]
name = "T_AMB"
unit = "C"

[[telemetry.fields]]
name = "SITE"
width = 8
align = "right"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.gateways.len(), 2);
        assert_eq!(config.gateways[0].port, DEFAULT_MQTT_PORT);
        assert_eq!(config.gateways[1].port, 1884);
        assert_eq!(config.stale_timeout(), Duration::from_secs(90));
        assert_eq!(config.stale_tick(), Duration::from_secs(1));
        assert_eq!(config.settle_delay(), Duration::from_millis(1500));
        assert_eq!(config.find_window(), Duration::from_secs(5));
        assert_eq!(config.monitor.observe, vec!["gw2"]);
        assert_eq!(config.telemetry.fields[1].align, Some(Align::Right));
    }

    #[test]
    fn parse_defaults() {
        let config: Config = toml::from_str(
            r#"
[[gateways]]
name = "gw1"
host = "localhost"
"#,
        )
        .unwrap();
        assert_eq!(config.namespace, "Yotta");
        assert_eq!(config.monitor.stale_timeout_sec, 65);
        assert_eq!(config.monitor.event_capacity, 1024);
        assert_eq!(config.commands.settle_delay_ms, 3000);
        assert!(config.telemetry.names.is_none());
    }

    #[test]
    fn unknown_unit_fails_to_parse() {
        let res: Result<Config, _> = toml::from_str(
            r#"
[[telemetry.fields]]
name = "X"
unit = "Hz"
"#,
        );
        assert!(res.is_err());
    }

    // -- Validation: valid configs pass -----------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn multiple_gateways_pass() {
        let mut cfg = valid_config();
        cfg.gateways.push(gateway("gw2"));
        cfg.gateways.push(gateway("gw3"));
        cfg.monitor.observe = vec!["gw1".into(), "gw3".into()];
        cfg.validate().unwrap();
    }

    // -- Validation: gateways ---------------------------------------------

    #[test]
    fn no_gateways_rejected() {
        let mut cfg = valid_config();
        cfg.gateways.clear();
        assert_validation_err(&cfg, "no gateways configured");
    }

    #[test]
    fn gateway_empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.gateways[0].name = "".into();
        assert_validation_err(&cfg, "gateways[0]: name is empty");
    }

    #[test]
    fn gateway_duplicate_name_rejected() {
        let mut cfg = valid_config();
        cfg.gateways.push(gateway("gw1"));
        assert_validation_err(&cfg, "duplicate name");
    }

    #[test]
    fn gateway_empty_host_rejected() {
        let mut cfg = valid_config();
        cfg.gateways[0].host = " ".into();
        assert_validation_err(&cfg, "host is empty");
    }

    #[test]
    fn gateway_port_zero_rejected() {
        let mut cfg = valid_config();
        cfg.gateways[0].port = 0;
        assert_validation_err(&cfg, "port must be non-zero");
    }

    #[test]
    fn observe_unknown_gateway_rejected() {
        let mut cfg = valid_config();
        cfg.monitor.observe = vec!["gw9".into()];
        assert_validation_err(&cfg, "'gw9' does not match any configured gateway");
    }

    // -- Validation: namespace and timings --------------------------------

    #[test]
    fn namespace_wildcard_rejected() {
        let mut cfg = valid_config();
        cfg.namespace = "Yotta/#".into();
        assert_validation_err(&cfg, "must not contain");
    }

    #[test]
    fn namespace_empty_rejected() {
        let mut cfg = valid_config();
        cfg.namespace = "".into();
        assert_validation_err(&cfg, "namespace is empty");
    }

    #[test]
    fn stale_timeout_zero_rejected() {
        let mut cfg = valid_config();
        cfg.monitor.stale_timeout_sec = 0;
        assert_validation_err(&cfg, "monitor.stale_timeout_sec must be positive");
    }

    #[test]
    fn event_capacity_zero_rejected() {
        let mut cfg = valid_config();
        cfg.monitor.event_capacity = 0;
        assert_validation_err(&cfg, "monitor.event_capacity must be positive");
    }

    #[test]
    fn zero_settle_delay_allowed() {
        let mut cfg = valid_config();
        cfg.commands.settle_delay_ms = 0;
        cfg.validate().unwrap();
    }

    // -- Validation: telemetry --------------------------------------------

    #[test]
    fn unknown_recognized_name_rejected() {
        let mut cfg = valid_config();
        cfg.telemetry.names = Some(vec!["BMS_SOC".into(), "BMS_S0C".into()]);
        assert_validation_err(&cfg, "'BMS_S0C' is not a telemetry field");
    }

    #[test]
    fn duplicate_recognized_name_rejected() {
        let mut cfg = valid_config();
        cfg.telemetry.names = Some(vec!["VPV".into(), "VPV".into()]);
        assert_validation_err(&cfg, "duplicate 'VPV'");
    }

    #[test]
    fn extra_field_shadowing_builtin_rejected() {
        let mut cfg = valid_config();
        cfg.telemetry.fields.push(FieldEntry {
            name: "VBAT".into(),
            unit: Some(Unit::Volt),
            width: None,
            align: None,
        });
        assert_validation_err(&cfg, "telemetry field 'VBAT': duplicate name");
    }

    #[test]
    fn type_field_rejected() {
        let mut cfg = valid_config();
        cfg.telemetry.fields.push(FieldEntry {
            name: "type".into(),
            unit: None,
            width: None,
            align: None,
        });
        assert_validation_err(&cfg, "reserved");
    }

    #[test]
    fn padded_field_name_rejected() {
        let mut cfg = valid_config();
        cfg.telemetry.fields.push(FieldEntry {
            name: " T_AMB".into(),
            unit: Some(Unit::Celsius),
            width: None,
            align: None,
        });
        cfg.telemetry.names = Some(vec!["T_AMB".into()]);
        assert_validation_err(&cfg, "has surrounding whitespace");
    }

    #[test]
    fn zero_width_numeric_rejected() {
        let mut cfg = valid_config();
        cfg.telemetry.fields.push(FieldEntry {
            name: "T_AMB".into(),
            unit: Some(Unit::Celsius),
            width: Some(0),
            align: None,
        });
        assert_validation_err(&cfg, "numeric width must be positive");
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.namespace = "".into();
        cfg.gateways[0].host = "".into();
        cfg.monitor.stale_tick_ms = 0;
        cfg.telemetry.names = Some(vec!["NOPE".into()]);

        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        for needle in [
            "namespace is empty",
            "host is empty",
            "stale_tick_ms",
            "'NOPE'",
        ] {
            assert!(msg.contains(needle), "missing {needle:?} in: {msg}");
        }
        assert!(msg.contains("(4 errors)"), "{msg}");
    }

    // -- Derived settings -------------------------------------------------

    #[test]
    fn schema_appends_extra_fields_and_limits_names() {
        let mut cfg = valid_config();
        cfg.telemetry.fields.push(FieldEntry {
            name: "T_AMB".into(),
            unit: Some(Unit::Celsius),
            width: None,
            align: None,
        });
        cfg.telemetry.names = Some(vec!["VPV".into(), "T_AMB".into()]);

        let schema = cfg.schema().unwrap();
        assert_eq!(schema.len(), builtin_fields().len() + 1);
        assert_eq!(schema.position("T_AMB"), Some(builtin_fields().len()));
        assert!(schema.slot("T_AMB").is_some());
        assert!(schema.slot("VPV").is_some());
        assert!(schema.slot("VBAT").is_none());
    }

    #[test]
    fn schema_recognizes_everything_by_default() {
        let schema = valid_config().schema().unwrap();
        assert!(schema.fields().iter().all(|f| schema.slot(&f.name).is_some()));
    }

    #[test]
    fn header_defaults_to_schema_labels() {
        let cfg = valid_config();
        let schema = cfg.schema().unwrap();
        let header = cfg.header(&schema);
        assert_eq!(header.len(), schema.len() + 4);
        assert_eq!(header[0], "#");

        let mut cfg = valid_config();
        cfg.telemetry.header = Some(vec!["#".into(), "Gateway".into(), "MAC".into()]);
        assert_eq!(cfg.header(&schema)[2], "MAC");
    }

    #[test]
    fn every_valid_config_builds_a_schema() {
        let with_extra = |name: &str, names: Option<Vec<&str>>| {
            let mut cfg = valid_config();
            cfg.telemetry.fields.push(FieldEntry {
                name: name.into(),
                unit: Some(Unit::Celsius),
                width: None,
                align: None,
            });
            cfg.telemetry.names = names.map(|n| n.into_iter().map(String::from).collect());
            cfg
        };
        let candidates = [
            valid_config(),
            with_extra("T_AMB", None),
            with_extra("T_AMB", Some(vec!["T_AMB", "VPV"])),
            with_extra(" T_AMB", Some(vec!["T_AMB"])),
            with_extra("T_AMB ", None),
            with_extra("VPV", None),
            with_extra("type", None),
        ];

        for cfg in &candidates {
            if cfg.validate().is_ok() {
                if let Err(e) = cfg.schema() {
                    panic!("{:?} validated but schema failed: {e:#}", cfg.telemetry.fields);
                }
            }
        }
    }

    #[test]
    fn load_missing_file_fails() {
        let err = load("/nonexistent/leafwatch.toml").unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }

    #[test]
    fn load_reads_and_validates_file() {
        let path = std::env::temp_dir().join(format!("leafwatch-{}.toml", std::process::id()));
        std::fs::write(&path, "[[gateways]]\nname = \"gw1\"\nhost = \"localhost\"\n").unwrap();
        let config = load(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.gateways[0].name, "gw1");
    }
}
