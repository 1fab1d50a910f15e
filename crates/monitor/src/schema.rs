//! Telemetry field schema: which payload keys a leaf reports, how each one
//! is stored, and how it is rendered for display.
//!
//! The schema is built once at startup. Payload keys are resolved to a slot
//! through [`TelemetrySchema::slot`], and each slot carries a typed setter
//! ([`TelemetrySchema::convert`]) so a value can never land in a field of
//! the wrong kind.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Characters stripped from a rendered number before re-parsing it.
const UNIT_SUFFIXES: &[char] = &['%', 'V', 'A', 'W', 'C'];

// ---------------------------------------------------------------------------
// Field definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "%")]
    Percent,
    #[serde(rename = "V")]
    Volt,
    #[serde(rename = "A")]
    Amp,
    #[serde(rename = "W")]
    Watt,
    #[serde(rename = "C")]
    Celsius,
}

impl Unit {
    pub fn suffix(self) -> char {
        match self {
            Unit::Percent => '%',
            Unit::Volt => 'V',
            Unit::Amp => 'A',
            Unit::Watt => 'W',
            Unit::Celsius => 'C',
        }
    }

    /// Default column width for the unit. Signed quantities get one more.
    pub fn default_width(self) -> usize {
        match self {
            Unit::Amp | Unit::Watt => 6,
            _ => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Align {
    #[default]
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Number { unit: Unit, width: usize },
    Text { width: usize, align: Align },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldDef {
    pub fn number(name: &str, unit: Unit) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Number {
                unit,
                width: unit.default_width(),
            },
        }
    }

    pub fn text(name: &str, width: usize, align: Align) -> Self {
        Self {
            name: name.to_string(),
            kind: FieldKind::Text { width, align },
        }
    }
}

/// Fields every leaf firmware reports, in display order.
pub fn builtin_fields() -> Vec<FieldDef> {
    use Unit::*;
    vec![
        FieldDef::number("BMS_SOC", Percent),
        FieldDef::number("BMS_Min_Cell_V", Volt),
        FieldDef::number("BMS_Max_Cell_V", Volt),
        FieldDef::number("VPV", Volt),
        FieldDef::number("IPV", Amp),
        FieldDef::number("P_PV", Watt),
        FieldDef::number("VBAT", Volt),
        FieldDef::number("IBAT", Amp),
        FieldDef::number("P_BAT", Watt),
        FieldDef::number("VOUT", Volt),
        FieldDef::number("IOUT", Amp),
        FieldDef::number("P_OUT", Watt),
        FieldDef::number("VCOM", Volt),
        FieldDef::number("VOUT_X", Volt),
        FieldDef::number("FET_T", Celsius),
        FieldDef::number("TEMP_PCB", Celsius),
        FieldDef::text("sl_status", 2, Align::Right),
        FieldDef::text("FW_CRC", 0, Align::Left),
        FieldDef::text("VERSION", 0, Align::Left),
    ]
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttributeError {
    #[error("field '{field}' expects a number, got {got}")]
    ExpectedNumber { field: String, got: String },
    #[error("field '{field}' expects a scalar, got {got}")]
    ExpectedScalar { field: String, got: String },
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Parse a rendered numeric cell (`" 87.3%"`, `"  -2.5A"`) back to a number.
pub fn parse_display_number(text: &str) -> Option<f64> {
    text.trim()
        .trim_end_matches(UNIT_SUFFIXES)
        .trim()
        .parse()
        .ok()
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

fn index_fields(fields: &[FieldDef]) -> Result<HashMap<String, usize>> {
    let mut positions = HashMap::with_capacity(fields.len());
    for (i, f) in fields.iter().enumerate() {
        if positions.insert(f.name.clone(), i).is_some() {
            bail!("duplicate telemetry field '{}'", f.name);
        }
    }
    Ok(positions)
}

#[derive(Debug, Clone)]
pub struct TelemetrySchema {
    fields: Vec<FieldDef>,
    positions: HashMap<String, usize>,
    recognized: Vec<bool>,
}

impl TelemetrySchema {
    /// Build the schema from its field list and the names that should be
    /// extracted from payloads. Every recognized name must be a field.
    pub fn new(fields: Vec<FieldDef>, recognized: &[String]) -> Result<Self> {
        let positions = index_fields(&fields)?;

        let mut flags = vec![false; fields.len()];
        for name in recognized {
            match positions.get(name) {
                Some(&i) => flags[i] = true,
                None => bail!("recognized name '{name}' is not a telemetry field"),
            }
        }

        Ok(Self {
            fields,
            positions,
            recognized: flags,
        })
    }

    /// Schema of the built-in fields with every one of them recognized.
    pub fn builtin() -> Self {
        let fields = builtin_fields();
        let positions = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self {
            recognized: vec![true; fields.len()],
            fields,
            positions,
        }
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Position of any field, recognized or not.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    /// Slot a payload key writes to, or `None` if the key is not recognized.
    pub fn slot(&self, name: &str) -> Option<usize> {
        self.position(name).filter(|&i| self.recognized[i])
    }

    pub fn defaults(&self) -> Vec<FieldValue> {
        self.fields
            .iter()
            .map(|f| match f.kind {
                FieldKind::Number { .. } => FieldValue::Number(0.0),
                FieldKind::Text { .. } => FieldValue::Text(String::new()),
            })
            .collect()
    }

    /// Typed setter for `slot`: convert a JSON value into the slot's kind.
    pub fn convert(&self, slot: usize, value: &Value) -> Result<FieldValue, AttributeError> {
        let field = &self.fields[slot];
        match field.kind {
            FieldKind::Number { .. } => {
                let parsed = match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                };
                parsed
                    .map(FieldValue::Number)
                    .ok_or_else(|| AttributeError::ExpectedNumber {
                        field: field.name.clone(),
                        got: json_kind(value).to_string(),
                    })
            }
            FieldKind::Text { .. } => match value {
                Value::String(s) => Ok(FieldValue::Text(s.clone())),
                Value::Number(n) => Ok(FieldValue::Text(n.to_string())),
                Value::Bool(b) => Ok(FieldValue::Text(b.to_string())),
                _ => Err(AttributeError::ExpectedScalar {
                    field: field.name.clone(),
                    got: json_kind(value).to_string(),
                }),
            },
        }
    }

    /// Render `value` for display in `slot`'s column.
    pub fn format(&self, slot: usize, value: &FieldValue) -> String {
        match (&self.fields[slot].kind, value) {
            (&FieldKind::Number { unit, width }, FieldValue::Number(v)) => {
                format!("{v:>width$.1}{}", unit.suffix())
            }
            (&FieldKind::Text { width, align }, FieldValue::Text(s)) => match align {
                Align::Left => format!("{s:<width$}"),
                Align::Right => format!("{s:>width$}"),
            },
            (_, FieldValue::Number(v)) => format!("{v:.1}"),
            (_, FieldValue::Text(s)) => s.clone(),
        }
    }

    /// Column labels derived from the schema: index, gateway, address, one
    /// per field, then the update time.
    pub fn default_header(&self) -> Vec<String> {
        let mut header = vec!["#".to_string(), "Gateway".to_string(), "Address".to_string()];
        header.extend(self.fields.iter().map(|f| f.name.clone()));
        header.push("Updated".to_string());
        header
    }
}

// ===========================================================================
// Tests
// ===========================================================================
