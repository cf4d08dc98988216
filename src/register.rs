//! Per-device register map.
//!
//! The cloud serves one schema per product family, holding several register
//! maps. A device only uses the map named by its `id_registers_map`; each
//! register in it describes where its bits live in the device buffer and how to
//! convert them to and from display values.

use crate::api::WireId;
use crate::formula::{EvaluationError, Formula, Number};
use crate::{Error, Result};
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// The `reg_type` marking a register as the gate of its siblings.
pub const REG_TYPE_ENABLE: &str = "ENABLE";
/// Suffix of gate register keys.
pub const ENABLE_SUFFIX: &str = "_enable";

/// One localized label of an enumerated register value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedValue {
    pub value: Number,
    pub description: String,
    pub lang: String,
}

/// A raw value for which a gate register reports "enabled".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnableValue {
    pub value: Number,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_formula() -> String {
    String::from("#")
}

fn default_step() -> Number {
    Number::Int(1)
}

/// A `null` formula becomes an empty one, which fails when it is used.
fn formula_or_empty<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn step_or_default<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Number, D::Error> {
    Ok(Option::<Number>::deserialize(deserializer)?.unwrap_or_else(default_step))
}

/// Decodes each register on its own, skipping the ones that do not match
/// the descriptor schema.
fn lenient_registers<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Vec<RegisterDescriptor>, D::Error> {
    let values = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(values
        .into_iter()
        .filter_map(|value| {
            let key = value
                .get("reg_key")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("<unnamed>")
                .to_string();
            serde_json::from_value::<RegisterDescriptor>(value)
                .map_err(|err| warn!("Skipping register '{key}': {err}"))
                .ok()
        })
        .collect())
}

/// A register as described by the cloud schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    pub reg_key: String,
    pub offset: u32,
    pub mask: i64,
    #[serde(default = "default_formula", deserialize_with = "formula_or_empty")]
    pub formula: String,
    #[serde(default = "default_formula", deserialize_with = "formula_or_empty")]
    pub formula_inverse: String,
    #[serde(default)]
    pub set_min: Option<Number>,
    #[serde(default)]
    pub set_max: Option<Number>,
    #[serde(default, deserialize_with = "crate::api::bool_or_int")]
    pub is_hex: bool,
    #[serde(default)]
    pub enc_val: Option<Vec<EncodedValue>>,
    #[serde(default)]
    pub enable_val: Option<Vec<EnableValue>>,
    #[serde(default)]
    pub reg_type: Option<String>,
    #[serde(default = "default_step", deserialize_with = "step_or_default")]
    pub step: Number,
    #[serde(default)]
    pub format_string: Option<String>,
}

impl RegisterDescriptor {
    pub fn is_enable(&self) -> bool {
        self.reg_type.as_deref() == Some(REG_TYPE_ENABLE)
    }
}

/// A register descriptor with its formulas parsed.
///
/// A formula that fails to parse does not invalidate the whole map, only
/// conversions through it fail.
#[derive(Debug, Clone)]
pub struct Register {
    descriptor: RegisterDescriptor,
    forward: std::result::Result<Formula, EvaluationError>,
    inverse: std::result::Result<Formula, EvaluationError>,
}

impl Register {
    pub fn new(descriptor: RegisterDescriptor) -> Self {
        let forward = Formula::parse(&descriptor.formula);
        let inverse = Formula::parse(&descriptor.formula_inverse);
        if let Err(err) = &forward {
            warn!("Register '{}' has an invalid formula: {err}", descriptor.reg_key);
        }
        if let Err(err) = &inverse {
            warn!(
                "Register '{}' has an invalid inverse formula: {err}",
                descriptor.reg_key
            );
        }
        Self {
            descriptor,
            forward,
            inverse,
        }
    }

    pub fn descriptor(&self) -> &RegisterDescriptor {
        &self.descriptor
    }

    fn evaluation_error(&self, err: &EvaluationError) -> Error {
        Error::Evaluation(format!("register '{}': {err}", self.descriptor.reg_key))
    }

    /// Raw register value to display value.
    pub fn decode(&self, raw: i64) -> Result<Number> {
        self.forward
            .as_ref()
            .map_err(|err| self.evaluation_error(err))?
            .evaluate(Number::Int(raw))
            .map_err(|err| self.evaluation_error(&err))
    }

    /// Display value to raw register value, truncated to an integer.
    pub fn encode(&self, value: Number) -> Result<i64> {
        self.inverse
            .as_ref()
            .map_err(|err| self.evaluation_error(err))?
            .evaluate(value)
            .and_then(Number::trunc)
            .map_err(|err| self.evaluation_error(&err))
    }
}

/// One entry of the `registers_map` array returned by the cloud.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistersMapEntry {
    pub id: WireId,
    #[serde(default, deserialize_with = "lenient_registers")]
    pub registers: Vec<RegisterDescriptor>,
}

/// Registers of one device keyed by lowercased `reg_key`.
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    registers: BTreeMap<String, Register>,
}

impl RegisterMap {
    /// Builds the map from the full schema, keeping only the map `id_registers_map`.
    pub fn from_schema(maps: Vec<RegistersMapEntry>, id_registers_map: &str) -> Self {
        let mut registers = BTreeMap::new();
        let mut found = false;
        for map in maps.into_iter().filter(|map| map.id.matches(id_registers_map)) {
            found = true;
            for descriptor in map.registers {
                let key = descriptor.reg_key.to_lowercase();
                if registers.contains_key(&key) {
                    warn!("Duplicate register '{key}' in map {id_registers_map}, keeping the last");
                }
                registers.insert(key, Register::new(descriptor));
            }
        }
        if !found {
            warn!("Register map {id_registers_map} not present in schema");
        }
        Self { registers }
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = RegisterDescriptor>) -> Self {
        Self {
            registers: descriptors
                .into_iter()
                .map(|d| (d.reg_key.to_lowercase(), Register::new(d)))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Register> {
        self.registers.get(&key.to_lowercase())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.registers.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Register)> {
        self.registers.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Key of the gate register for `key`: its last `_` segment replaced by `_enable`.
    pub fn enable_key(key: &str) -> String {
        let prefix = key.rsplit_once('_').map_or(key, |(prefix, _)| prefix);
        format!("{}{ENABLE_SUFFIX}", prefix.to_lowercase())
    }

    /// Resolves whether `key` is currently enabled.
    ///
    /// `value_of` yields the current display value of a register, or `None`
    /// while it has no reading. Registers without a gate, or whose gate has
    /// no reading yet, are enabled.
    pub fn is_enabled<F>(&self, key: &str, value_of: F) -> Result<bool>
    where
        F: Fn(&str) -> Option<Number>,
    {
        let enable_key = Self::enable_key(key);
        let Some(gate) = self.get(&enable_key) else {
            return Ok(true);
        };
        if !gate.descriptor().is_enable() {
            return Err(Error::Configuration(format!(
                "'{enable_key}' gating '{key}' is not a register of type {REG_TYPE_ENABLE}"
            )));
        }
        let Some(value) = value_of(&enable_key) else {
            return Ok(true);
        };
        Ok(match &gate.descriptor().enable_val {
            Some(enabled) => enabled.iter().any(|e| e.value == value),
            None => value == Number::Int(1),
        })
    }
}
