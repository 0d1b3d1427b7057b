//! Hierarchical key-value configuration and the property declaration contract.
//!
//! Every component declares the keys it understands as a list of
//! [`PropertyDescriptor`]s. Before a component is opened its scoped
//! [`Properties`] are checked with [`Properties::init`]: required keys must be
//! present, present values must have the declared kind, and defaults are
//! filled in for absent optional keys.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{AthenaError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    String,
    Integer,
    Unsigned,
    Float,
    Bool,
    StringList,
    Duration,
    Object,
}

impl PropertyKind {
    fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            PropertyKind::String => value.is_string(),
            PropertyKind::Integer => value.is_i64(),
            PropertyKind::Unsigned => value.is_u64(),
            PropertyKind::Float => value.is_number(),
            PropertyKind::Bool => value.is_boolean(),
            PropertyKind::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(serde_json::Value::is_string)),
            PropertyKind::Duration => match value {
                serde_json::Value::String(s) => parse_duration(s).is_ok(),
                other => other.is_u64(),
            },
            PropertyKind::Object => value.is_object(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyKind::String => "string",
            PropertyKind::Integer => "integer",
            PropertyKind::Unsigned => "unsigned",
            PropertyKind::Float => "float",
            PropertyKind::Bool => "bool",
            PropertyKind::StringList => "string_list",
            PropertyKind::Duration => "duration",
            PropertyKind::Object => "object",
        }
    }
}

/// Declaration of one configuration key a component recognizes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: PropertyKind,
    /// `None` marks the property as required.
    pub default: Option<serde_json::Value>,
}

impl PropertyDescriptor {
    pub fn required(name: &'static str, description: &'static str, kind: PropertyKind) -> Self {
        Self {
            name,
            description,
            kind,
            default: None,
        }
    }

    pub fn optional(
        name: &'static str,
        description: &'static str,
        kind: PropertyKind,
        default: serde_json::Value,
    ) -> Self {
        Self {
            name,
            description,
            kind,
            default: Some(default),
        }
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Parse `500ms`, `10s`, `1m`, `2h`, `1d`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => return Err(format!("duration '{s}' has no unit")),
    };
    let n: u64 = digits
        .parse()
        .map_err(|e| format!("invalid duration '{s}': {e}"))?;
    let seconds = |per: u64| {
        n.checked_mul(per)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    };
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => seconds(60),
        "h" => seconds(3600),
        "d" => seconds(86400),
        _ => Err(format!("unknown duration unit in '{s}'")),
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

/// A JSON object scoped to one level of the configuration tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    values: serde_json::Map<String, serde_json::Value>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(values) => Ok(Self { values }),
            other => Err(AthenaError::Configuration(format!(
                "expected a mapping, found {other}"
            ))),
        }
    }

    /// Read a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let value: serde_json::Value = serde_json::from_str(&data)?;
        Self::from_value(value)
    }

    /// Child scope under `key`, if it exists and is a mapping.
    pub fn sub(&self, key: &str) -> Option<Properties> {
        self.values.get(key).and_then(|v| match v {
            serde_json::Value::Object(values) => Some(Properties {
                values: values.clone(),
            }),
            _ => None,
        })
    }

    /// Keys of the mapping under `prefix`, sorted.
    pub fn prefix_keys(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .sub(prefix)
            .map(|p| p.values.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
    }

    /// Check `definitions` against this scope, applying defaults.
    ///
    /// Returns a rendered table of the effective values for the startup log.
    pub fn init(&mut self, definitions: &[PropertyDescriptor]) -> Result<String> {
        let mut rendered = String::from("name | type | value\n");
        for def in definitions {
            match self.values.get(def.name) {
                Some(value) => {
                    if !def.kind.accepts(value) {
                        return Err(AthenaError::Configuration(format!(
                            "property '{}' must be {}, found {}",
                            def.name,
                            def.kind.as_str(),
                            value
                        )));
                    }
                }
                None => match &def.default {
                    Some(default) => {
                        self.values.insert(def.name.to_string(), default.clone());
                    }
                    None => {
                        return Err(AthenaError::Configuration(format!(
                            "required property '{}' is not set",
                            def.name
                        )));
                    }
                },
            }
            let value = self
                .values
                .get(def.name)
                .map(|v| v.to_string())
                .unwrap_or_default();
            rendered.push_str(&format!("{} | {} | {}\n", def.name, def.kind.as_str(), value));
        }
        Ok(rendered)
    }

    fn require<'a>(&'a self, def: &'a PropertyDescriptor) -> Result<&'a serde_json::Value> {
        self.values
            .get(def.name)
            .or(def.default.as_ref())
            .ok_or_else(|| {
                AthenaError::Configuration(format!("required property '{}' is not set", def.name))
            })
    }

    fn mismatch(def: &PropertyDescriptor) -> AthenaError {
        AthenaError::Configuration(format!(
            "property '{}' must be {}",
            def.name,
            def.kind.as_str()
        ))
    }

    pub fn string(&self, def: &PropertyDescriptor) -> Result<String> {
        self.require(def)?
            .as_str()
            .map(String::from)
            .ok_or_else(|| Self::mismatch(def))
    }

    pub fn i64(&self, def: &PropertyDescriptor) -> Result<i64> {
        self.require(def)?.as_i64().ok_or_else(|| Self::mismatch(def))
    }

    pub fn u64(&self, def: &PropertyDescriptor) -> Result<u64> {
        self.require(def)?.as_u64().ok_or_else(|| Self::mismatch(def))
    }

    pub fn f64(&self, def: &PropertyDescriptor) -> Result<f64> {
        self.require(def)?.as_f64().ok_or_else(|| Self::mismatch(def))
    }

    pub fn bool(&self, def: &PropertyDescriptor) -> Result<bool> {
        self.require(def)?.as_bool().ok_or_else(|| Self::mismatch(def))
    }

    pub fn string_list(&self, def: &PropertyDescriptor) -> Result<Vec<String>> {
        let items = self.require(def)?.as_array().ok_or_else(|| Self::mismatch(def))?;
        items
            .iter()
            .map(|item| item.as_str().map(String::from).ok_or_else(|| Self::mismatch(def)))
            .collect()
    }

    /// Integer values are milliseconds; strings use [`parse_duration`].
    pub fn duration(&self, def: &PropertyDescriptor) -> Result<Duration> {
        match self.require(def)? {
            serde_json::Value::String(s) => parse_duration(s).map_err(|e| {
                AthenaError::Configuration(format!("property '{}': {e}", def.name))
            }),
            other => other
                .as_u64()
                .map(Duration::from_millis)
                .ok_or_else(|| Self::mismatch(def)),
        }
    }

    pub fn object(&self, def: &PropertyDescriptor) -> Result<Properties> {
        match self.require(def)? {
            serde_json::Value::Object(values) => Ok(Properties {
                values: values.clone(),
            }),
            _ => Err(Self::mismatch(def)),
        }
    }

    /// Iterate the raw key/value pairs of this scope.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.values.iter()
    }
}
