//! The closed scalar set carried by events, and the recursive message shape.
//!
//! Typed construction is valid by construction. Untyped input (JSON read by a
//! source or a config file) goes through the `from_json` conversions, which
//! reject anything outside the closed set with an
//! [`AthenaError::Validation`] naming the offending field path.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AthenaError, Result};

/// Event metadata: a flat map of scalars.
pub type Meta = HashMap<String, Value>;

/// A scalar drawn from the closed type set.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Str(String),
    Float(f64),
    Char(char),
    Bytes(Vec<u8>),
    Time(DateTime<Utc>),
    /// Explicit "no value" marker.
    Empty,
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_empty_marker(&self) -> bool {
        matches!(self, Value::Empty)
    }

    /// Lossy JSON rendering used for logging and sinks.
    ///
    /// Characters and timestamps become strings, bytes become an array of
    /// numbers, and the empty marker becomes `null`.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(i) => serde_json::json!(*i),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Float(f) => serde_json::json!(*f),
            Value::Char(c) => serde_json::Value::String(c.to_string()),
            Value::Bytes(b) => serde_json::json!(b),
            Value::Time(t) => {
                serde_json::Value::String(t.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Empty => serde_json::Value::Null,
        }
    }

    /// Convert a JSON scalar, naming `field` in the error when it is not one.
    pub fn from_json(field: &str, value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(Value::Empty),
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::String(s) => Ok(Value::Str(s)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::Float(f))
                } else {
                    Err(AthenaError::Validation {
                        field: field.to_string(),
                        message: format!("number {n} does not fit a 64-bit integer or float"),
                    })
                }
            }
            serde_json::Value::Array(_) => Err(AthenaError::Validation {
                field: field.to_string(),
                message: "arrays are not part of the event type set".into(),
            }),
            serde_json::Value::Object(_) => Err(AthenaError::Validation {
                field: field.to_string(),
                message: "nested mappings are not allowed here".into(),
            }),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<char> for Value {
    fn from(v: char) -> Self {
        Value::Char(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

/// Event payload: a scalar, or a mapping whose values are messages again.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Scalar(Value),
    Map(HashMap<String, Message>),
}

impl Message {
    pub fn empty() -> Self {
        Message::Scalar(Value::Empty)
    }

    pub fn is_empty_marker(&self) -> bool {
        matches!(self, Message::Scalar(Value::Empty))
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Message::Scalar(v) => Some(v),
            Message::Map(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&HashMap<String, Message>> {
        match self {
            Message::Map(m) => Some(m),
            Message::Scalar(_) => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut HashMap<String, Message>> {
        match self {
            Message::Map(m) => Some(m),
            Message::Scalar(_) => None,
        }
    }

    /// Look up a nested value by a dotted path, e.g. `"request.status"`.
    pub fn get_path(&self, path: &str) -> Option<&Message> {
        path.split('.').try_fold(self, |current, segment| match current {
            Message::Map(m) => m.get(segment),
            Message::Scalar(_) => None,
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Message::Scalar(v) => v.to_json(),
            Message::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Recursively convert JSON, reporting the dotted path of the first
    /// value outside the closed set.
    pub fn from_json(field: &str, value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Object(map) => {
                let mut out = HashMap::with_capacity(map.len());
                for (key, value) in map {
                    let path = format!("{field}.{key}");
                    out.insert(key, Message::from_json(&path, value)?);
                }
                Ok(Message::Map(out))
            }
            other => Ok(Message::Scalar(Value::from_json(field, other)?)),
        }
    }
}

impl Default for Message {
    fn default() -> Self {
        Message::empty()
    }
}

impl From<Value> for Message {
    fn from(v: Value) -> Self {
        Message::Scalar(v)
    }
}

macro_rules! scalar_message_from {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Message {
                fn from(v: $t) -> Self {
                    Message::Scalar(Value::from(v))
                }
            }
        )*
    };
}

scalar_message_from!(i64, bool, f64, char, String, &str, Vec<u8>, DateTime<Utc>);

impl From<HashMap<String, Message>> for Message {
    fn from(m: HashMap<String, Message>) -> Self {
        Message::Map(m)
    }
}

/// Shallow validation of a JSON object as event metadata.
pub fn meta_from_json(value: serde_json::Value) -> Result<Meta> {
    match value {
        serde_json::Value::Null => Ok(Meta::new()),
        serde_json::Value::Object(map) => map
            .into_iter()
            .map(|(key, value)| {
                let field = format!("meta.{key}");
                Value::from_json(&field, value).map(|v| (key, v))
            })
            .collect(),
        _ => Err(AthenaError::Validation {
            field: "meta".into(),
            message: "meta must be a mapping".into(),
        }),
    }
}

pub fn meta_to_json(meta: &Meta) -> serde_json::Value {
    serde_json::Value::Object(
        meta.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
    )
}
