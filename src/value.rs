// Decoded field values.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value as JsonValue;

/// Primitive shape of a decoded value; modifiers are registered per shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ValueKind {
    ByteArray,
    Integer,
    Decimal,
    Text,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::ByteArray => "byte array",
            ValueKind::Integer => "integer",
            ValueKind::Decimal => "decimal",
            ValueKind::Text => "string",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single decoded value after the optional modifier step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Decimal(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Integer(_) => ValueKind::Integer,
            Value::Decimal(_) => ValueKind::Decimal,
            Value::Text(_) => ValueKind::Text,
            Value::Bytes(_) => ValueKind::ByteArray,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Decimal(x) => Some(*x),
            Value::Integer(x) => Some(*x as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// JSON form used when no interpretation is available.
    /// Byte arrays are rendered as `0x`-prefixed hex, like the packet dumps.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Integer(x) => JsonValue::from(*x),
            Value::Decimal(x) => serde_json::Number::from_f64(*x)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::Bytes(b) => JsonValue::String(format!("0x{}", hex::encode(b))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(x) => write!(f, "{}", x),
            Value::Decimal(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

/// One decoded occurrence of a field.
///
/// `raw` always holds the wire bytes (a slice of the packet buffer), `value` the
/// post-modifier value, and `interpretation` is only present when it was asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldValue {
    raw: Bytes,
    value: Value,
    interpretation: Option<JsonValue>,
}

impl FieldValue {
    pub(crate) fn new(raw: Bytes, value: Value, interpretation: Option<JsonValue>) -> Self {
        Self {
            raw,
            value,
            interpretation,
        }
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn interpretation(&self) -> Option<&JsonValue> {
        self.interpretation.as_ref()
    }

    /// Interpretation if present, otherwise the plain value.
    pub fn display_json(&self) -> JsonValue {
        self.interpretation
            .clone()
            .unwrap_or_else(|| self.value.to_json())
    }
}
