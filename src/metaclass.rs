// Built-in modifiers, interpreters and translators.
//
// The names registered here are part of the definition-facing contract and
// must stay stable.

use std::net::Ipv4Addr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};

use crate::enumerator::FieldCursor;
use crate::error::InterpretError;
use crate::registry::{
    ByteArrayModifier, ContextualInterpreter, DecimalModifier, IntegerModifier, InterpretEnv,
    Interpreter, Metaclass, RegistryBuilder, TextModifier, Translator,
};
use crate::value::Value;

pub(crate) fn register_defaults(builder: &mut RegistryBuilder) {
    builder
        .register("Negate", Metaclass::IntegerModifier(Arc::new(Negate)))
        .register("Reverse", Metaclass::ByteArrayModifier(Arc::new(Reverse)))
        .register("Trim", Metaclass::TextModifier(Arc::new(Trim)))
        .register("Round", Metaclass::DecimalModifier(Arc::new(Round)))
        .register("Hex", Metaclass::Interpreter(Arc::new(Hex)))
        .register("Boolean", Metaclass::Interpreter(Arc::new(Boolean)))
        .register("IpAddress", Metaclass::Interpreter(Arc::new(IpAddress)))
        .register("UnixTime", Metaclass::Interpreter(Arc::new(UnixTime)))
        .register("Percent", Metaclass::Interpreter(Arc::new(Percent)))
        .register(
            "ShortcutTarget",
            Metaclass::Contextual(Arc::new(ShortcutTarget::default())),
        )
        .register("ObjectName", Metaclass::Translator(Arc::new(ObjectName)))
        .register("ObjectKind", Metaclass::Translator(Arc::new(ObjectKind)));
}

fn unsupported(interpreter: &'static str, value: &Value) -> InterpretError {
    InterpretError::UnsupportedValue {
        interpreter,
        kind: value.kind().as_str(),
    }
}

pub struct Negate;

impl IntegerModifier for Negate {
    fn modify(&self, raw: i64) -> Result<i64, InterpretError> {
        raw.checked_neg().ok_or(InterpretError::OutOfRange(raw))
    }
}

/// Byte array modifier reversing byte order (big-endian identifiers).
pub struct Reverse;

impl ByteArrayModifier for Reverse {
    fn modify(&self, raw: &[u8]) -> Result<Vec<u8>, InterpretError> {
        Ok(raw.iter().rev().copied().collect())
    }
}

pub struct Trim;

impl TextModifier for Trim {
    fn modify(&self, raw: &str) -> Result<String, InterpretError> {
        Ok(raw.trim().to_string())
    }
}

/// Rounds to two decimal places.
pub struct Round;

impl DecimalModifier for Round {
    fn modify(&self, raw: f64) -> Result<f64, InterpretError> {
        if !raw.is_finite() {
            return Err(InterpretError::NotFinite(raw));
        }
        Ok((raw * 100.0).round() / 100.0)
    }
}

/// XOR de-obfuscation with a fixed byte mask. Not registered by default since
/// the mask is deployment specific.
pub struct XorMask {
    mask: u8,
}

impl XorMask {
    pub fn new(mask: u8) -> Self {
        Self { mask }
    }
}

impl ByteArrayModifier for XorMask {
    fn modify(&self, raw: &[u8]) -> Result<Vec<u8>, InterpretError> {
        Ok(raw.iter().map(|b| b ^ self.mask).collect())
    }
}

impl IntegerModifier for XorMask {
    fn modify(&self, raw: i64) -> Result<i64, InterpretError> {
        Ok(raw ^ i64::from(self.mask))
    }
}

pub struct Hex;

impl Interpreter for Hex {
    fn interpret(&self, value: &Value, _env: &InterpretEnv<'_>) -> Result<JsonValue, InterpretError> {
        match value {
            Value::Integer(x) => Ok(json!(format!("0x{:X}", x))),
            Value::Bytes(b) => Ok(json!(hex::encode_upper(b))),
            other => Err(unsupported("Hex", other)),
        }
    }
}

pub struct Boolean;

impl Interpreter for Boolean {
    fn interpret(&self, value: &Value, _env: &InterpretEnv<'_>) -> Result<JsonValue, InterpretError> {
        value
            .as_i64()
            .map(|x| json!(x != 0))
            .ok_or_else(|| unsupported("Boolean", value))
    }
}

/// IPv4 address stored as a little-endian 32-bit integer or as 4 raw bytes.
pub struct IpAddress;

impl Interpreter for IpAddress {
    fn interpret(&self, value: &Value, _env: &InterpretEnv<'_>) -> Result<JsonValue, InterpretError> {
        let octets: [u8; 4] = match value {
            Value::Integer(x) => (*x as u32).to_le_bytes(),
            Value::Bytes(b) if b.len() == 4 => [b[0], b[1], b[2], b[3]],
            other => return Err(unsupported("IpAddress", other)),
        };
        Ok(json!(Ipv4Addr::from(octets).to_string()))
    }
}

/// Seconds since the epoch, rendered as RFC 3339.
pub struct UnixTime;

impl Interpreter for UnixTime {
    fn interpret(&self, value: &Value, _env: &InterpretEnv<'_>) -> Result<JsonValue, InterpretError> {
        let secs = value.as_i64().ok_or_else(|| unsupported("UnixTime", value))?;
        let time = DateTime::<Utc>::from_timestamp(secs, 0).ok_or(InterpretError::OutOfRange(secs))?;
        Ok(json!(time.to_rfc3339()))
    }
}

/// Fraction in `[0, 1]` shown as a percentage.
pub struct Percent;

impl Interpreter for Percent {
    fn interpret(&self, value: &Value, _env: &InterpretEnv<'_>) -> Result<JsonValue, InterpretError> {
        let fraction = value.as_f64().ok_or_else(|| unsupported("Percent", value))?;
        Ok(json!(format!("{:.1}%", fraction * 100.0)))
    }
}

/// Interprets a shortcut's target id according to the shortcut type decoded
/// just before it in the same block.
pub struct ShortcutTarget {
    type_field: String,
}

impl Default for ShortcutTarget {
    fn default() -> Self {
        Self {
            type_field: "shortcut_type".to_string(),
        }
    }
}

impl ShortcutTarget {
    pub fn new(type_field: impl Into<String>) -> Self {
        Self {
            type_field: type_field.into(),
        }
    }
}

impl ContextualInterpreter for ShortcutTarget {
    fn interpret(
        &self,
        value: &Value,
        _env: &InterpretEnv<'_>,
        siblings: &FieldCursor<'_>,
    ) -> Result<JsonValue, InterpretError> {
        let target = value.as_i64().ok_or_else(|| unsupported("ShortcutTarget", value))?;
        let kind = siblings
            .preceding(&self.type_field)
            .and_then(|v| v.value().as_i64())
            .ok_or_else(|| InterpretError::MissingSibling(self.type_field.clone()))?;
        if !(1..=5).contains(&kind) {
            return Err(InterpretError::OutOfRange(kind));
        }
        let label = match kind {
            1 => "item",
            2 => "skill",
            3 => "action",
            4 => "macro",
            _ => "recipe",
        };
        Ok(json!(format!("{} #{}", label, target)))
    }
}

fn entity_id(value: &Value, interpreter: &'static str) -> Result<u32, InterpretError> {
    let id = value.as_i64().ok_or_else(|| unsupported(interpreter, value))?;
    u32::try_from(id).map_err(|_| InterpretError::OutOfRange(id))
}

/// Object id → last known name in the current entity context.
pub struct ObjectName;

impl Translator for ObjectName {
    fn translate(&self, value: &Value, env: &InterpretEnv<'_>) -> Result<Value, InterpretError> {
        let id = entity_id(value, "ObjectName")?;
        let entities = env.entities.ok_or(InterpretError::NoEntityContext)?;
        entities
            .get(id)
            .and_then(|e| e.state().name)
            .map(Value::Text)
            .ok_or(InterpretError::UnknownEntity(id))
    }
}

/// Object id → kind of the entity (the packet that introduced it).
pub struct ObjectKind;

impl Translator for ObjectKind {
    fn translate(&self, value: &Value, env: &InterpretEnv<'_>) -> Result<Value, InterpretError> {
        let id = entity_id(value, "ObjectKind")?;
        let entities = env.entities.ok_or(InterpretError::NoEntityContext)?;
        entities
            .get(id)
            .and_then(|e| e.state().kind)
            .map(Value::Text)
            .ok_or(InterpretError::UnknownEntity(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::ProtocolVersion;

    fn env() -> InterpretEnv<'static> {
        InterpretEnv::new(ProtocolVersion(1))
    }

    #[test]
    fn test_ip_address() {
        let ip = IpAddress
            .interpret(&Value::Integer(0x0100_007F), &env())
            .unwrap();
        assert_eq!(ip, json!("127.0.0.1"));
        assert!(IpAddress.interpret(&Value::Text("x".into()), &env()).is_err());
    }

    #[test]
    fn test_unix_time() {
        assert_eq!(
            UnixTime.interpret(&Value::Integer(0), &env()).unwrap(),
            json!("1970-01-01T00:00:00+00:00")
        );
    }

    #[test]
    fn test_modifiers() {
        assert_eq!(Negate.modify(5), Ok(-5));
        assert_eq!(Reverse.modify(&[1, 2, 3]), Ok(vec![3, 2, 1]));
        assert_eq!(Trim.modify("  a "), Ok("a".to_string()));
        assert_eq!(ByteArrayModifier::modify(&XorMask::new(0xff), &[0x0f]), Ok(vec![0xf0]));
        assert_eq!(Round.modify(1.23456), Ok(1.23));
    }

    #[test]
    fn test_modifiers_refuse_unrepresentable_values() {
        assert_eq!(Negate.modify(i64::MIN), Err(InterpretError::OutOfRange(i64::MIN)));
        assert!(matches!(Round.modify(f64::NAN), Err(InterpretError::NotFinite(_))));
    }

    #[test]
    fn test_translators_need_context() {
        assert_eq!(
            ObjectName.translate(&Value::Integer(7), &env()),
            Err(InterpretError::NoEntityContext)
        );
        assert_eq!(
            ObjectName.translate(&Value::Integer(-1), &env()),
            Err(InterpretError::OutOfRange(-1))
        );
    }

    #[test]
    fn test_defaults_registered() {
        let registry = RegistryBuilder::with_defaults().build();
        for name in ["Negate", "Hex", "ShortcutTarget", "ObjectName"] {
            assert!(registry.contains(name), "{} missing", name);
        }
    }
}
