// Name-indexed registry of modifiers, interpreters and translators.
//
// Definitions refer to behaviour purely by name. A name resolves to a
// Metaclass, a tagged union over the capability shapes, so callers match on
// the variant instead of probing for interfaces at runtime.
//
// A MetaclassRegistry is immutable once built. Reloading builds a new one
// and swaps it into a SharedRegistry; decoders work on an `Arc` snapshot and
// never hold a lock while decoding.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::entity::ContextHandle;
use crate::enumerator::FieldCursor;
use crate::error::{InterpretError, RegistryError};
use crate::template::ProtocolVersion;
use crate::value::{Value, ValueKind};

// Modifiers may refuse a value; decoding then keeps the raw one.
pub trait ByteArrayModifier: Send + Sync {
    fn modify(&self, raw: &[u8]) -> Result<Vec<u8>, InterpretError>;
}

pub trait IntegerModifier: Send + Sync {
    fn modify(&self, raw: i64) -> Result<i64, InterpretError>;
}

pub trait DecimalModifier: Send + Sync {
    fn modify(&self, raw: f64) -> Result<f64, InterpretError>;
}

pub trait TextModifier: Send + Sync {
    fn modify(&self, raw: &str) -> Result<String, InterpretError>;
}

/// Everything an interpreter may consult besides the value itself.
#[derive(Clone, Copy)]
pub struct InterpretEnv<'a> {
    pub version: ProtocolVersion,
    pub entities: Option<&'a ContextHandle>,
}

impl<'a> InterpretEnv<'a> {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            entities: None,
        }
    }

    pub fn with_entities(mut self, entities: &'a ContextHandle) -> Self {
        self.entities = Some(entities);
        self
    }
}

/// Produces a human-readable form of a value.
pub trait Interpreter: Send + Sync {
    fn interpret(&self, value: &Value, env: &InterpretEnv<'_>) -> Result<JsonValue, InterpretError>;
}

/// Interpreter that also needs sibling fields decoded before the current cursor,
/// e.g. a type tag that governs how a later value is read.
pub trait ContextualInterpreter: Send + Sync {
    fn interpret(
        &self,
        value: &Value,
        env: &InterpretEnv<'_>,
        siblings: &FieldCursor<'_>,
    ) -> Result<JsonValue, InterpretError>;
}

/// Maps a value to another value, typically through protocol version or entity state.
pub trait Translator: Send + Sync {
    fn translate(&self, value: &Value, env: &InterpretEnv<'_>) -> Result<Value, InterpretError>;
}

/// A registered implementation, tagged by capability.
#[derive(Clone)]
pub enum Metaclass {
    ByteArrayModifier(Arc<dyn ByteArrayModifier>),
    IntegerModifier(Arc<dyn IntegerModifier>),
    DecimalModifier(Arc<dyn DecimalModifier>),
    TextModifier(Arc<dyn TextModifier>),
    Interpreter(Arc<dyn Interpreter>),
    Contextual(Arc<dyn ContextualInterpreter>),
    Translator(Arc<dyn Translator>),
}

impl Metaclass {
    pub fn describe(&self) -> &'static str {
        match self {
            Metaclass::ByteArrayModifier(_) => "byte array modifier",
            Metaclass::IntegerModifier(_) => "integer modifier",
            Metaclass::DecimalModifier(_) => "decimal modifier",
            Metaclass::TextModifier(_) => "string modifier",
            Metaclass::Interpreter(_) => "interpreter",
            Metaclass::Contextual(_) => "contextual interpreter",
            Metaclass::Translator(_) => "translator",
        }
    }

    fn satisfies(&self, capability: Capability) -> bool {
        match (self, capability) {
            (Metaclass::ByteArrayModifier(_), Capability::Modifier(ValueKind::ByteArray))
            | (Metaclass::IntegerModifier(_), Capability::Modifier(ValueKind::Integer))
            | (Metaclass::DecimalModifier(_), Capability::Modifier(ValueKind::Decimal))
            | (Metaclass::TextModifier(_), Capability::Modifier(ValueKind::Text)) => true,
            (
                Metaclass::Interpreter(_) | Metaclass::Contextual(_) | Metaclass::Translator(_),
                Capability::Interpretation,
            ) => true,
            _ => false,
        }
    }

    /// Applies a modifier. Values of a shape the modifier does not handle pass through.
    pub fn modify(&self, value: &Value) -> Result<Value, InterpretError> {
        Ok(match (self, value) {
            (Metaclass::ByteArrayModifier(m), Value::Bytes(b)) => Value::Bytes(m.modify(b)?),
            (Metaclass::IntegerModifier(m), Value::Integer(x)) => Value::Integer(m.modify(*x)?),
            (Metaclass::DecimalModifier(m), Value::Decimal(x)) => Value::Decimal(m.modify(*x)?),
            (Metaclass::TextModifier(m), Value::Text(s)) => Value::Text(m.modify(s)?),
            (_, other) => other.clone(),
        })
    }

    pub fn interpret(
        &self,
        value: &Value,
        env: &InterpretEnv<'_>,
        siblings: &FieldCursor<'_>,
    ) -> Result<JsonValue, InterpretError> {
        match self {
            Metaclass::Interpreter(i) => i.interpret(value, env),
            Metaclass::Contextual(c) => c.interpret(value, env, siblings),
            Metaclass::Translator(t) => t.translate(value, env).map(|v| v.to_json()),
            other => Err(InterpretError::UnsupportedValue {
                interpreter: other.describe(),
                kind: value.kind().as_str(),
            }),
        }
    }
}

impl fmt::Debug for Metaclass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// What a caller needs from a named metaclass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Modifier(ValueKind),
    /// Satisfied by interpreters, contextual interpreters and translators.
    Interpretation,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Modifier(kind) => write!(f, "{} modifier", kind),
            Capability::Interpretation => f.write_str("interpreter"),
        }
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    entries: HashMap<String, Metaclass>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder pre-populated with the built-in metaclasses.
    pub fn with_defaults() -> Self {
        let mut builder = Self::new();
        crate::metaclass::register_defaults(&mut builder);
        builder
    }

    /// Registers `metaclass` under `name`, replacing any earlier registration.
    pub fn register(&mut self, name: impl Into<String>, metaclass: Metaclass) -> &mut Self {
        let name = name.into();
        if self.entries.insert(name.clone(), metaclass).is_some() {
            debug!(name = %name, "Replaced metaclass registration");
        }
        self
    }

    /// Makes `alias` resolve to the same instance as `target`.
    pub fn alias(&mut self, alias: impl Into<String>, target: &str) -> Result<&mut Self, RegistryError> {
        let metaclass = self
            .entries
            .get(target)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownName(target.to_string()))?;
        self.entries.insert(alias.into(), metaclass);
        Ok(self)
    }

    pub fn build(self) -> MetaclassRegistry {
        MetaclassRegistry {
            entries: self.entries,
        }
    }
}

pub struct MetaclassRegistry {
    entries: HashMap<String, Metaclass>,
}

impl MetaclassRegistry {
    pub fn with_defaults() -> Self {
        RegistryBuilder::with_defaults().build()
    }

    pub fn resolve(&self, name: &str, capability: Capability) -> Result<&Metaclass, RegistryError> {
        let metaclass = self
            .entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownName(name.to_string()))?;
        if metaclass.satisfies(capability) {
            Ok(metaclass)
        } else {
            Err(RegistryError::CapabilityMismatch {
                name: name.to_string(),
                expected: capability,
                found: metaclass.describe(),
            })
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Holder that lets a reload replace the registry while decoders keep using
/// the snapshot they started with.
pub struct SharedRegistry {
    current: RwLock<Arc<MetaclassRegistry>>,
}

impl SharedRegistry {
    pub fn new(registry: MetaclassRegistry) -> Self {
        Self {
            current: RwLock::new(Arc::new(registry)),
        }
    }

    pub fn snapshot(&self) -> Arc<MetaclassRegistry> {
        Arc::clone(&self.current.read())
    }

    /// Installs `registry` and returns the one it replaced.
    pub fn replace(&self, registry: MetaclassRegistry) -> Arc<MetaclassRegistry> {
        let next = Arc::new(registry);
        info!(entries = next.len(), "Installed metaclass registry");
        std::mem::replace(&mut *self.current.write(), next)
    }
}
