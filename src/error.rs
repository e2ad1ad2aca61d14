// Error types shared by the decoding core.
//
// File-format errors live next to their readers (`packet_logger`, `hiding`).

use thiserror::Error;

use crate::enumerator::DecodedPacket;
use crate::registry::Capability;

/// Failure to resolve a metaclass by name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no metaclass registered under '{0}'")]
    UnknownName(String),
    #[error("metaclass '{name}' is a {found}, expected {expected}")]
    CapabilityMismatch {
        name: String,
        expected: Capability,
        found: &'static str,
    },
}

/// Failure to read a single field from a packet body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer underflow: needed {needed} bytes, {available} available")]
    Underflow { needed: usize, available: usize },
    #[error("loop count field '{alias}' is missing or negative")]
    LoopCount { alias: String },
}

/// A mandatory field could not be decoded; the rest of the packet was abandoned.
#[derive(Debug, Error)]
#[error("field '{field}' at offset {offset}: {source} ({unconsumed} bytes unconsumed)")]
pub struct EnumerateError {
    pub field: String,
    pub offset: usize,
    /// Bytes left in the buffer at the point of failure.
    pub unconsumed: usize,
    #[source]
    pub source: DecodeError,
    /// Everything decoded before the failing field.
    pub partial: DecodedPacket,
}

/// Recoverable failure of a modifier, interpreter or translator.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InterpretError {
    #[error("{interpreter} cannot interpret a {kind} value")]
    UnsupportedValue {
        interpreter: &'static str,
        kind: &'static str,
    },
    #[error("value {0} is out of range")]
    OutOfRange(i64),
    #[error("value {0} is not a finite number")]
    NotFinite(f64),
    #[error("sibling field '{0}' has not been decoded")]
    MissingSibling(String),
    #[error("no entity context is attached")]
    NoEntityContext,
    #[error("unknown entity {0}")]
    UnknownEntity(u32),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A second terminal decision was attempted on an intercepted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("packet already marked as {0}")]
pub struct DecisionError(pub &'static str);
