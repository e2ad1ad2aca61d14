// Field elements: stateless descriptors of how to read one value.
//
// Every primitive kind shares the same decode steps (read raw bytes, apply the
// modifier, compute the interpretation), implemented once in decode_field.
// Only read_raw differs per kind.

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::enumerator::{FieldCursor, ReadOptions};
use crate::error::{DecodeError, InterpretError};
use crate::registry::{Capability, InterpretEnv, MetaclassRegistry};
use crate::value::{FieldValue, Value};

/// Width of a length prefix (little-endian, unsigned).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthPrefix {
    U8,
    U16,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteLength {
    Fixed(usize),
    Prefixed(LengthPrefix),
    /// Everything left in the packet.
    Rest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

impl IntWidth {
    pub fn bytes(self) -> usize {
        match self {
            IntWidth::W8 => 1,
            IntWidth::W16 => 2,
            IntWidth::W32 => 4,
            IntWidth::W64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextEncoding {
    Utf16Le,
    Utf8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextLength {
    /// Prefix counts characters (code units), not bytes.
    Prefixed(LengthPrefix),
    NulTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Bytes {
        length: ByteLength,
    },
    Integer {
        width: IntWidth,
        #[serde(default)]
        signed: bool,
    },
    Float {
        #[serde(default)]
        double: bool,
    },
    Text {
        encoding: TextEncoding,
        length: TextLength,
    },
}

impl FieldKind {
    pub const fn int(width: IntWidth, signed: bool) -> Self {
        FieldKind::Integer { width, signed }
    }

    pub const fn bytes(length: ByteLength) -> Self {
        FieldKind::Bytes { length }
    }

    pub const fn float(double: bool) -> Self {
        FieldKind::Float { double }
    }

    /// NUL-terminated UTF-16LE, the usual game string encoding.
    pub const fn utf16z() -> Self {
        FieldKind::Text {
            encoding: TextEncoding::Utf16Le,
            length: TextLength::NulTerminated,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldElement {
    /// Defaults to the alias when loaded from a definition file.
    #[serde(default)]
    pub id: String,
    pub alias: String,
    #[serde(default)]
    pub script_aliases: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    pub kind: FieldKind,
    #[serde(default)]
    pub modifier: Option<String>,
    #[serde(default)]
    pub interpreter: Option<String>,
}

impl FieldElement {
    pub fn new(alias: impl Into<String>, kind: FieldKind) -> Self {
        let alias = alias.into();
        Self {
            id: alias.clone(),
            alias,
            script_aliases: Vec::new(),
            optional: false,
            kind,
            modifier: None,
            interpreter: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_modifier(mut self, name: impl Into<String>) -> Self {
        self.modifier = Some(name.into());
        self
    }

    pub fn with_interpreter(mut self, name: impl Into<String>) -> Self {
        self.interpreter = Some(name.into());
        self
    }

    pub fn with_script_alias(mut self, alias: impl Into<String>) -> Self {
        self.script_aliases.push(alias.into());
        self
    }

    /// Primary alias followed by the script-facing ones.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.alias.as_str()).chain(self.script_aliases.iter().map(String::as_str))
    }
}

/// Forward-only cursor over a packet buffer.
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    buf: &'a Bytes,
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a Bytes, pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<Bytes, DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Underflow {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = self.buf.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(slice)
    }

    fn read_uint(&mut self, width: IntWidth) -> Result<u64, DecodeError> {
        let b = self.take(width.bytes())?;
        Ok(match width {
            IntWidth::W8 => u64::from(b[0]),
            IntWidth::W16 => u64::from(LittleEndian::read_u16(&b)),
            IntWidth::W32 => u64::from(LittleEndian::read_u32(&b)),
            IntWidth::W64 => LittleEndian::read_u64(&b),
        })
    }

    fn read_length(&mut self, prefix: LengthPrefix) -> Result<usize, DecodeError> {
        let width = match prefix {
            LengthPrefix::U8 => IntWidth::W8,
            LengthPrefix::U16 => IntWidth::W16,
            LengthPrefix::U32 => IntWidth::W32,
        };
        Ok(self.read_uint(width)? as usize)
    }

    /// Position of the first terminator unit at or after the cursor.
    fn find_terminator(&self, unit: usize) -> Result<usize, DecodeError> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        rest.chunks_exact(unit)
            .position(|c| c.iter().all(|&b| b == 0))
            .map(|i| i * unit)
            .ok_or(DecodeError::Underflow {
                needed: rest.len() + unit,
                available: rest.len(),
            })
    }
}

fn sign_extend(raw: u64, width: IntWidth) -> i64 {
    match width {
        IntWidth::W8 => raw as u8 as i8 as i64,
        IntWidth::W16 => raw as u16 as i16 as i64,
        IntWidth::W32 => raw as u32 as i32 as i64,
        IntWidth::W64 => raw as i64,
    }
}

fn decode_text(bytes: &[u8], encoding: TextEncoding) -> String {
    match encoding {
        TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        TextEncoding::Utf16Le => {
            let units: Vec<u16> = bytes.chunks_exact(2).map(LittleEndian::read_u16).collect();
            String::from_utf16_lossy(&units)
        }
    }
}

/// Reads the wire bytes of one field and its unmodified value.
/// The reader is only advanced on success.
pub fn read_raw(kind: &FieldKind, reader: &mut FieldReader<'_>) -> Result<(Bytes, Value), DecodeError> {
    let mut lookahead = reader.clone();
    let start = lookahead.position();
    let value = match *kind {
        FieldKind::Bytes { length } => {
            let n = match length {
                ByteLength::Fixed(n) => n,
                ByteLength::Prefixed(prefix) => lookahead.read_length(prefix)?,
                ByteLength::Rest => lookahead.remaining(),
            };
            Value::Bytes(lookahead.take(n)?.to_vec())
        }
        FieldKind::Integer { width, signed } => {
            let raw = lookahead.read_uint(width)?;
            Value::Integer(if signed { sign_extend(raw, width) } else { raw as i64 })
        }
        FieldKind::Float { double } => {
            if double {
                Value::Decimal(LittleEndian::read_f64(&lookahead.take(8)?))
            } else {
                Value::Decimal(f64::from(LittleEndian::read_f32(&lookahead.take(4)?)))
            }
        }
        FieldKind::Text { encoding, length } => {
            let unit = match encoding {
                TextEncoding::Utf16Le => 2,
                TextEncoding::Utf8 => 1,
            };
            let text = match length {
                TextLength::Prefixed(prefix) => {
                    let chars = lookahead.read_length(prefix)?;
                    lookahead.take(chars.saturating_mul(unit))?
                }
                TextLength::NulTerminated => {
                    let n = lookahead.find_terminator(unit)?;
                    let text = lookahead.take(n)?;
                    lookahead.take(unit)?;
                    text
                }
            };
            Value::Text(decode_text(&text, encoding))
        }
    };
    let raw = reader.buf.slice(start..lookahead.position());
    *reader = lookahead;
    Ok((raw, value))
}

/// Decodes one field: raw read, modifier, interpretation.
///
/// Returns `Ok(None)` when an optional field runs out of buffer. Modifier and
/// interpreter failures never fail the decode; the unmodified or
/// uninterpreted value is kept instead.
pub fn decode_field(
    element: &FieldElement,
    reader: &mut FieldReader<'_>,
    registry: &MetaclassRegistry,
    options: ReadOptions,
    env: &InterpretEnv<'_>,
    siblings: &FieldCursor<'_>,
) -> Result<Option<FieldValue>, DecodeError> {
    let (raw, raw_value) = match read_raw(&element.kind, reader) {
        Ok(read) => read,
        Err(DecodeError::Underflow { .. }) if element.optional => {
            trace!(field = %element.alias, "Optional field absent");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let value = match (&element.modifier, options.modify) {
        (Some(name), true) => match registry.resolve(name, Capability::Modifier(raw_value.kind())) {
            Ok(modifier) => match modifier.modify(&raw_value) {
                Ok(modified) => modified,
                Err(e) => {
                    debug!(field = %element.alias, modifier = %name, error = %e, "Modifier failed, keeping raw value");
                    raw_value
                }
            },
            Err(e) => {
                debug!(field = %element.alias, error = %e, "Modifier unavailable, keeping raw value");
                raw_value
            }
        },
        _ => raw_value,
    };

    let interpretation = match (&element.interpreter, options.interpret) {
        (Some(name), true) => interpret(name, &element.alias, &value, registry, env, siblings),
        _ => None,
    };

    Ok(Some(FieldValue::new(raw, value, interpretation)))
}

pub(crate) fn interpret(
    name: &str,
    alias: &str,
    value: &Value,
    registry: &MetaclassRegistry,
    env: &InterpretEnv<'_>,
    siblings: &FieldCursor<'_>,
) -> Option<serde_json::Value> {
    let result = registry
        .resolve(name, Capability::Interpretation)
        .map_err(InterpretError::from)
        .and_then(|metaclass| metaclass.interpret(value, env, siblings));
    match result {
        Ok(json) => Some(json),
        Err(e) => {
            debug!(field = %alias, interpreter = %name, error = %e, "Interpretation failed");
            None
        }
    }
}
