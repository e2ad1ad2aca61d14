// Walks a template's field script over a packet buffer.
//
// All per-decode state lives in a local DecodeContext; templates, elements
// and the registry are only read, so any number of connections can decode
// concurrently with the same definitions.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::trace;

use crate::error::{DecodeError, EnumerateError};
use crate::field::{self, FieldElement, FieldReader};
use crate::registry::{InterpretEnv, MetaclassRegistry};
use crate::template::PacketTemplate;
use crate::value::{FieldValue, Value};

/// One step of a template's script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum ScriptNode {
    Field(FieldElement),
    /// Body repeated `count` times.
    Loop { count: LoopCount, body: Vec<ScriptNode> },
    /// Structural grouping; decoded in place.
    Block { id: String, body: Vec<ScriptNode> },
}

impl ScriptNode {
    pub fn field(element: FieldElement) -> Self {
        ScriptNode::Field(element)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopCount {
    Fixed(usize),
    /// Latest decoded value of this alias.
    Field(String),
}

/// Which optional steps a decode performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
    pub modify: bool,
    pub interpret: bool,
}

impl ReadOptions {
    pub const RAW: ReadOptions = ReadOptions {
        modify: false,
        interpret: false,
    };
    pub const MODIFIED: ReadOptions = ReadOptions {
        modify: true,
        interpret: false,
    };
    pub const FULL: ReadOptions = ReadOptions {
        modify: true,
        interpret: true,
    };
}

#[derive(Debug, Clone)]
struct Entry {
    alias: String,
    offset: usize,
    value: FieldValue,
    interpreter: Option<String>,
}

/// Decode result: every field occurrence with its offset, indexed by all of
/// the element's aliases.
#[derive(Debug, Clone, Default)]
pub struct DecodedPacket {
    entries: Vec<Entry>,
    index: HashMap<String, Vec<usize>>,
    consumed: usize,
    length: usize,
}

impl DecodedPacket {
    fn push(&mut self, element: &FieldElement, offset: usize, value: FieldValue) {
        let slot = self.entries.len();
        for alias in element.aliases() {
            self.index.entry(alias.to_string()).or_default().push(slot);
        }
        self.entries.push(Entry {
            alias: element.alias.clone(),
            offset,
            value,
            interpreter: element.interpreter.clone(),
        });
    }

    fn slots(&self, alias: &str) -> &[usize] {
        self.index.get(alias).map(Vec::as_slice).unwrap_or(&[])
    }

    /// First occurrence of `alias`.
    pub fn get(&self, alias: &str) -> Option<&FieldValue> {
        self.slots(alias).first().map(|&i| &self.entries[i].value)
    }

    pub fn latest(&self, alias: &str) -> Option<&FieldValue> {
        self.slots(alias).last().map(|&i| &self.entries[i].value)
    }

    /// All occurrences of `alias` in decode order, with their byte offsets.
    pub fn occurrences<'a>(&'a self, alias: &str) -> impl Iterator<Item = (usize, &'a FieldValue)> + 'a {
        self.slots(alias).iter().map(move |&i| {
            let entry = &self.entries[i];
            (entry.offset, &entry.value)
        })
    }

    pub fn count(&self, alias: &str) -> usize {
        self.slots(alias).len()
    }

    pub fn value(&self, alias: &str) -> Option<&Value> {
        self.get(alias).map(FieldValue::value)
    }

    pub fn integer(&self, alias: &str) -> Option<i64> {
        self.value(alias).and_then(Value::as_i64)
    }

    pub fn text(&self, alias: &str) -> Option<&str> {
        self.value(alias).and_then(Value::as_str)
    }

    pub fn bytes(&self, alias: &str) -> Option<&[u8]> {
        self.value(alias).and_then(Value::as_bytes)
    }

    /// Number of decoded occurrences.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Offset just past the last decoded field.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Bytes the script did not account for.
    pub fn trailing(&self) -> usize {
        self.length.saturating_sub(self.consumed)
    }

    /// `(primary alias, offset, value)` in script order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize, &FieldValue)> {
        self.entries
            .iter()
            .map(|e| (e.alias.as_str(), e.offset, &e.value))
    }

    /// Interpretation of the `index`-th occurrence of `alias`, computed on
    /// demand if the decode skipped it. Contextual interpreters see the packet
    /// as it was at that occurrence's offset.
    pub fn interpret(
        &self,
        alias: &str,
        index: usize,
        registry: &MetaclassRegistry,
        env: &InterpretEnv<'_>,
    ) -> Option<JsonValue> {
        let entry = &self.entries[*self.slots(alias).get(index)?];
        if let Some(json) = entry.value.interpretation() {
            return Some(json.clone());
        }
        let name = entry.interpreter.as_deref()?;
        let cursor = FieldCursor::new(self, entry.offset);
        field::interpret(name, alias, entry.value.value(), registry, env, &cursor)
    }

    /// JSON object keyed by primary alias; repeated aliases become arrays.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::new();
        for entry in &self.entries {
            let value = entry.value.display_json();
            if self.count(&entry.alias) > 1 {
                let slot = map
                    .entry(entry.alias.clone())
                    .or_insert_with(|| JsonValue::Array(Vec::new()));
                if let JsonValue::Array(items) = slot {
                    items.push(value);
                }
            } else {
                map.insert(entry.alias.clone(), value);
            }
        }
        JsonValue::Object(map)
    }
}

/// View of the fields decoded before a cursor position, handed to contextual
/// interpreters.
#[derive(Debug, Clone, Copy)]
pub struct FieldCursor<'a> {
    packet: &'a DecodedPacket,
    cursor: usize,
}

impl<'a> FieldCursor<'a> {
    pub fn new(packet: &'a DecodedPacket, cursor: usize) -> Self {
        Self { packet, cursor }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Closest occurrence of `alias` that starts before the cursor.
    pub fn preceding(&self, alias: &str) -> Option<&'a FieldValue> {
        self.packet
            .occurrences(alias)
            .filter(|(offset, _)| *offset < self.cursor)
            .last()
            .map(|(_, value)| value)
    }

    pub fn packet(&self) -> &'a DecodedPacket {
        self.packet
    }
}

struct DecodeContext<'b> {
    reader: FieldReader<'b>,
    packet: DecodedPacket,
    /// Set once an optional field is absent; everything after it is absent too.
    exhausted: bool,
}

struct FieldFailure {
    field: String,
    offset: usize,
    error: DecodeError,
}

pub struct Enumerator<'a> {
    registry: &'a MetaclassRegistry,
    env: InterpretEnv<'a>,
    options: ReadOptions,
}

impl<'a> Enumerator<'a> {
    pub fn new(registry: &'a MetaclassRegistry, env: InterpretEnv<'a>) -> Self {
        Self {
            registry,
            env,
            options: ReadOptions::FULL,
        }
    }

    pub fn with_options(mut self, options: ReadOptions) -> Self {
        self.options = options;
        self
    }

    /// Decodes `buffer` (opcode prefix included) with `template`'s script.
    pub fn enumerate(&self, template: &PacketTemplate, buffer: &Bytes) -> Result<DecodedPacket, EnumerateError> {
        let start = template.prefix().len();
        let mut ctx = DecodeContext {
            reader: FieldReader::new(buffer, start),
            packet: DecodedPacket {
                length: buffer.len(),
                consumed: start.min(buffer.len()),
                ..DecodedPacket::default()
            },
            exhausted: false,
        };

        if buffer.len() < start {
            return Err(EnumerateError {
                field: template.name().to_string(),
                offset: 0,
                unconsumed: buffer.len(),
                source: DecodeError::Underflow {
                    needed: start,
                    available: buffer.len(),
                },
                partial: ctx.packet,
            });
        }

        match self.walk(template.script(), &mut ctx) {
            Ok(()) => {
                ctx.packet.consumed = ctx.reader.position();
                trace!(
                    packet = %template.name(),
                    fields = ctx.packet.len(),
                    trailing = ctx.packet.trailing(),
                    "Enumerated packet"
                );
                Ok(ctx.packet)
            }
            Err(failure) => {
                ctx.packet.consumed = failure.offset;
                Err(EnumerateError {
                    field: failure.field,
                    offset: failure.offset,
                    unconsumed: buffer.len().saturating_sub(failure.offset),
                    source: failure.error,
                    partial: ctx.packet,
                })
            }
        }
    }

    fn walk(&self, nodes: &[ScriptNode], ctx: &mut DecodeContext<'_>) -> Result<(), FieldFailure> {
        for node in nodes {
            if ctx.exhausted {
                return Ok(());
            }
            match node {
                ScriptNode::Field(element) => self.decode(element, ctx)?,
                ScriptNode::Loop { count, body } => {
                    let offset = ctx.reader.position();
                    let n = match count {
                        LoopCount::Fixed(n) => *n,
                        LoopCount::Field(alias) => ctx
                            .packet
                            .latest(alias)
                            .and_then(|v| v.value().as_i64())
                            .and_then(|n| usize::try_from(n).ok())
                            .ok_or_else(|| FieldFailure {
                                field: alias.clone(),
                                offset,
                                error: DecodeError::LoopCount { alias: alias.clone() },
                            })?,
                    };
                    for _ in 0..n {
                        let before = ctx.reader.position();
                        self.walk(body, ctx)?;
                        // A body that reads nothing would spin on a corrupt count.
                        if ctx.exhausted || ctx.reader.position() == before {
                            break;
                        }
                    }
                }
                ScriptNode::Block { body, .. } => self.walk(body, ctx)?,
            }
        }
        Ok(())
    }

    fn decode(&self, element: &FieldElement, ctx: &mut DecodeContext<'_>) -> Result<(), FieldFailure> {
        let offset = ctx.reader.position();
        let decoded = {
            let siblings = FieldCursor::new(&ctx.packet, offset);
            field::decode_field(
                element,
                &mut ctx.reader,
                self.registry,
                self.options,
                &self.env,
                &siblings,
            )
        };
        match decoded {
            Ok(Some(value)) => {
                ctx.packet.push(element, offset, value);
                Ok(())
            }
            Ok(None) => {
                ctx.exhausted = true;
                Ok(())
            }
            Err(error) => Err(FieldFailure {
                field: element.alias.clone(),
                offset,
                error,
            }),
        }
    }
}
