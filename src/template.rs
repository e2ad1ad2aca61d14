use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::enumerator::ScriptNode;

/// Protocol revision number announced by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolVersion(pub u32);

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive range of protocol versions a template applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRange {
    #[serde(default)]
    pub min: Option<ProtocolVersion>,
    #[serde(default)]
    pub max: Option<ProtocolVersion>,
}

impl VersionRange {
    pub const ANY: VersionRange = VersionRange {
        min: None,
        max: None,
    };

    pub fn contains(&self, version: ProtocolVersion) -> bool {
        self.min.map_or(true, |min| version >= min) && self.max.map_or(true, |max| version <= max)
    }
}

/// Structural description of one packet type.
///
/// Identity is the opcode prefix: two templates with the same prefix are equal
/// regardless of name or script.
#[derive(Debug, Clone)]
pub struct PacketTemplate {
    prefix: Vec<u8>,
    name: String,
    script: Vec<ScriptNode>,
    versions: VersionRange,
    defined: bool,
}

impl PacketTemplate {
    pub fn new(prefix: impl Into<Vec<u8>>, name: impl Into<String>, script: Vec<ScriptNode>) -> Self {
        Self {
            prefix: prefix.into(),
            name: name.into(),
            script,
            versions: VersionRange::ANY,
            defined: true,
        }
    }

    /// Placeholder minted by a resolver for a prefix no definition covers.
    pub fn undefined(prefix: impl Into<Vec<u8>>) -> Self {
        let prefix = prefix.into();
        let name = format!("Unknown_{}", hex::encode_upper(&prefix));
        Self {
            prefix,
            name,
            script: Vec::new(),
            versions: VersionRange::ANY,
            defined: false,
        }
    }

    pub fn with_versions(mut self, versions: VersionRange) -> Self {
        self.versions = versions;
        self
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn script(&self) -> &[ScriptNode] {
        &self.script
    }

    pub fn versions(&self) -> VersionRange {
        self.versions
    }

    pub fn is_defined(&self) -> bool {
        self.defined
    }

    pub fn applies_to(&self, version: ProtocolVersion) -> bool {
        self.versions.contains(version)
    }
}

impl PartialEq for PacketTemplate {
    fn eq(&self, other: &Self) -> bool {
        self.prefix == other.prefix
    }
}

impl Eq for PacketTemplate {}

impl Hash for PacketTemplate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.prefix.hash(state);
    }
}

impl fmt::Display for PacketTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, hex::encode_upper(&self.prefix))
    }
}
