// Protocol catalog: packet definitions per protocol version
// Definitions are loaded from YAML documents and compiled into prefix resolvers

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::enumerator::ScriptNode;
use crate::packet::EndpointType;
use crate::resolver::PrefixResolver;
use crate::template::{PacketTemplate, ProtocolVersion, VersionRange};

// Protocol revision assumed when neither the config nor the environment names one
pub const DEFAULT_PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion(746);

/// Top-level layout of a definitions file: packets grouped by the peer that sends them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionDocument {
    #[serde(default)]
    pub client: Vec<TemplateDef>,
    #[serde(default)]
    pub server: Vec<TemplateDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDef {
    pub name: String,
    /// Hex string, e.g. "FE 02 00" or "0x00"
    pub prefix: String,
    #[serde(default)]
    pub versions: VersionRange,
    #[serde(default)]
    pub script: Vec<ScriptNode>,
}

impl TemplateDef {
    pub fn into_template(self) -> Result<PacketTemplate> {
        let prefix = parse_prefix(&self.prefix)
            .with_context(|| format!("Invalid prefix for packet {}", self.name))?;
        let mut script = self.script;
        fill_ids(&mut script);
        Ok(PacketTemplate::new(prefix, self.name, script).with_versions(self.versions))
    }
}

fn parse_prefix(text: &str) -> Result<Vec<u8>> {
    let digits: String = text
        .split_whitespace()
        .map(|chunk| chunk.trim_start_matches("0x").trim_start_matches("0X"))
        .collect();
    let prefix = hex::decode(&digits).with_context(|| format!("'{}' is not a hex byte sequence", text))?;
    if prefix.is_empty() {
        return Err(anyhow!("empty prefix"));
    }
    Ok(prefix)
}

// Elements written without an id take their alias
fn fill_ids(nodes: &mut [ScriptNode]) {
    for node in nodes {
        match node {
            ScriptNode::Field(element) if element.id.is_empty() => element.id = element.alias.clone(),
            ScriptNode::Field(_) => {}
            ScriptNode::Loop { body, .. } | ScriptNode::Block { body, .. } => fill_ids(body),
        }
    }
}

/// Parsed templates of one definitions document.
#[derive(Debug, Clone, Default)]
pub struct Definitions {
    pub client: Vec<PacketTemplate>,
    pub server: Vec<PacketTemplate>,
}

impl Definitions {
    pub fn len(&self) -> usize {
        self.client.len() + self.server.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn compile(defs: Vec<TemplateDef>) -> Result<Vec<PacketTemplate>> {
    defs.into_iter().map(TemplateDef::into_template).collect()
}

/// Parses a YAML definitions document into templates.
pub fn parse_definitions(content: &str) -> Result<Definitions> {
    let document: DefinitionDocument =
        serde_yaml::from_str(content).context("Failed to parse packet definitions")?;
    Ok(Definitions {
        client: compile(document.client).context("Invalid client packet")?,
        server: compile(document.server).context("Invalid server packet")?,
    })
}

pub fn load_definitions(path: &Path) -> Result<Definitions> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read definitions file: {}", path.display()))?;
    parse_definitions(&content).with_context(|| format!("Invalid definitions in {}", path.display()))
}

/// Client and server resolvers of one protocol version.
#[derive(Debug, Clone)]
pub struct ProtocolResolvers {
    pub client: Arc<PrefixResolver>,
    pub server: Arc<PrefixResolver>,
}

impl ProtocolResolvers {
    pub fn build(version: ProtocolVersion, definitions: Definitions) -> Self {
        Self {
            client: Arc::new(PrefixResolver::build(version, definitions.client)),
            server: Arc::new(PrefixResolver::build(version, definitions.server)),
        }
    }

    /// Resolver for packets sent by `sender`.
    pub fn for_sender(&self, sender: EndpointType) -> &Arc<PrefixResolver> {
        match sender {
            EndpointType::Client => &self.client,
            EndpointType::Server => &self.server,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.client.version()
    }
}

/// Resolvers for every protocol version that has been installed.
///
/// Installing definitions for a version builds fresh resolvers and replaces
/// the previous ones; sessions that already hold the old resolvers keep using
/// them, along with any undefined templates those have minted.
#[derive(Default)]
pub struct ProtocolCatalog {
    resolvers: RwLock<HashMap<ProtocolVersion, ProtocolResolvers>>,
}

impl ProtocolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, version: ProtocolVersion, definitions: Definitions) -> ProtocolResolvers {
        let resolvers = ProtocolResolvers::build(version, definitions);
        let previous = self.resolvers.write().insert(version, resolvers.clone());
        info!(
            version = %version,
            client_templates = resolvers.client.templates().len(),
            server_templates = resolvers.server.templates().len(),
            rejected = resolvers.client.rejected() + resolvers.server.rejected(),
            replaced = previous.is_some(),
            "Installed packet definitions"
        );
        resolvers
    }

    pub fn load_yaml(&self, path: &Path, version: ProtocolVersion) -> Result<ProtocolResolvers> {
        let definitions = load_definitions(path)?;
        Ok(self.install(version, definitions))
    }

    pub fn resolvers(&self, version: ProtocolVersion) -> Option<ProtocolResolvers> {
        self.resolvers.read().get(&version).cloned()
    }

    /// Resolvers for `version`, or empty ones that treat every packet as undefined.
    pub fn resolvers_or_empty(&self, version: ProtocolVersion) -> ProtocolResolvers {
        if let Some(resolvers) = self.resolvers(version) {
            return resolvers;
        }
        self.resolvers
            .write()
            .entry(version)
            .or_insert_with(|| ProtocolResolvers::build(version, Definitions::default()))
            .clone()
    }

    pub fn versions(&self) -> Vec<ProtocolVersion> {
        let mut versions: Vec<_> = self.resolvers.read().keys().copied().collect();
        versions.sort();
        versions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldKind, IntWidth};
    use std::io::Write;

    const DEFINITIONS: &str = r#"
client:
  - name: RequestAction
    prefix: "1F"
    script:
      - node: field
        alias: object_id
        kind: { type: integer, width: w32, signed: true }
server:
  - name: Die
    prefix: "00"
    script:
      - node: field
        alias: object_id
        kind: { type: integer, width: w32, signed: true }
        interpreter: ObjectName
  - name: ExEventMatchUserInfo
    prefix: "FE 02 00"
    versions: { min: 700 }
    script:
      - node: field
        alias: count
        kind: { type: integer, width: w8 }
      - node: loop
        count: { field: count }
        body:
          - node: field
            alias: name
            kind: { type: text, encoding: utf16_le, length: nul_terminated }
"#;

    #[test]
    fn test_parse_definitions() {
        let definitions = parse_definitions(DEFINITIONS).unwrap();
        assert_eq!(definitions.len(), 3);
        let server = &definitions.server;
        assert_eq!(server[0].prefix(), &[0x00]);
        assert_eq!(server[1].prefix(), &[0xfe, 0x02, 0x00]);
        match &server[0].script()[0] {
            ScriptNode::Field(element) => {
                assert_eq!(element.id, "object_id");
                assert_eq!(element.kind, FieldKind::int(IntWidth::W32, true));
                assert_eq!(element.interpreter.as_deref(), Some("ObjectName"));
            }
            other => panic!("unexpected node {:?}", other),
        }
        assert!(!server[1].applies_to(ProtocolVersion(600)));
    }

    #[test]
    fn test_bad_prefix() {
        let err = parse_definitions("server:\n  - name: Bad\n    prefix: \"zz\"\n").unwrap_err();
        assert!(format!("{:#}", err).contains("Bad"));
    }

    #[test]
    fn test_resolvers_are_per_sender() {
        let catalog = ProtocolCatalog::new();
        let resolvers = catalog.install(ProtocolVersion(746), parse_definitions(DEFINITIONS).unwrap());
        let from_server = resolvers.for_sender(EndpointType::Server);
        assert_eq!(from_server.resolve(&[0x00, 1, 0, 0, 0]).unwrap().name(), "Die");
        let from_client = resolvers.for_sender(EndpointType::Client);
        assert!(!from_client.resolve(&[0x00]).unwrap().is_defined());
        assert_eq!(from_client.resolve(&[0x1f]).unwrap().name(), "RequestAction");
    }

    #[test]
    fn test_catalog_reload_replaces_resolvers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(DEFINITIONS.as_bytes()).unwrap();

        let catalog = ProtocolCatalog::new();
        let first = catalog.load_yaml(file.path(), ProtocolVersion(746)).unwrap();
        let unknown = first.server.resolve(&[0x33]).unwrap();
        assert!(!unknown.is_defined());

        let reloaded = catalog.install(
            ProtocolVersion(746),
            Definitions {
                client: Vec::new(),
                server: vec![PacketTemplate::new(vec![0x33], "Late", Vec::new())],
            },
        );
        let current = catalog.resolvers(ProtocolVersion(746)).unwrap();
        assert!(Arc::ptr_eq(&current.server, &reloaded.server));
        assert_eq!(reloaded.server.resolve(&[0x33]).unwrap().name(), "Late");
        // The old resolver is left untouched
        assert!(!first.server.resolve(&[0x33]).unwrap().is_defined());
        assert_eq!(catalog.versions(), vec![ProtocolVersion(746)]);
    }

    #[test]
    fn test_missing_version_gets_empty_resolvers() {
        let catalog = ProtocolCatalog::new();
        assert!(catalog.resolvers(ProtocolVersion(1)).is_none());
        let resolvers = catalog.resolvers_or_empty(ProtocolVersion(1));
        assert!(resolvers.client.templates().is_empty());
        let again = catalog.resolvers_or_empty(ProtocolVersion(1));
        assert!(Arc::ptr_eq(&resolvers.server, &again.server));
    }
}
