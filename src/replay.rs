// Re-decodes a recorded session.
//
// Received packets are run through an interception pipeline again so the
// replay builds up its own entity context, then each packet is decoded in full
// against that context.

use std::sync::Arc;

use bytes::Bytes;

use crate::entity::{ContextKey, EntityCache, EntityTracker};
use crate::enumerator::{DecodedPacket, Enumerator, ReadOptions};
use crate::error::EnumerateError;
use crate::hiding::HidingConfig;
use crate::interception::InterceptionPipeline;
use crate::packet_logger::{PacketEntry, PacketLog};
use crate::protocol::ProtocolResolvers;
use crate::registry::{InterpretEnv, SharedRegistry};
use crate::template::PacketTemplate;

pub struct ReplayedPacket<'a> {
    /// Position in the log, counting hidden packets.
    pub index: usize,
    pub entry: &'a PacketEntry,
    /// `None` when the packet is too short to resolve.
    pub template: Option<Arc<PacketTemplate>>,
    pub decoded: Option<Result<DecodedPacket, EnumerateError>>,
}

pub struct LogReplay<'a> {
    log: &'a PacketLog,
    resolvers: ProtocolResolvers,
    registry: Arc<SharedRegistry>,
    pipeline: InterceptionPipeline,
    hiding: HidingConfig,
    next: usize,
    hidden: usize,
}

impl<'a> LogReplay<'a> {
    pub fn new(
        log: &'a PacketLog,
        resolvers: ProtocolResolvers,
        registry: Arc<SharedRegistry>,
        entities: &EntityCache,
    ) -> Self {
        let context = entities.acquire(ContextKey::new());
        let mut pipeline = InterceptionPipeline::new(resolvers.clone(), Arc::clone(&registry)).with_entities(context);
        pipeline.add_interceptor(Arc::new(EntityTracker::default()));
        Self {
            log,
            resolvers,
            registry,
            pipeline,
            hiding: HidingConfig::default(),
            next: 0,
            hidden: 0,
        }
    }

    pub fn with_hiding(mut self, hiding: HidingConfig) -> Self {
        self.hiding = hiding;
        self
    }

    /// Hidden packets skipped so far.
    pub fn hidden(&self) -> usize {
        self.hidden
    }

    fn decode(&self, template: &PacketTemplate, data: &[u8]) -> Result<DecodedPacket, EnumerateError> {
        let registry = self.registry.snapshot();
        let mut env = InterpretEnv::new(self.resolvers.version());
        if let Some(entities) = self.pipeline.entities() {
            env = env.with_entities(entities);
        }
        Enumerator::new(&registry, env)
            .with_options(ReadOptions::FULL)
            .enumerate(template, &Bytes::copy_from_slice(data))
    }
}

impl<'a> Iterator for LogReplay<'a> {
    type Item = ReplayedPacket<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let log = self.log;
        while let Some(entry) = log.entries.get(self.next) {
            let index = self.next;
            self.next += 1;
            if let Some(received) = &entry.received {
                self.pipeline.process(entry.endpoint, Bytes::copy_from_slice(received));
            }

            let data = entry.data();
            if self.hiding.is_hidden(entry.endpoint, data) {
                self.hidden += 1;
                continue;
            }
            let template = self.resolvers.for_sender(entry.endpoint).resolve(data);
            let decoded = template.as_ref().map(|template| self.decode(template, data));
            return Some(ReplayedPacket {
                index,
                entry,
                template,
                decoded,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::EndpointType;
    use crate::packet_logger::LogHeader;
    use crate::protocol::parse_definitions;
    use crate::registry::MetaclassRegistry;
    use crate::template::ProtocolVersion;
    use crate::work::WorkQueue;
    use uuid::Uuid;

    const DEFINITIONS: &str = r#"
server:
  - name: CharInfo
    prefix: "31"
    script:
      - node: field
        alias: object_id
        kind: { type: integer, width: w32, signed: true }
      - node: field
        alias: name
        kind: { type: text, encoding: utf16_le, length: nul_terminated }
  - name: Die
    prefix: "00"
    script:
      - node: field
        alias: object_id
        kind: { type: integer, width: w32, signed: true }
        interpreter: ObjectName
"#;

    fn entry(endpoint: EndpointType, data: &[u8]) -> PacketEntry {
        PacketEntry {
            timestamp: 0,
            endpoint,
            received: Some(data.to_vec()),
            sent: Some(data.to_vec()),
        }
    }

    fn log(entries: Vec<PacketEntry>) -> PacketLog {
        PacketLog {
            header: LogHeader {
                session_id: Uuid::new_v4(),
                protocol_version: ProtocolVersion(746),
                started_at: 0,
                client_addr: "127.0.0.1:1".to_string(),
                upstream_addr: "127.0.0.1:2".to_string(),
            },
            footer: None,
            entries,
        }
    }

    #[test]
    fn test_replay_builds_entity_context() {
        let log = log(vec![
            entry(EndpointType::Server, &[0x31, 0x09, 0, 0, 0, b'O', 0, b'w', 0, b'l', 0, 0, 0]),
            entry(EndpointType::Client, &[0x59]),
            entry(EndpointType::Server, &[0x00, 0x09, 0, 0, 0]),
        ]);
        let resolvers = ProtocolResolvers::build(ProtocolVersion(746), parse_definitions(DEFINITIONS).unwrap());
        let registry = Arc::new(SharedRegistry::new(MetaclassRegistry::with_defaults()));
        let cache = EntityCache::new(Arc::new(WorkQueue::new("test-replay").unwrap()));

        let mut hiding = HidingConfig::new();
        hiding.hide(EndpointType::Client, vec![0x59]);
        let mut replay = LogReplay::new(&log, resolvers, registry, &cache).with_hiding(hiding);

        let first = replay.next().unwrap();
        assert_eq!(first.template.unwrap().name(), "CharInfo");
        let die = replay.next().unwrap();
        assert_eq!(die.index, 2);
        let decoded = die.decoded.unwrap().unwrap();
        assert_eq!(decoded.get("object_id").unwrap().interpretation(), Some(&serde_json::json!("Owl")));
        assert!(replay.next().is_none());
        assert_eq!(replay.hidden(), 1);
    }
}
