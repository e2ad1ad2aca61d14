use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::entity::{ContextKey, EntityCache, EntityTracker};
use crate::hiding::HidingConfig;
use crate::interception::{Forward, InjectionQueue, InterceptionPipeline, PacketInterceptor, PacketListener, PacketOutcome};
use crate::packet::{hex_dump, EndpointType};
use crate::packet_logger::{LogHeader, PacketLogListener, PacketLogger};
use crate::protocol::ProtocolCatalog;
use crate::registry::{MetaclassRegistry, SharedRegistry};
use crate::work::WorkQueue;

const LOG_FINISH_TIMEOUT: Duration = Duration::from_secs(5);

/// State shared by every session of one relay.
pub struct RelayServices {
    pub config: RelayConfig,
    pub catalog: Arc<ProtocolCatalog>,
    pub registry: Arc<SharedRegistry>,
    pub entities: EntityCache,
    /// Packets left out of the per-packet debug trace.
    pub hiding: HidingConfig,
    interceptors: Vec<Arc<dyn PacketInterceptor>>,
}

impl RelayServices {
    /// Loads the configured definitions and starts the shared work queue.
    pub fn new(config: RelayConfig) -> Result<Self> {
        let catalog = ProtocolCatalog::new();
        match &config.definitions {
            Some(path) => {
                catalog.load_yaml(path, config.protocol_version)?;
            }
            None => warn!("No packet definitions configured, every packet will be undefined"),
        }
        let hiding = match &config.hiding_config {
            Some(path) => HidingConfig::load(path)
                .with_context(|| format!("Failed to read hiding config {}", path.display()))?,
            None => HidingConfig::default(),
        };
        let queue = WorkQueue::new("relay-work").context("Failed to start work queue")?;
        let mut services = Self::with_catalog(config, catalog, Arc::new(queue));
        services.hiding = hiding;
        Ok(services)
    }

    pub fn with_catalog(config: RelayConfig, catalog: ProtocolCatalog, queue: Arc<WorkQueue>) -> Self {
        Self {
            config,
            catalog: Arc::new(catalog),
            registry: Arc::new(SharedRegistry::new(MetaclassRegistry::with_defaults())),
            entities: EntityCache::new(queue),
            hiding: HidingConfig::default(),
            interceptors: Vec::new(),
        }
    }

    /// Interceptor installed in every new session, after entity tracking.
    pub fn add_interceptor(&mut self, interceptor: Arc<dyn PacketInterceptor>) {
        self.interceptors.push(interceptor);
    }
}

/// One client/server pair: its pipeline, entity context and packet log.
pub struct RelaySession {
    id: Uuid,
    client_addr: SocketAddr,
    upstream_addr: SocketAddr,
    pipeline: InterceptionPipeline,
    log: Arc<PacketLogListener>,
}

impl RelaySession {
    pub fn new(services: &RelayServices, client_addr: SocketAddr, upstream_addr: SocketAddr) -> Result<Self> {
        let id = Uuid::new_v4();
        let config = &services.config;
        let header = LogHeader {
            session_id: id,
            protocol_version: config.protocol_version,
            started_at: Utc::now().timestamp_millis(),
            client_addr: client_addr.to_string(),
            upstream_addr: upstream_addr.to_string(),
        };
        let logger = PacketLogger::new(&header, &config.log_dir)
            .with_context(|| format!("Failed to create packet log in {}", config.log_dir.display()))?;
        let log = Arc::new(PacketLogListener::new(logger, Arc::clone(services.entities.queue())));

        let resolvers = services.catalog.resolvers_or_empty(config.protocol_version);
        let entities = services.entities.acquire(ContextKey::new());
        let mut pipeline = InterceptionPipeline::new(resolvers, Arc::clone(&services.registry))
            .with_entities(entities)
            .with_key_exchange(config.key_exchange.clone());
        pipeline.add_interceptor(Arc::new(EntityTracker::default()));
        for interceptor in &services.interceptors {
            pipeline.add_interceptor(Arc::clone(interceptor));
        }
        pipeline.add_listener(log.clone());
        pipeline.add_listener(Arc::new(TrafficTrace {
            session: id,
            hiding: services.hiding.clone(),
        }));

        info!(session = %id, client = %client_addr, upstream = %upstream_addr, "Session started");
        Ok(Self {
            id,
            client_addr,
            upstream_addr,
            pipeline,
            log,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn upstream_addr(&self) -> SocketAddr {
        self.upstream_addr
    }

    pub fn pipeline_mut(&mut self) -> &mut InterceptionPipeline {
        &mut self.pipeline
    }

    pub fn injection_queue(&self) -> InjectionQueue {
        self.pipeline.injection_queue()
    }

    pub fn process(&mut self, from: EndpointType, wire: Bytes) -> Vec<Forward> {
        self.pipeline.process(from, wire)
    }

    pub fn drain_injections(&mut self) -> Vec<Forward> {
        self.pipeline.drain_injections()
    }

    /// Releases the entity context and completes the packet log. Blocks on
    /// pending log writes.
    pub fn finish(self) -> Result<Option<PathBuf>> {
        let Self { id, pipeline, log, .. } = self;
        drop(pipeline);
        let path = log
            .finish(LOG_FINISH_TIMEOUT)
            .with_context(|| format!("Failed to finish packet log of session {}", id))?;
        info!(session = %id, log = ?path, "Session finished");
        Ok(path)
    }
}

// Debug-level trace of every packet the hiding config does not cover
struct TrafficTrace {
    session: Uuid,
    hiding: HidingConfig,
}

impl TrafficTrace {
    fn shows(&self, outcome: &PacketOutcome) -> bool {
        let data = outcome.received.as_ref().or(outcome.sent.as_ref());
        data.map_or(false, |data| !self.hiding.is_hidden(outcome.endpoint, data))
    }
}

impl PacketListener for TrafficTrace {
    fn on_outcome(&self, outcome: &PacketOutcome) {
        if !self.shows(outcome) {
            return;
        }
        let name = outcome.template.as_ref().map_or("?", |t| t.name());
        let data = outcome.sent.as_ref().or(outcome.received.as_ref()).map_or(&[][..], |b| b.as_ref());
        debug!(
            session = %self.session,
            endpoint = %outcome.endpoint,
            packet = name,
            injected = outcome.is_injected(),
            forwarded = outcome.forwarded,
            dump = %hex_dump(data),
            "Packet"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_logger::PacketLog;
    use crate::protocol::parse_definitions;

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
"#;

    fn services(log_dir: PathBuf) -> RelayServices {
        let config = RelayConfig {
            log_dir,
            key_exchange: None,
            ..RelayConfig::default()
        };
        let catalog = ProtocolCatalog::new();
        catalog.install(config.protocol_version, parse_definitions(DEFINITIONS).unwrap());
        RelayServices::with_catalog(config, catalog, Arc::new(WorkQueue::new("test-session").unwrap()))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_session_tracks_entities_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path().to_path_buf());
        let mut session = RelaySession::new(&services, addr(5000), addr(7777)).unwrap();

        let wire = Bytes::from_static(&[0x31, 0x07, 0, 0, 0, b'A', 0, b'n', 0, 0, 0]);
        let forwards = session.process(EndpointType::Server, wire.clone());
        assert_eq!(forwards, vec![Forward { to: EndpointType::Client, bytes: wire.clone() }]);

        let entity = session.pipeline_mut().entities().unwrap().get(7).unwrap();
        assert_eq!(entity.state().name.as_deref(), Some("An"));
        assert_eq!(services.entities.live_contexts(), 1);

        let path = session.finish().unwrap().unwrap();
        let log = PacketLog::open(&path).unwrap();
        assert!(log.is_complete());
        assert_eq!(log.header.client_addr, "127.0.0.1:5000");
        assert_eq!(log.entries.len(), 1);
        assert_eq!(log.entries[0].data(), wire.as_ref());

        assert!(services.entities.queue().flush(Duration::from_secs(2)));
        assert_eq!(services.entities.live_contexts(), 0);
        assert_eq!(services.entities.teardowns(), 1);
    }

    #[test]
    fn test_sessions_get_separate_contexts() {
        let dir = tempfile::tempdir().unwrap();
        let services = services(dir.path().to_path_buf());
        let mut first = RelaySession::new(&services, addr(5001), addr(7777)).unwrap();
        let second = RelaySession::new(&services, addr(5002), addr(7777)).unwrap();
        assert_ne!(first.id(), second.id());

        first.process(
            EndpointType::Server,
            Bytes::from_static(&[0x31, 0x01, 0, 0, 0, b'X', 0, 0, 0]),
        );
        assert_eq!(services.entities.live_contexts(), 2);
        let mut second = second;
        assert!(second.pipeline_mut().entities().unwrap().get(1).is_none());
    }

    fn outcome(endpoint: EndpointType, data: &'static [u8]) -> PacketOutcome {
        PacketOutcome {
            endpoint,
            template: None,
            received: Some(Bytes::from_static(data)),
            sent: Some(Bytes::from_static(data)),
            arrived_at: Utc::now(),
            replaced: false,
            forwarded: true,
        }
    }

    #[test]
    fn test_traffic_trace_skips_hidden_packets() {
        let mut hiding = HidingConfig::new();
        hiding.hide(EndpointType::Client, vec![0xa0]);
        let trace = TrafficTrace {
            session: Uuid::new_v4(),
            hiding,
        };
        assert!(!trace.shows(&outcome(EndpointType::Client, &[0xa0, 1])));
        assert!(trace.shows(&outcome(EndpointType::Server, &[0xa0, 1])));
        assert!(trace.shows(&outcome(EndpointType::Client, &[0xa1])));
    }

    #[test]
    fn test_services_load_hiding_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hidden.bin");
        let mut hiding = HidingConfig::new();
        hiding.hide(EndpointType::Server, vec![0x0b, 0x01]);
        hiding.save(&path).unwrap();

        let config = RelayConfig {
            log_dir: dir.path().join("logs"),
            hiding_config: Some(path),
            ..RelayConfig::default()
        };
        let services = RelayServices::new(config).unwrap();
        assert_eq!(services.hiding, hiding);

        let config = RelayConfig {
            hiding_config: Some(dir.path().join("missing.bin")),
            ..RelayConfig::default()
        };
        assert!(RelayServices::new(config).is_err());
    }
}
