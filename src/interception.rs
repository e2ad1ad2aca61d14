// Per-connection packet lifecycle: decipher, decode, let interceptors decide,
// forward, notify.
//
// A pipeline is owned by one connection and processes its packets strictly in
// arrival order. Interceptors run synchronously on the connection task, so
// they must not block.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::cipher::SessionCipher;
use crate::entity::ContextHandle;
use crate::enumerator::{DecodedPacket, Enumerator, ReadOptions};
use crate::packet::{hex_dump, Decision, EndpointType, Injection, Packet, PacketStage};
use crate::protocol::ProtocolResolvers;
use crate::registry::{InterpretEnv, MetaclassRegistry, SharedRegistry};
use crate::template::PacketTemplate;

/// Logic that inspects a decoded packet and may drop, replace or inject.
///
/// Errors and panics are contained: the packet proceeds as if this
/// interceptor had not touched it.
pub trait PacketInterceptor: Send + Sync {
    fn intercept(&self, packet: &mut Packet, ctx: &InterceptContext<'_>) -> anyhow::Result<()>;
}

/// Observer of final packet outcomes, real and injected alike.
pub trait PacketListener: Send + Sync {
    fn on_outcome(&self, outcome: &PacketOutcome);
}

/// What an interceptor can see besides the packet.
pub struct InterceptContext<'a> {
    pub template: &'a Arc<PacketTemplate>,
    /// Decoded with modifiers applied; interpretations are computed on demand.
    pub decoded: &'a DecodedPacket,
    pub registry: &'a MetaclassRegistry,
    pub env: InterpretEnv<'a>,
}

impl InterceptContext<'_> {
    pub fn interpret(&self, alias: &str, index: usize) -> Option<JsonValue> {
        self.decoded.interpret(alias, index, self.registry, &self.env)
    }
}

/// Final record of one packet passing through the pipeline.
#[derive(Debug, Clone)]
pub struct PacketOutcome {
    /// Peer that sent (or appears to have sent) the packet.
    pub endpoint: EndpointType,
    pub template: Option<Arc<PacketTemplate>>,
    /// Deciphered bytes as received; `None` for injected packets.
    pub received: Option<Bytes>,
    /// Plain bytes forwarded; `None` when dropped.
    pub sent: Option<Bytes>,
    pub arrived_at: DateTime<Utc>,
    pub replaced: bool,
    pub forwarded: bool,
}

impl PacketOutcome {
    pub fn is_injected(&self) -> bool {
        self.received.is_none()
    }
}

/// Server packet carrying the cipher seed, and the byte field it is read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchange {
    pub template: String,
    pub field: String,
}

/// Out-of-band injection into a running pipeline.
#[derive(Clone)]
pub struct InjectionQueue {
    sender: mpsc::UnboundedSender<Injection>,
}

impl InjectionQueue {
    /// Returns false once the connection is gone.
    pub fn inject(&self, injection: Injection) -> bool {
        self.sender.send(injection).is_ok()
    }
}

/// Enciphered bytes ready to be written to `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub to: EndpointType,
    pub bytes: Bytes,
}

pub struct InterceptionPipeline {
    resolvers: ProtocolResolvers,
    registry: Arc<SharedRegistry>,
    entities: Option<ContextHandle>,
    interceptors: Vec<Arc<dyn PacketInterceptor>>,
    listeners: Vec<Arc<dyn PacketListener>>,
    cipher: SessionCipher,
    key_exchange: Option<KeyExchange>,
    injection_tx: mpsc::UnboundedSender<Injection>,
    injection_rx: mpsc::UnboundedReceiver<Injection>,
}

impl InterceptionPipeline {
    pub fn new(resolvers: ProtocolResolvers, registry: Arc<SharedRegistry>) -> Self {
        let (injection_tx, injection_rx) = mpsc::unbounded_channel();
        Self {
            resolvers,
            registry,
            entities: None,
            interceptors: Vec::new(),
            listeners: Vec::new(),
            cipher: SessionCipher::new(),
            key_exchange: None,
            injection_tx,
            injection_rx,
        }
    }

    pub fn with_entities(mut self, entities: ContextHandle) -> Self {
        self.entities = Some(entities);
        self
    }

    pub fn with_key_exchange(mut self, key_exchange: Option<KeyExchange>) -> Self {
        self.key_exchange = key_exchange;
        self
    }

    /// Interceptors run in registration order.
    pub fn add_interceptor(&mut self, interceptor: Arc<dyn PacketInterceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn add_listener(&mut self, listener: Arc<dyn PacketListener>) {
        self.listeners.push(listener);
    }

    pub fn injection_queue(&self) -> InjectionQueue {
        InjectionQueue {
            sender: self.injection_tx.clone(),
        }
    }

    pub fn cipher_enabled(&self) -> bool {
        self.cipher.is_enabled()
    }

    pub fn entities(&self) -> Option<&ContextHandle> {
        self.entities.as_ref()
    }

    /// Runs one wire packet from `from` through the pipeline and returns what
    /// must be written, in order.
    pub fn process(&mut self, from: EndpointType, wire: Bytes) -> Vec<Forward> {
        let mut body = BytesMut::from(&wire[..]);
        self.cipher.decipher_inbound(from, &mut body);
        let mut packet = Packet::new(from, body.freeze());

        let template = self.resolvers.for_sender(from).resolve(packet.original());
        let key_seed = match &template {
            Some(template) => self.decide(&mut packet, template),
            None => {
                debug!(endpoint = %from, dump = %hex_dump(packet.original()), "Packet too short to resolve");
                None
            }
        };
        packet.stage = if packet.outgoing().is_some() {
            PacketStage::Forwarding
        } else {
            PacketStage::Dropped
        };

        let mut forwards = Vec::new();
        let before = std::mem::take(&mut packet.before);
        let after = std::mem::take(&mut packet.after);
        for injection in before {
            self.emit_injection(injection, &mut forwards);
        }
        if let Some(outgoing) = packet.outgoing() {
            forwards.push(self.seal(from, outgoing));
            if let Some(seed) = key_seed {
                self.cipher.enable(&seed);
                info!("Key exchange observed, cipher enabled");
            }
        }

        // Listeners hear about the packet before anything injected after it.
        let outcome = PacketOutcome {
            endpoint: from,
            template,
            received: Some(packet.original().clone()),
            sent: packet.outgoing().cloned(),
            arrived_at: packet.arrived_at(),
            replaced: matches!(packet.decision(), Decision::Replace(_)),
            forwarded: packet.outgoing().is_some(),
        };
        self.notify(&outcome, None);
        packet.stage = PacketStage::Notified;

        for injection in after {
            self.emit_injection(injection, &mut forwards);
        }
        trace!(endpoint = %from, packet = ?packet, "Packet done");
        packet.stage = PacketStage::Done;
        forwards
    }

    /// Forwards a packet built by interception logic. It is not decoded or
    /// offered to interceptors.
    pub fn inject(&mut self, injection: Injection) -> Vec<Forward> {
        let mut forwards = Vec::new();
        self.emit_injection(injection, &mut forwards);
        forwards
    }

    /// Forwards everything queued through [`InjectionQueue`]s.
    pub fn drain_injections(&mut self) -> Vec<Forward> {
        let mut forwards = Vec::new();
        while let Ok(injection) = self.injection_rx.try_recv() {
            self.emit_injection(injection, &mut forwards);
        }
        forwards
    }

    /// Decodes the packet and runs the interceptors. Returns the cipher seed
    /// when this is the key exchange packet.
    fn decide(&self, packet: &mut Packet, template: &Arc<PacketTemplate>) -> Option<[u8; 8]> {
        packet.stage = PacketStage::Decoding;
        let registry = self.registry.snapshot();
        let mut env = InterpretEnv::new(self.resolvers.version());
        if let Some(entities) = &self.entities {
            env = env.with_entities(entities);
        }

        let enumerated = panic::catch_unwind(AssertUnwindSafe(|| {
            Enumerator::new(&registry, env)
                .with_options(ReadOptions::MODIFIED)
                .enumerate(template, packet.original())
        }));
        let decoded = match enumerated {
            Ok(Ok(decoded)) => decoded,
            Ok(Err(e)) => {
                warn!(
                    endpoint = %packet.endpoint(),
                    packet = %template,
                    error = %e,
                    dump = %hex_dump(packet.original()),
                    "Packet does not match its definition, forwarding unmodified"
                );
                return None;
            }
            Err(_) => {
                error!(
                    endpoint = %packet.endpoint(),
                    packet = %template,
                    dump = %hex_dump(packet.original()),
                    "Decoding panicked, forwarding unmodified"
                );
                return None;
            }
        };
        if decoded.trailing() > 0 && template.is_defined() {
            debug!(packet = %template, trailing = decoded.trailing(), "Definition left bytes unread");
        }

        packet.stage = PacketStage::AwaitingDecision;
        let ctx = InterceptContext {
            template,
            decoded: &decoded,
            registry: &registry,
            env,
        };
        for interceptor in &self.interceptors {
            let decision = packet.decision.clone();
            let (before, after) = (packet.before.len(), packet.after.len());
            let failure = match panic::catch_unwind(AssertUnwindSafe(|| interceptor.intercept(packet, &ctx))) {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(_) => Some("interceptor panicked".to_string()),
            };
            if let Some(reason) = failure {
                warn!(
                    endpoint = %packet.endpoint(),
                    packet = %template,
                    error = %reason,
                    dump = %hex_dump(packet.original()),
                    "Interceptor failed, discarding its changes"
                );
                packet.decision = decision;
                packet.before.truncate(before);
                packet.after.truncate(after);
            }
        }

        self.key_seed(packet.endpoint(), template, &decoded)
    }

    fn key_seed(&self, from: EndpointType, template: &PacketTemplate, decoded: &DecodedPacket) -> Option<[u8; 8]> {
        let exchange = self.key_exchange.as_ref()?;
        if from != EndpointType::Server || self.cipher.is_enabled() || template.name() != exchange.template {
            return None;
        }
        match decoded.bytes(&exchange.field) {
            Some(key) if key.len() >= 8 => {
                let mut seed = [0u8; 8];
                seed.copy_from_slice(&key[..8]);
                Some(seed)
            }
            _ => {
                error!(packet = %template, field = %exchange.field, "Key exchange packet has no usable key");
                None
            }
        }
    }

    fn seal(&mut self, from: EndpointType, body: &Bytes) -> Forward {
        let mut bytes = BytesMut::from(&body[..]);
        self.cipher.encipher_outbound(from, &mut bytes);
        Forward {
            to: from.opposite(),
            bytes: bytes.freeze(),
        }
    }

    fn emit_injection(&mut self, injection: Injection, forwards: &mut Vec<Forward>) {
        let Injection { from, body, origin } = injection;
        forwards.push(self.seal(from, &body));
        let outcome = PacketOutcome {
            endpoint: from,
            template: self.resolvers.for_sender(from).resolve(&body),
            received: None,
            sent: Some(body),
            arrived_at: Utc::now(),
            replaced: false,
            forwarded: true,
        };
        self.notify(&outcome, origin.as_deref());
    }

    fn notify(&self, outcome: &PacketOutcome, origin: Option<&dyn PacketListener>) {
        let listeners = self.listeners.iter().map(|l| l.as_ref()).chain(origin);
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener.on_outcome(outcome))).is_err() {
                error!(endpoint = %outcome.endpoint, "Packet listener panicked");
            }
        }
    }
}
