// The unit of interception: one complete wire packet and what to do with it.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecisionError;
use crate::interception::PacketListener;

/// Which peer sent a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EndpointType {
    Client,
    Server,
}

impl EndpointType {
    pub fn opposite(self) -> Self {
        match self {
            EndpointType::Client => EndpointType::Server,
            EndpointType::Server => EndpointType::Client,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            EndpointType::Client => 0,
            EndpointType::Server => 1,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(EndpointType::Client),
            1 => Some(EndpointType::Server),
            _ => None,
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointType::Client => f.write_str("client"),
            EndpointType::Server => f.write_str("server"),
        }
    }
}

/// Lifecycle position of a packet inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStage {
    Received,
    Decoding,
    AwaitingDecision,
    Forwarding,
    Dropped,
    Notified,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Undecided,
    Forward,
    Replace(Bytes),
    Drop,
}

impl Decision {
    fn label(&self) -> &'static str {
        match self {
            Decision::Undecided => "undecided",
            Decision::Forward => "forward",
            Decision::Replace(_) => "replace",
            Decision::Drop => "drop",
        }
    }
}

/// A packet synthesized by interception logic rather than read from the wire.
#[derive(Clone)]
pub struct Injection {
    /// Peer the packet appears to come from; it is sent to the other one.
    pub from: EndpointType,
    pub body: Bytes,
    /// Listener told about this packet's outcome in addition to the registered ones.
    pub origin: Option<Arc<dyn PacketListener>>,
}

impl Injection {
    pub fn new(from: EndpointType, body: impl Into<Bytes>) -> Self {
        Self {
            from,
            body: body.into(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: Arc<dyn PacketListener>) -> Self {
        self.origin = Some(origin);
        self
    }
}

impl fmt::Debug for Injection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injection")
            .field("from", &self.from)
            .field("body", &hex_dump(&self.body))
            .finish()
    }
}

/// One received packet under interception.
///
/// The received bytes are never modified; changes are expressed through the
/// decision and injections.
pub struct Packet {
    endpoint: EndpointType,
    original: Bytes,
    arrived_at: DateTime<Utc>,
    pub(crate) stage: PacketStage,
    pub(crate) decision: Decision,
    pub(crate) before: Vec<Injection>,
    pub(crate) after: Vec<Injection>,
}

impl Packet {
    pub fn new(endpoint: EndpointType, original: Bytes) -> Self {
        Self {
            endpoint,
            original,
            arrived_at: Utc::now(),
            stage: PacketStage::Received,
            decision: Decision::Undecided,
            before: Vec::new(),
            after: Vec::new(),
        }
    }

    pub fn endpoint(&self) -> EndpointType {
        self.endpoint
    }

    /// Bytes as received (deciphered), opcode included.
    pub fn original(&self) -> &Bytes {
        &self.original
    }

    pub fn arrived_at(&self) -> DateTime<Utc> {
        self.arrived_at
    }

    pub fn stage(&self) -> PacketStage {
        self.stage
    }

    pub fn decision(&self) -> &Decision {
        &self.decision
    }

    pub fn is_decided(&self) -> bool {
        self.decision != Decision::Undecided
    }

    fn decide(&mut self, decision: Decision) -> Result<(), DecisionError> {
        if self.is_decided() {
            return Err(DecisionError(self.decision.label()));
        }
        self.decision = decision;
        Ok(())
    }

    pub fn drop_packet(&mut self) -> Result<(), DecisionError> {
        self.decide(Decision::Drop)
    }

    /// Forwards `body` (opcode included) instead of the received bytes.
    pub fn replace(&mut self, body: impl Into<Bytes>) -> Result<(), DecisionError> {
        self.decide(Decision::Replace(body.into()))
    }

    pub fn forward_unmodified(&mut self) -> Result<(), DecisionError> {
        self.decide(Decision::Forward)
    }

    pub fn inject_before(&mut self, injection: Injection) {
        self.before.push(injection);
    }

    pub fn inject_after(&mut self, injection: Injection) {
        self.after.push(injection);
    }

    /// Bytes that will be forwarded, or `None` if the packet is dropped.
    pub fn outgoing(&self) -> Option<&Bytes> {
        match &self.decision {
            Decision::Drop => None,
            Decision::Replace(body) => Some(body),
            Decision::Undecided | Decision::Forward => Some(&self.original),
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("endpoint", &self.endpoint)
            .field("stage", &self.stage)
            .field("decision", &self.decision.label())
            .field("original", &hex_dump(&self.original))
            .finish()
    }
}

/// Upper-case hex with a byte count, for diagnostics.
pub fn hex_dump(data: &[u8]) -> String {
    const MAX: usize = 256;
    if data.len() > MAX {
        format!("{}... ({} bytes)", hex::encode_upper(&data[..MAX]), data.len())
    } else {
        format!("{} ({} bytes)", hex::encode_upper(data), data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_decision_wins() {
        let mut packet = Packet::new(EndpointType::Client, Bytes::from_static(&[0x01, 0x02]));
        packet.drop_packet().unwrap();
        assert_eq!(packet.replace(Bytes::from_static(&[0x09])), Err(DecisionError("drop")));
        assert_eq!(packet.decision(), &Decision::Drop);
        assert!(packet.outgoing().is_none());
    }

    #[test]
    fn test_replacement_keeps_original() {
        let mut packet = Packet::new(EndpointType::Server, Bytes::from_static(&[0x01, 0x02]));
        packet.replace(vec![0x01, 0x03]).unwrap();
        assert_eq!(packet.outgoing().unwrap().as_ref(), &[0x01, 0x03]);
        assert_eq!(packet.original().as_ref(), &[0x01, 0x02]);
    }

    #[test]
    fn test_endpoint_codes() {
        for endpoint in [EndpointType::Client, EndpointType::Server] {
            assert_eq!(EndpointType::from_u8(endpoint.as_u8()), Some(endpoint));
        }
        assert_eq!(EndpointType::from_u8(7), None);
        assert_eq!(EndpointType::Client.opposite(), EndpointType::Server);
    }

    #[test]
    fn test_hex_dump_truncates() {
        assert_eq!(hex_dump(&[0xfe, 0x02]), "FE02 (2 bytes)");
        assert!(hex_dump(&[0u8; 300]).ends_with("... (300 bytes)"));
    }
}
