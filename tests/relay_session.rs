use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use opcode_relay::cipher::CipherState;
use opcode_relay::config::RelayConfig;
use opcode_relay::interception::Forward;
use opcode_relay::packet_logger::PacketLog;
use opcode_relay::replay::LogReplay;
use opcode_relay::session::{RelayServices, RelaySession};
use opcode_relay::{EndpointType, Injection, InterceptContext, Packet, PacketInterceptor};

const DEFINITIONS: &str = r#"
client:
  - name: Say
    prefix: "49"
    script:
      - node: field
        alias: text
        kind: { type: text, encoding: utf16_le, length: nul_terminated }
server:
  - name: KeyPacket
    prefix: "2E"
    script:
      - node: field
        alias: ok
        kind: { type: integer, width: w8 }
      - node: field
        alias: key
        kind: { type: bytes, length: { fixed: 8 } }
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

const SEED: [u8; 8] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88];

fn utf16z(text: &str) -> Vec<u8> {
    let mut out: Vec<u8> = text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    out.extend_from_slice(&[0, 0]);
    out
}

fn say(text: &str) -> Vec<u8> {
    let mut body = vec![0x49];
    body.extend(utf16z(text));
    body
}

/// Greets every character that appears and silences one phrase.
struct Greeter;

impl PacketInterceptor for Greeter {
    fn intercept(&self, packet: &mut Packet, ctx: &InterceptContext<'_>) -> anyhow::Result<()> {
        match ctx.template.name() {
            "CharInfo" => {
                let name = ctx.decoded.text("name").context("character without a name")?;
                packet.inject_after(Injection::new(EndpointType::Client, say(&format!("hi {}", name))));
            }
            "Say" if ctx.decoded.text("text") == Some("drop me") => packet.drop_packet()?,
            _ => {}
        }
        Ok(())
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

#[test]
fn test_session_ciphers_intercepts_logs_and_replays() {
    let dir = tempfile::tempdir().unwrap();
    let definitions = dir.path().join("definitions.yml");
    std::fs::write(&definitions, DEFINITIONS).unwrap();

    let config = RelayConfig {
        definitions: Some(definitions),
        log_dir: dir.path().join("logs"),
        ..RelayConfig::default()
    };
    let mut services = RelayServices::new(config).unwrap();
    services.add_interceptor(Arc::new(Greeter));
    let mut session = RelaySession::new(&services, addr(40000), addr(7777)).unwrap();

    // The key packet itself travels in the clear.
    let mut key_packet = vec![0x2e, 0x01];
    key_packet.extend_from_slice(&SEED);
    let forwards = session.process(EndpointType::Server, Bytes::from(key_packet.clone()));
    assert_eq!(
        forwards,
        vec![Forward { to: EndpointType::Client, bytes: Bytes::from(key_packet.clone()) }]
    );
    assert!(session.pipeline_mut().cipher_enabled());

    let mut server_out = CipherState::from_seed(&SEED);
    let mut server_in = CipherState::from_seed(&SEED);
    let mut client_out = CipherState::from_seed(&SEED);

    let mut char_info = vec![0x31, 0x2a, 0, 0, 0];
    char_info.extend(utf16z("Owl"));
    let mut wire = char_info.clone();
    server_out.encipher(&mut wire);
    let forwards = session.process(EndpointType::Server, Bytes::from(wire.clone()));
    assert_eq!(forwards.len(), 2);
    // Unmodified traffic is re-enciphered to the same bytes.
    assert_eq!(forwards[0], Forward { to: EndpointType::Client, bytes: Bytes::from(wire) });
    assert_eq!(forwards[1].to, EndpointType::Server);
    let mut injected = forwards[1].bytes.to_vec();
    server_in.decipher(&mut injected);
    assert_eq!(injected, say("hi Owl"));

    let entity = session.pipeline_mut().entities().unwrap().get(42).unwrap();
    assert_eq!(entity.state().name.as_deref(), Some("Owl"));
    assert_eq!(entity.state().kind.as_deref(), Some("CharInfo"));

    let mut silenced = say("drop me");
    client_out.encipher(&mut silenced);
    assert!(session.process(EndpointType::Client, Bytes::from(silenced)).is_empty());

    let path = session.finish().unwrap().unwrap();
    assert!(services.entities.queue().flush(Duration::from_secs(2)));
    assert_eq!(services.entities.teardowns(), 1);

    let log = PacketLog::open(&path).unwrap();
    assert!(log.is_complete());
    assert_eq!(log.footer.as_ref().unwrap().packet_count, 4);
    let kinds: Vec<_> = log
        .entries
        .iter()
        .map(|e| (e.endpoint, e.received.is_some(), e.sent.is_some()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (EndpointType::Server, true, true),
            (EndpointType::Server, true, true),
            (EndpointType::Client, false, true),
            (EndpointType::Client, true, false),
        ]
    );
    // Logged bytes are deciphered.
    assert_eq!(log.entries[1].data(), char_info.as_slice());
    assert_eq!(log.entries[3].data(), say("drop me").as_slice());

    let resolvers = services.catalog.resolvers(log.header.protocol_version).unwrap();
    let replayed: Vec<_> = LogReplay::new(&log, resolvers, Arc::clone(&services.registry), &services.entities)
        .map(|p| {
            let name = p.template.map(|t| t.name().to_string());
            let decoded = p.decoded.map(|d| d.unwrap().to_json());
            (name, decoded)
        })
        .collect();
    assert_eq!(replayed.len(), 4);
    assert_eq!(replayed[1].1.as_ref().unwrap()["name"], "Owl");
    assert_eq!(replayed[2].0.as_deref(), Some("Say"));
    assert_eq!(replayed[2].1.as_ref().unwrap()["text"], "hi Owl");
}
