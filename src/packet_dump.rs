// CLI utility to dump decoded packets from a log file
// Usage: packet_dump <log_file> [--count N] [--definitions FILE] [--hiding FILE]

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use opcode_relay::entity::EntityCache;
use opcode_relay::hiding::HidingConfig;
use opcode_relay::packet_logger::PacketLog;
use opcode_relay::protocol::{load_definitions, Definitions, ProtocolResolvers};
use opcode_relay::registry::{MetaclassRegistry, SharedRegistry};
use opcode_relay::replay::{LogReplay, ReplayedPacket};
use opcode_relay::work::WorkQueue;
use serde_json::json;

struct Args {
    log_file: PathBuf,
    count: usize,
    definitions: Option<PathBuf>,
    hiding: Option<PathBuf>,
}

fn program_name(args: &[String]) -> &str {
    args.first().map_or("packet_dump", String::as_str)
}

fn parse_args() -> Result<Option<Args>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!(
            "Usage: {} <log_file> [--count N] [--definitions FILE] [--hiding FILE]",
            program_name(&args)
        );
        eprintln!("  log_file: Path to the log file to read");
        eprintln!("  --count N: Number of packets to dump (default: 10)");
        eprintln!("  --definitions FILE: YAML packet definitions used to decode fields");
        eprintln!("  --hiding FILE: Hiding config; matching packets are left out");
        return Ok(None);
    }

    let mut parsed = Args {
        log_file: PathBuf::from(&args[1]),
        count: 10,
        definitions: None,
        hiding: None,
    };
    let mut rest = args[2..].iter();
    while let Some(flag) = rest.next() {
        let value = rest.next().with_context(|| format!("Missing value for {}", flag))?;
        match flag.as_str() {
            "--count" | "-n" => {
                parsed.count = value
                    .parse()
                    .context("Invalid count value. Must be a positive integer.")?;
            }
            "--definitions" | "-d" => parsed.definitions = Some(PathBuf::from(value)),
            "--hiding" => parsed.hiding = Some(PathBuf::from(value)),
            other => eprintln!("Warning: ignoring unknown argument {}", other),
        }
    }
    Ok(Some(parsed))
}

fn packet_json(packet: &ReplayedPacket<'_>, started_at: i64) -> serde_json::Value {
    let entry = packet.entry;
    let data = entry.data();
    let time_str = DateTime::<Utc>::from_timestamp_millis(entry.timestamp)
        .unwrap_or_default()
        .format("%Y-%m-%d %H:%M:%S%.3f UTC")
        .to_string();

    let mut packet_json = json!({
        "index": packet.index,
        "endpoint": entry.endpoint.to_string(),
        "timestamp": entry.timestamp,
        "timestamp_formatted": time_str,
        "relative_time_ms": entry.timestamp - started_at,
        "size_bytes": data.len(),
        "injected": entry.received.is_none(),
        "dropped": entry.sent.is_none(),
        "replaced": entry.received.is_some() && entry.sent.is_some() && entry.received != entry.sent,
    });

    if let Some(template) = &packet.template {
        packet_json["packet_name"] = json!(template.name());
        packet_json["prefix"] = json!(hex::encode(template.prefix()));
    }
    match &packet.decoded {
        Some(Ok(decoded)) => {
            packet_json["decoded_fields"] = decoded.to_json();
            if decoded.trailing() > 0 {
                packet_json["trailing_bytes"] = json!(decoded.trailing());
            }
        }
        Some(Err(e)) => {
            packet_json["decoded_fields"] = e.partial.to_json();
            packet_json["decode_error"] = json!(e.to_string());
        }
        None => {}
    }

    let data_preview = if data.len() > 256 {
        format!("{}... (truncated, {} total bytes)", hex::encode(&data[..256]), data.len())
    } else {
        hex::encode(data)
    };
    packet_json["data_hex"] = json!(data_preview);
    packet_json
}

fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let Some(args) = parse_args()? else {
        std::process::exit(1);
    };

    let log = PacketLog::open(&args.log_file)
        .with_context(|| format!("Failed to read log file {}", args.log_file.display()))?;
    if !log.is_complete() {
        eprintln!("Warning: log was not finished, showing the packets that were recovered");
    }

    let version = log.header.protocol_version;
    let definitions = match &args.definitions {
        Some(path) => load_definitions(path)?,
        None => {
            eprintln!("Packets will be shown without field decoding.");
            Definitions::default()
        }
    };
    let resolvers = ProtocolResolvers::build(version, definitions);
    let hiding = match &args.hiding {
        Some(path) => HidingConfig::load(path)
            .with_context(|| format!("Failed to read hiding config {}", path.display()))?,
        None => HidingConfig::default(),
    };

    let registry = Arc::new(SharedRegistry::new(MetaclassRegistry::with_defaults()));
    let entities = EntityCache::new(Arc::new(WorkQueue::new("packet-dump").context("Failed to start work queue")?));
    let mut replay = LogReplay::new(&log, resolvers, registry, &entities).with_hiding(hiding);

    let started_at = log.header.started_at;
    let output_packets: Vec<_> = replay
        .by_ref()
        .take(args.count)
        .map(|packet| packet_json(&packet, started_at))
        .collect();

    // Output as pretty JSON
    let output = json!({
        "session_id": log.header.session_id.to_string(),
        "protocol_version": version.0,
        "client_addr": log.header.client_addr,
        "upstream_addr": log.header.upstream_addr,
        "complete": log.is_complete(),
        "total_packets": log.entries.len(),
        "hidden_packets": replay.hidden(),
        "packets_shown": output_packets.len(),
        "packets": output_packets,
    });

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_name_without_argv() {
        assert_eq!(program_name(&[]), "packet_dump");
        assert_eq!(program_name(&["dump".to_string()]), "dump");
    }
}
