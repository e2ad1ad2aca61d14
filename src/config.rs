// Relay configuration
// Read from a YAML file when one is given, then overridden from the environment

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::interception::KeyExchange;
use crate::protocol::DEFAULT_PROTOCOL_VERSION;
use crate::template::ProtocolVersion;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub protocol_version: ProtocolVersion,
    /// YAML packet definitions; without them every packet is undefined.
    pub definitions: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub hiding_config: Option<PathBuf>,
    /// How often queued injections are flushed when no traffic arrives.
    pub poll_interval_ms: u64,
    pub key_exchange: Option<KeyExchange>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7777)),
            upstream_addr: SocketAddr::from(([127, 0, 0, 1], 17777)),
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            definitions: None,
            log_dir: PathBuf::from("logs"),
            hiding_config: None,
            poll_interval_ms: 50,
            key_exchange: Some(KeyExchange {
                template: "KeyPacket".to_string(),
                field: "key".to_string(),
            }),
        }
    }
}

impl RelayConfig {
    /// Loads `path` if given (defaults otherwise) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        debug!(config = ?config, "Configuration loaded");
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("RELAY_LISTEN") {
            self.listen_addr = addr.parse().context("Invalid RELAY_LISTEN")?;
        }
        if let Some(addr) = lookup("RELAY_UPSTREAM") {
            self.upstream_addr = addr.parse().context("Invalid RELAY_UPSTREAM")?;
        }
        if let Some(version) = lookup("RELAY_PROTOCOL") {
            self.protocol_version = ProtocolVersion(version.parse().context("Invalid RELAY_PROTOCOL")?);
        }
        if let Some(dir) = lookup("RELAY_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "upstream_addr: 10.0.0.5:2106\nprotocol_version: 110\nkey_exchange: null").unwrap();

        let config = RelayConfig::from_file(file.path()).unwrap();
        assert_eq!(config.upstream_addr, "10.0.0.5:2106".parse().unwrap());
        assert_eq!(config.protocol_version, ProtocolVersion(110));
        assert_eq!(config.listen_addr, RelayConfig::default().listen_addr);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert!(config.key_exchange.is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [("RELAY_LISTEN", "127.0.0.1:9000"), ("RELAY_PROTOCOL", "152")]
            .into_iter()
            .collect();
        let mut config = RelayConfig::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.protocol_version, ProtocolVersion(152));
        assert_eq!(config.upstream_addr, RelayConfig::default().upstream_addr);
    }

    #[test]
    fn test_bad_override_is_reported() {
        let mut config = RelayConfig::default();
        let err = config
            .apply_overrides(|name| (name == "RELAY_UPSTREAM").then(|| "nowhere".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("RELAY_UPSTREAM"));
    }
}
