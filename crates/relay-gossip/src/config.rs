//! Startup configuration for the bridge and client.
//!
//! Plain serde structs; callers load them however they like. Every struct
//! validates itself before anything touches the network or the disk.

use crate::error::{Error, Result};
use relay_p2p::{parse_multiaddr, Multiaddr, TransportConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default listen address for relay nodes.
pub const DEFAULT_LISTEN_ADDR: &str = "/ip4/0.0.0.0/tcp/44544";

/// File name of the identity key inside the data directory.
pub const IDENTITY_FILE: &str = "identity.key";

/// Where the bridge reads rounds from.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Host (and optional port) of the beacon source, e.g. `api.example.org`.
    pub address: String,
    /// Talk plain HTTP instead of HTTPS.
    pub insecure: bool,
    /// Extra PEM root certificate to trust.
    pub cert_path: Option<PathBuf>,
    /// How often to ask the source for a new round, in milliseconds.
    pub poll_interval_ms: u64,
    /// Per-request timeout, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            insecure: false,
            cert_path: None,
            poll_interval_ms: 1_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl SourceConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::Config("source address is empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("source poll interval must be positive".into()));
        }
        Ok(())
    }
}

/// Reconnect delays after a source stream error.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay_ms == 0 {
            return Err(Error::Config("backoff initial delay must be positive".into()));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(Error::Config(format!(
                "backoff max delay {}ms is below initial delay {}ms",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(Error::Config("backoff multiplier must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(Error::Config("backoff jitter must be within [0, 1]".into()));
        }
        Ok(())
    }
}

/// Everything a relay bridge node needs to start.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipRelayConfig {
    /// Chain to relay. Determines the topic and the verification key.
    pub chain_id: String,
    /// Multiaddresses of peers to dial at startup.
    #[serde(default)]
    pub peer_with: Vec<String>,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Holds the peer datastore and, unless overridden, the identity key.
    pub data_dir: PathBuf,
    /// Identity key location. Defaults to `identity.key` in `data_dir`.
    #[serde(default)]
    pub identity_path: Option<PathBuf>,
    pub source: SourceConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

impl GossipRelayConfig {
    pub fn new(
        chain_id: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        source: SourceConfig,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            peer_with: Vec::new(),
            listen_addr: default_listen_addr(),
            data_dir: data_dir.into(),
            identity_path: None,
            source,
            backoff: BackoffConfig::default(),
            transport: TransportConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chain_id.is_empty() {
            return Err(Error::Config("chain id is empty".into()));
        }
        parse_multiaddr(&self.listen_addr).map_err(|e| Error::Config(e.to_string()))?;
        self.bootstrap_peers()?;
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::Config("data directory is empty".into()));
        }
        self.source.validate()?;
        self.backoff.validate()?;
        self.transport.validate().map_err(Error::Config)
    }

    /// `peer_with` parsed into multiaddresses.
    pub fn bootstrap_peers(&self) -> Result<Vec<Multiaddr>> {
        self.peer_with
            .iter()
            .map(|addr| parse_multiaddr(addr).map_err(|e| Error::Config(e.to_string())))
            .collect()
    }

    pub fn identity_path(&self) -> PathBuf {
        self.identity_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(IDENTITY_FILE))
    }
}

/// Client settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    pub chain_id: String,
    /// Rounds buffered per watcher. When full, new rounds are dropped for that watcher.
    #[serde(default = "default_watch_buffer")]
    pub watch_buffer: usize,
}

fn default_watch_buffer() -> usize {
    64
}

impl ClientConfig {
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            watch_buffer: default_watch_buffer(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chain_id.is_empty() {
            return Err(Error::Config("chain id is empty".into()));
        }
        if self.watch_buffer == 0 {
            return Err(Error::Config("watch buffer must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_config() -> GossipRelayConfig {
        GossipRelayConfig::new("test", "/tmp/relay", SourceConfig::new("localhost:8080"))
    }

    #[test]
    fn test_valid_config() {
        assert!(relay_config().validate().is_ok());
        assert!(ClientConfig::new("test").validate().is_ok());
    }

    #[test]
    fn test_empty_chain_id_rejected() {
        let config = GossipRelayConfig {
            chain_id: String::new(),
            ..relay_config()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(matches!(ClientConfig::new("").validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_multiaddr_rejected() {
        let mut config = relay_config();
        config.peer_with = vec!["127.0.0.1:9000".into()];
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = relay_config();
        config.listen_addr = "nowhere".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_empty_source_rejected() {
        let mut config = relay_config();
        config.source.address = "  ".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let backoff = BackoffConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 10,
            ..BackoffConfig::default()
        };
        assert!(backoff.validate().is_err());
        let backoff = BackoffConfig {
            jitter: 1.5,
            ..BackoffConfig::default()
        };
        assert!(backoff.validate().is_err());
    }

    #[test]
    fn test_identity_path_defaults_to_data_dir() {
        let config = relay_config();
        assert_eq!(config.identity_path(), PathBuf::from("/tmp/relay/identity.key"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = r#"{
            "chain_id": "test",
            "data_dir": "/var/lib/relay",
            "source": { "address": "api.example.org", "insecure": true }
        }"#;
        let config: GossipRelayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert!(config.source.insecure);
        assert_eq!(config.source.poll_interval_ms, 1_000);
        assert!(config.validate().is_ok());

        let client: ClientConfig = serde_json::from_str(r#"{"chain_id":"test"}"#).unwrap();
        assert_eq!(client.watch_buffer, 64);
    }
}
