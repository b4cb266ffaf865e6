//! Node and mesh configuration
//!
//! Both structs have working defaults and can be loaded from a JSON file;
//! command-line flags override individual fields afterwards.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Timing and cost parameters of the mesh protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Window in which routing changes are coalesced into one summary wave
    pub broadcast_debounce_ms: u64,
    /// Interval between latency probes to a random peer
    pub probe_interval_ms: u64,
    /// Default deadline of a reliable send
    pub message_timeout_ms: u64,
    /// How long synchronized state of an unavailable node is kept
    pub sync_grace_ms: u64,
    /// Hop budget of routed packets
    pub max_hops: u8,
    /// Link cost used until the first probe answer arrives
    pub default_link_cost: u32,
    /// Deadline for the authentication handshake of a new connection
    pub handshake_timeout_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            broadcast_debounce_ms: 100,
            probe_interval_ms: 30_000,
            message_timeout_ms: 30_000,
            sync_grace_ms: 10_000,
            max_hops: 16,
            default_link_cost: 100,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl MeshConfig {
    pub fn broadcast_debounce(&self) -> Duration {
        Duration::from_millis(self.broadcast_debounce_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn sync_grace(&self) -> Duration {
        Duration::from_millis(self.sync_grace_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_hops == 0 {
            return Err(ConfigError::Invalid {
                field: "max_hops",
                reason: "must be at least 1".into(),
            });
        }
        if self.default_link_cost == 0 {
            return Err(ConfigError::Invalid {
                field: "default_link_cost",
                reason: "must be at least 1".into(),
            });
        }
        if self.probe_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "probe_interval_ms",
                reason: "must be non-zero".into(),
            });
        }
        Ok(())
    }
}

/// Federator node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Port to listen on for mesh connections
    pub port: u16,
    /// Peers to dial at startup (host:port)
    pub bootstrap_peers: Vec<String>,
    /// File holding the hex-encoded federator private key
    pub key_file: PathBuf,
    /// JSON list of authorized federator addresses
    pub registry_file: PathBuf,
    /// Directory for persisted local state
    pub data_dir: PathBuf,
    /// Port of the status API, disabled when `None`
    pub api_port: Option<u16>,
    pub mesh: MeshConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 9030,
            bootstrap_peers: Vec::new(),
            key_file: PathBuf::from("federator.key"),
            registry_file: PathBuf::from("federators.json"),
            data_dir: PathBuf::from(".federator_data"),
            api_port: None,
            mesh: MeshConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load a config file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&data)?;
        config.mesh.validate()?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.broadcast_debounce(), Duration::from_millis(100));
        assert_eq!(config.probe_interval(), Duration::from_secs(30));
        assert_eq!(config.message_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        fs::write(
            &path,
            r#"{"port": 9100, "mesh": {"message_timeout_ms": 500}}"#,
        )
        .unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.mesh.message_timeout_ms, 500);
        assert_eq!(config.mesh.broadcast_debounce_ms, 100);
        assert!(config.bootstrap_peers.is_empty());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        fs::write(&path, r#"{"mesh": {"max_hops": 0}}"#).unwrap();
        assert!(matches!(
            NodeConfig::load(&path),
            Err(ConfigError::Invalid { field: "max_hops", .. })
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let mut config = NodeConfig::default();
        config.bootstrap_peers = vec!["127.0.0.1:9031".into()];
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path).unwrap();
        assert_eq!(loaded.bootstrap_peers, config.bootstrap_peers);
        assert_eq!(loaded.mesh, config.mesh);
    }
}
