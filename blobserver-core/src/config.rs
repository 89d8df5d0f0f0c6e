//! Server configuration
//!
//! The launcher can load a JSON document describing flows to create at
//! startup; everything else has a working default.

use crate::error::{Error, Result};
use crate::OSC_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Control-plane transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Connectionless datagrams (the default).
    Udp,
    /// Length-prefixed stream framing.
    Tcp,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Udp
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Udp => write!(f, "udp"),
            Transport::Tcp => write!(f, "tcp"),
        }
    }
}

/// One source reference inside a startup flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: String,
    pub subsource: i32,
}

/// A flow to create at boot, applied through the same commands the
/// control plane uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Subscriber host.
    pub client: String,
    /// Subscriber port for the per-frame blob stream.
    pub port: u16,
    pub detector: String,
    pub sources: Vec<SourceConfig>,
    /// Start the flow immediately instead of waiting for `Start`.
    #[serde(default)]
    pub start: bool,
}

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_osc_port")]
    pub osc_port: u16,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default)]
    pub verbose: bool,
    /// Greyscale mask bound to every detector at flow creation.
    #[serde(default)]
    pub mask: Option<PathBuf>,
    /// Directory output segments are created in.
    #[serde(default = "default_shm_dir")]
    pub shm_dir: PathBuf,
    #[serde(default)]
    pub flows: Vec<FlowConfig>,
}

fn default_osc_port() -> u16 {
    OSC_PORT
}

fn default_shm_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            osc_port: default_osc_port(),
            transport: Transport::default(),
            verbose: false,
            mask: None,
            shm_dir: default_shm_dir(),
            flows: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: ServerConfig = serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.osc_port == 0 {
            return Err(Error::Config("osc_port must be non-zero".to_string()));
        }
        for flow in &self.flows {
            if flow.client.is_empty() {
                return Err(Error::Config("flow client host must not be empty".to_string()));
            }
            if flow.sources.is_empty() {
                return Err(Error::Config(format!(
                    "flow for {} declares no sources",
                    flow.client
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.osc_port, 9002);
        assert_eq!(config.transport, Transport::Udp);
        assert!(!config.verbose);
        assert!(config.flows.is_empty());
        assert_eq!(config.shm_dir, PathBuf::from("/tmp"));
    }

    #[test]
    fn test_config_parse_minimal() {
        let config: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.osc_port, 9002);
    }

    #[test]
    fn test_config_parse_flows() {
        let json = r#"{
            "transport": "tcp",
            "flows": [
                {
                    "client": "127.0.0.1",
                    "port": 10000,
                    "detector": "LightSpots",
                    "sources": [{"kind": "Pattern", "subsource": 0}],
                    "start": true
                }
            ]
        }"#;
        let config: ServerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.transport, Transport::Tcp);
        assert_eq!(config.flows.len(), 1);
        assert_eq!(config.flows[0].detector, "LightSpots");
        assert!(config.flows[0].start);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_rejects_zero_port() {
        let mut config = ServerConfig::default();
        config.osc_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_rejects_sourceless_flow() {
        let mut config = ServerConfig::default();
        config.flows.push(FlowConfig {
            client: "127.0.0.1".to_string(),
            port: 10000,
            detector: "LightSpots".to_string(),
            sources: vec![],
            start: false,
        });
        assert!(config.validate().is_err());
    }
}
