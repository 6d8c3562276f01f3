//! Configuration file parser for wormhole
//!
//! Supports wormhole.yml with multi-tunnel definitions for the `start`
//! subcommand.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use wormhole_shared::protocol::{Proto, MAX_NAME_SIZE};

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WormholeConfig {
    /// Rendezvous server address
    #[serde(default = "default_address")]
    pub address: String,

    /// Tunnel definitions
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

/// Single tunnel definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Subdomain to register
    pub name: String,

    /// Protocol: http or tcp
    #[serde(default = "default_proto")]
    pub proto: String,

    /// Local address to forward traffic to
    pub target_address: String,

    /// The local target speaks TLS (self-signed)
    #[serde(default)]
    pub target_tls: bool,

    /// Stream metrics for this tunnel
    #[serde(default)]
    pub metrics: bool,
}

impl TunnelConfig {
    pub fn proto(&self) -> Result<Proto> {
        match self.proto.as_str() {
            "http" => Ok(Proto::Http),
            "tcp" => Ok(Proto::Tcp),
            other => anyhow::bail!("invalid protocol '{}' for tunnel '{}'", other, self.name),
        }
    }
}

fn default_address() -> String {
    "wormhole.dyastin.dev:443".to_string()
}

fn default_proto() -> String {
    "http".to_string()
}

impl WormholeConfig {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: WormholeConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.tunnels.is_empty() {
            anyhow::bail!("no tunnels defined in configuration");
        }

        for tunnel in &self.tunnels {
            if tunnel.name.is_empty() {
                anyhow::bail!("tunnel name cannot be empty");
            }
            if tunnel.name.len() > MAX_NAME_SIZE {
                anyhow::bail!("tunnel name '{}' is too long", tunnel.name);
            }
            tunnel.proto()?;
            if tunnel.target_address.is_empty() {
                anyhow::bail!("no target address for tunnel '{}'", tunnel.name);
            }
        }

        Ok(())
    }

    /// Search for config file in standard locations
    pub fn find_config() -> Option<std::path::PathBuf> {
        let candidates = [
            "wormhole.yml",
            "wormhole.yaml",
            ".wormhole.yml",
            ".wormhole.yaml",
        ];

        // Check current directory
        for name in &candidates {
            let path = std::path::PathBuf::from(name);
            if path.exists() {
                return Some(path);
            }
        }

        // Check home directory
        if let Some(home) = dirs::home_dir() {
            for name in &candidates {
                let path = home.join(name);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
address: wormhole.example.net:443
tunnels:
  - name: api
    proto: http
    target_address: ":3000"
    metrics: true
  - name: db
    proto: tcp
    target_address: "127.0.0.1:5432"
"#;
        let config: WormholeConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.tunnels[0].name, "api");
        assert_eq!(config.tunnels[0].proto().unwrap(), Proto::Http);
        assert!(config.tunnels[0].metrics);
        assert_eq!(config.tunnels[1].proto().unwrap(), Proto::Tcp);
        assert!(!config.tunnels[1].target_tls);
    }

    #[test]
    fn test_rejects_unknown_proto() {
        let yaml = r#"
tunnels:
  - name: api
    proto: udp
    target_address: ":3000"
"#;
        let config: WormholeConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_tunnel_list() {
        let config: WormholeConfig = serde_yaml::from_str("address: x:443").unwrap();
        assert!(config.validate().is_err());
    }
}
