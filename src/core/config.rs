//! Configuration parsing and validation.
//!
//! Configuration is loaded from a TOML file and/or CLI flags; flags override
//! file values. A node needs its own identity and bind address plus the
//! static list of every other participant.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// This node.
    #[serde(default)]
    pub node: NodeConfig,

    /// Every other participant.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Local scheduling loop.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Outbound connection behavior.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Identity and listen address of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity, unique in the peer set.
    #[serde(default)]
    pub id: String,

    /// gRPC bind address (e.g., "127.0.0.1:50051").
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            bind: default_bind(),
        }
    }
}

/// One remote participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: String,
    /// `host:port` of the peer's gRPC listener.
    pub addr: String,
}

impl PeerConfig {
    /// Parse an `id@host:port` entry.
    pub fn parse(entry: &str) -> Result<Self> {
        let entry = entry.trim();
        let (id, addr) = entry
            .split_once('@')
            .with_context(|| format!("invalid peer format (expected id@host:port): {}", entry))?;
        if id.is_empty() || addr.is_empty() || addr.contains('@') {
            anyhow::bail!("invalid peer format (expected id@host:port): {}", entry);
        }
        Ok(Self {
            id: id.to_string(),
            addr: addr.to_string(),
        })
    }

    /// Parse a comma-separated list of `id@host:port` entries.
    pub fn parse_list(list: &str) -> Result<Vec<Self>> {
        list.split(',')
            .filter(|entry| !entry.trim().is_empty())
            .map(Self::parse)
            .collect()
    }
}

/// Local scheduling loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Delay between acquisitions in milliseconds.
    #[serde(default = "default_request_interval_ms")]
    pub request_interval_ms: u64,

    /// Simulated critical-section work in milliseconds.
    #[serde(default = "default_hold_duration_ms")]
    pub hold_duration_ms: u64,

    /// Stop after this many rounds; 0 runs until shutdown.
    #[serde(default)]
    pub max_rounds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            request_interval_ms: default_request_interval_ms(),
            hold_duration_ms: default_hold_duration_ms(),
            max_rounds: 0,
        }
    }
}

/// Outbound connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-RPC deadline in milliseconds; 0 means no deadline.
    #[serde(default)]
    pub request_timeout_ms: u64,

    /// Eager connection attempts per peer at startup.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Retries of a failed RPC; 0 disables retry.
    #[serde(default)]
    pub retry_max_attempts: u32,

    /// First retry delay in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Maximum retry delay in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: 0,
            connect_attempts: default_connect_attempts(),
            retry_max_attempts: 0,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_bind() -> String {
    "127.0.0.1:50051".to_string()
}

fn default_request_interval_ms() -> u64 {
    1_000
}

fn default_hold_duration_ms() -> u64 {
    2_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_connect_attempts() -> u32 {
    10
}

fn default_retry_base_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from CLI flags alone.
    pub fn from_overrides(overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = Config::default();
        config.apply_overrides(overrides)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) -> Result<()> {
        if let Some(ref id) = overrides.node_id {
            self.node.id = id.clone();
        }
        if let Some(ref bind) = overrides.bind {
            self.node.bind = bind.clone();
        }
        if let Some(ref peers) = overrides.peers {
            self.peers = PeerConfig::parse_list(peers)?;
        }
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(rounds) = overrides.max_rounds {
            self.scheduler.max_rounds = rounds;
        }
        if let Some(interval) = overrides.request_interval_ms {
            self.scheduler.request_interval_ms = interval;
        }
        if let Some(hold) = overrides.hold_duration_ms {
            self.scheduler.hold_duration_ms = hold;
        }
        Ok(())
    }

    /// Parsed bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.node
            .bind
            .parse()
            .with_context(|| format!("node.bind is not a socket address: {}", self.node.bind))
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_node()?;
        self.validate_peers()?;
        self.validate_scheduler()?;
        self.validate_transport()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_node(&self) -> Result<()> {
        if self.node.id.trim().is_empty() {
            anyhow::bail!("node.id is required");
        }
        self.bind_addr()?;
        Ok(())
    }

    fn validate_peers(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id.trim().is_empty() {
                anyhow::bail!("peers[].id must not be empty");
            }
            if peer.id == self.node.id {
                anyhow::bail!("peer id {} is this node's own id", peer.id);
            }
            if !seen.insert(peer.id.as_str()) {
                anyhow::bail!("duplicate peer id: {}", peer.id);
            }
            match peer.addr.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
                _ => anyhow::bail!(
                    "peer {} address must be host:port, got: {}",
                    peer.id,
                    peer.addr
                ),
            }
        }
        Ok(())
    }

    fn validate_scheduler(&self) -> Result<()> {
        if self.scheduler.request_interval_ms == 0 {
            anyhow::bail!("scheduler.request_interval_ms must be > 0");
        }
        Ok(())
    }

    fn validate_transport(&self) -> Result<()> {
        if self.transport.retry_base_delay_ms > self.transport.retry_max_delay_ms {
            anyhow::bail!(
                "retry_base_delay_ms ({}) cannot exceed retry_max_delay_ms ({})",
                self.transport.retry_base_delay_ms,
                self.transport.retry_max_delay_ms
            );
        }
        if self.transport.connect_attempts == 0 {
            anyhow::bail!("transport.connect_attempts must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override node identity.
    pub node_id: Option<String>,
    /// Override bind address.
    pub bind: Option<String>,
    /// Replace the peer list (`id@host:port,...`).
    pub peers: Option<String>,
    /// Override log level.
    pub log_level: Option<String>,
    /// Override the number of rounds.
    pub max_rounds: Option<u64>,
    /// Override the request interval.
    pub request_interval_ms: Option<u64>,
    /// Override the simulated hold duration.
    pub hold_duration_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREE_NODES: &str = r#"
[node]
id = "node1"
bind = "127.0.0.1:50051"

[[peers]]
id = "node2"
addr = "127.0.0.1:50052"

[[peers]]
id = "node3"
addr = "localhost:50053"
"#;

    #[test]
    fn test_parse_with_defaults() {
        let config = Config::from_toml(THREE_NODES).unwrap();
        assert_eq!(config.node.id, "node1");
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.scheduler.request_interval_ms, 1_000);
        assert_eq!(config.scheduler.hold_duration_ms, 2_000);
        assert_eq!(config.transport.retry_max_attempts, 0);
        assert_eq!(config.telemetry.log_level, "info");
    }

    #[test]
    fn test_peer_entry_parsing() {
        let peer = PeerConfig::parse("node2@127.0.0.1:50052").unwrap();
        assert_eq!(peer.id, "node2");
        assert_eq!(peer.addr, "127.0.0.1:50052");

        assert!(PeerConfig::parse("node2").is_err());
        assert!(PeerConfig::parse("@127.0.0.1:1").is_err());
        assert!(PeerConfig::parse("a@b@c").is_err());

        let peers = PeerConfig::parse_list("a@h:1, b@h:2,").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].id, "b");
    }

    #[test]
    fn test_overrides_replace_values() {
        let mut config = Config::from_toml(THREE_NODES).unwrap();
        config
            .apply_overrides(&ConfigOverrides {
                node_id: Some("nodeX".to_string()),
                peers: Some("node9@127.0.0.1:9".to_string()),
                max_rounds: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.node.id, "nodeX");
        assert_eq!(config.peers, vec![PeerConfig::parse("node9@127.0.0.1:9").unwrap()]);
        assert_eq!(config.scheduler.max_rounds, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_overrides_requires_id() {
        assert!(Config::from_overrides(&ConfigOverrides::default()).is_err());

        let config = Config::from_overrides(&ConfigOverrides {
            node_id: Some("solo".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(config.peers.is_empty());
        assert_eq!(config.node.bind, "127.0.0.1:50051");
    }

    #[test]
    fn test_rejects_self_and_duplicate_peers() {
        let self_peer = r#"
[node]
id = "node1"

[[peers]]
id = "node1"
addr = "127.0.0.1:1"
"#;
        let err = Config::from_toml(self_peer).unwrap_err();
        assert!(err.to_string().contains("own id"));

        let duplicate = r#"
[node]
id = "node1"

[[peers]]
id = "node2"
addr = "127.0.0.1:1"

[[peers]]
id = "node2"
addr = "127.0.0.1:2"
"#;
        let err = Config::from_toml(duplicate).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_rejects_bad_addresses() {
        let bad_bind = r#"
[node]
id = "node1"
bind = "not-an-address"
"#;
        assert!(Config::from_toml(bad_bind).is_err());

        let bad_peer = r#"
[node]
id = "node1"

[[peers]]
id = "node2"
addr = "127.0.0.1"
"#;
        let err = Config::from_toml(bad_peer).unwrap_err();
        assert!(err.to_string().contains("host:port"));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let config = r#"
[node]
id = "node1"

[transport]
retry_base_delay_ms = 10000
retry_max_delay_ms = 10
"#;
        let err = Config::from_toml(config).unwrap_err();
        assert!(err.to_string().contains("retry_base_delay_ms"));
    }
}
