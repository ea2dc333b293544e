//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

/// Start a node.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Node identity (overrides node.id).
    #[arg(long)]
    pub id: Option<String>,

    /// gRPC bind address (overrides node.bind).
    #[arg(long)]
    pub addr: Option<String>,

    /// Peers as id@host:port,id@host:port (replaces [[peers]]).
    #[arg(long)]
    pub peers: Option<String>,

    /// Stop the local loop after this many rounds.
    #[arg(long)]
    pub rounds: Option<u64>,

    /// Delay between acquisitions in milliseconds.
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Simulated critical-section work in milliseconds.
    #[arg(long)]
    pub hold_ms: Option<u64>,
}

impl StartArgs {
    /// Collect the flags as config overrides.
    pub fn overrides(&self, log_level: Option<String>) -> ConfigOverrides {
        ConfigOverrides {
            node_id: self.id.clone(),
            bind: self.addr.clone(),
            peers: self.peers.clone(),
            log_level,
            max_rounds: self.rounds,
            request_interval_ms: self.interval_ms,
            hold_duration_ms: self.hold_ms,
        }
    }
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
///
/// `RUST_LOG` takes precedence over the configured level.
#[cfg(feature = "telemetry")]
fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[cfg(not(feature = "telemetry"))]
fn init_tracing(_level: &str) {}

/// Load the config file when given, then apply overrides and validate.
///
/// Without a file the configuration is built from flags alone.
pub fn load_config(config_path: Option<&Path>, overrides: &ConfigOverrides) -> Result<Config> {
    match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let mut config: Config = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?;
            config.apply_overrides(overrides)?;
            config.validate()?;
            Ok(config)
        }
        None => Config::from_overrides(overrides),
    }
}

/// Run the start command.
pub async fn run_start(
    args: StartArgs,
    config_path: Option<PathBuf>,
    log_level: Option<String>,
) -> Result<()> {
    let overrides = args.overrides(log_level);
    let config = load_config(config_path.as_deref(), &overrides).with_context(|| match &config_path {
        Some(path) => format!("failed to load config from {:?}", path),
        None => "invalid command-line configuration".to_string(),
    })?;

    init_tracing(&config.telemetry.log_level);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_flags_override_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[node]
id = "node1"
bind = "127.0.0.1:50051"

[[peers]]
id = "node2"
addr = "127.0.0.1:50052"
"#
        )
        .unwrap();

        let args = StartArgs {
            addr: Some("127.0.0.1:6000".to_string()),
            rounds: Some(2),
            ..Default::default()
        };
        let config = load_config(Some(file.path()), &args.overrides(Some("debug".into()))).unwrap();

        assert_eq!(config.node.id, "node1");
        assert_eq!(config.node.bind, "127.0.0.1:6000");
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.scheduler.max_rounds, 2);
        assert_eq!(config.telemetry.log_level, "debug");
    }

    #[test]
    fn test_flags_only() {
        let args = StartArgs {
            id: Some("node1".to_string()),
            peers: Some("node2@127.0.0.1:50052".to_string()),
            ..Default::default()
        };
        let config = load_config(None, &args.overrides(None)).unwrap();
        assert_eq!(config.peers[0].id, "node2");
    }

    #[test]
    fn test_malformed_peer_flag() {
        let args = StartArgs {
            id: Some("node1".to_string()),
            peers: Some("node2-127.0.0.1:50052".to_string()),
            ..Default::default()
        };
        let err = load_config(None, &args.overrides(None)).unwrap_err();
        assert!(format!("{:#}", err).contains("id@host:port"));
    }
}
