//! Config command implementation.

use crate::core::config::{Config, PeerConfig};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Config file used when `--config` is not given.
const DEFAULT_CONFIG_PATH: &str = "config/ramutex.toml";

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate,
    /// Print configuration with defaults.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
    /// Generate a configuration for one node of a local cluster.
    Generate {
        /// Node identity to generate for.
        #[arg(long, default_value = "node1")]
        id: String,
        /// Cluster size; nodes are named node1..nodeN.
        #[arg(long, default_value_t = 3)]
        nodes: u16,
        /// Port of node1; nodeK listens on base_port + K - 1.
        #[arg(long, default_value_t = 50051)]
        base_port: u16,
        /// Output file path.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs, config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    match args.command {
        ConfigCommand::Validate => validate_config(&path),
        ConfigCommand::Show { format } => show_config(&path, &format),
        ConfigCommand::Generate {
            id,
            nodes,
            base_port,
            output,
        } => {
            let template = generate_config(&id, nodes, base_port)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &template)
                        .with_context(|| format!("failed to write {:?}", path))?;
                    println!("Generated config for {}: {:?}", id, path);
                }
                None => println!("{}", template),
            }
            Ok(())
        }
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }

    let config = Config::from_file(path)?;
    println!("✓ Configuration is valid");
    println!("  node:  {} on {}", config.node.id, config.node.bind);
    if config.peers.is_empty() {
        println!("  ⚠ Warning: no peers configured, node runs alone");
    }
    for peer in &config.peers {
        println!("  peer:  {} at {}", peer.id, peer.addr);
    }
    if config.transport.retry_max_attempts == 0 {
        println!("  note:  retry disabled, an unreachable peer stalls acquisitions");
    }
    Ok(())
}

fn show_config(path: &Path, format: &str) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }

    let config = Config::from_file(path)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        "toml" => println!("{}", toml::to_string_pretty(&config)?),
        other => anyhow::bail!("unknown format {:?} (expected toml or json)", other),
    }
    Ok(())
}

/// Render a TOML config for `id` in a cluster of `nodes` local nodes.
pub fn generate_config(id: &str, nodes: u16, base_port: u16) -> Result<String> {
    if nodes == 0 {
        anyhow::bail!("--nodes must be at least 1");
    }
    let port_of = |index: u16| {
        base_port
            .checked_add(index)
            .with_context(|| format!("port overflow for node{}", index + 1))
    };

    let mut config = Config::default();
    let mut found = false;
    for index in 0..nodes {
        let name = format!("node{}", index + 1);
        let addr = format!("127.0.0.1:{}", port_of(index)?);
        if name == id {
            found = true;
            config.node.id = name;
            config.node.bind = addr;
        } else {
            config.peers.push(PeerConfig { id: name, addr });
        }
    }
    if !found {
        anyhow::bail!("{} is not one of node1..node{}", id, nodes);
    }

    config.validate()?;
    let body = toml::to_string_pretty(&config)?;
    Ok(format!("# ramutex configuration for {}\n\n{}", id, body))
}
