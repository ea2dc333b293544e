//! ramutex - unified CLI entrypoint.
//!
//! Usage:
//!   ramutex start --config config/node1.toml
//!   ramutex start --id node1 --addr 127.0.0.1:50051 --peers node2@127.0.0.1:50052
//!   ramutex config validate --config config/node1.toml
//!   ramutex config show --config config/node1.toml [--format json]
//!   ramutex config generate --id node1 --nodes 3

use anyhow::Result;
use clap::Parser;
use ramutex::cli::commands::{run_config, run_start};
use ramutex::cli::{Cli, Commands};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.map(PathBuf::from);

    match cli.command {
        Commands::Start(args) => run_start(args, config_path, cli.log_level).await,
        Commands::Config(args) => run_config(args, config_path),
    }
}
