//! The `computechain` binary: data directory initialisation, the node
//! itself, and a status probe.
//!
//! Exit codes are a stable contract for tooling: 0 success, 1 generic
//! error, 2 invalid argument, 3 network error, 4 consensus or state error.

use anyhow::Result;
use clap::{Parser, Subcommand};
use cpc_core::{BlockError, StoreError, TxError};
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_OK: u8 = 0;
const EXIT_GENERIC: u8 = 1;
const EXIT_INVALID_ARGUMENT: u8 = 2;
const EXIT_NETWORK: u8 = 3;
const EXIT_CONSENSUS: u8 = 4;

#[derive(Parser)]
#[command(name = "computechain", about = "ComputeChain validator node", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a data directory with a config, a dev genesis and a fresh
    /// validator key.
    Init {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
        #[arg(long, default_value = "computechain-dev")]
        network_id: String,
    },
    /// Run the node.
    Run {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
        /// Config file; defaults to `<data-dir>/config.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Query a running node's status endpoint.
    Status {
        #[arg(long, default_value = "http://127.0.0.1:8800")]
        rpc: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    cpc_node::init_logging();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(classify(&e))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Init {
            data_dir,
            network_id,
        } => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            cpc_config::init_data_dir(&data_dir, &network_id, now)?;
            println!("initialised {}", data_dir.display());
            Ok(())
        }
        Command::Run { data_dir, config } => {
            let config_path = config.unwrap_or_else(|| data_dir.join(cpc_config::CONFIG_FILE));
            let mut node_config = cpc_config::NodeConfig::load(&config_path)?;
            node_config.data_dir = data_dir;
            cpc_node::run_node(node_config).await
        }
        Command::Status { rpc } => {
            let url = format!("{}/status", rpc.trim_end_matches('/'));
            let status: serde_json::Value = reqwest::get(&url).await?.json().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

/// Map error kinds onto the documented exit codes.
fn classify(error: &anyhow::Error) -> u8 {
    for cause in error.chain() {
        if cause.is::<BlockError>() || cause.is::<TxError>() {
            return EXIT_CONSENSUS;
        }
        if cause.is::<StoreError>() {
            return EXIT_GENERIC;
        }
        if cause.is::<cpc_config::ConfigError>() {
            return EXIT_INVALID_ARGUMENT;
        }
        if cause.is::<reqwest::Error>()
            || cause.is::<cpc_core::NetError>()
            || cause.is::<std::io::Error>()
        {
            return EXIT_NETWORK;
        }
    }
    EXIT_GENERIC
}
