//! Federator CLI Application
//!
//! Key management, batch hashing and the long-running federator node.

use clap::{Parser, Subcommand};
use federator_mesh::cli;
use federator_mesh::config::NodeConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "federator")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Authenticated gossip mesh for bridge federators", long_about = None)]
struct Cli {
    /// JSON node configuration; flags override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a federator key
    Keygen {
        /// Where to write the hex private key
        #[arg(short, long, default_value = "federator.key")]
        output: PathBuf,

        /// Overwrite an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Print the registry address of a key
    Address {
        /// Hex private key file
        #[arg(short, long, default_value = "federator.key")]
        key: PathBuf,
    },

    /// Start the federator node
    Start {
        /// Port to listen on for mesh connections
        #[arg(short, long)]
        port: Option<u16>,

        /// Peers to dial (comma-separated host:port)
        #[arg(long)]
        peers: Option<String>,

        /// Hex private key file
        #[arg(short, long)]
        key: Option<PathBuf>,

        /// JSON list of authorized federator addresses
        #[arg(short, long)]
        registry: Option<PathBuf>,

        /// Directory for local state
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Serve the status API on this port
        #[arg(long)]
        api_port: Option<u16>,
    },

    /// Compute the hash federators sign for a transfer batch
    BatchHash {
        /// Target status (sending, mined, refunded)
        #[arg(short, long)]
        status: String,

        /// Bitcoin transaction hash carrying the transfers
        #[arg(long)]
        btc_tx: Option<String>,

        /// Transfer ids (0x-prefixed, 32 bytes)
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { output, force } => cli::cmd_keygen(&output, force),

        Commands::Address { key } => cli::cmd_address(&key),

        Commands::BatchHash {
            status,
            btc_tx,
            ids,
        } => cli::cmd_batch_hash(&ids, &status, btc_tx.as_deref()),

        Commands::Start {
            port,
            peers,
            key,
            registry,
            data_dir,
            api_port,
        } => {
            let mut config = match &cli.config {
                Some(path) => NodeConfig::load(path)?,
                None => NodeConfig::default(),
            };
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(peers) = peers {
                config.bootstrap_peers = peers
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            if let Some(key) = key {
                config.key_file = key;
            }
            if let Some(registry) = registry {
                config.registry_file = registry;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            if api_port.is_some() {
                config.api_port = api_port;
            }

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_start(config))
        }
    }
}
