//! Copay CLI Application
//!
//! A command-line interface for multisig addresses, copayer keys and
//! payment requests.

use clap::{Parser, Subcommand};
use copay_core::cli;
use copay_core::config::WalletConfig;
use copay_core::core::Network;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "copay")]
#[command(version = "0.1.0")]
#[command(about = "Multisig Bitcoin wallet with payment protocol support", long_about = None)]
struct Cli {
    /// Wallet configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Derive a shared multisig address from copayer xpubs
    Address {
        /// Copayer extended public keys, comma-separated
        #[arg(short, long, value_delimiter = ',', required = true)]
        xpubs: Vec<String>,

        /// Required signatures
        #[arg(short, long, default_value = "1")]
        required: u8,

        /// Address index
        #[arg(short, long, default_value = "0")]
        index: u32,

        /// Derive a change address
        #[arg(long)]
        change: bool,

        /// Network (livenet or testnet)
        #[arg(short, long, default_value = "livenet")]
        network: Network,
    },

    /// Decode and verify a payment request from a file, URL or bitcoin: URI
    InspectRequest {
        /// Request source
        source: String,

        /// Extra trusted root certificate (PEM)
        #[arg(long)]
        trusted_root: Vec<PathBuf>,

        /// Accept requests with pki_type "none"
        #[arg(long)]
        allow_unsigned: bool,
    },

    /// Parse a bitcoin: payment URI
    ParseUri {
        /// The URI
        uri: String,
    },

    /// Generate a random copayer key for testing
    Keygen {
        /// Network (livenet or testnet)
        #[arg(short, long, default_value = "livenet")]
        network: Network,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => WalletConfig::load(path)?,
        None => WalletConfig::default(),
    };

    match cli.command {
        Commands::Address {
            xpubs,
            required,
            index,
            change,
            network,
        } => {
            cli::cmd_address(&xpubs, required, network, index, change)?;
        }

        Commands::InspectRequest {
            source,
            trusted_root,
            allow_unsigned,
        } => {
            config.trusted_roots.extend(trusted_root);
            config.allow_unsigned_requests |= allow_unsigned;
            cli::cmd_inspect_request(&source, &config)?;
        }

        Commands::ParseUri { uri } => {
            cli::cmd_parse_uri(&uri)?;
        }

        Commands::Keygen { network } => {
            cli::cmd_keygen(network)?;
        }
    }

    Ok(())
}
