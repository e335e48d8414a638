//! SPV Wallet CLI Application
//!
//! A command-line interface for syncing and spending an SPV wallet.

use clap::{Parser, Subcommand, ValueEnum};
use spv_kit::cli::{self, WalletState};
use spv_kit::network::Network;
use spv_kit::storage::TransactionFilterType;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "spv-wallet")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "An SPV wallet for Bitcoin-family networks", long_about = None)]
struct Cli {
    /// Data directory for wallet storage
    #[arg(short, long, default_value = ".spv_wallet_data")]
    data_dir: PathBuf,

    /// Network to use (mainnet, testnet, regtest)
    #[arg(short, long, default_value = "mainnet")]
    network: Network,

    /// Wallet seed as hex; falls back to the SPV_WALLET_SEED environment variable
    #[arg(long)]
    seed_hex: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sync the wallet with the network
    Sync {
        /// Stop after this many seconds instead of at the chain tip
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Show the wallet balance
    Balance,

    /// Show a fresh address
    Address {
        /// Show the change address instead of the receive address
        #[arg(short, long)]
        change: bool,
    },

    /// Estimate the fee of a payment
    Fee {
        /// Recipient's address; a placeholder is used when omitted
        #[arg(short, long)]
        to: Option<String>,

        /// Amount in satoshis
        #[arg(short, long)]
        amount: u64,

        /// Fee rate in sat/vbyte
        #[arg(short, long, default_value = "1")]
        fee_rate: u64,

        /// Lock the funds until this block height
        #[arg(long)]
        unlock_height: Option<u32>,
    },

    /// Send coins to an address
    Send {
        /// Recipient's address
        #[arg(short, long)]
        to: String,

        /// Amount in satoshis
        #[arg(short, long)]
        amount: u64,

        /// Fee rate in sat/vbyte
        #[arg(short, long, default_value = "1")]
        fee_rate: u64,

        /// Lock the funds until this block height
        #[arg(long)]
        unlock_height: Option<u32>,

        /// Seconds to wait for synced peers
        #[arg(long, default_value = "120")]
        timeout: u64,
    },

    /// List wallet transactions
    Transactions {
        /// Only incoming or outgoing transactions
        #[arg(short, long)]
        filter: Option<Direction>,

        /// Number of transactions to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    Incoming,
    Outgoing,
}

impl From<Direction> for TransactionFilterType {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Incoming => TransactionFilterType::Incoming,
            Direction::Outgoing => TransactionFilterType::Outgoing,
        }
    }
}

fn read_seed(seed_hex: Option<String>) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let seed_hex = match seed_hex {
        Some(seed_hex) => seed_hex,
        None => std::env::var("SPV_WALLET_SEED").map_err(|_| "no seed given: use --seed-hex or SPV_WALLET_SEED")?,
    };
    let seed = hex::decode(seed_hex.trim()).map_err(|_| "seed is not valid hex")?;
    if seed.len() < 16 {
        return Err("seed must be at least 16 bytes".into());
    }
    Ok(seed)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let seed = read_seed(cli.seed_hex)?;
    let state = WalletState::new(cli.data_dir, cli.network, &seed)?;

    match cli.command {
        Commands::Sync { duration } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_sync(&state, duration))?;
        }

        Commands::Balance => {
            cli::cmd_balance(&state)?;
        }

        Commands::Address { change } => {
            cli::cmd_address(&state, change)?;
        }

        Commands::Fee {
            to,
            amount,
            fee_rate,
            unlock_height,
        } => {
            cli::cmd_fee(&state, to.as_deref(), amount, fee_rate, unlock_height)?;
        }

        Commands::Send {
            to,
            amount,
            fee_rate,
            unlock_height,
            timeout,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::cmd_send(&state, &to, amount, fee_rate, unlock_height, timeout))?;
        }

        Commands::Transactions { filter, limit } => {
            cli::cmd_transactions(&state, filter.map(Into::into), limit)?;
        }
    }

    Ok(())
}
