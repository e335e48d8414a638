//! SPV-Kit: a simplified payment verification wallet core in Rust
//!
//! This crate provides the pieces of a light wallet for Bitcoin-family networks:
//! - BIP32/44/49/84/86 key derivation with gap-limit address management
//! - Legacy, P2SH-wrapped SegWit, native SegWit and Taproot scripts
//! - Header sync from checkpoints with bloom-filtered merkle blocks
//! - Reorg-safe transaction tracking with conflict and double-spend handling
//! - Coin selection, fee estimation, RBF and BIP69 ordering
//! - Broadcasting with per-peer retries over a tokio peer group
//! - JSON persistence of the wallet store
//!
//! # Example
//!
//! ```rust,no_run
//! use spv_kit::{KitConfig, MemoryStorage, Network, SpvKit};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Keep the wallet in memory
//!     let storage = Arc::new(MemoryStorage::new());
//!     let kit = SpvKit::new(KitConfig::for_network(Network::Testnet), &[1u8; 32], storage)?;
//!     println!("Receive address: {}", kit.receive_address()?);
//!
//!     // Sync for a while
//!     kit.start()?;
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     println!("State: {}", kit.sync_state());
//!
//!     kit.stop().await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod core;
pub mod crypto;
pub mod kit;
pub mod network;
pub mod storage;
pub mod transactions;
pub mod wallet;

// Re-export commonly used types
pub use core::{Block, BlockHeader, FullTransaction, Transaction, TransactionOutput};
pub use kit::{BlockInfo, KitConfig, KitError, KitListener, KitState, SpvKit};
pub use network::{Network, NetworkParams, SyncMode};
pub use storage::{FullTransactionInfo, MemoryStorage, Storage, StorageConfig, TransactionFilterType};
pub use transactions::{BalanceInfo, PluginData, SendInfo, SendRequest, TransactionDataSortType};
pub use wallet::{Purpose, TransactionFilter, WatchedTransactionListener};
