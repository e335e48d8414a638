//! Wallet kit
//!
//! - `config`: `KitConfig` with defaults per network
//! - `spv_kit`: the `SpvKit` facade and its wiring
//! - `data_provider`: balance, last block and transaction queries
//! - `sync_manager`: `KitState` tracking
//! - `listener`: application callbacks

pub mod config;
pub mod data_provider;
pub mod listener;
pub mod spv_kit;
pub mod sync_manager;

pub use config::KitConfig;
pub use data_provider::{BlockInfo, DataProvider};
pub use listener::KitListener;
pub use spv_kit::{KitError, SpvKit};
pub use sync_manager::{KitState, SyncManager};
