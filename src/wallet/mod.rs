//! Wallet key management and bloom filter sources
//!
//! - `keychain`: HD derivation behind the `KeyChain` trait
//! - `public_key_manager`: gap-limit upkeep, receive and change keys
//! - `bloom_filter_manager`: aggregates filter elements from providers
//! - `watched`, `irregular`: additional filter providers

pub mod bloom_filter_manager;
pub mod irregular;
pub mod keychain;
pub mod public_key_manager;
pub mod watched;

pub use bloom_filter_manager::{BloomFilterListener, BloomFilterManager, BloomFilterProvider};
pub use irregular::IrregularOutputFinder;
pub use keychain::{KeyChain, KeyChainError, Purpose, SeedKeyChain};
pub use public_key_manager::{PublicKeyManager, PublicKeyManagerError};
pub use watched::{TransactionFilter, WatchedTransactionListener, WatchedTransactionManager};
