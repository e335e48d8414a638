//! Wallet storage
//!
//! The `Storage` trait is the single persistence seam of the kit: blocks,
//! pending block hashes, wallet transactions with their inputs and outputs,
//! the invalid partition, public keys, send bookkeeping and peer addresses.
//!
//! Writes are grouped with `begin`/`commit`/`rollback`. `MemoryStorage`
//! implements the trait; `MemoryStorage::open` mirrors it to a JSON file.

pub mod file;
pub mod memory;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::block::{Block, BlockHash};
use crate::core::public_key::PublicKey;
use crate::core::script::ScriptType;
use crate::core::transaction::{FullTransaction, Transaction, TransactionInput, TransactionOutput};
use crate::crypto::Hash256;

pub use file::StorageConfig;
pub use memory::MemoryStorage;

// =============================================================================
// Storage Errors
// =============================================================================

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

// =============================================================================
// Stored Models
// =============================================================================

/// A transaction moved out of the wallet view because it was double spent
/// or descends from one that was
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidTransaction {
    pub transaction: FullTransaction,
}

impl InvalidTransaction {
    pub fn new(transaction: FullTransaction) -> Self {
        Self { transaction }
    }

    pub fn hash(&self) -> Hash256 {
        self.transaction.header.hash
    }
}

/// Broadcast bookkeeping for an outgoing transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentTransaction {
    pub hash: Hash256,
    /// Milliseconds since the epoch
    pub first_send_time: i64,
    pub last_send_time: i64,
    pub retries_count: u32,
    pub send_success: bool,
}

impl SentTransaction {
    pub fn new(hash: Hash256) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            hash,
            first_send_time: now,
            last_send_time: now,
            retries_count: 0,
            send_success: false,
        }
    }
}

/// A known peer address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub ip: String,
    pub score: i32,
    /// Milliseconds the last successful handshake took
    pub connection_time: Option<i64>,
}

impl PeerAddress {
    pub fn new(ip: impl Into<String>, score: i32) -> Self {
        Self {
            ip: ip.into(),
            score,
            connection_time: None,
        }
    }
}

/// A wallet output joined with everything needed to spend it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub output: TransactionOutput,
    pub public_key: PublicKey,
    pub transaction: Transaction,
    /// `None` while unconfirmed
    pub block: Option<Block>,
}

/// A transaction joined with its inputs, outputs and block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTransactionInfo {
    pub header: Transaction,
    pub inputs: Vec<InputWithPreviousOutput>,
    pub outputs: Vec<TransactionOutput>,
    pub block: Option<Block>,
}

impl FullTransactionInfo {
    pub fn full_transaction(&self) -> FullTransaction {
        FullTransaction {
            header: self.header.clone(),
            inputs: self.inputs.iter().map(|i| i.input.clone()).collect(),
            outputs: self.outputs.clone(),
        }
    }
}

/// An input together with the output it spends, when that output is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputWithPreviousOutput {
    pub input: TransactionInput,
    pub previous_output: Option<TransactionOutput>,
}

/// Direction filter for transaction listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionFilterType {
    Incoming,
    Outgoing,
}

// =============================================================================
// Storage Trait
// =============================================================================

/// Transactional wallet storage
pub trait Storage: Send + Sync {
    // -- transactions --------------------------------------------------------

    /// Start a write group; nested calls are flattened into the outer group
    fn begin(&self);

    fn commit(&self) -> Result<(), StorageError>;

    /// Discard everything written since the outermost `begin`
    fn rollback(&self);

    /// Persist outside of a write group
    fn flush(&self) -> Result<(), StorageError>;

    // -- peer addresses ------------------------------------------------------

    fn least_score_fastest_peer_address(&self, excluding: &[String]) -> Option<PeerAddress>;

    fn peer_addresses(&self) -> Vec<PeerAddress>;

    fn set_peer_addresses(&self, addresses: Vec<PeerAddress>);

    fn delete_peer_address(&self, ip: &str);

    fn mark_connected(&self, ip: &str, connection_time: i64);

    // -- block hashes --------------------------------------------------------

    /// Pending hashes ordered by (sequence, height)
    fn block_hashes_sorted(&self, limit: usize) -> Vec<BlockHash>;

    fn block_hash_header_hashes(&self) -> Vec<Hash256>;

    /// Pending hash with the highest sequence
    fn last_block_hash(&self) -> Option<BlockHash>;

    /// Most recent pending hash whose height is unresolved
    fn last_blockchain_block_hash(&self) -> Option<BlockHash>;

    /// Remove every pending hash whose height is unresolved
    fn delete_blockchain_block_hashes(&self);

    fn delete_block_hash(&self, hash: &Hash256);

    fn add_block_hashes(&self, hashes: Vec<BlockHash>);

    // -- blocks --------------------------------------------------------------

    fn block(&self, hash: &Hash256) -> Option<Block>;

    /// Block at `height`, a stale one when both exist
    fn block_by_height_stale_prioritized(&self, height: u32) -> Option<Block>;

    fn blocks_by_hashes(&self, hashes: &[Hash256]) -> Vec<Block>;

    /// Up to `limit` blocks above `height`, highest first
    fn blocks_above(&self, height: u32, limit: usize) -> Vec<Block>;

    fn blocks_from_height(&self, height: u32, stale: bool) -> Vec<Block>;

    fn stale_blocks(&self) -> Vec<Block>;

    /// Lowest stale block
    fn first_stale_block(&self) -> Option<Block>;

    /// Highest stale block
    fn last_stale_block(&self) -> Option<Block>;

    /// Highest non-stale block
    fn last_not_stale_block(&self) -> Option<Block>;

    fn add_block(&self, block: Block);

    fn update_block(&self, block: Block);

    fn blocks_count(&self, hashes: Option<&[Hash256]>) -> usize;

    /// Highest block, stale or not
    fn last_block(&self) -> Option<Block>;

    /// Height of the highest block whose transactions are downloaded
    fn downloaded_transactions_best_block_height(&self) -> u32;

    /// Delete blocks together with every transaction confirmed in them
    fn delete_blocks(&self, blocks: &[Block]);

    /// Delete blocks below `to_height` that confirm no wallet transaction
    fn delete_blocks_without_transactions(&self, to_height: u32);

    fn unstale_all_blocks(&self);

    /// Timestamps of blocks with heights in `from..=to`, ascending
    fn timestamps(&self, from: u32, to: u32) -> Vec<u32>;

    // -- wallet transactions -------------------------------------------------

    fn transaction(&self, hash: &Hash256) -> Option<Transaction>;

    fn full_transaction(&self, hash: &Hash256) -> Option<FullTransaction>;

    fn full_transaction_info(&self, hash: &Hash256) -> Option<FullTransactionInfo>;

    /// Valid and invalid transactions, newest first, starting after `from`
    fn full_transaction_infos(
        &self,
        from: Option<&Transaction>,
        filter: Option<TransactionFilterType>,
        limit: Option<usize>,
    ) -> Vec<FullTransactionInfo>;

    fn add_transaction(&self, transaction: FullTransaction);

    fn update_transaction(&self, transaction: Transaction);

    /// Replace header, inputs and outputs of a stored transaction
    fn update_full_transaction(&self, transaction: FullTransaction);

    fn block_transactions(&self, block_hash: &Hash256) -> Vec<Transaction>;

    /// Our transactions not yet seen from the network
    fn new_transactions(&self) -> Vec<FullTransaction>;

    fn is_transaction_exists(&self, hash: &Hash256) -> bool;

    /// Unconfirmed wallet transactions that are not outgoing
    fn incoming_pending_tx_hashes(&self) -> Vec<Hash256>;

    fn incoming_pending_transactions_exist(&self) -> bool {
        !self.incoming_pending_tx_hashes().is_empty()
    }

    // -- invalid partition ---------------------------------------------------

    fn invalid_transaction(&self, hash: &Hash256) -> Option<InvalidTransaction>;

    /// Move transactions from the wallet view into the invalid partition
    fn move_transactions_to_invalid(&self, transactions: Vec<InvalidTransaction>);

    /// Restore an invalidated transaction as `transaction`
    fn move_invalid_transaction_to_transactions(&self, invalid: &InvalidTransaction, transaction: FullTransaction);

    fn delete_all_invalid_transactions(&self);

    // -- outputs and inputs --------------------------------------------------

    /// Own outputs not referenced by any stored input
    fn unspent_outputs(&self) -> Vec<UnspentOutput>;

    fn output(&self, transaction_hash: &Hash256, index: u32) -> Option<TransactionOutput>;

    fn previous_output(&self, input: &TransactionInput) -> Option<TransactionOutput> {
        self.output(&input.previous_output_tx_hash, input.previous_output_index)
    }

    fn outputs_of_public_key(&self, public_key: &PublicKey) -> Vec<TransactionOutput>;

    /// Own outputs of the given script types that are unspent, or spent in a
    /// block less than 100 blocks below `best_height`
    fn outputs_for_bloom_filter(&self, best_height: u32, script_types: &[ScriptType]) -> Vec<TransactionOutput>;

    fn transaction_inputs(&self, transaction_hashes: &[Hash256]) -> Vec<TransactionInput>;

    /// Input spending the given output, from any valid transaction
    fn transaction_input(&self, previous_output_tx_hash: &Hash256, previous_output_index: u32) -> Option<TransactionInput>;

    fn inputs_by_previous_output_tx_hash(&self, transaction_hash: &Hash256) -> Vec<TransactionInput>;

    // -- public keys ---------------------------------------------------------

    fn public_key_by_script_hash_p2wpkh(&self, script_hash: &[u8]) -> Option<PublicKey>;

    fn public_key_by_key_or_key_hash(&self, key_or_hash: &[u8]) -> Option<PublicKey>;

    fn public_key_by_hash_p2tr(&self, output_key: &[u8]) -> Option<PublicKey>;

    fn public_keys(&self) -> Vec<PublicKey>;

    /// Every public key paired with whether any stored output pays it
    fn public_keys_with_used_state(&self) -> Vec<(PublicKey, bool)>;

    fn save_public_keys(&self, keys: Vec<PublicKey>);

    // -- sent transactions ---------------------------------------------------

    fn sent_transaction(&self, hash: &Hash256) -> Option<SentTransaction>;

    fn add_sent_transaction(&self, transaction: SentTransaction);

    fn update_sent_transaction(&self, transaction: SentTransaction);

    fn delete_sent_transaction(&self, hash: &Hash256);
}
