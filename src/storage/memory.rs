//! In-memory storage
//!
//! All tables live behind one mutex. A write group snapshots the state on the
//! outermost `begin` so `rollback` can restore it. When opened on a file (see
//! `storage::file`) the state is written out on `commit` and `flush`.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::file::JsonFile;
use super::{
    FullTransactionInfo, InputWithPreviousOutput, InvalidTransaction, PeerAddress, SentTransaction, Storage,
    StorageError, TransactionFilterType, UnspentOutput,
};
use crate::core::block::{Block, BlockHash};
use crate::core::public_key::PublicKey;
use crate::core::script::ScriptType;
use crate::core::transaction::{FullTransaction, Transaction, TransactionInput, TransactionOutput, TransactionStatus};
use crate::crypto::Hash256;

/// Blocks spent this deep are no longer watched by the bloom filter
const SPENT_OUTPUT_WATCH_DEPTH: u32 = 100;

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, Default)]
struct State {
    blocks: HashMap<Hash256, Block>,
    block_hashes: HashMap<Hash256, BlockHash>,
    transactions: HashMap<Hash256, FullTransaction>,
    invalid_transactions: HashMap<Hash256, InvalidTransaction>,
    public_keys: Vec<PublicKey>,
    sent_transactions: HashMap<Hash256, SentTransaction>,
    peer_addresses: Vec<PeerAddress>,
}

/// Serialized form of the whole store
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    blocks: Vec<Block>,
    block_hashes: Vec<BlockHash>,
    transactions: Vec<FullTransaction>,
    invalid_transactions: Vec<InvalidTransaction>,
    public_keys: Vec<PublicKey>,
    sent_transactions: Vec<SentTransaction>,
    peer_addresses: Vec<PeerAddress>,
}

impl From<&State> for Snapshot {
    fn from(state: &State) -> Self {
        Self {
            blocks: state.blocks.values().cloned().collect(),
            block_hashes: state.block_hashes.values().cloned().collect(),
            transactions: state.transactions.values().cloned().collect(),
            invalid_transactions: state.invalid_transactions.values().cloned().collect(),
            public_keys: state.public_keys.clone(),
            sent_transactions: state.sent_transactions.values().cloned().collect(),
            peer_addresses: state.peer_addresses.clone(),
        }
    }
}

impl From<Snapshot> for State {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            blocks: snapshot.blocks.into_iter().map(|b| (b.hash(), b)).collect(),
            block_hashes: snapshot
                .block_hashes
                .into_iter()
                .map(|h| (h.header_hash, h))
                .collect(),
            transactions: snapshot.transactions.into_iter().map(|t| (t.hash(), t)).collect(),
            invalid_transactions: snapshot
                .invalid_transactions
                .into_iter()
                .map(|t| (t.hash(), t))
                .collect(),
            public_keys: snapshot.public_keys,
            sent_transactions: snapshot
                .sent_transactions
                .into_iter()
                .map(|t| (t.hash, t))
                .collect(),
            peer_addresses: snapshot.peer_addresses,
        }
    }
}

impl State {
    fn spent_outpoints(&self) -> HashSet<(Hash256, u32)> {
        self.transactions
            .values()
            .flat_map(|tx| tx.inputs.iter())
            .map(|input| (input.previous_output_tx_hash, input.previous_output_index))
            .collect()
    }

    fn block_of(&self, transaction: &Transaction) -> Option<Block> {
        transaction
            .block_hash
            .as_ref()
            .and_then(|hash| self.blocks.get(hash))
            .cloned()
    }

    fn info(&self, transaction: &FullTransaction) -> FullTransactionInfo {
        let inputs = transaction
            .inputs
            .iter()
            .map(|input| InputWithPreviousOutput {
                input: input.clone(),
                previous_output: self
                    .transactions
                    .get(&input.previous_output_tx_hash)
                    .and_then(|tx| tx.outputs.get(input.previous_output_index as usize))
                    .cloned(),
            })
            .collect();

        FullTransactionInfo {
            header: transaction.header.clone(),
            inputs,
            outputs: transaction.outputs.clone(),
            block: self.block_of(&transaction.header),
        }
    }

    fn delete_transaction(&mut self, hash: &Hash256) {
        self.transactions.remove(hash);
    }
}

struct Inner {
    state: State,
    /// State at the outermost `begin`
    snapshot: Option<State>,
    depth: u32,
    dirty: bool,
}

// =============================================================================
// Memory Storage
// =============================================================================

/// `Storage` kept in memory, optionally mirrored to a JSON file
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    file: Option<JsonFile>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::default(),
                snapshot: None,
                depth: 0,
                dirty: false,
            }),
            file: None,
        }
    }

    /// Storage backed by `file`, starting from its current content
    pub(crate) fn with_file(file: JsonFile) -> Result<Self, StorageError> {
        let state = match file.load()? {
            Some(snapshot) => State::from(snapshot),
            None => State::default(),
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                state,
                snapshot: None,
                depth: 0,
                dirty: false,
            }),
            file: Some(file),
        })
    }

    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        f(&self.inner.lock().state)
    }

    fn write(&self, f: impl FnOnce(&mut State)) {
        let mut inner = self.inner.lock();
        f(&mut inner.state);
        inner.dirty = true;
    }

    fn persist(&self, inner: &mut Inner) -> Result<(), StorageError> {
        if let Some(file) = &self.file {
            if inner.dirty {
                file.save(&Snapshot::from(&inner.state))?;
            }
        }
        inner.dirty = false;
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn begin(&self) {
        let mut inner = self.inner.lock();
        if inner.depth == 0 {
            inner.snapshot = Some(inner.state.clone());
        }
        inner.depth += 1;
    }

    fn commit(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.depth = inner.depth.saturating_sub(1);
        if inner.depth > 0 {
            return Ok(());
        }
        // a failed save keeps the snapshot for rollback
        self.persist(&mut inner)?;
        inner.snapshot = None;
        Ok(())
    }

    fn rollback(&self) {
        let mut inner = self.inner.lock();
        if let Some(snapshot) = inner.snapshot.take() {
            inner.state = snapshot;
        }
        inner.depth = 0;
    }

    fn flush(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        if inner.depth > 0 {
            return Ok(());
        }
        self.persist(&mut inner)
    }

    // -- peer addresses ------------------------------------------------------

    fn least_score_fastest_peer_address(&self, excluding: &[String]) -> Option<PeerAddress> {
        self.read(|s| {
            s.peer_addresses
                .iter()
                .filter(|a| !excluding.contains(&a.ip))
                .min_by_key(|a| (a.score, a.connection_time))
                .cloned()
        })
    }

    fn peer_addresses(&self) -> Vec<PeerAddress> {
        self.read(|s| s.peer_addresses.clone())
    }

    fn set_peer_addresses(&self, addresses: Vec<PeerAddress>) {
        self.write(|s| {
            for address in addresses {
                if !s.peer_addresses.iter().any(|a| a.ip == address.ip) {
                    s.peer_addresses.push(address);
                }
            }
        })
    }

    fn delete_peer_address(&self, ip: &str) {
        self.write(|s| s.peer_addresses.retain(|a| a.ip != ip))
    }

    fn mark_connected(&self, ip: &str, connection_time: i64) {
        self.write(|s| {
            if let Some(address) = s.peer_addresses.iter_mut().find(|a| a.ip == ip) {
                address.connection_time = Some(connection_time);
            }
        })
    }

    // -- block hashes --------------------------------------------------------

    fn block_hashes_sorted(&self, limit: usize) -> Vec<BlockHash> {
        self.read(|s| {
            let mut hashes: Vec<BlockHash> = s.block_hashes.values().cloned().collect();
            hashes.sort_by_key(|h| (h.sequence, h.height));
            hashes.truncate(limit);
            hashes
        })
    }

    fn block_hash_header_hashes(&self) -> Vec<Hash256> {
        self.read(|s| s.block_hashes.keys().copied().collect())
    }

    fn last_block_hash(&self) -> Option<BlockHash> {
        self.read(|s| s.block_hashes.values().max_by_key(|h| h.sequence).cloned())
    }

    fn last_blockchain_block_hash(&self) -> Option<BlockHash> {
        self.read(|s| {
            s.block_hashes
                .values()
                .filter(|h| h.height == 0)
                .max_by_key(|h| h.sequence)
                .cloned()
        })
    }

    fn delete_blockchain_block_hashes(&self) {
        self.write(|s| s.block_hashes.retain(|_, h| h.height != 0))
    }

    fn delete_block_hash(&self, hash: &Hash256) {
        self.write(|s| {
            s.block_hashes.remove(hash);
        })
    }

    fn add_block_hashes(&self, hashes: Vec<BlockHash>) {
        self.write(|s| {
            for hash in hashes {
                s.block_hashes.entry(hash.header_hash).or_insert(hash);
            }
        })
    }

    // -- blocks --------------------------------------------------------------

    fn block(&self, hash: &Hash256) -> Option<Block> {
        self.read(|s| s.blocks.get(hash).cloned())
    }

    fn block_by_height_stale_prioritized(&self, height: u32) -> Option<Block> {
        self.read(|s| {
            s.blocks
                .values()
                .filter(|b| b.height == height)
                .max_by_key(|b| b.stale)
                .cloned()
        })
    }

    fn blocks_by_hashes(&self, hashes: &[Hash256]) -> Vec<Block> {
        self.read(|s| hashes.iter().filter_map(|h| s.blocks.get(h)).cloned().collect())
    }

    fn blocks_above(&self, height: u32, limit: usize) -> Vec<Block> {
        self.read(|s| {
            let mut blocks: Vec<Block> = s.blocks.values().filter(|b| b.height > height).cloned().collect();
            blocks.sort_by(|a, b| b.height.cmp(&a.height));
            blocks.truncate(limit);
            blocks
        })
    }

    fn blocks_from_height(&self, height: u32, stale: bool) -> Vec<Block> {
        self.read(|s| {
            s.blocks
                .values()
                .filter(|b| b.height >= height && b.stale == stale)
                .cloned()
                .collect()
        })
    }

    fn stale_blocks(&self) -> Vec<Block> {
        self.read(|s| s.blocks.values().filter(|b| b.stale).cloned().collect())
    }

    fn first_stale_block(&self) -> Option<Block> {
        self.read(|s| s.blocks.values().filter(|b| b.stale).min_by_key(|b| b.height).cloned())
    }

    fn last_stale_block(&self) -> Option<Block> {
        self.read(|s| s.blocks.values().filter(|b| b.stale).max_by_key(|b| b.height).cloned())
    }

    fn last_not_stale_block(&self) -> Option<Block> {
        self.read(|s| s.blocks.values().filter(|b| !b.stale).max_by_key(|b| b.height).cloned())
    }

    fn add_block(&self, block: Block) {
        self.write(|s| {
            s.blocks.insert(block.hash(), block);
        })
    }

    fn update_block(&self, block: Block) {
        self.write(|s| {
            if let Some(stored) = s.blocks.get_mut(&block.hash()) {
                *stored = block;
            }
        })
    }

    fn blocks_count(&self, hashes: Option<&[Hash256]>) -> usize {
        self.read(|s| match hashes {
            Some(hashes) => hashes.iter().filter(|h| s.blocks.contains_key(*h)).count(),
            None => s.blocks.len(),
        })
    }

    fn last_block(&self) -> Option<Block> {
        self.read(|s| s.blocks.values().max_by_key(|b| b.height).cloned())
    }

    fn downloaded_transactions_best_block_height(&self) -> u32 {
        self.read(|s| {
            s.blocks
                .values()
                .filter(|b| !b.stale && !s.block_hashes.contains_key(&b.hash()))
                .map(|b| b.height)
                .max()
                .unwrap_or(0)
        })
    }

    fn delete_blocks(&self, blocks: &[Block]) {
        self.write(|s| {
            for block in blocks {
                let hash = block.hash();
                let confirmed: Vec<Hash256> = s
                    .transactions
                    .values()
                    .filter(|tx| tx.header.block_hash == Some(hash))
                    .map(|tx| tx.hash())
                    .collect();
                for tx_hash in confirmed {
                    s.delete_transaction(&tx_hash);
                }
                s.blocks.remove(&hash);
            }
        })
    }

    fn delete_blocks_without_transactions(&self, to_height: u32) {
        self.write(|s| s.blocks.retain(|_, b| b.height >= to_height || b.has_transactions))
    }

    fn unstale_all_blocks(&self) {
        self.write(|s| {
            for block in s.blocks.values_mut() {
                block.stale = false;
            }
        })
    }

    fn timestamps(&self, from: u32, to: u32) -> Vec<u32> {
        self.read(|s| {
            let mut blocks: Vec<&Block> = s
                .blocks
                .values()
                .filter(|b| b.height >= from && b.height <= to)
                .collect();
            blocks.sort_by_key(|b| b.height);
            blocks.iter().map(|b| b.timestamp()).collect()
        })
    }

    // -- wallet transactions -------------------------------------------------

    fn transaction(&self, hash: &Hash256) -> Option<Transaction> {
        self.read(|s| s.transactions.get(hash).map(|tx| tx.header.clone()))
    }

    fn full_transaction(&self, hash: &Hash256) -> Option<FullTransaction> {
        self.read(|s| s.transactions.get(hash).cloned())
    }

    fn full_transaction_info(&self, hash: &Hash256) -> Option<FullTransactionInfo> {
        self.read(|s| s.transactions.get(hash).map(|tx| s.info(tx)))
    }

    fn full_transaction_infos(
        &self,
        from: Option<&Transaction>,
        filter: Option<TransactionFilterType>,
        limit: Option<usize>,
    ) -> Vec<FullTransactionInfo> {
        self.read(|s| {
            let mut all: Vec<&FullTransaction> = s
                .transactions
                .values()
                .chain(s.invalid_transactions.values().map(|i| &i.transaction))
                .filter(|tx| match filter {
                    Some(TransactionFilterType::Incoming) => !tx.header.is_outgoing,
                    Some(TransactionFilterType::Outgoing) => tx.header.is_outgoing,
                    None => true,
                })
                .collect();

            // newest first
            let key = |h: &Transaction| (h.timestamp, h.order, h.hash);
            all.sort_by(|a, b| key(&b.header).cmp(&key(&a.header)));

            if let Some(from) = from {
                let from_key = key(from);
                all.retain(|tx| key(&tx.header) < from_key);
            }
            if let Some(limit) = limit {
                all.truncate(limit);
            }

            all.into_iter().map(|tx| s.info(tx)).collect()
        })
    }

    fn add_transaction(&self, transaction: FullTransaction) {
        self.write(|s| {
            s.transactions.insert(transaction.hash(), transaction);
        })
    }

    fn update_transaction(&self, transaction: Transaction) {
        self.write(|s| {
            if let Some(stored) = s.transactions.get_mut(&transaction.hash) {
                stored.header = transaction;
            }
        })
    }

    fn update_full_transaction(&self, transaction: FullTransaction) {
        self.write(|s| {
            if let Some(stored) = s.transactions.get_mut(&transaction.hash()) {
                *stored = transaction;
            }
        })
    }

    fn block_transactions(&self, block_hash: &Hash256) -> Vec<Transaction> {
        self.read(|s| {
            s.transactions
                .values()
                .filter(|tx| tx.header.block_hash.as_ref() == Some(block_hash))
                .map(|tx| tx.header.clone())
                .collect()
        })
    }

    fn new_transactions(&self) -> Vec<FullTransaction> {
        self.read(|s| {
            let mut txs: Vec<FullTransaction> = s
                .transactions
                .values()
                .filter(|tx| tx.header.status == TransactionStatus::New)
                .cloned()
                .collect();
            txs.sort_by_key(|tx| tx.header.timestamp);
            txs
        })
    }

    fn is_transaction_exists(&self, hash: &Hash256) -> bool {
        self.read(|s| s.transactions.contains_key(hash))
    }

    fn incoming_pending_tx_hashes(&self) -> Vec<Hash256> {
        self.read(|s| {
            s.transactions
                .values()
                .filter(|tx| tx.header.block_hash.is_none() && !tx.header.is_outgoing)
                .map(|tx| tx.hash())
                .collect()
        })
    }

    // -- invalid partition ---------------------------------------------------

    fn invalid_transaction(&self, hash: &Hash256) -> Option<InvalidTransaction> {
        self.read(|s| s.invalid_transactions.get(hash).cloned())
    }

    fn move_transactions_to_invalid(&self, transactions: Vec<InvalidTransaction>) {
        self.write(|s| {
            for invalid in transactions {
                let hash = invalid.hash();
                s.delete_transaction(&hash);
                s.invalid_transactions.insert(hash, invalid);
            }
        })
    }

    fn move_invalid_transaction_to_transactions(&self, invalid: &InvalidTransaction, transaction: FullTransaction) {
        self.write(|s| {
            s.invalid_transactions.remove(&invalid.hash());
            s.transactions.insert(transaction.hash(), transaction);
        })
    }

    fn delete_all_invalid_transactions(&self) {
        self.write(|s| s.invalid_transactions.clear())
    }

    // -- outputs and inputs --------------------------------------------------

    fn unspent_outputs(&self) -> Vec<UnspentOutput> {
        self.read(|s| {
            let spent = s.spent_outpoints();
            let mut unspent = Vec::new();

            for tx in s.transactions.values() {
                for output in &tx.outputs {
                    let Some(path) = &output.public_key_path else {
                        continue;
                    };
                    if spent.contains(&(output.transaction_hash, output.index)) {
                        continue;
                    }
                    let Some(public_key) = s.public_keys.iter().find(|k| &k.path == path) else {
                        continue;
                    };

                    unspent.push(UnspentOutput {
                        output: output.clone(),
                        public_key: public_key.clone(),
                        transaction: tx.header.clone(),
                        block: s.block_of(&tx.header),
                    });
                }
            }

            unspent.sort_by_key(|u| (u.transaction.timestamp, u.output.transaction_hash, u.output.index));
            unspent
        })
    }

    fn output(&self, transaction_hash: &Hash256, index: u32) -> Option<TransactionOutput> {
        self.read(|s| {
            s.transactions
                .get(transaction_hash)
                .and_then(|tx| tx.outputs.get(index as usize))
                .cloned()
        })
    }

    fn outputs_of_public_key(&self, public_key: &PublicKey) -> Vec<TransactionOutput> {
        self.read(|s| {
            s.transactions
                .values()
                .flat_map(|tx| tx.outputs.iter())
                .filter(|o| o.public_key_path.as_deref() == Some(public_key.path.as_str()))
                .cloned()
                .collect()
        })
    }

    fn outputs_for_bloom_filter(&self, best_height: u32, script_types: &[ScriptType]) -> Vec<TransactionOutput> {
        self.read(|s| {
            let spending: HashMap<(Hash256, u32), &FullTransaction> = s
                .transactions
                .values()
                .flat_map(|tx| {
                    tx.inputs
                        .iter()
                        .map(move |i| ((i.previous_output_tx_hash, i.previous_output_index), tx))
                })
                .collect();

            s.transactions
                .values()
                .flat_map(|tx| tx.outputs.iter())
                .filter(|o| o.is_mine() && script_types.contains(&o.script_type))
                .filter(|o| match spending.get(&(o.transaction_hash, o.index)) {
                    None => true,
                    Some(spender) => match s.block_of(&spender.header) {
                        Some(block) => best_height.saturating_sub(block.height) < SPENT_OUTPUT_WATCH_DEPTH,
                        None => true,
                    },
                })
                .cloned()
                .collect()
        })
    }

    fn transaction_inputs(&self, transaction_hashes: &[Hash256]) -> Vec<TransactionInput> {
        self.read(|s| {
            transaction_hashes
                .iter()
                .filter_map(|h| s.transactions.get(h))
                .flat_map(|tx| tx.inputs.iter().cloned())
                .collect()
        })
    }

    fn transaction_input(&self, previous_output_tx_hash: &Hash256, previous_output_index: u32) -> Option<TransactionInput> {
        self.read(|s| {
            s.transactions
                .values()
                .flat_map(|tx| tx.inputs.iter())
                .find(|i| {
                    &i.previous_output_tx_hash == previous_output_tx_hash
                        && i.previous_output_index == previous_output_index
                })
                .cloned()
        })
    }

    fn inputs_by_previous_output_tx_hash(&self, transaction_hash: &Hash256) -> Vec<TransactionInput> {
        self.read(|s| {
            s.transactions
                .values()
                .flat_map(|tx| tx.inputs.iter())
                .filter(|i| &i.previous_output_tx_hash == transaction_hash)
                .cloned()
                .collect()
        })
    }

    // -- public keys ---------------------------------------------------------

    fn public_key_by_script_hash_p2wpkh(&self, script_hash: &[u8]) -> Option<PublicKey> {
        self.read(|s| {
            s.public_keys
                .iter()
                .find(|k| k.script_hash_p2wpkh.as_slice() == script_hash)
                .cloned()
        })
    }

    fn public_key_by_key_or_key_hash(&self, key_or_hash: &[u8]) -> Option<PublicKey> {
        self.read(|s| {
            s.public_keys
                .iter()
                .find(|k| k.public_key_hash.as_slice() == key_or_hash || k.public_key.as_slice() == key_or_hash)
                .cloned()
        })
    }

    fn public_key_by_hash_p2tr(&self, output_key: &[u8]) -> Option<PublicKey> {
        self.read(|s| {
            s.public_keys
                .iter()
                .find(|k| k.converted_for_p2tr.as_slice() == output_key)
                .cloned()
        })
    }

    fn public_keys(&self) -> Vec<PublicKey> {
        self.read(|s| s.public_keys.clone())
    }

    fn public_keys_with_used_state(&self) -> Vec<(PublicKey, bool)> {
        self.read(|s| {
            let used: HashSet<&str> = s
                .transactions
                .values()
                .flat_map(|tx| tx.outputs.iter())
                .filter_map(|o| o.public_key_path.as_deref())
                .collect();

            s.public_keys
                .iter()
                .map(|k| (k.clone(), used.contains(k.path.as_str())))
                .collect()
        })
    }

    fn save_public_keys(&self, keys: Vec<PublicKey>) {
        self.write(|s| {
            for key in keys {
                if !s.public_keys.iter().any(|k| k.path == key.path) {
                    s.public_keys.push(key);
                }
            }
        })
    }

    // -- sent transactions ---------------------------------------------------

    fn sent_transaction(&self, hash: &Hash256) -> Option<SentTransaction> {
        self.read(|s| s.sent_transactions.get(hash).cloned())
    }

    fn add_sent_transaction(&self, transaction: SentTransaction) {
        self.write(|s| {
            s.sent_transactions.insert(transaction.hash, transaction);
        })
    }

    fn update_sent_transaction(&self, transaction: SentTransaction) {
        self.add_sent_transaction(transaction)
    }

    fn delete_sent_transaction(&self, hash: &Hash256) {
        self.write(|s| {
            s.sent_transactions.remove(hash);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::BlockHeader;
    use crate::core::transaction::{TransactionInput, TX_VERSION};

    fn block(height: u32, prev: Hash256) -> Block {
        Block::new(BlockHeader::new(1, prev, [0u8; 32], height, 0x207fffff, height), height)
    }

    fn tx(prev: Hash256, value: u64, path: Option<&str>) -> FullTransaction {
        let input = TransactionInput::new(prev, 0, 0xffff_fffe);
        let mut output = TransactionOutput::new(value, 0, vec![0x51], ScriptType::P2WPKH);
        output.public_key_path = path.map(str::to_string);
        FullTransaction::new(Transaction::new(TX_VERSION, 0), vec![input], vec![output])
    }

    #[test]
    fn test_rollback_restores_state() {
        let storage = MemoryStorage::new();
        let genesis = block(0, [0u8; 32]);
        storage.add_block(genesis.clone());

        storage.begin();
        storage.add_block(block(1, genesis.hash()));
        assert_eq!(storage.blocks_count(None), 2);
        storage.rollback();

        assert_eq!(storage.blocks_count(None), 1);
        assert_eq!(storage.last_block().unwrap().height, 0);
    }

    #[test]
    fn test_nested_commit_keeps_outer_group() {
        let storage = MemoryStorage::new();
        storage.begin();
        storage.begin();
        storage.add_block(block(0, [0u8; 32]));
        storage.commit().unwrap();
        storage.rollback();

        assert_eq!(storage.blocks_count(None), 0);
    }

    #[test]
    fn test_stale_queries() {
        let storage = MemoryStorage::new();
        let b0 = block(0, [0u8; 32]);
        let mut b1 = block(1, b0.hash());
        b1.stale = true;
        let mut b2 = block(2, b1.hash());
        b2.stale = true;
        storage.add_block(b0.clone());
        storage.add_block(b1.clone());
        storage.add_block(b2.clone());

        assert_eq!(storage.first_stale_block().unwrap().height, 1);
        assert_eq!(storage.last_stale_block().unwrap().height, 2);
        assert_eq!(storage.last_not_stale_block().unwrap().height, 0);

        storage.unstale_all_blocks();
        assert!(storage.stale_blocks().is_empty());
    }

    #[test]
    fn test_unspent_outputs_exclude_spent() {
        let storage = MemoryStorage::new();
        let secp = secp256k1::Secp256k1::new();
        let secret = secp256k1::SecretKey::from_slice(&[3u8; 32]).unwrap();
        let raw = secp256k1::PublicKey::from_secret_key(&secp, &secret).serialize().to_vec();
        let key = PublicKey::new(0, 0, true, raw).unwrap();
        let path = key.path.clone();
        storage.save_public_keys(vec![key]);

        let funding = tx([9u8; 32], 10_000, Some(&path));
        storage.add_transaction(funding.clone());
        assert_eq!(storage.unspent_outputs().len(), 1);

        let spending = tx(funding.hash(), 9_000, None);
        storage.add_transaction(spending);
        assert!(storage.unspent_outputs().is_empty());
        assert!(storage.public_keys_with_used_state()[0].1);
    }

    #[test]
    fn test_delete_blocks_removes_confirmed_transactions() {
        let storage = MemoryStorage::new();
        let b0 = block(0, [0u8; 32]);
        storage.add_block(b0.clone());

        let mut confirmed = tx([1u8; 32], 1_000, None);
        confirmed.header.block_hash = Some(b0.hash());
        storage.add_transaction(confirmed.clone());

        storage.delete_blocks(&[b0]);
        assert!(!storage.is_transaction_exists(&confirmed.hash()));
        assert_eq!(storage.blocks_count(None), 0);
    }

    #[test]
    fn test_block_hashes_order() {
        let storage = MemoryStorage::new();
        storage.add_block_hashes(vec![
            BlockHash::new([2u8; 32], 0, 2),
            BlockHash::new([1u8; 32], 5, 1),
            BlockHash::new([3u8; 32], 0, 3),
        ]);

        let sorted = storage.block_hashes_sorted(2);
        assert_eq!(sorted[0].header_hash, [1u8; 32]);
        assert_eq!(sorted.len(), 2);
        assert_eq!(storage.last_blockchain_block_hash().unwrap().sequence, 3);

        storage.delete_blockchain_block_hashes();
        assert_eq!(storage.block_hash_header_hashes(), vec![[1u8; 32]]);
    }

    #[test]
    fn test_peer_address_selection() {
        let storage = MemoryStorage::new();
        storage.set_peer_addresses(vec![PeerAddress::new("10.0.0.1", 0), PeerAddress::new("10.0.0.2", 0)]);
        storage.mark_connected("10.0.0.1", 300);

        let best = storage.least_score_fastest_peer_address(&[]).unwrap();
        assert_eq!(best.ip, "10.0.0.2");

        let best = storage
            .least_score_fastest_peer_address(&["10.0.0.2".to_string()])
            .unwrap();
        assert_eq!(best.ip, "10.0.0.1");
    }
}
