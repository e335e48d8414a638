//! Wallet data for the application
//!
//! Listens to the blockchain and the processors, keeps the balance and the
//! last block current, and answers transaction queries.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::listener::ListenerSlot;
use crate::core::block::Block;
use crate::core::blockchain::BlockchainDataListener;
use crate::core::transaction::Transaction;
use crate::crypto::{from_reversed_hex, to_reversed_hex, Hash256};
use crate::storage::{FullTransactionInfo, Storage, TransactionFilterType};
use crate::transactions::unspent_output_provider::{BalanceInfo, UnspentOutputProvider};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    pub header_hash: String,
    pub height: u32,
    pub timestamp: u32,
}

impl From<&Block> for BlockInfo {
    fn from(block: &Block) -> Self {
        Self {
            header_hash: to_reversed_hex(&block.hash()),
            height: block.height,
            timestamp: block.timestamp(),
        }
    }
}

pub struct DataProvider {
    storage: Arc<dyn Storage>,
    unspent_output_provider: Arc<UnspentOutputProvider>,
    listeners: Arc<ListenerSlot>,
    balance: RwLock<BalanceInfo>,
    last_block_info: RwLock<Option<BlockInfo>>,
}

impl DataProvider {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        unspent_output_provider: Arc<UnspentOutputProvider>,
        listeners: Arc<ListenerSlot>,
    ) -> Self {
        let balance = unspent_output_provider.balance();
        let last_block_info = storage.last_block().as_ref().map(BlockInfo::from);

        Self {
            storage,
            unspent_output_provider,
            listeners,
            balance: RwLock::new(balance),
            last_block_info: RwLock::new(last_block_info),
        }
    }

    pub fn balance(&self) -> BalanceInfo {
        *self.balance.read()
    }

    pub fn last_block_info(&self) -> Option<BlockInfo> {
        self.last_block_info.read().clone()
    }

    /// Recompute the balance and report it when it changed
    pub fn refresh_balance(&self) {
        let balance = self.unspent_output_provider.balance();
        {
            let mut current = self.balance.write();
            if *current == balance {
                return;
            }
            *current = balance;
        }

        if let Some(listener) = self.listeners.get() {
            listener.on_balance_update(balance);
        }
    }

    /// Newest first, continuing after `from_hash` when given
    pub fn transactions(
        &self,
        from_hash: Option<&str>,
        filter: Option<TransactionFilterType>,
        limit: Option<usize>,
    ) -> Vec<FullTransactionInfo> {
        let from = from_hash.and_then(from_reversed_hex).and_then(|hash| self.valid_or_invalid(&hash));
        if from_hash.is_some() && from.is_none() {
            return Vec::new();
        }
        self.storage.full_transaction_infos(from.as_ref(), filter, limit)
    }

    pub fn transaction(&self, hash: &str) -> Option<FullTransactionInfo> {
        let hash = from_reversed_hex(hash)?;
        self.storage.full_transaction_info(&hash)
    }

    fn valid_or_invalid(&self, hash: &Hash256) -> Option<Transaction> {
        self.storage
            .transaction(hash)
            .or_else(|| self.storage.invalid_transaction(hash).map(|i| i.transaction.header))
    }

    fn infos(&self, transactions: &[Transaction]) -> Vec<FullTransactionInfo> {
        transactions
            .iter()
            .filter_map(|t| self.storage.full_transaction_info(&t.hash))
            .collect()
    }
}

impl BlockchainDataListener for DataProvider {
    fn on_block_insert(&self, block: &Block) {
        let info = {
            let mut last = self.last_block_info.write();
            if last.as_ref().map(|l| block.height <= l.height).unwrap_or(false) {
                return;
            }
            let info = BlockInfo::from(block);
            *last = Some(info.clone());
            info
        };

        if let Some(listener) = self.listeners.get() {
            listener.on_last_block_info_update(&info);
        }
        self.refresh_balance();
    }

    fn on_transactions_update(&self, inserted: &[Transaction], updated: &[Transaction], _block: Option<&Block>) {
        if let Some(listener) = self.listeners.get() {
            listener.on_transactions_update(&self.infos(inserted), &self.infos(updated));
        }
        self.refresh_balance();
    }

    fn on_transactions_delete(&self, hashes: &[Hash256]) {
        if let Some(listener) = self.listeners.get() {
            let hashes: Vec<String> = hashes.iter().map(to_reversed_hex).collect();
            listener.on_transactions_delete(&hashes);
        }
        self.refresh_balance();
    }
}
