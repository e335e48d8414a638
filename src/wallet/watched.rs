//! Watching foreign outputs and outpoints
//!
//! Lets the application follow transactions that do not belong to the
//! wallet: a P2SH output paying a given script hash, or an input spending a
//! given outpoint. Filters contribute to the bloom filter.

use std::sync::Arc;

use parking_lot::RwLock;

use super::bloom_filter_manager::BloomFilterProvider;
use crate::core::transaction::FullTransaction;
use crate::crypto::{to_reversed_hex, Hash256};

/// What to watch for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionFilter {
    P2SHOutput { script_hash: Vec<u8> },
    Outpoint { transaction_hash: Hash256, index: u32 },
}

impl TransactionFilter {
    fn bloom_filter_element(&self) -> Vec<u8> {
        match self {
            TransactionFilter::P2SHOutput { script_hash } => script_hash.clone(),
            TransactionFilter::Outpoint {
                transaction_hash,
                index,
            } => outpoint(transaction_hash, *index),
        }
    }
}

impl std::fmt::Display for TransactionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionFilter::P2SHOutput { script_hash } => {
                write!(f, "P2SHOutputFilter({})", hex::encode(script_hash))
            }
            TransactionFilter::Outpoint {
                transaction_hash,
                index,
            } => write!(f, "OutpointFilter({}, {})", to_reversed_hex(transaction_hash), index),
        }
    }
}

/// Bloom filter element of an outpoint: transaction hash then LE index
pub fn outpoint(transaction_hash: &Hash256, index: u32) -> Vec<u8> {
    let mut element = transaction_hash.to_vec();
    element.extend_from_slice(&index.to_le_bytes());
    element
}

pub trait WatchedTransactionListener: Send + Sync {
    fn on_transaction_seen_p2sh(&self, _transaction: &FullTransaction, _output_index: u32) {}

    fn on_transaction_seen_outpoint(&self, _transaction: &FullTransaction, _input_index: usize) {}
}

#[derive(Default)]
pub struct WatchedTransactionManager {
    filters: RwLock<Vec<(TransactionFilter, Arc<dyn WatchedTransactionListener>)>>,
}

impl WatchedTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter; the bloom filter must be regenerated afterwards
    pub fn add(&self, filter: TransactionFilter, listener: Arc<dyn WatchedTransactionListener>) {
        log::info!("Add filter: {}", filter);

        let mut filters = self.filters.write();
        filters.retain(|(existing, _)| existing != &filter);
        filters.push((filter, listener));
    }

    pub fn on_transaction_received(&self, transaction: &FullTransaction) {
        for (filter, listener) in self.filters.read().iter() {
            match filter {
                TransactionFilter::P2SHOutput { script_hash } => {
                    let seen = transaction
                        .outputs
                        .iter()
                        .find(|o| o.key_hash.as_deref() == Some(script_hash.as_slice()));
                    if let Some(output) = seen {
                        log::info!("Transaction received {} for filter: {}", transaction.header.hash_hex(), filter);
                        listener.on_transaction_seen_p2sh(transaction, output.index);
                    }
                }
                TransactionFilter::Outpoint {
                    transaction_hash,
                    index,
                } => {
                    let seen = transaction.inputs.iter().position(|i| {
                        &i.previous_output_tx_hash == transaction_hash && i.previous_output_index == *index
                    });
                    if let Some(input_index) = seen {
                        log::info!("Transaction received {} for filter: {}", transaction.header.hash_hex(), filter);
                        listener.on_transaction_seen_outpoint(transaction, input_index);
                    }
                }
            }
        }
    }
}

impl BloomFilterProvider for WatchedTransactionManager {
    fn filter_elements(&self) -> Vec<Vec<u8>> {
        self.filters
            .read()
            .iter()
            .map(|(filter, _)| filter.bloom_filter_element())
            .collect()
    }
}
