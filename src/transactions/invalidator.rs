//! Moves double-spent transactions and their descendants out of the wallet view

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::blockchain::BlockchainDataListener;
use crate::core::transaction::{FullTransaction, Transaction, TransactionStatus};
use crate::crypto::Hash256;
use crate::storage::{InvalidTransaction, Storage};

pub struct TransactionInvalidator {
    storage: Arc<dyn Storage>,
    listener: Arc<dyn BlockchainDataListener>,
}

impl TransactionInvalidator {
    pub fn new(storage: Arc<dyn Storage>, listener: Arc<dyn BlockchainDataListener>) -> Self {
        Self { storage, listener }
    }

    /// Invalidate `hash` and everything spending its outputs, transitively.
    /// Returns the invalidated headers.
    pub fn invalidate(&self, hash: &Hash256, conflicting_tx_hash: Option<Hash256>) -> Vec<Transaction> {
        let transactions = self.descendants(hash);
        if transactions.is_empty() {
            return Vec::new();
        }

        let invalid: Vec<InvalidTransaction> = transactions
            .into_iter()
            .map(|mut tx| {
                tx.header.status = TransactionStatus::Invalid;
                if conflicting_tx_hash.is_some() {
                    tx.header.conflicting_tx_hash = conflicting_tx_hash;
                }
                InvalidTransaction::new(tx)
            })
            .collect();
        let headers: Vec<Transaction> = invalid.iter().map(|i| i.transaction.header.clone()).collect();

        log::info!("Invalidating {} transactions starting at {}", headers.len(), headers[0].hash_hex());
        self.storage.move_transactions_to_invalid(invalid);
        self.listener.on_transactions_update(&[], &headers, None);

        headers
    }

    fn descendants(&self, hash: &Hash256) -> Vec<FullTransaction> {
        let mut result = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![*hash];

        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let Some(transaction) = self.storage.full_transaction(&current) else {
                continue;
            };

            for input in self.storage.inputs_by_previous_output_tx_hash(&current) {
                stack.push(input.transaction_hash);
            }
            result.push(transaction);
        }

        result
    }
}
