//! Double-spend resolution
//!
//! A transaction conflicts with a stored one when both spend the same
//! output. The resolver decides which side survives; applying the decision
//! is left to the processors.

use std::sync::Arc;

use crate::core::transaction::{FullTransaction, Transaction};
use crate::crypto::Hash256;
use crate::storage::Storage;

/// Outcome of resolving a received transaction against stored conflicts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Store the received transaction and invalidate these
    Accept { invalidate: Vec<Transaction> },
    /// Drop the received transaction; `update` carries conflicts whose
    /// `conflicting_tx_hash` now points at it
    Ignore { update: Vec<Transaction> },
    /// A conflict is already confirmed, the received transaction loses
    Invalid { confirmed: Hash256 },
}

pub struct TransactionConflictsResolver {
    storage: Arc<dyn Storage>,
}

impl TransactionConflictsResolver {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Decide between `transaction` and the stored transactions spending any
    /// of its inputs. `in_block` tells whether `transaction` is confirmed.
    pub fn resolve(&self, transaction: &FullTransaction, in_block: bool) -> ConflictResolution {
        let conflicts = self.conflicting_transactions(transaction);
        if conflicts.is_empty() || in_block {
            return ConflictResolution::Accept { invalidate: conflicts };
        }

        if let Some(confirmed) = conflicts.iter().find(|tx| tx.block_hash.is_some()) {
            return ConflictResolution::Invalid {
                confirmed: confirmed.hash,
            };
        }

        if self.replaces(transaction, &conflicts) {
            return ConflictResolution::Accept { invalidate: conflicts };
        }

        let hash = transaction.hash();
        let update = conflicts
            .into_iter()
            .map(|mut tx| {
                tx.conflicting_tx_hash = Some(hash);
                tx
            })
            .collect();
        ConflictResolution::Ignore { update }
    }

    /// Stored transactions spending an output that `transaction` spends
    pub fn conflicting_transactions(&self, transaction: &FullTransaction) -> Vec<Transaction> {
        let own_hash = transaction.hash();
        let mut hashes: Vec<Hash256> = Vec::new();

        for input in &transaction.inputs {
            let Some(spending) = self
                .storage
                .transaction_input(&input.previous_output_tx_hash, input.previous_output_index)
            else {
                continue;
            };
            if spending.transaction_hash != own_hash && !hashes.contains(&spending.transaction_hash) {
                hashes.push(spending.transaction_hash);
            }
        }

        hashes.iter().filter_map(|h| self.storage.transaction(h)).collect()
    }

    /// Unconfirmed incoming wallet transactions that spend an output
    /// `transaction` also spends
    pub fn incoming_pending_transactions_conflicting_with(&self, transaction: &FullTransaction) -> Vec<Transaction> {
        let pending = self.storage.incoming_pending_tx_hashes();
        if pending.is_empty() {
            return Vec::new();
        }

        let mut hashes: Vec<Hash256> = Vec::new();
        for input in self.storage.transaction_inputs(&pending) {
            let conflicts = transaction.inputs.iter().any(|i| i.spends_same_output(&input));
            if conflicts && !hashes.contains(&input.transaction_hash) {
                hashes.push(input.transaction_hash);
            }
        }

        hashes
            .iter()
            .filter_map(|h| self.storage.transaction(h))
            .filter(|tx| tx.block_hash.is_none())
            .collect()
    }

    /// Every shared outpoint is spent by `transaction` with a sequence no
    /// higher than the stored spend's
    fn replaces(&self, transaction: &FullTransaction, conflicts: &[Transaction]) -> bool {
        let conflict_hashes: Vec<Hash256> = conflicts.iter().map(|tx| tx.hash).collect();
        let existing_inputs = self.storage.transaction_inputs(&conflict_hashes);

        transaction.inputs.iter().all(|input| {
            existing_inputs
                .iter()
                .filter(|existing| existing.spends_same_output(input))
                .all(|existing| input.sequence <= existing.sequence)
        })
    }
}
