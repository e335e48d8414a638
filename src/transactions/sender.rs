//! Outgoing transaction bookkeeping
//!
//! Our new transactions are announced to a few peers and re-announced every
//! `retries_period` until a peer relays them back or `max_retries` sends
//! have been answered. A `SentTransaction` record in storage tracks each
//! one; relaying deletes it. Choosing peers is the peer group's job.

use std::sync::Arc;
use std::time::Duration;

use crate::core::transaction::FullTransaction;
use crate::network::peer_group::PeerGroupError;
use crate::network::task::PeerTask;
use crate::storage::{SentTransaction, Storage};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRIES_PERIOD: Duration = Duration::from_secs(60);

/// Anything that can put our transactions on the network
pub trait TransactionBroadcaster: Send + Sync {
    /// Fails while too few peers are connected or synced
    fn can_send_transaction(&self) -> Result<(), PeerGroupError>;

    /// Announce every pending transaction that is due
    fn send_pending_transactions(&self);
}

pub struct TransactionSender {
    storage: Arc<dyn Storage>,
    max_retries: u32,
    retries_period: Duration,
}

impl TransactionSender {
    pub fn new(storage: Arc<dyn Storage>, max_retries: u32, retries_period: Duration) -> Self {
        Self {
            storage,
            max_retries,
            retries_period,
        }
    }

    pub fn retries_period(&self) -> Duration {
        self.retries_period
    }

    pub fn has_pending(&self) -> bool {
        !self.storage.new_transactions().is_empty()
    }

    /// New transactions never sent, or last sent over a period ago with
    /// retries left
    pub fn transactions_to_send(&self, now_ms: i64) -> Vec<FullTransaction> {
        let period_ms = self.retries_period.as_millis() as i64;

        self.storage
            .new_transactions()
            .into_iter()
            .filter(|transaction| match self.storage.sent_transaction(&transaction.hash()) {
                Some(sent) => sent.retries_count < self.max_retries && sent.last_send_time < now_ms - period_ms,
                None => true,
            })
            .collect()
    }

    pub fn transaction_send_start(&self, transaction: &FullTransaction, now_ms: i64) {
        match self.storage.sent_transaction(&transaction.hash()) {
            Some(mut sent) => {
                sent.last_send_time = now_ms;
                sent.send_success = false;
                self.storage.update_sent_transaction(sent);
            }
            None => {
                let mut sent = SentTransaction::new(transaction.hash());
                sent.first_send_time = now_ms;
                sent.last_send_time = now_ms;
                self.storage.add_sent_transaction(sent);
            }
        }
    }

    /// A peer fetched the transaction; counted once per send round
    pub fn transaction_send_success(&self, transaction: &FullTransaction) {
        let Some(mut sent) = self.storage.sent_transaction(&transaction.hash()) else {
            return;
        };
        if sent.send_success {
            return;
        }

        sent.retries_count += 1;
        sent.send_success = true;
        if sent.retries_count >= self.max_retries {
            log::info!(
                "Transaction {} sent {} times, no more retries",
                transaction.header.hash_hex(),
                sent.retries_count
            );
        }
        self.storage.update_sent_transaction(sent);
    }

    pub fn transactions_relayed(&self, transactions: &[FullTransaction]) {
        for transaction in transactions {
            if self.storage.sent_transaction(&transaction.hash()).is_some() {
                self.storage.delete_sent_transaction(&transaction.hash());
            }
        }
    }

    /// Returns whether the task was one of ours
    pub fn handle_completed_task(&self, task: &PeerTask) -> bool {
        match task {
            PeerTask::SendTransaction(task) => {
                if task.sent {
                    self.transaction_send_success(&task.transaction);
                }
                true
            }
            _ => false,
        }
    }
}
