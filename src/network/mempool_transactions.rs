//! Mempool relay
//!
//! Transactions announced in a peer's `inv` are fetched once across all
//! peers and handed to the pending processor. Relay of one of our own
//! transactions also ends its send retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::core::transaction::FullTransaction;
use crate::crypto::Hash256;
use crate::network::message::{InvItem, InvType};
use crate::network::peer::{Peer, PeerId};
use crate::network::task::{PeerTask, RequestTransactionsTask};
use crate::storage::Storage;
use crate::transactions::processor::{PendingTransactionProcessor, ProcessorError};
use crate::transactions::sender::TransactionSender;
use crate::wallet::{BloomFilterManager, PublicKeyManager};

pub struct MempoolTransactions {
    storage: Arc<dyn Storage>,
    processor: Arc<PendingTransactionProcessor>,
    public_key_manager: Arc<PublicKeyManager>,
    bloom_filter_manager: Arc<BloomFilterManager>,
    sender: Arc<TransactionSender>,
    /// Hashes in flight, per peer
    requested: HashMap<PeerId, Vec<Hash256>>,
}

impl MempoolTransactions {
    pub fn new(
        storage: Arc<dyn Storage>,
        processor: Arc<PendingTransactionProcessor>,
        public_key_manager: Arc<PublicKeyManager>,
        bloom_filter_manager: Arc<BloomFilterManager>,
        sender: Arc<TransactionSender>,
    ) -> Self {
        Self {
            storage,
            processor,
            public_key_manager,
            bloom_filter_manager,
            sender,
            requested: HashMap::new(),
        }
    }

    fn is_requested(&self, hash: &Hash256) -> bool {
        self.requested.values().any(|hashes| hashes.contains(hash))
    }

    fn should_request(&self, hash: &Hash256) -> bool {
        !self.storage.is_transaction_exists(hash) && self.storage.invalid_transaction(hash).is_none()
    }

    pub fn handle_inventory(&mut self, peer: &mut Peer, items: &[InvItem], now: Instant) {
        let mut hashes: Vec<Hash256> = Vec::new();
        for item in items.iter().filter(|item| item.inv_type == InvType::Tx) {
            if !hashes.contains(&item.hash) && !self.is_requested(&item.hash) && self.should_request(&item.hash) {
                hashes.push(item.hash);
            }
        }
        if hashes.is_empty() {
            return;
        }

        log::debug!("Requesting {} transactions from {}", hashes.len(), peer.host());
        self.requested.entry(peer.id()).or_default().extend(hashes.iter().copied());
        peer.add_task(PeerTask::RequestTransactions(RequestTransactionsTask::new(hashes)), now);
    }

    /// Returns whether the task was one of ours
    pub fn handle_completed_task(&mut self, id: PeerId, task: &PeerTask) -> bool {
        let PeerTask::RequestTransactions(task) = task else {
            return false;
        };

        self.handle_relayed(task.transactions.clone());

        // hashes left over after a timeout may go to another peer
        if let Some(requested) = self.requested.get_mut(&id) {
            let delivered: Vec<Hash256> = task.transactions.iter().map(|t| t.hash()).collect();
            requested.retain(|hash| !delivered.contains(hash) && task.requested().all(|r| r != hash));
        }
        self.sender.transactions_relayed(&task.transactions);
        true
    }

    pub fn on_peer_disconnect(&mut self, id: PeerId) {
        self.requested.remove(&id);
    }

    fn handle_relayed(&self, transactions: Vec<FullTransaction>) {
        if transactions.is_empty() {
            return;
        }

        match self.processor.process_received(transactions, false) {
            Ok(()) => {}
            Err(ProcessorError::BloomFilterExpired) => {
                if let Err(e) = self.public_key_manager.fill_gap() {
                    log::error!("Failed to fill key gap: {}", e);
                }
                self.bloom_filter_manager.regenerate_bloom_filter();
            }
            Err(e) => log::error!("Failed to process relayed transactions: {}", e),
        }
    }
}
