//! Send flow
//!
//! Checks that the network can take a transaction, builds and signs it,
//! stores it as a new pending transaction and asks the broadcaster to
//! announce it. Sends are serialized so two concurrent requests never
//! select the same outputs.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use super::builder::{BuilderError, SendRequest, TransactionBuilder};
use super::processor::{PendingTransactionProcessor, ProcessorError};
use super::sender::TransactionBroadcaster;
use crate::core::transaction::FullTransaction;
use crate::network::peer_group::PeerGroupError;
use crate::wallet::{BloomFilterManager, PublicKeyManager};

#[derive(Error, Debug)]
pub enum CreatorError {
    #[error("{0}")]
    PeerGroup(#[from] PeerGroupError),
    #[error("{0}")]
    Builder(#[from] BuilderError),
    #[error("{0}")]
    Processor(#[from] ProcessorError),
}

pub struct TransactionCreator {
    builder: Arc<TransactionBuilder>,
    processor: Arc<PendingTransactionProcessor>,
    broadcaster: Arc<dyn TransactionBroadcaster>,
    public_key_manager: Arc<PublicKeyManager>,
    bloom_filter_manager: Arc<BloomFilterManager>,
    send_lock: Mutex<()>,
}

impl TransactionCreator {
    pub fn new(
        builder: Arc<TransactionBuilder>,
        processor: Arc<PendingTransactionProcessor>,
        broadcaster: Arc<dyn TransactionBroadcaster>,
        public_key_manager: Arc<PublicKeyManager>,
        bloom_filter_manager: Arc<BloomFilterManager>,
    ) -> Self {
        Self {
            builder,
            processor,
            broadcaster,
            public_key_manager,
            bloom_filter_manager,
            send_lock: Mutex::new(()),
        }
    }

    pub fn create(&self, request: &SendRequest) -> Result<FullTransaction, CreatorError> {
        let _guard = self.send_lock.lock();

        self.broadcaster.can_send_transaction()?;
        let transaction = self.builder.build_transaction(request)?;
        self.process_and_send(transaction.clone())?;
        Ok(transaction)
    }

    fn process_and_send(&self, transaction: FullTransaction) -> Result<(), CreatorError> {
        match self.processor.process_created(transaction) {
            Ok(()) => {}
            // the change output went to a key the filter does not cover yet
            Err(ProcessorError::BloomFilterExpired) => {
                if let Err(e) = self.public_key_manager.fill_gap() {
                    log::error!("Failed to fill key gap: {}", e);
                }
                self.bloom_filter_manager.regenerate_bloom_filter();
            }
            Err(ProcessorError::TransactionAlreadyExists(hash)) => {
                log::debug!("Transaction {} already stored", hash);
            }
            Err(e) => return Err(e.into()),
        }

        self.broadcaster.send_pending_transactions();
        Ok(())
    }
}
