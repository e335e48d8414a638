//! Header chain management
//!
//! Connects downloaded headers to the stored chain, validating them against
//! their parent, and reconciles competing branches once a download round
//! finishes. New blocks are stored as stale; `handle_fork` decides whether
//! the stale branch replaces the current one.

use std::sync::Arc;

use thiserror::Error;

use crate::core::block::{Block, BlockHeader, RETARGET_INTERVAL};
use crate::core::transaction::Transaction;
use crate::core::validator::{BlockValidator, BlockValidatorError};
use crate::crypto::{to_reversed_hex, Hash256};
use crate::storage::{Storage, StorageError};

/// Blockchain-related errors
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("No previous block for {0}")]
    NoPreviousBlock(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] BlockValidatorError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Notifications about chain changes
pub trait BlockchainDataListener: Send + Sync {
    fn on_block_insert(&self, block: &Block);

    /// Wallet transactions inserted or changed, with the block they came in
    fn on_transactions_update(&self, inserted: &[Transaction], updated: &[Transaction], block: Option<&Block>);

    /// Transactions confirmed in deleted blocks, reported once per deletion
    fn on_transactions_delete(&self, hashes: &[Hash256]);
}

/// The stored header chain
pub struct Blockchain {
    storage: Arc<dyn Storage>,
    validator: Option<Box<dyn BlockValidator>>,
    listener: Arc<dyn BlockchainDataListener>,
}

impl Blockchain {
    pub fn new(
        storage: Arc<dyn Storage>,
        validator: Option<Box<dyn BlockValidator>>,
        listener: Arc<dyn BlockchainDataListener>,
    ) -> Self {
        Self {
            storage,
            validator,
            listener,
        }
    }

    /// Connect a header to its stored parent.
    ///
    /// Already stored headers are returned as they are. The new block is
    /// stored stale at parent height + 1.
    pub fn connect(&self, header: BlockHeader) -> Result<Block, BlockchainError> {
        if let Some(existing) = self.storage.block(&header.hash) {
            return Ok(existing);
        }

        let previous = self
            .storage
            .block(&header.previous_hash)
            .ok_or_else(|| BlockchainError::NoPreviousBlock(header.hash_hex()))?;

        let mut block = Block::new(header, previous.height + 1);
        if let Some(validator) = &self.validator {
            validator.validate(&block, &previous)?;
        }
        block.stale = true;

        if block.height % RETARGET_INTERVAL == 0 {
            self.storage
                .delete_blocks_without_transactions(block.height - RETARGET_INTERVAL);
        }

        self.add_block(block)
    }

    /// Store a header at a known height without validation
    pub fn force_add(&self, header: BlockHeader, height: u32) -> Result<Block, BlockchainError> {
        if let Some(existing) = self.storage.block(&header.hash) {
            return Ok(existing);
        }

        let mut block = Block::new(header, height);
        block.stale = true;
        self.add_block(block)
    }

    /// Resolve the stale branch against the current one.
    ///
    /// A strictly longer stale branch replaces the overlapping part of the
    /// current chain; an equal or shorter one is dropped.
    pub fn handle_fork(&self) -> Result<(), BlockchainError> {
        let Some(first_stale) = self.storage.first_stale_block() else {
            return Ok(());
        };
        let Some(last_stale) = self.storage.last_stale_block() else {
            return Ok(());
        };
        let last_not_stale_height = self
            .storage
            .last_not_stale_block()
            .map(|b| b.height)
            .unwrap_or(0);

        self.storage.begin();

        let mut deleted = Vec::new();
        if first_stale.height <= last_not_stale_height {
            if last_stale.height > last_not_stale_height {
                log::info!(
                    "Reorg: replacing blocks {}..={} with stale branch up to {}",
                    first_stale.height,
                    last_not_stale_height,
                    last_stale.height
                );
                let replaced = self.storage.blocks_from_height(first_stale.height, false);
                deleted = self.remove_blocks(&replaced);
                self.storage.unstale_all_blocks();
            } else {
                log::info!(
                    "Dropping stale branch {}..={}, current chain is not shorter",
                    first_stale.height,
                    last_stale.height
                );
                let stale = self.storage.stale_blocks();
                deleted = self.remove_blocks(&stale);
            }
        } else {
            self.storage.unstale_all_blocks();
        }

        self.commit_and_notify(deleted)
    }

    /// Delete blocks with their transactions and report the removed hashes
    /// once the deletion is stored
    pub fn delete_blocks(&self, blocks: &[Block]) -> Result<(), BlockchainError> {
        if blocks.is_empty() {
            return Ok(());
        }

        self.storage.begin();
        let deleted = self.remove_blocks(blocks);
        self.commit_and_notify(deleted)
    }

    /// Hashes of the transactions confirmed in `blocks`, which are deleted
    fn remove_blocks(&self, blocks: &[Block]) -> Vec<Hash256> {
        let mut hashes = Vec::new();
        for block in blocks {
            hashes.extend(
                self.storage
                    .block_transactions(&block.hash())
                    .into_iter()
                    .map(|tx| tx.hash),
            );
        }

        self.storage.delete_blocks(blocks);
        hashes
    }

    fn commit_and_notify(&self, deleted: Vec<Hash256>) -> Result<(), BlockchainError> {
        if let Err(e) = self.storage.commit() {
            self.storage.rollback();
            return Err(e.into());
        }

        if !deleted.is_empty() {
            self.listener.on_transactions_delete(&deleted);
        }
        Ok(())
    }

    fn add_block(&self, block: Block) -> Result<Block, BlockchainError> {
        self.storage.add_block(block.clone());
        log::debug!("Added block {} at {}", to_reversed_hex(&block.hash()), block.height);
        self.listener.on_block_insert(&block);
        Ok(block)
    }
}
