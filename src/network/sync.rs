//! Block synchronization bookkeeping
//!
//! `BlockSyncer` owns the storage side of a download: which block hashes are
//! still pending, which locator to send, and what to do with every merkle
//! block that arrives. Peer selection and task scheduling live in
//! `initial_block_download`.

use std::sync::Arc;

use thiserror::Error;

use crate::core::block::{BlockError, BlockHash, Checkpoint, MerkleBlock};
use crate::core::blockchain::{Blockchain, BlockchainError};
use crate::crypto::Hash256;
use crate::network::params::NetworkParams;
use crate::storage::Storage;
use crate::transactions::processor::{BlockTransactionProcessor, ProcessorError};
use crate::wallet::{BloomFilterManager, PublicKeyManager, PublicKeyManagerError};

/// Most pending hashes handed out per merkle block request
pub const BLOCK_HASHES_LIMIT: usize = 500;

/// Recent blocks put into a locator when no pending hash exists
const LOCATOR_RECENT_BLOCKS: usize = 10;

/// Sync-related errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),
    #[error("Key error: {0}")]
    PublicKey(#[from] PublicKeyManagerError),
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] BlockError),
}

/// Where a fresh wallet starts downloading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// From the BIP44 checkpoint, for wallets that may hold old funds
    Full,
    /// API-assisted restore; block download starts at the last checkpoint
    #[default]
    Api,
    /// From the last checkpoint, for wallets created just now
    NewWallet,
}

/// Progress callbacks of the block download
pub trait BlockSyncListener: Send + Sync {
    fn on_block_sync_started(&self) {}

    fn on_current_best_block_height_update(&self, _height: u32, _max_block_height: u32) {}

    fn on_block_sync_finished(&self) {}
}

/// Pick the checkpoint to start from, seeding empty storage with it
pub fn resolve_checkpoint(
    sync_mode: SyncMode,
    params: &NetworkParams,
    storage: &dyn Storage,
) -> Result<Checkpoint, SyncError> {
    let last_block = storage.last_block();

    let checkpoint = match sync_mode {
        SyncMode::Full => params.bip44_checkpoint()?,
        SyncMode::Api | SyncMode::NewWallet => {
            let last_checkpoint = params.last_checkpoint()?;
            match &last_block {
                // stored chain predates the newest checkpoint
                Some(block) if block.height < last_checkpoint.block.height => params.bip44_checkpoint()?,
                _ => last_checkpoint,
            }
        }
    };

    if last_block.is_none() {
        log::info!("Starting from checkpoint at height {}", checkpoint.block.height);
        storage.add_block(checkpoint.block.clone());
        for block in &checkpoint.additional_blocks {
            storage.add_block(block.clone());
        }
    }

    Ok(checkpoint)
}

pub struct BlockSyncer {
    storage: Arc<dyn Storage>,
    blockchain: Arc<Blockchain>,
    processor: Arc<BlockTransactionProcessor>,
    public_key_manager: Arc<PublicKeyManager>,
    bloom_filter_manager: Arc<BloomFilterManager>,
    checkpoint: Checkpoint,
    listener: Arc<dyn BlockSyncListener>,
    /// A block of the current iteration was processed with an expired filter
    iteration_has_partial_blocks: bool,
}

impl BlockSyncer {
    pub fn new(
        storage: Arc<dyn Storage>,
        blockchain: Arc<Blockchain>,
        processor: Arc<BlockTransactionProcessor>,
        public_key_manager: Arc<PublicKeyManager>,
        bloom_filter_manager: Arc<BloomFilterManager>,
        checkpoint: Checkpoint,
        listener: Arc<dyn BlockSyncListener>,
    ) -> Self {
        Self {
            storage,
            blockchain,
            processor,
            public_key_manager,
            bloom_filter_manager,
            checkpoint,
            listener,
            iteration_has_partial_blocks: false,
        }
    }

    pub fn listener(&self) -> &Arc<dyn BlockSyncListener> {
        &self.listener
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn local_downloaded_best_block_height(&self) -> u32 {
        self.storage.last_block().map(|b| b.height).unwrap_or(0)
    }

    /// Downloaded height plus announced hashes not stored as blocks yet
    pub fn local_known_best_block_height(&self) -> u32 {
        let pending: Vec<Hash256> = self
            .storage
            .block_hashes_sorted(usize::MAX)
            .into_iter()
            .filter(|h| h.height == 0)
            .map(|h| h.header_hash)
            .collect();
        let existing = self.storage.blocks_count(Some(&pending));

        self.local_downloaded_best_block_height() + (pending.len() - existing.min(pending.len())) as u32
    }

    /// Reset leftovers of an interrupted download
    pub fn prepare_for_download(&mut self) -> Result<(), SyncError> {
        self.handle_partial_blocks()?;
        self.clear_partial_blocks()?;
        // hashes announced by the old sync peer may belong to its fork
        self.storage.delete_blockchain_block_hashes();
        self.blockchain.handle_fork()?;
        Ok(())
    }

    pub fn download_iteration_completed(&mut self) -> Result<(), SyncError> {
        self.processor.clear_not_mine_cache();
        if self.iteration_has_partial_blocks {
            self.handle_partial_blocks()?;
        }
        Ok(())
    }

    pub fn download_completed(&mut self) -> Result<(), SyncError> {
        self.blockchain.handle_fork()?;
        Ok(())
    }

    pub fn download_failed(&mut self) -> Result<(), SyncError> {
        self.prepare_for_download()
    }

    /// Next pending hashes to fetch as merkle blocks
    pub fn get_block_hashes(&self) -> Vec<BlockHash> {
        self.storage.block_hashes_sorted(BLOCK_HASHES_LIMIT)
    }

    /// Locator for `getblocks`, newest first, ending at a hash the peer knows
    pub fn block_locator_hashes(&self, peer_last_block_height: u32) -> Vec<Hash256> {
        let mut locator = Vec::new();

        if let Some(last) = self.storage.last_blockchain_block_hash() {
            locator.push(last.header_hash);
        }

        if locator.is_empty() {
            locator.extend(
                self.storage
                    .blocks_above(self.checkpoint.block.height, LOCATOR_RECENT_BLOCKS)
                    .iter()
                    .map(|b| b.hash()),
            );
        }

        match self.storage.block_by_height_stale_prioritized(peer_last_block_height) {
            Some(block) => {
                let hash = block.hash();
                if !locator.contains(&hash) {
                    locator.push(hash);
                }
            }
            None => locator.push(self.checkpoint.block.hash()),
        }

        locator
    }

    /// Queue hashes from an `inv`, skipping ones already queued
    pub fn add_block_hashes(&self, hashes: Vec<Hash256>) {
        let mut sequence = self.storage.last_block_hash().map(|h| h.sequence).unwrap_or(0);
        let existing = self.storage.block_hash_header_hashes();

        let new_hashes: Vec<BlockHash> = hashes
            .into_iter()
            .filter(|hash| !existing.contains(hash))
            .map(|hash| {
                sequence += 1;
                BlockHash::new(hash, 0, sequence)
            })
            .collect();

        if !new_hashes.is_empty() {
            log::debug!("Queued {} block hashes", new_hashes.len());
            self.storage.add_block_hashes(new_hashes);
        }
    }

    pub fn handle_merkle_block(&mut self, merkle_block: MerkleBlock, max_block_height: u32) -> Result<(), SyncError> {
        let MerkleBlock {
            header,
            associated_transactions,
            height,
            ..
        } = merkle_block;

        let block = match height {
            Some(height) => self.blockchain.force_add(header, height)?,
            None => self.blockchain.connect(header)?,
        };
        let hash = block.hash();
        let block_height = block.height;

        match self.processor.process_received(
            associated_transactions,
            Some(block),
            self.iteration_has_partial_blocks,
        ) {
            Ok(()) => {}
            Err(ProcessorError::BloomFilterExpired) => {
                log::debug!("Bloom filter expired at block {}", block_height);
                self.iteration_has_partial_blocks = true;
            }
            Err(e) => return Err(e.into()),
        }

        // the hash of a partial block stays queued so the block is fetched again
        if !self.iteration_has_partial_blocks {
            self.storage.delete_block_hash(&hash);
        }

        self.listener.on_current_best_block_height_update(block_height, max_block_height);
        Ok(())
    }

    pub fn should_request(&self, hash: &Hash256) -> bool {
        self.storage.block(hash).is_none()
    }

    /// Extend keys and reload the filter after an expiry
    fn handle_partial_blocks(&mut self) -> Result<(), SyncError> {
        self.public_key_manager.fill_gap()?;
        self.bloom_filter_manager.regenerate_bloom_filter();
        self.iteration_has_partial_blocks = false;
        Ok(())
    }

    /// Drop blocks still listed as pending, so they are downloaded again
    fn clear_partial_blocks(&self) -> Result<(), SyncError> {
        let mut excluded = vec![self.checkpoint.block.hash()];
        excluded.extend(self.checkpoint.additional_blocks.iter().map(|b| b.hash()));

        let to_delete: Vec<Hash256> = self
            .storage
            .block_hash_header_hashes()
            .into_iter()
            .filter(|hash| !excluded.contains(hash))
            .collect();

        let blocks = self.storage.blocks_by_hashes(&to_delete);
        if !blocks.is_empty() {
            log::debug!("Deleting {} partially downloaded blocks", blocks.len());
            self.blockchain.delete_blocks(&blocks)?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::address::{AddressConverterChain, Base58AddressConverter, SegwitAddressConverter};
    use crate::core::block::{Block, BlockHeader};
    use crate::core::blockchain::BlockchainDataListener;
    use crate::core::transaction::Transaction;
    use crate::storage::MemoryStorage;
    use crate::transactions::conflicts::TransactionConflictsResolver;
    use crate::transactions::extractor::TransactionExtractor;
    use crate::transactions::invalidator::TransactionInvalidator;
    use crate::transactions::outputs_cache::OutputsCache;
    use crate::transactions::plugin::PluginManager;
    use crate::transactions::processor::{PendingTransactionProcessor, ProcessorContext};
    use crate::wallet::{IrregularOutputFinder, Purpose, SeedKeyChain, WatchedTransactionManager};
    use parking_lot::Mutex;

    pub(crate) struct Silent;

    impl BlockchainDataListener for Silent {
        fn on_block_insert(&self, _block: &Block) {}
        fn on_transactions_update(&self, _inserted: &[Transaction], _updated: &[Transaction], _block: Option<&Block>) {}
        fn on_transactions_delete(&self, _hashes: &[Hash256]) {}
    }

    #[derive(Default)]
    pub(crate) struct Progress {
        pub heights: Mutex<Vec<(u32, u32)>>,
        pub finished: Mutex<usize>,
        pub started: Mutex<usize>,
    }

    impl BlockSyncListener for Progress {
        fn on_block_sync_started(&self) {
            *self.started.lock() += 1;
        }

        fn on_current_best_block_height_update(&self, height: u32, max_block_height: u32) {
            self.heights.lock().push((height, max_block_height));
        }

        fn on_block_sync_finished(&self) {
            *self.finished.lock() += 1;
        }
    }

    /// Wallet and chain wired over regtest, starting at genesis
    pub(crate) struct SyncFixture {
        pub storage: Arc<MemoryStorage>,
        pub progress: Arc<Progress>,
        pub public_key_manager: Arc<PublicKeyManager>,
        pub bloom_filter_manager: Arc<BloomFilterManager>,
        pub pending_processor: Arc<PendingTransactionProcessor>,
        pub syncer: BlockSyncer,
    }

    pub(crate) fn fixture() -> SyncFixture {
        let storage = Arc::new(MemoryStorage::new());
        let params = NetworkParams::regtest();
        let checkpoint = resolve_checkpoint(SyncMode::NewWallet, &params, storage.as_ref()).unwrap();

        let key_chain = Arc::new(SeedKeyChain::from_seed(&[3u8; 32], Purpose::Bip84, 1).unwrap());
        let public_key_manager = Arc::new(PublicKeyManager::new(storage.clone(), key_chain, 5));
        public_key_manager.fill_gap().unwrap();

        let mut converter = AddressConverterChain::new();
        converter.push(Box::new(Base58AddressConverter::new(0x6f, 0xc4)));
        converter.push(Box::new(SegwitAddressConverter::new("bcrt")));

        let listener: Arc<dyn BlockchainDataListener> = Arc::new(Silent);
        let context = Arc::new(ProcessorContext::new(
            storage.clone(),
            Arc::new(TransactionExtractor::new(
                storage.clone(),
                Arc::new(converter),
                Arc::new(PluginManager::new()),
                Arc::new(OutputsCache::new()),
            )),
            public_key_manager.clone(),
            Arc::new(IrregularOutputFinder::new(storage.clone())),
            Arc::new(TransactionConflictsResolver::new(storage.clone())),
            Arc::new(TransactionInvalidator::new(storage.clone(), listener.clone())),
            Arc::new(WatchedTransactionManager::new()),
            listener.clone(),
        ));

        let bloom_filter_manager = Arc::new(BloomFilterManager::with_tweak(7));
        bloom_filter_manager.add_provider(public_key_manager.clone());

        let progress = Arc::new(Progress::default());
        let syncer = BlockSyncer::new(
            storage.clone(),
            Arc::new(Blockchain::new(storage.clone(), None, listener)),
            Arc::new(BlockTransactionProcessor::new(context.clone())),
            public_key_manager.clone(),
            bloom_filter_manager.clone(),
            checkpoint,
            progress.clone(),
        );

        SyncFixture {
            storage,
            progress,
            public_key_manager,
            bloom_filter_manager,
            pending_processor: Arc::new(PendingTransactionProcessor::new(context)),
            syncer,
        }
    }

    /// Headers chained on top of `previous`
    pub(crate) fn headers(previous: Hash256, count: usize) -> Vec<BlockHeader> {
        let mut previous = previous;
        (0..count)
            .map(|i| {
                let header = BlockHeader::new(1, previous, [i as u8 + 1; 32], 1_600_000_000 + i as u32, 0x207f_ffff, 0);
                previous = header.hash;
                header
            })
            .collect()
    }

    #[test]
    fn test_resolve_checkpoint_seeds_storage() {
        let storage = MemoryStorage::new();
        let params = NetworkParams::regtest();
        let checkpoint = resolve_checkpoint(SyncMode::Full, &params, &storage).unwrap();

        assert_eq!(checkpoint.block.height, 0);
        assert_eq!(storage.last_block().map(|b| b.hash()), Some(checkpoint.block.hash()));

        // stored chain is left alone on the next start
        let again = resolve_checkpoint(SyncMode::NewWallet, &params, &storage).unwrap();
        assert_eq!(again.block, checkpoint.block);
        assert_eq!(storage.blocks_count(None), 1);
    }

    #[test]
    fn test_block_locator_hashes() {
        let f = fixture();
        let genesis = f.syncer.checkpoint().block.hash();

        // nothing downloaded: the checkpoint
        assert_eq!(f.syncer.block_locator_hashes(300), vec![genesis]);

        f.syncer.add_block_hashes(vec![[9u8; 32], [8u8; 32]]);
        assert_eq!(f.syncer.block_locator_hashes(300), vec![[8u8; 32], genesis]);
        assert_eq!(f.syncer.block_locator_hashes(0), vec![[8u8; 32], genesis]);
    }

    #[test]
    fn test_add_block_hashes_skips_known() {
        let f = fixture();
        f.syncer.add_block_hashes(vec![[1u8; 32], [2u8; 32]]);
        f.syncer.add_block_hashes(vec![[2u8; 32], [3u8; 32]]);

        let queued: Vec<(Hash256, u32)> = f
            .syncer
            .get_block_hashes()
            .into_iter()
            .map(|h| (h.header_hash, h.sequence))
            .collect();
        assert_eq!(queued, vec![([1u8; 32], 1), ([2u8; 32], 2), ([3u8; 32], 3)]);
        assert_eq!(f.syncer.local_known_best_block_height(), 3);
    }

    #[test]
    fn test_handle_merkle_blocks() {
        let mut f = fixture();
        let genesis = f.syncer.checkpoint().block.hash();
        let headers = headers(genesis, 2);
        f.syncer.add_block_hashes(headers.iter().map(|h| h.hash).collect());
        assert!(f.syncer.should_request(&headers[0].hash));

        for header in &headers {
            f.syncer
                .handle_merkle_block(MerkleBlock::new(header.clone(), vec![]), 2)
                .unwrap();
        }

        assert!(f.syncer.get_block_hashes().is_empty());
        assert!(!f.syncer.should_request(&headers[1].hash));
        assert_eq!(*f.progress.heights.lock(), vec![(1, 2), (2, 2)]);

        // new blocks are stale until the download completes
        assert!(f.storage.last_block().unwrap().stale);
        f.syncer.download_completed().unwrap();
        assert!(!f.storage.last_block().unwrap().stale);
        assert_eq!(f.syncer.local_downloaded_best_block_height(), 2);
    }

    #[test]
    fn test_partial_block_stays_queued() {
        use crate::core::script::{locking_script, ScriptType};
        use crate::core::transaction::{FullTransaction, TransactionInput, TransactionOutput};

        let mut f = fixture();
        let genesis = f.syncer.checkpoint().block.hash();
        let headers = headers(genesis, 2);
        f.syncer.add_block_hashes(headers.iter().map(|h| h.hash).collect());

        // paying the first receive key uses up the gap and expires the filter
        let key = f.public_key_manager.receive_public_key().unwrap();
        let script = locking_script(ScriptType::P2PKH, &key.public_key_hash).unwrap();
        let tx = FullTransaction::new(
            Transaction::default(),
            vec![TransactionInput::new([9u8; 32], 0, 0)],
            vec![TransactionOutput::new(5_000, 0, script, ScriptType::Unknown)],
        );
        let mut merkle_block = MerkleBlock::new(headers[0].clone(), vec![tx.hash()]);
        merkle_block.associated_transactions.push(tx.clone());

        f.syncer.handle_merkle_block(merkle_block, 2).unwrap();
        f.syncer
            .handle_merkle_block(MerkleBlock::new(headers[1].clone(), vec![]), 2)
            .unwrap();

        assert!(f.storage.transaction(&tx.hash()).is_some());
        let queued: Vec<Hash256> = f.syncer.get_block_hashes().iter().map(|h| h.header_hash).collect();
        assert_eq!(queued, vec![headers[0].hash, headers[1].hash]);

        let keys_before = f.storage.public_keys().len();
        f.syncer.download_iteration_completed().unwrap();
        assert!(f.storage.public_keys().len() > keys_before);

        // with a fresh filter the block is processed again and leaves the queue
        let mut merkle_block = MerkleBlock::new(headers[0].clone(), vec![tx.hash()]);
        merkle_block.associated_transactions.push(tx);
        merkle_block.height = Some(1);
        f.syncer.handle_merkle_block(merkle_block, 2).unwrap();
        let queued: Vec<Hash256> = f.syncer.get_block_hashes().iter().map(|h| h.header_hash).collect();
        assert_eq!(queued, vec![headers[1].hash]);
    }

    #[test]
    fn test_prepare_for_download_drops_pending() {
        let mut f = fixture();
        let genesis = f.syncer.checkpoint().block.hash();
        let headers = headers(genesis, 2);
        f.syncer.add_block_hashes(headers.iter().map(|h| h.hash).collect());
        f.syncer
            .handle_merkle_block(MerkleBlock::new(headers[0].clone(), vec![]), 2)
            .unwrap();

        f.syncer.prepare_for_download().unwrap();

        assert!(f.syncer.get_block_hashes().is_empty());
        assert_eq!(f.syncer.local_downloaded_best_block_height(), 1);
        assert!(!f.storage.last_block().unwrap().stale);
        assert!(f.bloom_filter_manager.bloom_filter().is_some());
    }
}
