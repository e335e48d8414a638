//! Transaction processors
//!
//! `BlockTransactionProcessor` handles transactions arriving in merkle blocks
//! (and mempool relays forwarded by the sync layer); `PendingTransactionProcessor`
//! handles mempool transactions and the ones the wallet creates itself.
//!
//! Both process a batch in topological order while holding the lock of
//! their shared `ProcessorContext`, because the same transaction may arrive
//! from a block and a peer's mempool at once. Created transactions are
//! stored under the same lock.
//! A pass that consumes the key gap or finds an irregular own output ends
//! with `ProcessorError::BloomFilterExpired`; everything processed before
//! that point stays stored.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use super::conflicts::{ConflictResolution, TransactionConflictsResolver};
use super::extractor::TransactionExtractor;
use super::invalidator::TransactionInvalidator;
use crate::core::block::Block;
use crate::core::blockchain::BlockchainDataListener;
use crate::core::transaction::{FullTransaction, Transaction, TransactionStatus};
use crate::crypto::Hash256;
use crate::storage::{InvalidTransaction, Storage, StorageError};
use crate::wallet::{IrregularOutputFinder, PublicKeyManager, WatchedTransactionManager};

// =============================================================================
// Errors
// =============================================================================

#[derive(Error, Debug)]
pub enum ProcessorError {
    /// The filter no longer covers every wallet key or outpoint
    #[error("Bloom filter expired")]
    BloomFilterExpired,
    #[error("Transaction already exists: {0}")]
    TransactionAlreadyExists(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

// =============================================================================
// Ordering
// =============================================================================

/// Order a batch so every transaction follows the ones it spends from
pub fn in_topological_order(transactions: Vec<FullTransaction>) -> Vec<FullTransaction> {
    fn visit(index: usize, transactions: &[FullTransaction], visited: &mut [bool], stack: &mut Vec<usize>) {
        if visited[index] {
            return;
        }
        visited[index] = true;

        let current = &transactions[index];
        for (child, transaction) in transactions.iter().enumerate() {
            let spends_current = transaction.inputs.iter().any(|input| {
                input.previous_output_tx_hash == current.hash()
                    && (input.previous_output_index as usize) < current.outputs.len()
            });
            if spends_current {
                visit(child, transactions, visited, stack);
            }
        }

        stack.push(index);
    }

    let mut visited = vec![false; transactions.len()];
    let mut stack = Vec::with_capacity(transactions.len());
    for index in 0..transactions.len() {
        visit(index, &transactions, &mut visited, &mut stack);
    }

    let mut slots: Vec<Option<FullTransaction>> = transactions.into_iter().map(Some).collect();
    stack.iter().rev().filter_map(|&index| slots[index].take()).collect()
}

/// Foreign transactions already seen are not looked at again until this
/// many pile up
const NOT_MINE_CACHE_LIMIT: usize = 10_000;

/// Guarded by the processing lock
#[derive(Default)]
struct ProcessingState {
    /// Foreign transactions checked by the block processor, with whether
    /// they came in a block
    block_not_mine: HashSet<(Hash256, bool)>,
    /// Foreign transactions checked by the pending processor
    pending_not_mine: HashSet<Hash256>,
}

impl ProcessingState {
    fn clear(&mut self) {
        self.block_not_mine.clear();
        self.pending_not_mine.clear();
    }

    fn trim(&mut self) {
        if self.block_not_mine.len() + self.pending_not_mine.len() > NOT_MINE_CACHE_LIMIT {
            log::debug!("Clearing foreign transaction cache");
            self.clear();
        }
    }
}

/// Collaborators shared by both processors, and the lock every
/// processing pass holds
pub struct ProcessorContext {
    pub storage: Arc<dyn Storage>,
    pub extractor: Arc<TransactionExtractor>,
    pub public_key_manager: Arc<PublicKeyManager>,
    pub irregular_output_finder: Arc<IrregularOutputFinder>,
    pub conflicts_resolver: Arc<TransactionConflictsResolver>,
    pub invalidator: Arc<TransactionInvalidator>,
    pub watched_transaction_manager: Arc<WatchedTransactionManager>,
    pub listener: Arc<dyn BlockchainDataListener>,
    state: Mutex<ProcessingState>,
}

impl ProcessorContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        extractor: Arc<TransactionExtractor>,
        public_key_manager: Arc<PublicKeyManager>,
        irregular_output_finder: Arc<IrregularOutputFinder>,
        conflicts_resolver: Arc<TransactionConflictsResolver>,
        invalidator: Arc<TransactionInvalidator>,
        watched_transaction_manager: Arc<WatchedTransactionManager>,
        listener: Arc<dyn BlockchainDataListener>,
    ) -> Self {
        Self {
            storage,
            extractor,
            public_key_manager,
            irregular_output_finder,
            conflicts_resolver,
            invalidator,
            watched_transaction_manager,
            listener,
            state: Mutex::new(ProcessingState::default()),
        }
    }

    /// Forget the foreign transactions seen so far
    pub fn clear_not_mine_cache(&self) {
        self.state.lock().clear();
    }

    fn filter_expired(&self, transaction: &FullTransaction, double_spend_possible: bool) -> bool {
        double_spend_possible
            || self.public_key_manager.gap_shifts()
            || self.irregular_output_finder.has_irregular_output(&transaction.outputs)
    }

    fn finish(
        &self,
        inserted: &[Transaction],
        updated: &[Transaction],
        block: Option<&Block>,
        filter_expired: bool,
    ) -> Result<(), ProcessorError> {
        let committed = self.storage.commit();

        if !inserted.is_empty() || !updated.is_empty() {
            self.listener.on_transactions_update(inserted, updated, block);
        }
        committed?;

        if filter_expired {
            return Err(ProcessorError::BloomFilterExpired);
        }
        Ok(())
    }

    /// Record an own transaction that lost to a confirmed double spend
    fn store_invalid(&self, transaction: &mut FullTransaction, confirmed: Hash256) {
        log::info!(
            "Transaction {} conflicts with confirmed {}",
            transaction.header.hash_hex(),
            crate::crypto::to_reversed_hex(&confirmed)
        );
        transaction.header.status = TransactionStatus::Invalid;
        transaction.header.conflicting_tx_hash = Some(confirmed);
        self.storage
            .move_transactions_to_invalid(vec![InvalidTransaction::new(transaction.clone())]);
    }
}

// =============================================================================
// Block Transaction Processor
// =============================================================================

pub struct BlockTransactionProcessor {
    context: Arc<ProcessorContext>,
}

impl BlockTransactionProcessor {
    pub fn new(context: Arc<ProcessorContext>) -> Self {
        Self { context }
    }

    /// Called between download iterations
    pub fn clear_not_mine_cache(&self) {
        self.context.clear_not_mine_cache();
    }

    pub fn process_received(
        &self,
        transactions: Vec<FullTransaction>,
        mut block: Option<Block>,
        skip_check_bloom_filter: bool,
    ) -> Result<(), ProcessorError> {
        let ctx = &self.context;
        let mut filter_expired = false;
        let mut inserted = Vec::new();
        let mut updated = Vec::new();

        let mut state = ctx.state.lock();
        state.trim();

        let in_block = block.is_some();
        let pending_exists = !in_block || ctx.storage.incoming_pending_transactions_exist();
        ctx.storage.begin();

        for (index, mut transaction) in in_topological_order(transactions).into_iter().enumerate() {
            let hash = transaction.hash();
            if state.block_not_mine.contains(&(hash, in_block)) {
                continue;
            }

            let invalid = ctx.storage.invalid_transaction(&hash);
            if invalid.is_some() && !in_block {
                continue;
            }

            if let Some(mut existing) = ctx.storage.transaction(&hash) {
                // already confirmed, or a mempool echo of a relayed one
                if existing.block_hash.is_some() || (!in_block && existing.status == TransactionStatus::Relayed) {
                    continue;
                }

                if existing.status == TransactionStatus::New {
                    ctx.storage.delete_sent_transaction(&hash);
                }
                self.relay(&mut existing, index, block.as_mut());
                if existing.block_hash.is_some() {
                    existing.conflicting_tx_hash = None;
                }
                ctx.storage.update_transaction(existing.clone());
                updated.push(existing);
                continue;
            }

            ctx.extractor.extract(&mut transaction);
            ctx.watched_transaction_manager.on_transaction_received(&transaction);

            if transaction.header.is_mine {
                self.relay(&mut transaction.header, index, block.as_mut());

                match ctx.conflicts_resolver.resolve(&transaction, in_block) {
                    ConflictResolution::Accept { invalidate } => {
                        for conflict in invalidate {
                            ctx.invalidator.invalidate(&conflict.hash, Some(hash));
                        }
                        match &invalid {
                            Some(invalid) => {
                                ctx.storage
                                    .move_invalid_transaction_to_transactions(invalid, transaction.clone());
                                updated.push(transaction.header.clone());
                            }
                            None => {
                                ctx.storage.add_transaction(transaction.clone());
                                inserted.push(transaction.header.clone());
                            }
                        }
                    }
                    ConflictResolution::Ignore { update } => {
                        for conflict in update {
                            ctx.storage.update_transaction(conflict.clone());
                            updated.push(conflict);
                        }
                    }
                    ConflictResolution::Invalid { confirmed } => {
                        ctx.store_invalid(&mut transaction, confirmed);
                        inserted.push(transaction.header.clone());
                    }
                }

                if !skip_check_bloom_filter {
                    let double_spend_possible = !transaction.header.is_outgoing && !in_block;
                    filter_expired = filter_expired || ctx.filter_expired(&transaction, double_spend_possible);
                }
            } else if pending_exists {
                state.block_not_mine.insert((hash, in_block));

                for mut conflict in ctx.conflicts_resolver.incoming_pending_transactions_conflicting_with(&transaction) {
                    if in_block {
                        ctx.invalidator.invalidate(&conflict.hash, Some(hash));
                        filter_expired = true;
                    } else {
                        conflict.conflicting_tx_hash = Some(hash);
                        ctx.storage.update_transaction(conflict.clone());
                        updated.push(conflict);
                    }
                }
            }
        }

        ctx.finish(&inserted, &updated, block.as_ref(), filter_expired)
    }

    fn relay(&self, transaction: &mut Transaction, order: usize, block: Option<&mut Block>) {
        transaction.status = TransactionStatus::Relayed;
        transaction.order = order as u32;
        transaction.block_hash = block.as_ref().map(|b| b.hash());

        if let Some(block) = block {
            transaction.timestamp = block.timestamp() as i64;
            if !block.has_transactions {
                block.has_transactions = true;
                self.context.storage.update_block(block.clone());
            }
        }
    }
}

// =============================================================================
// Pending Transaction Processor
// =============================================================================

pub struct PendingTransactionProcessor {
    context: Arc<ProcessorContext>,
}

impl PendingTransactionProcessor {
    pub fn new(context: Arc<ProcessorContext>) -> Self {
        Self { context }
    }

    /// Store a transaction the wallet just built
    pub fn process_created(&self, mut transaction: FullTransaction) -> Result<(), ProcessorError> {
        let ctx = &self.context;
        let _state = ctx.state.lock();
        if ctx.storage.transaction(&transaction.hash()).is_some() {
            return Err(ProcessorError::TransactionAlreadyExists(transaction.header.hash_hex()));
        }

        ctx.extractor.extract(&mut transaction);
        ctx.storage.add_transaction(transaction.clone());
        ctx.storage.flush()?;
        ctx.listener
            .on_transactions_update(&[transaction.header.clone()], &[], None);

        if ctx.irregular_output_finder.has_irregular_output(&transaction.outputs) {
            return Err(ProcessorError::BloomFilterExpired);
        }
        Ok(())
    }

    pub fn process_received(
        &self,
        transactions: Vec<FullTransaction>,
        skip_check_bloom_filter: bool,
    ) -> Result<(), ProcessorError> {
        let ctx = &self.context;
        let mut filter_expired = false;
        let mut inserted = Vec::new();
        let mut updated = Vec::new();

        let mut state = ctx.state.lock();
        state.trim();
        ctx.storage.begin();

        for (index, mut transaction) in in_topological_order(transactions).into_iter().enumerate() {
            let hash = transaction.hash();
            if state.pending_not_mine.contains(&hash) {
                continue;
            }

            // a peer relaying a transaction after it was invalidated
            if ctx.storage.invalid_transaction(&hash).is_some() {
                continue;
            }

            if let Some(mut existing) = ctx.storage.transaction(&hash) {
                if existing.status == TransactionStatus::Relayed {
                    continue;
                }

                ctx.storage.delete_sent_transaction(&hash);
                relay(&mut existing, index);
                ctx.storage.update_transaction(existing.clone());
                updated.push(existing);
                continue;
            }

            relay(&mut transaction.header, index);
            ctx.extractor.extract(&mut transaction);
            ctx.watched_transaction_manager.on_transaction_received(&transaction);

            if !transaction.header.is_mine {
                state.pending_not_mine.insert(hash);

                for mut conflict in ctx.conflicts_resolver.incoming_pending_transactions_conflicting_with(&transaction) {
                    conflict.conflicting_tx_hash = Some(hash);
                    ctx.storage.update_transaction(conflict.clone());
                    updated.push(conflict);
                }
                continue;
            }

            match ctx.conflicts_resolver.resolve(&transaction, false) {
                ConflictResolution::Accept { invalidate } => {
                    for conflict in invalidate {
                        ctx.invalidator.invalidate(&conflict.hash, Some(hash));
                    }
                    ctx.storage.add_transaction(transaction.clone());
                    inserted.push(transaction.header.clone());
                }
                ConflictResolution::Ignore { update } => {
                    for conflict in update {
                        ctx.storage.update_transaction(conflict.clone());
                        updated.push(conflict);
                    }
                }
                ConflictResolution::Invalid { confirmed } => {
                    ctx.store_invalid(&mut transaction, confirmed);
                    inserted.push(transaction.header.clone());
                }
            }

            if !skip_check_bloom_filter {
                let double_spend_possible = !transaction.header.is_outgoing;
                filter_expired = filter_expired || ctx.filter_expired(&transaction, double_spend_possible);
            }
        }

        ctx.finish(&inserted, &updated, None, filter_expired)
    }
}

fn relay(transaction: &mut Transaction, order: usize) {
    transaction.status = TransactionStatus::Relayed;
    transaction.order = order as u32;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::{AddressConverterChain, Base58AddressConverter, SegwitAddressConverter};
    use crate::core::block::BlockHeader;
    use crate::core::public_key::PublicKey;
    use crate::core::script::{locking_script, ScriptType};
    use crate::core::transaction::{TransactionInput, TransactionOutput, SEQUENCE_NO_RBF};
    use crate::storage::MemoryStorage;
    use crate::transactions::outputs_cache::OutputsCache;
    use crate::transactions::plugin::PluginManager;
    use crate::wallet::keychain::{Purpose, SeedKeyChain};

    #[derive(Default)]
    struct Recorder {
        inserted: Mutex<Vec<Hash256>>,
        updated: Mutex<Vec<Hash256>>,
    }

    impl BlockchainDataListener for Recorder {
        fn on_block_insert(&self, _block: &Block) {}

        fn on_transactions_update(&self, inserted: &[Transaction], updated: &[Transaction], _block: Option<&Block>) {
            self.inserted.lock().extend(inserted.iter().map(|t| t.hash));
            self.updated.lock().extend(updated.iter().map(|t| t.hash));
        }

        fn on_transactions_delete(&self, _hashes: &[Hash256]) {}
    }

    struct Fixture {
        storage: Arc<MemoryStorage>,
        recorder: Arc<Recorder>,
        key: PublicKey,
        block_processor: BlockTransactionProcessor,
        pending_processor: PendingTransactionProcessor,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let recorder = Arc::new(Recorder::default());
        let key_chain = Arc::new(SeedKeyChain::from_seed(&[2u8; 32], Purpose::Bip84, 1).unwrap());
        let public_key_manager = Arc::new(PublicKeyManager::new(storage.clone(), key_chain, 5));
        public_key_manager.fill_gap().unwrap();
        let key = public_key_manager.receive_public_key().unwrap();

        let mut converter = AddressConverterChain::new();
        converter.push(Box::new(Base58AddressConverter::new(0x6f, 0xc4)));
        converter.push(Box::new(SegwitAddressConverter::new("tb")));

        let context = Arc::new(ProcessorContext::new(
            storage.clone(),
            Arc::new(TransactionExtractor::new(
                storage.clone(),
                Arc::new(converter),
                Arc::new(PluginManager::new()),
                Arc::new(OutputsCache::new()),
            )),
            public_key_manager,
            Arc::new(IrregularOutputFinder::new(storage.clone())),
            Arc::new(TransactionConflictsResolver::new(storage.clone())),
            Arc::new(TransactionInvalidator::new(storage.clone(), recorder.clone())),
            Arc::new(WatchedTransactionManager::new()),
            recorder.clone(),
        ));

        Fixture {
            storage,
            recorder,
            key,
            block_processor: BlockTransactionProcessor::new(context.clone()),
            pending_processor: PendingTransactionProcessor::new(context),
        }
    }

    fn block(storage: &MemoryStorage, nonce: u32) -> Block {
        let header = BlockHeader::new(1, [0u8; 32], [0u8; 32], 1_600_000_000, 0x207f_ffff, nonce);
        let block = Block::new(header, 100 + nonce);
        storage.add_block(block.clone());
        block
    }

    /// Spend `outpoint` into a P2PKH output of `key_hash`
    fn payment(outpoint: (Hash256, u32), key_hash: &[u8], value: u64) -> FullTransaction {
        let input = TransactionInput::new(outpoint.0, outpoint.1, SEQUENCE_NO_RBF);
        let script = locking_script(ScriptType::P2PKH, key_hash).unwrap();
        let output = TransactionOutput::new(value, 0, script, ScriptType::Unknown);
        FullTransaction::new(Transaction::default(), vec![input], vec![output])
    }

    #[test]
    fn test_topological_order() {
        let parent = payment(([1u8; 32], 0), &[1u8; 20], 100);
        let child = payment((parent.hash(), 0), &[1u8; 20], 90);
        let grandchild = payment((child.hash(), 0), &[1u8; 20], 80);

        let ordered = in_topological_order(vec![grandchild.clone(), child.clone(), parent.clone()]);
        let hashes: Vec<Hash256> = ordered.iter().map(|t| t.hash()).collect();
        assert_eq!(hashes, vec![parent.hash(), child.hash(), grandchild.hash()]);
    }

    #[test]
    fn test_own_transaction_in_block() {
        let f = fixture();
        let block = block(&f.storage, 1);
        let tx = payment(([9u8; 32], 0), &f.key.public_key_hash, 5_000);

        f.block_processor
            .process_received(vec![tx.clone()], Some(block.clone()), true)
            .unwrap();

        let stored = f.storage.transaction(&tx.hash()).unwrap();
        assert_eq!(stored.block_hash, Some(block.hash()));
        assert_eq!(stored.status, TransactionStatus::Relayed);
        assert_eq!(stored.timestamp, block.timestamp() as i64);
        assert!(f.storage.block(&block.hash()).unwrap().has_transactions);
        assert_eq!(*f.recorder.inserted.lock(), vec![tx.hash()]);
    }

    #[test]
    fn test_gap_shift_expires_filter() {
        let f = fixture();
        let block = block(&f.storage, 1);
        let tx = payment(([9u8; 32], 0), &f.key.public_key_hash, 5_000);

        let result = f.block_processor.process_received(vec![tx.clone()], Some(block), false);

        assert!(matches!(result, Err(ProcessorError::BloomFilterExpired)));
        assert!(f.storage.transaction(&tx.hash()).is_some());
    }

    #[test]
    fn test_foreign_transaction_is_ignored() {
        let f = fixture();
        let block = block(&f.storage, 1);
        let tx = payment(([9u8; 32], 0), &[3u8; 20], 5_000);

        f.block_processor.process_received(vec![tx.clone()], Some(block), false).unwrap();

        assert!(f.storage.transaction(&tx.hash()).is_none());
        assert!(f.recorder.inserted.lock().is_empty());
    }

    #[test]
    fn test_pending_then_confirmed() {
        let f = fixture();
        let tx = payment(([9u8; 32], 0), &f.key.public_key_hash, 5_000);
        f.pending_processor.process_received(vec![tx.clone()], true).unwrap();

        let pending = f.storage.transaction(&tx.hash()).unwrap();
        assert!(pending.block_hash.is_none());

        // a second relay changes nothing
        f.pending_processor.process_received(vec![tx.clone()], true).unwrap();
        assert_eq!(f.recorder.inserted.lock().len(), 1);
        assert!(f.recorder.updated.lock().is_empty());

        let block = block(&f.storage, 2);
        f.block_processor
            .process_received(vec![tx.clone()], Some(block.clone()), true)
            .unwrap();

        assert_eq!(f.storage.transaction(&tx.hash()).unwrap().block_hash, Some(block.hash()));
        assert_eq!(*f.recorder.updated.lock(), vec![tx.hash()]);
    }

    #[test]
    fn test_unconfirmed_loses_to_confirmed() {
        let f = fixture();
        let block = block(&f.storage, 1);
        let confirmed = payment(([9u8; 32], 0), &f.key.public_key_hash, 5_000);
        f.block_processor
            .process_received(vec![confirmed.clone()], Some(block), true)
            .unwrap();

        let double_spend = payment(([9u8; 32], 0), &f.key.public_key_hash, 4_000);
        f.pending_processor.process_received(vec![double_spend.clone()], true).unwrap();

        assert!(f.storage.transaction(&double_spend.hash()).is_none());
        let invalid = f.storage.invalid_transaction(&double_spend.hash()).unwrap();
        assert_eq!(invalid.transaction.header.status, TransactionStatus::Invalid);
        assert_eq!(invalid.transaction.header.conflicting_tx_hash, Some(confirmed.hash()));
    }

    #[test]
    fn test_foreign_block_transaction_invalidates_incoming_pending() {
        let f = fixture();
        let pending = payment(([9u8; 32], 0), &f.key.public_key_hash, 5_000);
        f.pending_processor.process_received(vec![pending.clone()], true).unwrap();

        let block = block(&f.storage, 1);
        let foreign = payment(([9u8; 32], 0), &[3u8; 20], 5_000);
        let result = f.block_processor.process_received(vec![foreign.clone()], Some(block), true);

        assert!(matches!(result, Err(ProcessorError::BloomFilterExpired)));
        let invalid = f.storage.invalid_transaction(&pending.hash()).unwrap();
        assert_eq!(invalid.transaction.header.conflicting_tx_hash, Some(foreign.hash()));
    }

    #[test]
    fn test_foreign_mempool_transaction_marks_conflict() {
        let f = fixture();
        let pending = payment(([9u8; 32], 0), &f.key.public_key_hash, 5_000);
        f.pending_processor.process_received(vec![pending.clone()], true).unwrap();

        let foreign = payment(([9u8; 32], 0), &[3u8; 20], 5_000);
        f.pending_processor.process_received(vec![foreign.clone()], true).unwrap();

        let stored = f.storage.transaction(&pending.hash()).unwrap();
        assert_eq!(stored.conflicting_tx_hash, Some(foreign.hash()));
    }

    #[test]
    fn test_block_and_mempool_race() {
        use std::sync::Barrier;
        use std::thread;

        for round in 0..200 {
            let f = fixture();
            let block = block(&f.storage, round);
            let tx = payment(([9u8; 32], 0), &f.key.public_key_hash, 5_000);
            let barrier = Barrier::new(2);

            thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    f.block_processor
                        .process_received(vec![tx.clone()], Some(block.clone()), true)
                        .unwrap();
                });
                scope.spawn(|| {
                    barrier.wait();
                    f.pending_processor.process_received(vec![tx.clone()], true).unwrap();
                });
            });

            let stored = f.storage.transaction(&tx.hash()).unwrap();
            assert_eq!(stored.block_hash, Some(block.hash()), "round {}", round);
            assert_eq!(*f.recorder.inserted.lock(), vec![tx.hash()], "round {}", round);
        }
    }

    #[test]
    fn test_not_mine_cache_clear() {
        let f = fixture();
        let foreign = payment(([9u8; 32], 0), &[3u8; 20], 5_000);
        f.pending_processor.process_received(vec![foreign.clone()], true).unwrap();

        let pending = payment(([9u8; 32], 0), &f.key.public_key_hash, 5_000);
        f.pending_processor.process_received(vec![pending.clone()], true).unwrap();

        // remembered as foreign, so the relay is skipped
        f.pending_processor.process_received(vec![foreign.clone()], true).unwrap();
        assert!(f.storage.transaction(&pending.hash()).unwrap().conflicting_tx_hash.is_none());

        f.block_processor.clear_not_mine_cache();
        f.pending_processor.process_received(vec![foreign.clone()], true).unwrap();
        let stored = f.storage.transaction(&pending.hash()).unwrap();
        assert_eq!(stored.conflicting_tx_hash, Some(foreign.hash()));
    }

    #[test]
    fn test_not_mine_cache_is_bounded() {
        let mut state = ProcessingState::default();
        for i in 0..=NOT_MINE_CACHE_LIMIT {
            state.pending_not_mine.insert(crate::crypto::double_sha256(&i.to_le_bytes()));
        }
        state.block_not_mine.insert(([1u8; 32], true));

        state.trim();
        assert!(state.pending_not_mine.is_empty());
        assert!(state.block_not_mine.is_empty());

        state.block_not_mine.insert(([1u8; 32], true));
        state.trim();
        assert_eq!(state.block_not_mine.len(), 1);
    }

    #[test]
    fn test_created_twice() {
        let f = fixture();
        let mut header = Transaction::default();
        header.status = TransactionStatus::New;
        let input = TransactionInput::new([9u8; 32], 0, SEQUENCE_NO_RBF);
        let script = locking_script(ScriptType::P2PKH, &[3u8; 20]).unwrap();
        let tx = FullTransaction::new(
            header,
            vec![input],
            vec![TransactionOutput::new(1_000, 0, script, ScriptType::Unknown)],
        );

        f.pending_processor.process_created(tx.clone()).unwrap();
        assert!(matches!(
            f.pending_processor.process_created(tx),
            Err(ProcessorError::TransactionAlreadyExists(_))
        ));
    }
}
