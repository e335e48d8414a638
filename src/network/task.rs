//! Peer tasks
//!
//! A task is a request/response exchange with one peer: it emits its
//! request messages on `start`, consumes the replies routed to it and
//! finishes as completed or failed. Tasks never touch the socket or the
//! clock themselves; the owning `Peer` passes messages and `Instant`s in,
//! which keeps every exchange testable without a connection.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::core::block::{BlockHash, MerkleBlock};
use crate::core::transaction::FullTransaction;
use crate::crypto::{Hash256, ZERO_HASH};
use crate::network::message::{InvItem, InvType, Message};
use crate::network::peer::PeerError;

// =============================================================================
// Constants
// =============================================================================

const MIN_EXPECTED_BLOCK_HASHES: u32 = 6;
const MAX_EXPECTED_BLOCK_HASHES: u32 = 500;
const MIN_BLOCK_HASHES_IDLE: Duration = Duration::from_secs(1);
const MAX_BLOCK_HASHES_IDLE: Duration = Duration::from_secs(10);

const MERKLE_BLOCKS_IDLE: Duration = Duration::from_secs(5);
/// Throughput is judged only once a download has run this long
const SPEED_CHECK_DELAY: Duration = Duration::from_secs(10);

const SEND_TRANSACTION_IDLE: Duration = Duration::from_secs(30);
const REQUEST_TRANSACTIONS_IDLE: Duration = Duration::from_secs(5);

// =============================================================================
// Common State
// =============================================================================

#[derive(Debug)]
pub enum TaskStatus {
    Running,
    Completed,
    Failed(PeerError),
}

impl TaskStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }
}

/// Idle timer: a task times out when no reply arrived for `allowed_idle`
#[derive(Debug, Clone)]
struct TaskTimer {
    allowed_idle: Duration,
    last_active: Option<Instant>,
}

impl TaskTimer {
    fn new(allowed_idle: Duration) -> Self {
        Self {
            allowed_idle,
            last_active: None,
        }
    }

    fn reset(&mut self, now: Instant) {
        self.last_active = Some(now);
    }

    fn expired(&self, now: Instant) -> bool {
        self.last_active
            .map(|last| now.saturating_duration_since(last) > self.allowed_idle)
            .unwrap_or(false)
    }
}

/// Minimum merkle block download rate, per minute
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadSpeed {
    pub merkle_blocks: f64,
    pub transactions: f64,
}

impl Default for DownloadSpeed {
    fn default() -> Self {
        Self {
            merkle_blocks: 500.0,
            transactions: 50_000.0,
        }
    }
}

impl DownloadSpeed {
    pub fn divided(self, by: f64) -> Self {
        Self {
            merkle_blocks: self.merkle_blocks / by,
            transactions: self.transactions / by,
        }
    }
}

// =============================================================================
// Get Block Hashes
// =============================================================================

/// `getblocks` with a locator, answered by a block `inv`
#[derive(Debug)]
pub struct GetBlockHashesTask {
    locator: Vec<Hash256>,
    protocol_version: i32,
    expected_min: usize,
    /// Largest block inventory received
    pub block_hashes: Vec<Hash256>,
    timer: TaskTimer,
    status: TaskStatus,
}

impl GetBlockHashesTask {
    pub fn new(locator: Vec<Hash256>, expected_hashes_min_count: u32, protocol_version: i32) -> Self {
        let expected = expected_hashes_min_count.clamp(MIN_EXPECTED_BLOCK_HASHES, MAX_EXPECTED_BLOCK_HASHES);
        let scaled = MAX_BLOCK_HASHES_IDLE.mul_f64(expected as f64 / MAX_EXPECTED_BLOCK_HASHES as f64);

        Self {
            locator,
            protocol_version,
            expected_min: expected as usize,
            block_hashes: Vec::new(),
            timer: TaskTimer::new(scaled.max(MIN_BLOCK_HASHES_IDLE)),
            status: TaskStatus::Running,
        }
    }

    pub fn allowed_idle(&self) -> Duration {
        self.timer.allowed_idle
    }

    fn start(&mut self, now: Instant) -> Vec<Message> {
        self.timer.reset(now);
        vec![Message::GetBlocks {
            version: self.protocol_version,
            locator: self.locator.clone(),
            stop: ZERO_HASH,
        }]
    }

    fn handle_inventory(&mut self, items: &[InvItem]) -> bool {
        let hashes: Vec<Hash256> = items
            .iter()
            .filter(|item| item.inv_type == InvType::Block)
            .map(|item| item.hash)
            .collect();
        if hashes.is_empty() {
            return false;
        }

        // A peer also announces its tip after answering; when the tip is
        // already in our locator that announcement carries nothing new.
        if hashes.iter().any(|hash| self.locator.contains(hash)) {
            return true;
        }

        if hashes.len() > self.block_hashes.len() {
            self.block_hashes = hashes;
        }
        if self.block_hashes.len() >= self.expected_min {
            self.status = TaskStatus::Completed;
        }
        true
    }

    fn handle_timeout(&mut self) {
        self.status = TaskStatus::Completed;
    }
}

// =============================================================================
// Get Merkle Blocks
// =============================================================================

/// `getdata` for filtered blocks; each `merkleblock` is followed by a `tx`
/// for every matched transaction the peer has not sent before
#[derive(Debug)]
pub struct GetMerkleBlocksTask {
    block_hashes: Vec<BlockHash>,
    pending: Vec<MerkleBlock>,
    /// Assembled blocks not yet picked up by the peer
    completed: Vec<MerkleBlock>,
    min_speed: DownloadSpeed,
    started: Option<Instant>,
    requested_count: usize,
    received_blocks: usize,
    received_transactions: usize,
    timer: TaskTimer,
    status: TaskStatus,
}

impl GetMerkleBlocksTask {
    pub fn new(block_hashes: Vec<BlockHash>, min_speed: DownloadSpeed) -> Self {
        Self {
            requested_count: block_hashes.len(),
            block_hashes,
            pending: Vec::new(),
            completed: Vec::new(),
            min_speed,
            started: None,
            received_blocks: 0,
            received_transactions: 0,
            timer: TaskTimer::new(MERKLE_BLOCKS_IDLE),
            status: TaskStatus::Running,
        }
    }

    fn start(&mut self, now: Instant) -> Vec<Message> {
        self.started = Some(now);
        self.timer.reset(now);
        let items = self
            .block_hashes
            .iter()
            .map(|hash| InvItem::filtered_block(hash.header_hash))
            .collect();
        vec![Message::GetData(items)]
    }

    fn handle_merkle_block(&mut self, merkle_block: &MerkleBlock, now: Instant) -> bool {
        let Some(height) = self
            .block_hashes
            .iter()
            .find(|hash| hash.header_hash == merkle_block.block_hash())
            .map(|hash| hash.height)
        else {
            return false;
        };

        self.timer.reset(now);
        self.received_blocks += 1;

        let mut merkle_block = merkle_block.clone();
        merkle_block.height = (height > 0).then_some(height);

        if merkle_block.complete() {
            self.finish_block(merkle_block);
        } else {
            self.pending.push(merkle_block);
        }
        true
    }

    fn handle_transaction(&mut self, transaction: &FullTransaction, now: Instant) -> bool {
        let hash = transaction.hash();
        let Some(position) = self.pending.iter().position(|block| block.expects(&hash)) else {
            return false;
        };

        self.timer.reset(now);
        self.received_transactions += 1;

        let block = &mut self.pending[position];
        block.associated_transactions.push(transaction.clone());
        if block.complete() {
            let block = self.pending.remove(position);
            self.finish_block(block);
        }
        true
    }

    fn finish_block(&mut self, merkle_block: MerkleBlock) {
        let hash = merkle_block.block_hash();
        self.block_hashes.retain(|h| h.header_hash != hash);
        self.completed.push(merkle_block);

        if self.block_hashes.is_empty() {
            self.status = TaskStatus::Completed;
        }
    }

    fn check_speed(&mut self, now: Instant) {
        let Some(started) = self.started else {
            return;
        };
        let elapsed = now.saturating_duration_since(started);
        if elapsed < SPEED_CHECK_DELAY {
            return;
        }

        let minutes = elapsed.as_secs_f64() / 60.0;
        let expected_blocks = (self.min_speed.merkle_blocks * minutes).min(self.requested_count as f64);
        let expected_transactions = self.min_speed.transactions * minutes;

        if (self.received_blocks as f64) < expected_blocks
            && (self.received_transactions as f64) < expected_transactions
        {
            self.status = TaskStatus::Failed(PeerError::TooSlow {
                merkle_blocks: self.received_blocks,
                seconds: elapsed.as_secs(),
            });
        }
    }

    fn handle_timeout(&mut self) {
        self.status = if self.block_hashes.is_empty() {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed(PeerError::MerkleBlocksNotReceived(self.block_hashes.len()))
        };
    }
}

// =============================================================================
// Send Transaction
// =============================================================================

/// Announce a transaction with `inv` and serve the peer's `getdata`
#[derive(Debug)]
pub struct SendTransactionTask {
    pub transaction: FullTransaction,
    /// The peer actually fetched the transaction
    pub sent: bool,
    timer: TaskTimer,
    status: TaskStatus,
}

impl SendTransactionTask {
    pub fn new(transaction: FullTransaction) -> Self {
        Self {
            transaction,
            sent: false,
            timer: TaskTimer::new(SEND_TRANSACTION_IDLE),
            status: TaskStatus::Running,
        }
    }

    fn start(&mut self, now: Instant) -> Vec<Message> {
        self.timer.reset(now);
        vec![Message::Inv(vec![InvItem::tx(self.transaction.hash())])]
    }

    fn handle_get_data(&mut self, item: &InvItem) -> Option<Message> {
        if item.inv_type != InvType::Tx || item.hash != self.transaction.hash() {
            return None;
        }
        self.sent = true;
        self.status = TaskStatus::Completed;
        Some(Message::Tx(self.transaction.clone()))
    }

    // A peer that already has the transaction never asks for it
    fn handle_timeout(&mut self) {
        self.status = TaskStatus::Completed;
    }
}

// =============================================================================
// Request Transactions
// =============================================================================

/// `getdata` for transactions announced in a mempool `inv`
#[derive(Debug)]
pub struct RequestTransactionsTask {
    hashes: HashSet<Hash256>,
    pub transactions: Vec<FullTransaction>,
    timer: TaskTimer,
    status: TaskStatus,
}

impl RequestTransactionsTask {
    pub fn new(hashes: Vec<Hash256>) -> Self {
        Self {
            hashes: hashes.into_iter().collect(),
            transactions: Vec::new(),
            timer: TaskTimer::new(REQUEST_TRANSACTIONS_IDLE),
            status: TaskStatus::Running,
        }
    }

    pub fn requested(&self) -> impl Iterator<Item = &Hash256> {
        self.hashes.iter()
    }

    fn start(&mut self, now: Instant) -> Vec<Message> {
        self.timer.reset(now);
        let items = self.hashes.iter().map(|hash| InvItem::tx(*hash)).collect();
        vec![Message::GetData(items)]
    }

    fn handle_transaction(&mut self, transaction: &FullTransaction, now: Instant) -> bool {
        if !self.hashes.remove(&transaction.hash()) {
            return false;
        }
        self.timer.reset(now);
        self.transactions.push(transaction.clone());
        self.complete_if_done();
        true
    }

    fn handle_not_found(&mut self, items: &[InvItem]) -> bool {
        let before = self.hashes.len();
        for item in items.iter().filter(|i| i.inv_type == InvType::Tx) {
            self.hashes.remove(&item.hash);
        }
        let handled = self.hashes.len() != before;
        self.complete_if_done();
        handled
    }

    fn complete_if_done(&mut self) {
        if self.hashes.is_empty() {
            self.status = TaskStatus::Completed;
        }
    }

    // Whatever arrived is still worth processing
    fn handle_timeout(&mut self) {
        self.status = TaskStatus::Completed;
    }
}

// =============================================================================
// Peer Task
// =============================================================================

#[derive(Debug)]
pub enum PeerTask {
    GetBlockHashes(GetBlockHashesTask),
    GetMerkleBlocks(GetMerkleBlocksTask),
    SendTransaction(SendTransactionTask),
    RequestTransactions(RequestTransactionsTask),
}

impl PeerTask {
    fn timer(&mut self) -> &mut TaskTimer {
        match self {
            PeerTask::GetBlockHashes(t) => &mut t.timer,
            PeerTask::GetMerkleBlocks(t) => &mut t.timer,
            PeerTask::SendTransaction(t) => &mut t.timer,
            PeerTask::RequestTransactions(t) => &mut t.timer,
        }
    }

    fn status_mut(&mut self) -> &mut TaskStatus {
        match self {
            PeerTask::GetBlockHashes(t) => &mut t.status,
            PeerTask::GetMerkleBlocks(t) => &mut t.status,
            PeerTask::SendTransaction(t) => &mut t.status,
            PeerTask::RequestTransactions(t) => &mut t.status,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PeerTask::GetBlockHashes(_) => "GetBlockHashes",
            PeerTask::GetMerkleBlocks(_) => "GetMerkleBlocks",
            PeerTask::SendTransaction(_) => "SendTransaction",
            PeerTask::RequestTransactions(_) => "RequestTransactions",
        }
    }

    /// Request messages to send; starts the idle timer
    pub fn start(&mut self, now: Instant) -> Vec<Message> {
        match self {
            PeerTask::GetBlockHashes(t) => t.start(now),
            PeerTask::GetMerkleBlocks(t) => t.start(now),
            PeerTask::SendTransaction(t) => t.start(now),
            PeerTask::RequestTransactions(t) => t.start(now),
        }
    }

    pub fn reset_timer(&mut self, now: Instant) {
        self.timer().reset(now);
    }

    pub fn is_running(&mut self) -> bool {
        self.status_mut().is_running()
    }

    /// Take the final status, leaving the task marked running
    pub fn take_status(&mut self) -> TaskStatus {
        std::mem::replace(self.status_mut(), TaskStatus::Running)
    }

    pub fn handle_inventory(&mut self, items: &[InvItem]) -> bool {
        match self {
            PeerTask::GetBlockHashes(t) => t.handle_inventory(items),
            _ => false,
        }
    }

    pub fn handle_merkle_block(&mut self, merkle_block: &MerkleBlock, now: Instant) -> bool {
        match self {
            PeerTask::GetMerkleBlocks(t) => t.handle_merkle_block(merkle_block, now),
            _ => false,
        }
    }

    pub fn handle_transaction(&mut self, transaction: &FullTransaction, now: Instant) -> bool {
        match self {
            PeerTask::GetMerkleBlocks(t) => t.handle_transaction(transaction, now),
            PeerTask::RequestTransactions(t) => t.handle_transaction(transaction, now),
            _ => false,
        }
    }

    pub fn handle_get_data(&mut self, item: &InvItem) -> Option<Message> {
        match self {
            PeerTask::SendTransaction(t) => t.handle_get_data(item),
            _ => None,
        }
    }

    pub fn handle_not_found(&mut self, items: &[InvItem]) -> bool {
        match self {
            PeerTask::RequestTransactions(t) => t.handle_not_found(items),
            _ => false,
        }
    }

    /// Merkle blocks assembled since the last call
    pub fn take_merkle_blocks(&mut self) -> Vec<MerkleBlock> {
        match self {
            PeerTask::GetMerkleBlocks(t) => std::mem::take(&mut t.completed),
            _ => Vec::new(),
        }
    }

    pub fn check_timeout(&mut self, now: Instant) {
        if let PeerTask::GetMerkleBlocks(t) = self {
            t.check_speed(now);
            if !t.status.is_running() {
                return;
            }
        }

        if !self.timer().expired(now) {
            return;
        }

        match self {
            PeerTask::GetBlockHashes(t) => t.handle_timeout(),
            PeerTask::GetMerkleBlocks(t) => t.handle_timeout(),
            PeerTask::SendTransaction(t) => t.handle_timeout(),
            PeerTask::RequestTransactions(t) => t.handle_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::BlockHeader;
    use crate::core::transaction::{Transaction, TransactionInput};

    fn header(nonce: u32) -> BlockHeader {
        BlockHeader::new(1, [0u8; 32], [nonce as u8; 32], 1_600_000_000, 0x207f_ffff, nonce)
    }

    fn transaction(salt: u8) -> FullTransaction {
        FullTransaction::new(Transaction::default(), vec![TransactionInput::new([salt; 32], 0, 0)], vec![])
    }

    fn block_inv(hashes: &[Hash256]) -> Vec<InvItem> {
        hashes.iter().map(|h| InvItem::new(InvType::Block, *h)).collect()
    }

    #[test]
    fn test_block_hashes_idle_time_scales() {
        assert_eq!(GetBlockHashesTask::new(vec![], 0, 70014).allowed_idle(), Duration::from_secs(1));
        assert_eq!(GetBlockHashesTask::new(vec![], 250, 70014).allowed_idle(), Duration::from_secs(5));
        assert_eq!(GetBlockHashesTask::new(vec![], 10_000, 70014).allowed_idle(), Duration::from_secs(10));
    }

    #[test]
    fn test_block_hashes_completes_on_expected_count() {
        let now = Instant::now();
        let mut task = PeerTask::GetBlockHashes(GetBlockHashesTask::new(vec![[1u8; 32]], 6, 70014));
        match task.start(now).as_slice() {
            [Message::GetBlocks { locator, stop, .. }] => {
                assert_eq!(locator, &vec![[1u8; 32]]);
                assert_eq!(stop, &ZERO_HASH);
            }
            other => panic!("unexpected {:?}", other),
        }

        // tip announcement echoing the locator is ignored
        assert!(task.handle_inventory(&block_inv(&[[1u8; 32]])));
        assert!(task.is_running());

        // transaction inventory is not ours
        assert!(!task.handle_inventory(&[InvItem::tx([3u8; 32])]));

        let hashes: Vec<Hash256> = (10..16u8).map(|b| [b; 32]).collect();
        assert!(task.handle_inventory(&block_inv(&hashes)));
        assert!(matches!(task.take_status(), TaskStatus::Completed));
        match task {
            PeerTask::GetBlockHashes(t) => assert_eq!(t.block_hashes, hashes),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_block_hashes_timeout_completes() {
        let now = Instant::now();
        let mut task = PeerTask::GetBlockHashes(GetBlockHashesTask::new(vec![], 100, 70014));
        task.start(now);
        task.check_timeout(now + Duration::from_millis(500));
        assert!(task.is_running());
        task.check_timeout(now + Duration::from_secs(3));
        assert!(matches!(task.take_status(), TaskStatus::Completed));
    }

    #[test]
    fn test_merkle_blocks_assembles_transactions() {
        let now = Instant::now();
        let tx = transaction(1);
        let with_tx = MerkleBlock::new(header(1), vec![tx.hash()]);
        let empty = MerkleBlock::new(header(2), vec![]);

        let mut task = PeerTask::GetMerkleBlocks(GetMerkleBlocksTask::new(
            vec![
                BlockHash::new(with_tx.block_hash(), 0, 1),
                BlockHash::new(empty.block_hash(), 120, 2),
            ],
            DownloadSpeed::default(),
        ));
        match task.start(now).as_slice() {
            [Message::GetData(items)] => assert_eq!(items.len(), 2),
            other => panic!("unexpected {:?}", other),
        }

        assert!(task.handle_merkle_block(&with_tx, now));
        assert!(task.take_merkle_blocks().is_empty());
        assert!(!task.handle_merkle_block(&MerkleBlock::new(header(3), vec![]), now));

        assert!(task.handle_transaction(&tx, now));
        let blocks = task.take_merkle_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].associated_transactions.len(), 1);
        assert_eq!(blocks[0].height, None);
        assert!(task.is_running());

        assert!(task.handle_merkle_block(&empty, now));
        let blocks = task.take_merkle_blocks();
        assert_eq!(blocks[0].height, Some(120));
        assert!(matches!(task.take_status(), TaskStatus::Completed));
    }

    #[test]
    fn test_merkle_blocks_timeout_fails_when_pending() {
        let now = Instant::now();
        let mut task = PeerTask::GetMerkleBlocks(GetMerkleBlocksTask::new(
            vec![BlockHash::new([7u8; 32], 0, 1)],
            DownloadSpeed::default(),
        ));
        task.start(now);
        task.check_timeout(now + Duration::from_secs(6));
        assert!(matches!(
            task.take_status(),
            TaskStatus::Failed(PeerError::MerkleBlocksNotReceived(1))
        ));
    }

    #[test]
    fn test_merkle_blocks_slow_peer() {
        let now = Instant::now();
        let hashes: Vec<BlockHash> = (1..=500u32).map(|i| BlockHash::new(header(i).hash, 0, i)).collect();
        let mut task = PeerTask::GetMerkleBlocks(GetMerkleBlocksTask::new(hashes, DownloadSpeed::default()));
        task.start(now);

        // one block per second keeps the idle timer alive but is far too slow
        for i in 1..=12u32 {
            let at = now + Duration::from_secs(i as u64);
            assert!(task.handle_merkle_block(&MerkleBlock::new(header(i), vec![]), at));
            task.check_timeout(at);
        }
        assert!(matches!(task.take_status(), TaskStatus::Failed(PeerError::TooSlow { .. })));

        let lenient = DownloadSpeed::default().divided(100.0);
        assert!((lenient.merkle_blocks - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_send_transaction_answers_getdata() {
        let now = Instant::now();
        let tx = transaction(2);
        let mut task = PeerTask::SendTransaction(SendTransactionTask::new(tx.clone()));
        match task.start(now).as_slice() {
            [Message::Inv(items)] => assert_eq!(items[0], InvItem::tx(tx.hash())),
            other => panic!("unexpected {:?}", other),
        }

        assert!(task.handle_get_data(&InvItem::tx([0u8; 32])).is_none());
        assert!(matches!(task.handle_get_data(&InvItem::tx(tx.hash())), Some(Message::Tx(_))));
        assert!(matches!(task.take_status(), TaskStatus::Completed));
        match task {
            PeerTask::SendTransaction(t) => assert!(t.sent),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_request_transactions() {
        let now = Instant::now();
        let (a, b) = (transaction(3), transaction(4));
        let mut task = PeerTask::RequestTransactions(RequestTransactionsTask::new(vec![a.hash(), b.hash()]));
        task.start(now);

        assert!(task.handle_transaction(&a, now));
        assert!(!task.handle_transaction(&a, now));
        assert!(task.is_running());

        assert!(task.handle_not_found(&[InvItem::tx(b.hash())]));
        assert!(matches!(task.take_status(), TaskStatus::Completed));
        match task {
            PeerTask::RequestTransactions(t) => assert_eq!(t.transactions.len(), 1),
            _ => unreachable!(),
        }
    }
}
