//! Peer group coordinator
//!
//! A single task owns every piece of per-peer state. Connection tasks feed
//! it `PeerEvent`s; the kit talks to it through a `PeerGroupHandle`. Each
//! event is turned into `PeerNotice`s by the affected `Peer` and then routed
//! to initial block download, mempool relay and the transaction sender.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::bloom::BloomFilter;
use crate::network::addrman::PeerAddressManager;
use crate::network::connection::run_connection;
use crate::network::initial_block_download::{InitialBlockDownload, SyncSignal};
use crate::network::mempool_transactions::MempoolTransactions;
use crate::network::params::NetworkParams;
use crate::network::peer::{Peer, PeerError, PeerEvent, PeerHandle, PeerId, PeerManager, PeerNotice};
use crate::network::task::{PeerTask, SendTransactionTask};
use crate::transactions::sender::{TransactionBroadcaster, TransactionSender};
use crate::wallet::BloomFilterListener;

/// How often peers and tasks are checked for timeouts
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the connection event queue
const EVENT_QUEUE_SIZE: usize = 1024;

/// Peer group errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerGroupError {
    #[error("Peers not synced")]
    PeersNotSynced,
    #[error("Peer group stopped")]
    Stopped,
}

/// Peer group configuration
#[derive(Debug, Clone)]
pub struct PeerGroupConfig {
    /// Connections to keep open
    pub peer_size: usize,
    /// Connected peers needed before a transaction is sent
    pub min_peers_to_send: usize,
    /// Share of connected peers that must be synced before sending
    pub min_synced_peer_ratio: f64,
}

impl Default for PeerGroupConfig {
    fn default() -> Self {
        Self {
            peer_size: 10,
            min_peers_to_send: 2,
            min_synced_peer_ratio: 0.5,
        }
    }
}

/// Requests from the kit to the coordinator
#[derive(Debug)]
pub enum PeerGroupCommand {
    SendPending,
    LoadFilter(Arc<BloomFilter>),
    Stop,
}

/// Snapshot published after every event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerGroupStatus {
    pub connected: usize,
    pub synced: usize,
    /// Peers a transaction would be announced to right now
    pub peers_to_send: usize,
}

// =============================================================================
// Handle
// =============================================================================

#[derive(Clone)]
pub struct PeerGroupHandle {
    commands: mpsc::UnboundedSender<PeerGroupCommand>,
    status: Arc<RwLock<PeerGroupStatus>>,
    config: PeerGroupConfig,
}

impl PeerGroupHandle {
    pub fn status(&self) -> PeerGroupStatus {
        self.status.read().clone()
    }

    pub fn stop(&self) {
        let _ = self.commands.send(PeerGroupCommand::Stop);
    }

    fn send(&self, command: PeerGroupCommand) {
        if self.commands.send(command).is_err() {
            log::debug!("Peer group is not running");
        }
    }
}

impl TransactionBroadcaster for PeerGroupHandle {
    fn can_send_transaction(&self) -> Result<(), PeerGroupError> {
        let status = self.status.read();
        let synced_ratio = if status.connected == 0 {
            0.0
        } else {
            status.synced as f64 / status.connected as f64
        };

        if status.connected < self.config.min_peers_to_send
            || synced_ratio < self.config.min_synced_peer_ratio
            || status.peers_to_send == 0
        {
            return Err(PeerGroupError::PeersNotSynced);
        }
        Ok(())
    }

    fn send_pending_transactions(&self) {
        self.send(PeerGroupCommand::SendPending);
    }
}

impl BloomFilterListener for PeerGroupHandle {
    fn on_filter_updated(&self, filter: Arc<BloomFilter>) {
        self.send(PeerGroupCommand::LoadFilter(filter));
    }
}

// =============================================================================
// Peer Group
// =============================================================================

pub struct PeerGroup {
    params: NetworkParams,
    config: PeerGroupConfig,
    peers: PeerManager,
    ibd: InitialBlockDownload,
    mempool: MempoolTransactions,
    sender: Arc<TransactionSender>,
    addrman: PeerAddressManager,
    bloom_filter: Option<Arc<BloomFilter>>,
    next_id: PeerId,
    running: bool,
    last_send_attempt: Option<Instant>,
    status: Arc<RwLock<PeerGroupStatus>>,
    events_tx: mpsc::Sender<PeerEvent>,
    events_rx: mpsc::Receiver<PeerEvent>,
    commands_rx: mpsc::UnboundedReceiver<PeerGroupCommand>,
}

impl PeerGroup {
    pub fn new(
        params: NetworkParams,
        config: PeerGroupConfig,
        ibd: InitialBlockDownload,
        mempool: MempoolTransactions,
        sender: Arc<TransactionSender>,
        mut addrman: PeerAddressManager,
        bloom_filter: Option<Arc<BloomFilter>>,
    ) -> (Self, PeerGroupHandle) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let status = Arc::new(RwLock::new(PeerGroupStatus::default()));
        addrman.set_event_sender(events_tx.clone());

        let handle = PeerGroupHandle {
            commands: commands_tx,
            status: status.clone(),
            config: config.clone(),
        };

        let group = Self {
            params,
            config,
            peers: PeerManager::new(),
            ibd,
            mempool,
            sender,
            addrman,
            bloom_filter,
            next_id: 1,
            running: false,
            last_send_attempt: None,
            status,
            events_tx,
            events_rx,
            commands_rx,
        };
        (group, handle)
    }

    /// Run until stopped
    pub async fn run(mut self) {
        self.start();

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event, Instant::now());
                }
                command = self.commands_rx.recv() => {
                    let command = command.unwrap_or(PeerGroupCommand::Stop);
                    if !self.handle_command(command, Instant::now()) {
                        break;
                    }
                }
                _ = interval.tick() => self.tick(Instant::now()),
            }
        }

        self.running = false;
        self.peers.disconnect_all();
        self.update_status();
        log::info!("Peer group stopped");
    }

    fn start(&mut self) {
        log::info!("Starting peer group on {}", self.params.network);
        self.running = true;
        if let Err(e) = self.ibd.on_start() {
            log::error!("Failed to prepare block download: {}", e);
        }
        self.connect_peers_if_required();
    }

    /// Returns false once the group should stop
    fn handle_command(&mut self, command: PeerGroupCommand, now: Instant) -> bool {
        match command {
            PeerGroupCommand::SendPending => self.send_pending_transactions(now),
            PeerGroupCommand::LoadFilter(filter) => {
                for peer in self.peers.iter_mut().filter(|p| p.connected) {
                    peer.filter_load(&filter);
                }
                self.bloom_filter = Some(filter);
            }
            PeerGroupCommand::Stop => return false,
        }
        self.update_status();
        true
    }

    fn handle_event(&mut self, event: PeerEvent, now: Instant) {
        match event {
            PeerEvent::SocketConnected { id, addr } => {
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.socket_connected(addr, now);
                }
            }
            PeerEvent::Message { id, message } => {
                let notices = match self.peers.get_mut(id) {
                    Some(peer) => peer.handle_message(message, now),
                    None => return,
                };
                self.process_notices(id, notices, now);
            }
            PeerEvent::Disconnected { id, error } => self.on_peer_disconnect(id, error, now),
            PeerEvent::SeedAddresses(ips) => {
                self.addrman.add_ips(ips);
                self.connect_peers_if_required();
            }
        }
        self.update_status();
    }

    fn tick(&mut self, now: Instant) {
        for id in self.peers.ids() {
            let notices = match self.peers.get_mut(id) {
                Some(peer) => peer.tick(now),
                None => continue,
            };
            self.process_notices(id, notices, now);
        }

        let due = self
            .last_send_attempt
            .map(|last| now.saturating_duration_since(last) >= self.sender.retries_period())
            .unwrap_or(false);
        if due {
            self.send_pending_transactions(now);
        }
        self.update_status();
    }

    fn process_notices(&mut self, id: PeerId, notices: Vec<PeerNotice>, now: Instant) {
        for notice in notices {
            match notice {
                PeerNotice::Connected => self.on_peer_connect(id, now),
                PeerNotice::Ready => self.ibd.on_peer_ready(&mut self.peers, id, now),
                PeerNotice::TaskCompleted(task) => self.on_task_completed(id, task),
                PeerNotice::Inventory(items) => {
                    self.ibd.handle_inventory(&mut self.peers, id, &items, now);
                    if let Some(peer) = self.peers.get_mut(id) {
                        self.mempool.handle_inventory(peer, &items, now);
                    }
                }
                PeerNotice::Addresses(addrs) => {
                    self.addrman.add_relayed(&addrs);
                    self.connect_peers_if_required();
                }
                PeerNotice::MerkleBlock(merkle_block) => {
                    if let Err(e) = self.ibd.handle_merkle_block(&self.peers, merkle_block) {
                        log::warn!("Rejected merkle block: {}", e);
                        if let Some(peer) = self.peers.get_mut(id) {
                            peer.close(PeerError::InvalidBlock(e.to_string()));
                        }
                        return;
                    }
                }
            }
        }
        self.handle_sync_signals(now);
    }

    fn on_peer_connect(&mut self, id: PeerId, now: Instant) {
        if let Some(peer) = self.peers.get(id) {
            log::info!("Peer connected: {}", peer.host());
            let connection_ms = peer.connection_time.map(|t| t.as_millis() as i64).unwrap_or(0);
            self.addrman.mark_connected(peer.host(), connection_ms);
            if let Some(filter) = &self.bloom_filter {
                peer.filter_load(filter);
            }
        }
        self.ibd.on_peer_connect(&mut self.peers, id, now);
    }

    fn on_task_completed(&mut self, id: PeerId, task: PeerTask) {
        let handled = self.ibd.handle_completed_task(&mut self.peers, id, &task)
            || self.mempool.handle_completed_task(id, &task)
            || self.sender.handle_completed_task(&task);
        if !handled {
            log::debug!("Unhandled completed task {}", task.name());
        }
    }

    fn on_peer_disconnect(&mut self, id: PeerId, error: Option<PeerError>, now: Instant) {
        let Some(peer) = self.peers.remove(id) else {
            return;
        };

        match &error {
            None => log::info!("Peer {} disconnected", peer.host()),
            Some(e) => log::info!("Peer {} disconnected: {}", peer.host(), e),
        }
        match &error {
            None => self.addrman.mark_success(peer.host()),
            Some(e) if e.is_timeout() => self.addrman.mark_success(peer.host()),
            Some(_) => self.addrman.mark_failed(peer.host()),
        }

        self.ibd.on_peer_disconnect(&mut self.peers, id, error.as_ref(), now);
        self.mempool.on_peer_disconnect(id);
        self.handle_sync_signals(now);
        self.connect_peers_if_required();
    }

    fn handle_sync_signals(&mut self, now: Instant) {
        for signal in self.ibd.take_signals() {
            match signal {
                SyncSignal::PeerSynced(_) => {}
                SyncSignal::AllPeersSynced => self.send_pending_transactions(now),
            }
        }
    }

    fn connect_peers_if_required(&mut self) {
        if !self.running {
            return;
        }

        while self.peers.len() < self.config.peer_size {
            let Some(host) = self.addrman.get_ip() else {
                break;
            };
            self.connect(host);
        }
    }

    fn connect(&mut self, host: String) {
        let id = self.next_id;
        self.next_id += 1;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let handle = PeerHandle::new(id, host.clone(), commands_tx);
        self.add_peer(Peer::new(handle, &self.params, self.ibd.local_best_block_height(), Instant::now()));

        log::debug!("Connecting to {}", host);
        tokio::spawn(run_connection(
            id,
            host,
            self.params.port,
            self.params.magic,
            commands_rx,
            self.events_tx.clone(),
        ));
    }

    fn add_peer(&mut self, peer: Peer) {
        self.peers.add(peer);
    }

    /// Peers to announce a transaction to: keep one synced peer free, then
    /// prefer peers still syncing, and use half of the candidates
    fn peers_to_send(&self) -> Vec<PeerId> {
        if self.peers.connected_count() < self.config.min_peers_to_send {
            return Vec::new();
        }

        let free_synced_peer = self
            .ibd
            .synced_peers()
            .iter()
            .filter_map(|id| self.peers.get(*id))
            .min_by_key(|p| (p.ready(), p.id()))
            .map(|p| p.id());
        let Some(free_synced_peer) = free_synced_peer else {
            return Vec::new();
        };

        let mut ready: Vec<&Peer> = self
            .peers
            .ready()
            .into_iter()
            .filter(|id| *id != free_synced_peer)
            .filter_map(|id| self.peers.get(id))
            .collect();
        ready.sort_by_key(|p| (p.synced, p.id()));

        let count = if ready.len() == 1 { 1 } else { ready.len() / 2 };
        ready.into_iter().take(count).map(|p| p.id()).collect()
    }

    fn send_pending_transactions(&mut self, now: Instant) {
        if !self.sender.has_pending() {
            self.last_send_attempt = None;
            return;
        }
        self.last_send_attempt = Some(now);

        let now_ms = chrono::Utc::now().timestamp_millis();
        let transactions = self.sender.transactions_to_send(now_ms);
        if transactions.is_empty() {
            return;
        }

        let peers = self.peers_to_send();
        if peers.is_empty() {
            log::debug!("No peers to send {} transactions", transactions.len());
            return;
        }

        for transaction in transactions {
            log::info!("Sending transaction {}", transaction.header.hash_hex());
            self.sender.transaction_send_start(&transaction, now_ms);
            for id in &peers {
                if let Some(peer) = self.peers.get_mut(*id) {
                    peer.add_task(PeerTask::SendTransaction(SendTransactionTask::new(transaction.clone())), now);
                }
            }
        }
    }

    fn update_status(&self) {
        let status = PeerGroupStatus {
            connected: self.peers.connected_count(),
            synced: self
                .ibd
                .synced_peers()
                .iter()
                .filter(|id| self.peers.get(**id).map(|p| p.connected).unwrap_or(false))
                .count(),
            peers_to_send: self.peers_to_send().len(),
        };
        *self.status.write() = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::{FullTransaction, Transaction, TransactionInput, TransactionStatus};
    use crate::network::message::{Message, ServiceFlags};
    use crate::network::peer::tests::{drain, test_peer, version};
    use crate::network::peer::PeerCommand;
    use crate::network::sync::tests::{fixture, SyncFixture};
    use crate::storage::{MemoryStorage, PeerAddress, Storage};
    use crate::transactions::sender::{DEFAULT_MAX_RETRIES, DEFAULT_RETRIES_PERIOD};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn group() -> (PeerGroup, PeerGroupHandle, Arc<MemoryStorage>) {
        let SyncFixture {
            storage,
            public_key_manager,
            bloom_filter_manager,
            pending_processor,
            syncer,
            ..
        } = fixture();
        bloom_filter_manager.regenerate_bloom_filter();
        let sender = Arc::new(TransactionSender::new(
            storage.clone(),
            DEFAULT_MAX_RETRIES,
            DEFAULT_RETRIES_PERIOD,
        ));
        let mempool = MempoolTransactions::new(
            storage.clone(),
            pending_processor,
            public_key_manager,
            bloom_filter_manager.clone(),
            sender.clone(),
        );
        let addrman = PeerAddressManager::new(storage.clone(), vec![], 18444);
        let (group, handle) = PeerGroup::new(
            NetworkParams::regtest(),
            PeerGroupConfig::default(),
            InitialBlockDownload::new(syncer),
            mempool,
            sender,
            addrman,
            bloom_filter_manager.bloom_filter(),
        );
        (group, handle, storage)
    }

    /// Add a peer and complete its handshake through the group
    fn connect(group: &mut PeerGroup, id: PeerId, now: Instant) -> UnboundedReceiver<PeerCommand> {
        let (peer, mut rx) = test_peer(id, now);
        group.add_peer(peer);
        for message in [version(200, ServiceFlags::NETWORK | ServiceFlags::BLOOM), Message::VerAck] {
            group.handle_event(PeerEvent::Message { id, message }, now);
        }
        let commands = drain(&mut rx);
        assert!(matches!(commands.first(), Some(PeerCommand::Send(Message::VerAck))));
        rx
    }

    fn pending_transaction(storage: &MemoryStorage) -> FullTransaction {
        let mut header = Transaction::default();
        header.status = TransactionStatus::New;
        header.is_mine = true;
        let tx = FullTransaction::new(header, vec![TransactionInput::new([7u8; 32], 0, 0)], vec![]);
        storage.add_transaction(tx.clone());
        tx
    }

    #[test]
    fn test_connect_loads_filter_then_syncs() {
        let (mut group, _handle, _) = group();
        let now = Instant::now();
        let (peer, mut rx) = test_peer(1, now);
        group.add_peer(peer);

        group.handle_event(
            PeerEvent::Message {
                id: 1,
                message: version(200, ServiceFlags::NETWORK | ServiceFlags::BLOOM),
            },
            now,
        );
        group.handle_event(PeerEvent::Message { id: 1, message: Message::VerAck }, now);

        match drain(&mut rx).as_slice() {
            [PeerCommand::Send(Message::VerAck), PeerCommand::Send(Message::FilterLoad(_)), PeerCommand::Send(Message::GetBlocks { .. })] => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(group.handle_status().connected, 1);
    }

    #[test]
    fn test_can_send_requires_synced_peers() {
        let (mut group, handle, _) = group();
        let now = Instant::now();
        assert_eq!(handle.can_send_transaction(), Err(PeerGroupError::PeersNotSynced));

        let _rx1 = connect(&mut group, 1, now);
        let _rx2 = connect(&mut group, 2, now);
        assert_eq!(handle.status().connected, 2);
        assert_eq!(handle.can_send_transaction(), Err(PeerGroupError::PeersNotSynced));

        // block hash requests time out empty: both peers become synced
        group.tick(now + Duration::from_secs(20));
        group.tick(now + Duration::from_secs(40));
        assert_eq!(handle.status().synced, 2);
        assert!(handle.can_send_transaction().is_ok());
    }

    #[test]
    fn test_send_pending_transactions() {
        let (mut group, _handle, storage) = group();
        let now = Instant::now();
        let mut rx1 = connect(&mut group, 1, now);
        let mut rx2 = connect(&mut group, 2, now);
        group.tick(now + Duration::from_secs(20));
        group.tick(now + Duration::from_secs(40));
        drain(&mut rx1);
        drain(&mut rx2);

        let tx = pending_transaction(&storage);
        group.handle_command(PeerGroupCommand::SendPending, now + Duration::from_secs(41));

        // peer 1 stays free, peer 2 gets the announcement
        assert!(drain(&mut rx1).is_empty());
        assert!(matches!(
            drain(&mut rx2).as_slice(),
            [PeerCommand::Send(Message::Inv(items))] if items[0].hash == tx.hash()
        ));
        assert!(storage.sent_transaction(&tx.hash()).is_some());

        // the peer fetches it
        group.handle_event(
            PeerEvent::Message {
                id: 2,
                message: Message::GetData(vec![crate::network::message::InvItem::tx(tx.hash())]),
            },
            now + Duration::from_secs(42),
        );
        assert!(matches!(drain(&mut rx2).as_slice(), [PeerCommand::Send(Message::Tx(_))]));
        assert_eq!(storage.sent_transaction(&tx.hash()).unwrap().retries_count, 1);
    }

    #[test]
    fn test_disconnect_updates_addresses() {
        let (mut group, _handle, storage) = group();
        let now = Instant::now();
        storage.set_peer_addresses(vec![PeerAddress::new("10.0.0.1", 0), PeerAddress::new("10.0.0.2", 0)]);

        let _rx1 = connect(&mut group, 1, now);
        let _rx2 = connect(&mut group, 2, now);

        group.handle_event(
            PeerEvent::Disconnected {
                id: 1,
                error: Some(PeerError::Timeout("ping".to_string())),
            },
            now,
        );
        group.handle_event(
            PeerEvent::Disconnected {
                id: 2,
                error: Some(PeerError::UnsuitablePeer("services".to_string())),
            },
            now,
        );

        let ips: Vec<String> = storage.peer_addresses().into_iter().map(|a| a.ip).collect();
        assert_eq!(ips, vec!["10.0.0.1".to_string()]);
        assert_eq!(group.handle_status().connected, 0);
    }

    #[test]
    fn test_filter_update_reaches_connected_peers() {
        let (mut group, handle, _) = group();
        let now = Instant::now();
        let mut rx = connect(&mut group, 1, now);

        let filter = Arc::new(BloomFilter::with_elements(&[vec![1, 2, 3]], 0.0001, 5));
        handle.on_filter_updated(filter.clone());
        let command = group.commands_rx.try_recv().unwrap();
        group.handle_command(command, now);

        assert!(matches!(
            drain(&mut rx).as_slice(),
            [PeerCommand::Send(Message::FilterLoad(f))] if *f == *filter
        ));
    }

    impl PeerGroup {
        fn handle_status(&self) -> PeerGroupStatus {
            self.status.read().clone()
        }
    }
}
