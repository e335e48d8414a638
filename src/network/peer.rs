//! Peer state for P2P networking
//!
//! A `Peer` is the coordinator's view of one connection: handshake state,
//! sync flags, the queue of running tasks and the idle timer. The socket
//! itself lives in a connection task (see `connection`); the two talk over
//! channels, so everything here is plain synchronous state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::core::block::MerkleBlock;
use crate::core::bloom::BloomFilter;
use crate::network::message::{InvItem, Message, MessageError, NetAddr, ServiceFlags, VersionMessage};
use crate::network::params::NetworkParams;
use crate::network::task::{PeerTask, TaskStatus};

/// Silence after which we ping the peer
pub const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Time the peer has to answer anything after our ping
pub const PEER_PING_TIMEOUT: Duration = Duration::from_secs(60);

pub type PeerId = u64;

// =============================================================================
// Errors
// =============================================================================

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Message error: {0}")]
    Message(#[from] MessageError),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Unsuitable peer: {0}")]
    UnsuitablePeer(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("{0} merkle blocks not received")]
    MerkleBlocksNotReceived(usize),
    #[error("Peer too slow: {merkle_blocks} merkle blocks in {seconds}s")]
    TooSlow { merkle_blocks: usize, seconds: u64 },
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Peer group stopped")]
    Stopped,
}

impl PeerError {
    /// Errors after which the address stays usable
    pub fn is_timeout(&self) -> bool {
        matches!(self, PeerError::Timeout(_))
    }
}

// =============================================================================
// Channels
// =============================================================================

/// Commands from the coordinator to a connection task
#[derive(Debug)]
pub enum PeerCommand {
    Send(Message),
    Disconnect(PeerError),
}

/// Events from connection tasks to the coordinator
#[derive(Debug)]
pub enum PeerEvent {
    /// TCP connection established
    SocketConnected { id: PeerId, addr: SocketAddr },
    Message { id: PeerId, message: Message },
    /// Connection closed; `None` when the remote side closed it cleanly
    Disconnected { id: PeerId, error: Option<PeerError> },
    /// Addresses resolved from DNS seeds
    SeedAddresses(Vec<String>),
}

/// Handle for sending to a connection task
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    pub host: String,
    tx: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    pub fn new(id: PeerId, host: impl Into<String>, tx: mpsc::UnboundedSender<PeerCommand>) -> Self {
        Self {
            id,
            host: host.into(),
            tx,
        }
    }

    pub fn send(&self, message: Message) {
        log::trace!("Sending {} to {}", message, self.host);
        if self.tx.send(PeerCommand::Send(message)).is_err() {
            log::debug!("Connection to {} already closed", self.host);
        }
    }

    pub fn disconnect(&self, error: PeerError) {
        let _ = self.tx.send(PeerCommand::Disconnect(error));
    }
}

// =============================================================================
// Notices
// =============================================================================

/// What a message or tick on one peer means for the rest of the group
#[derive(Debug)]
pub enum PeerNotice {
    /// Handshake finished
    Connected,
    /// Task queue drained
    Ready,
    TaskCompleted(PeerTask),
    /// `inv` no running task claimed
    Inventory(Vec<InvItem>),
    Addresses(Vec<NetAddr>),
    MerkleBlock(MerkleBlock),
}

// =============================================================================
// Peer Timer
// =============================================================================

#[derive(Debug, PartialEq, Eq)]
enum TimerCheck {
    Alive,
    Idle,
    Timeout,
}

#[derive(Debug)]
struct PeerTimer {
    last_message: Instant,
    ping_sent: Option<Instant>,
}

impl PeerTimer {
    fn new(now: Instant) -> Self {
        Self {
            last_message: now,
            ping_sent: None,
        }
    }

    fn restart(&mut self, now: Instant) {
        self.last_message = now;
        self.ping_sent = None;
    }

    fn check(&self, now: Instant) -> TimerCheck {
        match self.ping_sent {
            Some(sent) if now.saturating_duration_since(sent) > PEER_PING_TIMEOUT => TimerCheck::Timeout,
            Some(_) => TimerCheck::Alive,
            None if now.saturating_duration_since(self.last_message) > PEER_IDLE_TIMEOUT => TimerCheck::Idle,
            None => TimerCheck::Alive,
        }
    }
}

// =============================================================================
// Peer
// =============================================================================

pub struct Peer {
    handle: PeerHandle,
    /// `version`/`verack` exchanged
    pub connected: bool,
    pub synced: bool,
    pub block_hashes_synced: bool,
    pub announced_last_block_height: u32,
    pub local_best_block_height: u32,
    /// Time from connection start to `verack`
    pub connection_time: Option<Duration>,
    protocol_version: i32,
    required_services: ServiceFlags,
    tasks: Vec<PeerTask>,
    timer: PeerTimer,
    created: Instant,
    closing: bool,
}

impl Peer {
    pub fn new(handle: PeerHandle, params: &NetworkParams, local_best_block_height: u32, now: Instant) -> Self {
        Self {
            handle,
            connected: false,
            synced: false,
            block_hashes_synced: false,
            announced_last_block_height: 0,
            local_best_block_height,
            connection_time: None,
            protocol_version: params.protocol_version,
            required_services: params.required_services,
            tasks: Vec::new(),
            timer: PeerTimer::new(now),
            created: now,
            closing: false,
        }
    }

    pub fn id(&self) -> PeerId {
        self.handle.id
    }

    pub fn host(&self) -> &str {
        &self.handle.host
    }

    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    /// Connected with nothing in flight
    pub fn ready(&self) -> bool {
        self.connected && !self.closing && self.tasks.is_empty()
    }

    pub fn tasks(&self) -> &[PeerTask] {
        &self.tasks
    }

    pub fn send(&self, message: Message) {
        self.handle.send(message);
    }

    pub fn close(&mut self, error: PeerError) {
        if self.closing {
            return;
        }
        log::info!("Closing peer {}: {}", self.host(), error);
        self.closing = true;
        self.handle.disconnect(error);
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn filter_load(&self, filter: &BloomFilter) {
        self.send(Message::FilterLoad(filter.clone()));
    }

    pub fn send_mempool(&self) {
        self.send(Message::Mempool);
    }

    pub fn add_task(&mut self, mut task: PeerTask, now: Instant) {
        log::debug!("Peer {} starts {}", self.host(), task.name());
        for message in task.start(now) {
            self.send(message);
        }
        self.tasks.push(task);
    }

    /// The socket is up: introduce ourselves
    pub fn socket_connected(&mut self, addr: SocketAddr, now: Instant) {
        self.timer.restart(now);
        let receiver = NetAddr::new(addr.ip(), addr.port(), ServiceFlags::empty());
        self.send(Message::Version(VersionMessage::new(
            self.protocol_version,
            receiver,
            self.local_best_block_height,
        )));
    }

    pub fn handle_message(&mut self, message: Message, now: Instant) -> Vec<PeerNotice> {
        self.timer.restart(now);
        let mut notices = Vec::new();

        match message {
            Message::Version(version) => {
                match self.validate_version(&version) {
                    Ok(()) => {
                        self.announced_last_block_height = version.start_height as u32;
                        self.send(Message::VerAck);
                    }
                    Err(e) => self.close(e),
                }
                return notices;
            }
            Message::VerAck => {
                if !self.connected {
                    self.connected = true;
                    self.connection_time = Some(now.saturating_duration_since(self.created));
                    notices.push(PeerNotice::Connected);
                }
                return notices;
            }
            _ if !self.connected => return notices,
            Message::Ping(nonce) => self.send(Message::Pong(nonce)),
            Message::Pong(_) => {}
            Message::Addr(addrs) => {
                notices.push(PeerNotice::Addresses(addrs.into_iter().map(|a| a.addr).collect()));
            }
            Message::MerkleBlock(message) => match message.to_merkle_block() {
                Ok(merkle_block) => {
                    let _ = self.tasks.iter_mut().any(|t| t.handle_merkle_block(&merkle_block, now));
                }
                Err(e) => {
                    self.close(PeerError::Message(e));
                    return notices;
                }
            },
            Message::Tx(transaction) => {
                let _ = self.tasks.iter_mut().any(|t| t.handle_transaction(&transaction, now));
            }
            Message::Inv(items) => {
                if !self.tasks.iter_mut().any(|t| t.handle_inventory(&items)) {
                    notices.push(PeerNotice::Inventory(items));
                }
            }
            Message::GetData(items) => {
                for item in &items {
                    if let Some(reply) = self.tasks.iter_mut().find_map(|t| t.handle_get_data(item)) {
                        self.send(reply);
                    }
                }
            }
            Message::NotFound(items) => {
                let _ = self.tasks.iter_mut().any(|t| t.handle_not_found(&items));
            }
            Message::Reject(reject) => {
                log::info!("Peer {} rejected {}: {} ({})", self.host(), reject.message, reject.reason, reject.code);
            }
            other => log::debug!("Ignoring {} from {}", other.command(), self.host()),
        }

        self.collect_tasks(&mut notices, now);
        notices
    }

    /// Periodic check: idle ping, ping timeout and the first task's timeout
    pub fn tick(&mut self, now: Instant) -> Vec<PeerNotice> {
        let mut notices = Vec::new();
        if self.closing {
            return notices;
        }

        match self.timer.check(now) {
            TimerCheck::Alive => {}
            TimerCheck::Idle => {
                self.send(Message::Ping(rand::random()));
                self.timer.ping_sent = Some(now);
            }
            TimerCheck::Timeout => {
                self.close(PeerError::Timeout("no response to ping".to_string()));
                return notices;
            }
        }

        if let Some(task) = self.tasks.first_mut() {
            task.check_timeout(now);
        }
        self.collect_tasks(&mut notices, now);
        notices
    }

    fn validate_version(&self, version: &VersionMessage) -> Result<(), PeerError> {
        if version.start_height <= 0 {
            return Err(PeerError::UnsuitablePeer("last block is not greater than 0".to_string()));
        }
        if (version.start_height as u32) < self.local_best_block_height {
            return Err(PeerError::UnsuitablePeer(format!(
                "expired blockchain {} vs {} local",
                version.start_height, self.local_best_block_height
            )));
        }
        if !version.services.contains(ServiceFlags::NETWORK) {
            return Err(PeerError::UnsuitablePeer("no copy of the block chain".to_string()));
        }
        if !version.services.contains(self.required_services) {
            return Err(PeerError::UnsuitablePeer(format!(
                "missing services {:?}",
                self.required_services.difference(version.services)
            )));
        }
        Ok(())
    }

    /// Hand over assembled merkle blocks and retire finished tasks
    fn collect_tasks(&mut self, notices: &mut Vec<PeerNotice>, now: Instant) {
        let mut completed_any = false;
        let mut index = 0;

        while index < self.tasks.len() {
            let task = &mut self.tasks[index];
            notices.extend(task.take_merkle_blocks().into_iter().map(PeerNotice::MerkleBlock));

            if task.is_running() {
                index += 1;
                continue;
            }

            let mut task = self.tasks.remove(index);
            match task.take_status() {
                TaskStatus::Failed(e) => {
                    log::warn!("Task {} failed on {}: {}", task.name(), self.host(), e);
                    self.close(e);
                    return;
                }
                _ => {
                    completed_any = true;
                    notices.push(PeerNotice::TaskCompleted(task));
                }
            }
        }

        if completed_any {
            if let Some(next) = self.tasks.first_mut() {
                next.reset_timer(now);
            }
            if self.tasks.is_empty() {
                notices.push(PeerNotice::Ready);
            }
        }
    }
}

// =============================================================================
// Peer Manager
// =============================================================================

/// All live peers, keyed by id
#[derive(Default)]
pub struct PeerManager {
    peers: HashMap<PeerId, Peer>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, peer: Peer) {
        self.peers.insert(peer.id(), peer);
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.peers.values().map(|p| p.host().to_string()).collect()
    }

    pub fn connected(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values().filter(|p| p.connected && !p.is_closing())
    }

    pub fn connected_count(&self) -> usize {
        self.connected().count()
    }

    /// Connected peers, fastest handshake first
    pub fn sorted(&self) -> Vec<PeerId> {
        let mut peers: Vec<&Peer> = self.connected().collect();
        peers.sort_by_key(|p| (p.connection_time, p.id()));
        peers.into_iter().map(|p| p.id()).collect()
    }

    pub fn ready(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.connected().filter(|p| p.ready()).map(|p| p.id()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn disconnect_all(&mut self) {
        for peer in self.peers.values_mut() {
            peer.close(PeerError::Stopped);
        }
    }
}
