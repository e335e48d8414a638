//! Initial block download
//!
//! Picks one sync peer at a time and drives it through rounds of
//! `getblocks` and filtered `getdata` until it has nothing new. A peer is
//! synced once it returned an empty block inventory and every queued merkle
//! block arrived. Runs inside the peer group task, so all methods take the
//! peer table by reference.

use std::collections::HashSet;
use std::time::Instant;

use crate::core::block::MerkleBlock;
use crate::network::message::{InvItem, InvType};
use crate::network::peer::{PeerError, PeerId, PeerManager};
use crate::network::sync::{BlockSyncer, SyncError};
use crate::network::task::{DownloadSpeed, GetBlockHashesTask, GetMerkleBlocksTask, PeerTask};

/// A new peer must connect this many times faster to replace the sync peer
const PEER_SWITCH_MINIMUM_RATIO: f64 = 1.5;

/// Slow-peer disconnects before the speed threshold is relaxed
const SLOW_PEERS_LIMIT: u32 = 3;

/// What the rest of the group should react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSignal {
    PeerSynced(PeerId),
    AllPeersSynced,
}

pub struct InitialBlockDownload {
    syncer: BlockSyncer,
    sync_peer: Option<PeerId>,
    synced_peers: HashSet<PeerId>,
    select_new_peer: bool,
    min_speed: DownloadSpeed,
    slow_peers_disconnected: u32,
    signals: Vec<SyncSignal>,
}

impl InitialBlockDownload {
    pub fn new(syncer: BlockSyncer) -> Self {
        Self {
            syncer,
            sync_peer: None,
            synced_peers: HashSet::new(),
            select_new_peer: false,
            min_speed: DownloadSpeed::default(),
            slow_peers_disconnected: 0,
            signals: Vec::new(),
        }
    }

    pub fn syncer(&self) -> &BlockSyncer {
        &self.syncer
    }

    pub fn sync_peer(&self) -> Option<PeerId> {
        self.sync_peer
    }

    pub fn synced_peers(&self) -> &HashSet<PeerId> {
        &self.synced_peers
    }

    pub fn min_speed(&self) -> DownloadSpeed {
        self.min_speed
    }

    pub fn take_signals(&mut self) -> Vec<SyncSignal> {
        std::mem::take(&mut self.signals)
    }

    /// Height new peers must at least announce
    pub fn local_best_block_height(&self) -> u32 {
        self.syncer.local_downloaded_best_block_height()
    }

    pub fn on_start(&mut self) -> Result<(), SyncError> {
        self.syncer.listener().on_block_sync_started();
        self.syncer.prepare_for_download()
    }

    pub fn on_peer_connect(&mut self, peers: &mut PeerManager, id: PeerId, now: Instant) {
        if let (Some(sync_id), Some(peer)) = (self.sync_peer, peers.get(id)) {
            let current = peers.get(sync_id).and_then(|p| p.connection_time);
            if let (Some(current), Some(new)) = (current, peer.connection_time) {
                if current.as_secs_f64() > new.as_secs_f64() * PEER_SWITCH_MINIMUM_RATIO {
                    log::debug!("Peer {} is faster than the sync peer", peer.host());
                    self.select_new_peer = true;
                }
            }
        }
        self.assign_next_sync_peer(peers, now);
    }

    pub fn on_peer_ready(&mut self, peers: &mut PeerManager, id: PeerId, now: Instant) {
        if self.sync_peer == Some(id) {
            self.download_blockchain(peers, now);
        }
    }

    /// Call after the peer was removed from `peers`
    pub fn on_peer_disconnect(&mut self, peers: &mut PeerManager, id: PeerId, error: Option<&PeerError>, now: Instant) {
        if let Some(PeerError::TooSlow { .. }) = error {
            self.slow_peers_disconnected += 1;
            if self.slow_peers_disconnected >= SLOW_PEERS_LIMIT {
                self.slow_peers_disconnected = 0;
                self.min_speed = self.min_speed.divided(SLOW_PEERS_LIMIT as f64);
                log::info!(
                    "Lowered minimum download speed to {:.0} blocks/min",
                    self.min_speed.merkle_blocks
                );
            }
        }

        self.synced_peers.remove(&id);

        if self.sync_peer == Some(id) {
            self.sync_peer = None;
            if let Err(e) = self.syncer.download_failed() {
                log::error!("Failed to reset download: {}", e);
            }
            self.assign_next_sync_peer(peers, now);
        }
    }

    /// A synced peer announcing blocks has more to give
    pub fn handle_inventory(&mut self, peers: &mut PeerManager, id: PeerId, items: &[InvItem], now: Instant) {
        let Some(peer) = peers.get_mut(id) else {
            return;
        };
        if peer.synced && items.iter().any(|item| item.inv_type == InvType::Block) {
            peer.synced = false;
            peer.block_hashes_synced = false;
            self.synced_peers.remove(&id);
            self.assign_next_sync_peer(peers, now);
        }
    }

    /// Returns whether the task was one of ours
    pub fn handle_completed_task(&mut self, peers: &mut PeerManager, id: PeerId, task: &PeerTask) -> bool {
        match task {
            PeerTask::GetBlockHashes(task) => {
                if task.block_hashes.is_empty() {
                    if let Some(peer) = peers.get_mut(id) {
                        peer.block_hashes_synced = true;
                    }
                } else {
                    self.syncer.add_block_hashes(task.block_hashes.clone());
                }
                true
            }
            PeerTask::GetMerkleBlocks(_) => {
                if let Err(e) = self.syncer.download_iteration_completed() {
                    log::error!("Failed to finish download iteration: {}", e);
                }
                true
            }
            _ => false,
        }
    }

    pub fn handle_merkle_block(&mut self, peers: &PeerManager, merkle_block: MerkleBlock) -> Result<(), SyncError> {
        let max_block_height = self
            .sync_peer
            .and_then(|id| peers.get(id))
            .map(|p| p.announced_last_block_height)
            .unwrap_or(0);
        self.syncer.handle_merkle_block(merkle_block, max_block_height)
    }

    fn assign_next_sync_peer(&mut self, peers: &mut PeerManager, now: Instant) {
        if self.sync_peer.is_some() {
            return;
        }

        let not_synced: Vec<PeerId> = peers
            .sorted()
            .into_iter()
            .filter(|id| peers.get(*id).map(|p| !p.synced).unwrap_or(false))
            .collect();
        if not_synced.is_empty() {
            self.signals.push(SyncSignal::AllPeersSynced);
        }

        let next = not_synced
            .into_iter()
            .find(|id| peers.get(*id).map(|p| p.ready()).unwrap_or(false));
        if let Some(id) = next {
            if let Some(peer) = peers.get(id) {
                log::info!("Start syncing peer {}", peer.host());
            }
            self.sync_peer = Some(id);
            self.download_blockchain(peers, now);
        }
    }

    fn download_blockchain(&mut self, peers: &mut PeerManager, now: Instant) {
        let Some(id) = self.sync_peer else {
            return;
        };
        let Some(peer) = peers.get_mut(id) else {
            return;
        };
        if !peer.ready() {
            return;
        }

        if self.select_new_peer {
            self.select_new_peer = false;
            if let Err(e) = self.syncer.download_completed() {
                log::error!("Failed to complete download: {}", e);
            }
            self.sync_peer = None;
            self.assign_next_sync_peer(peers, now);
            return;
        }

        let block_hashes = self.syncer.get_block_hashes();
        if block_hashes.is_empty() {
            peer.synced = peer.block_hashes_synced;
        } else {
            peer.add_task(
                PeerTask::GetMerkleBlocks(GetMerkleBlocksTask::new(block_hashes, self.min_speed)),
                now,
            );
        }

        if !peer.block_hashes_synced {
            let announced = peer.announced_last_block_height;
            let expected = announced.saturating_sub(self.syncer.local_known_best_block_height());
            let locator = self.syncer.block_locator_hashes(announced);
            let task = GetBlockHashesTask::new(locator, expected, peer.protocol_version());
            peer.add_task(PeerTask::GetBlockHashes(task), now);
        }

        if !peer.synced {
            return;
        }

        let announced = peer.announced_last_block_height;
        log::info!("Peer synced {}", peer.host());
        peer.send_mempool();
        self.synced_peers.insert(id);

        if let Err(e) = self.syncer.download_completed() {
            log::error!("Failed to complete download: {}", e);
        }
        self.sync_peer = None;
        self.assign_next_sync_peer(peers, now);
        self.signals.push(SyncSignal::PeerSynced(id));

        // a peer can go quiet before announcing its whole chain
        if self.syncer.local_downloaded_best_block_height() >= announced {
            self.syncer.listener().on_block_sync_finished();
        }
    }
}
