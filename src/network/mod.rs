//! P2P networking module
//!
//! Talks the Bitcoin wire protocol to full nodes as a bloom-filtered SPV
//! client.
//!
//! # Features
//! - Network parameters and checkpoints per chain
//! - Message framing and codec
//! - Per-peer handshake, keep-alive and task queue
//! - Peer address management with DNS seed discovery
//! - Initial block download of merkle blocks
//! - Mempool relay and transaction broadcasting

pub mod addrman;
pub mod codec;
pub mod connection;
pub mod initial_block_download;
pub mod mempool_transactions;
pub mod message;
pub mod params;
pub mod peer;
pub mod peer_group;
pub mod sync;
pub mod task;

pub use addrman::PeerAddressManager;
pub use codec::MessageCodec;
pub use initial_block_download::{InitialBlockDownload, SyncSignal};
pub use mempool_transactions::MempoolTransactions;
pub use message::{InvItem, InvType, Message, MessageError, NetAddr, ServiceFlags, VersionMessage};
pub use params::{Network, NetworkParams, PROTOCOL_VERSION};
pub use peer::{Peer, PeerError, PeerEvent, PeerHandle, PeerId, PeerManager};
pub use peer_group::{
    PeerGroup, PeerGroupCommand, PeerGroupConfig, PeerGroupError, PeerGroupHandle, PeerGroupStatus,
};
pub use sync::{resolve_checkpoint, BlockSyncListener, BlockSyncer, SyncError, SyncMode};
pub use task::{DownloadSpeed, PeerTask, TaskStatus};
