//! Kit configuration

use std::time::Duration;

use crate::network::params::Network;
use crate::network::peer_group::PeerGroupConfig;
use crate::network::sync::SyncMode;
use crate::transactions::builder::TransactionDataSortType;
use crate::transactions::sender::{DEFAULT_MAX_RETRIES, DEFAULT_RETRIES_PERIOD};
use crate::wallet::Purpose;

/// Wallet kit configuration
#[derive(Debug, Clone)]
pub struct KitConfig {
    pub network: Network,
    pub sync_mode: SyncMode,
    /// Derivation purpose; also decides the change output type
    pub purpose: Purpose,
    /// Connections to keep open
    pub peer_size: usize,
    /// Unused keys kept ahead of the last used one
    pub gap_limit: u32,
    /// Confirmations before incoming funds are spendable
    pub confirmations_threshold: u32,
    pub min_peers_to_send: usize,
    pub min_synced_peer_ratio: f64,
    /// Default for new send requests
    pub rbf_enabled: bool,
    /// Default for new send requests
    pub sort_type: TransactionDataSortType,
    pub max_retries: u32,
    pub retries_period: Duration,
}

impl Default for KitConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            sync_mode: SyncMode::default(),
            purpose: Purpose::Bip84,
            peer_size: 10,
            gap_limit: 20,
            confirmations_threshold: 6,
            min_peers_to_send: 2,
            min_synced_peer_ratio: 0.5,
            rbf_enabled: true,
            sort_type: TransactionDataSortType::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retries_period: DEFAULT_RETRIES_PERIOD,
        }
    }
}

impl KitConfig {
    pub fn for_network(network: Network) -> Self {
        Self {
            network,
            ..Default::default()
        }
    }

    pub fn peer_group_config(&self) -> PeerGroupConfig {
        PeerGroupConfig {
            peer_size: self.peer_size,
            min_peers_to_send: self.min_peers_to_send,
            min_synced_peer_ratio: self.min_synced_peer_ratio,
        }
    }
}
