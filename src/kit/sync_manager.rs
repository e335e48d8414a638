//! Kit state tracking
//!
//! Turns block download progress into a `KitState` and reports every change
//! to the application.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::listener::ListenerSlot;
use crate::network::sync::BlockSyncListener;

pub const NOT_STARTED: &str = "not started";

/// Sync state as seen by the application
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum KitState {
    Synced,
    /// Downloaded share of the blocks, 0.0 to 1.0
    Syncing(f64),
    /// Transactions found so far by an API restore
    ApiSyncing(usize),
    NotSynced(String),
}

impl fmt::Display for KitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KitState::Synced => write!(f, "synced"),
            KitState::Syncing(progress) => write!(f, "syncing {:.1}%", progress * 100.0),
            KitState::ApiSyncing(count) => write!(f, "api syncing, {} transactions", count),
            KitState::NotSynced(cause) => write!(f, "not synced: {}", cause),
        }
    }
}

struct Heights {
    initial: u32,
    current: u32,
}

pub struct SyncManager {
    state: RwLock<KitState>,
    heights: RwLock<Heights>,
    listeners: Arc<ListenerSlot>,
}

impl SyncManager {
    pub(crate) fn new(best_block_height: u32, listeners: Arc<ListenerSlot>) -> Self {
        Self {
            state: RwLock::new(KitState::NotSynced(NOT_STARTED.to_string())),
            heights: RwLock::new(Heights {
                initial: best_block_height,
                current: best_block_height,
            }),
            listeners,
        }
    }

    pub fn state(&self) -> KitState {
        self.state.read().clone()
    }

    fn set_state(&self, state: KitState) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            *current = state.clone();
        }

        log::debug!("Kit state: {}", state);
        if let Some(listener) = self.listeners.get() {
            listener.on_kit_state_update(&state);
        }
    }

    /// Returns false when a sync is already under way
    pub fn start(&self) -> bool {
        if !matches!(self.state(), KitState::NotSynced(_)) {
            return false;
        }
        self.set_state(KitState::Syncing(0.0));
        true
    }

    pub fn stop(&self) {
        self.set_state(KitState::NotSynced(NOT_STARTED.to_string()));
    }

    pub fn failed(&self, cause: impl fmt::Display) {
        self.set_state(KitState::NotSynced(cause.to_string()));
    }
}

impl BlockSyncListener for SyncManager {
    fn on_current_best_block_height_update(&self, height: u32, max_block_height: u32) {
        let progress = {
            let mut heights = self.heights.write();
            heights.current = heights.current.max(height);

            let downloaded = heights.current.saturating_sub(heights.initial);
            let to_download = max_block_height.saturating_sub(heights.initial);
            if to_download == 0 {
                1.0
            } else {
                downloaded as f64 / to_download as f64
            }
        };

        if progress >= 1.0 {
            self.set_state(KitState::Synced);
        } else {
            self.set_state(KitState::Syncing(progress));
        }
    }

    fn on_block_sync_finished(&self) {
        self.set_state(KitState::Synced);
    }
}
