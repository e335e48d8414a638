//! Application callbacks

use std::sync::Arc;

use parking_lot::RwLock;

use super::data_provider::BlockInfo;
use super::sync_manager::KitState;
use crate::storage::FullTransactionInfo;
use crate::transactions::unspent_output_provider::BalanceInfo;

/// Everything the kit reports back to the application
pub trait KitListener: Send + Sync {
    fn on_transactions_update(&self, _inserted: &[FullTransactionInfo], _updated: &[FullTransactionInfo]) {}

    /// Hashes in display (reversed hex) form
    fn on_transactions_delete(&self, _hashes: &[String]) {}

    fn on_balance_update(&self, _balance: BalanceInfo) {}

    fn on_last_block_info_update(&self, _info: &BlockInfo) {}

    fn on_kit_state_update(&self, _state: &KitState) {}
}

/// The listener shared by the data provider and the sync manager
#[derive(Default)]
pub(crate) struct ListenerSlot {
    listener: RwLock<Option<Arc<dyn KitListener>>>,
}

impl ListenerSlot {
    pub(crate) fn set(&self, listener: Arc<dyn KitListener>) {
        *self.listener.write() = Some(listener);
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn KitListener>> {
        self.listener.read().clone()
    }
}
