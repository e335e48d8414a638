//! Spendable output view
//!
//! Incoming outputs become spendable after `confirmations_threshold`
//! confirmations; change of our own outgoing transactions is spendable at
//! once. Plugins may hold outputs back further (time locks).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::plugin::PluginManager;
use crate::storage::{Storage, UnspentOutput};

/// Source of outputs coin selection may spend
pub trait UnspentOutputSource: Send + Sync {
    fn spendable_outputs(&self) -> Vec<UnspentOutput>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub spendable: u64,
    /// Unconfirmed incoming and time-locked funds
    pub unspendable: u64,
}

pub struct UnspentOutputProvider {
    storage: Arc<dyn Storage>,
    confirmations_threshold: u32,
    plugin_manager: Arc<PluginManager>,
}

impl UnspentOutputProvider {
    pub fn new(storage: Arc<dyn Storage>, confirmations_threshold: u32, plugin_manager: Arc<PluginManager>) -> Self {
        Self {
            storage,
            confirmations_threshold,
            plugin_manager,
        }
    }

    pub fn balance(&self) -> BalanceInfo {
        let last_height = self.last_block_height();
        let mut balance = BalanceInfo::default();

        for unspent in self.storage.unspent_outputs() {
            if self.is_spendable(&unspent, last_height) {
                balance.spendable += unspent.output.value;
            } else {
                balance.unspendable += unspent.output.value;
            }
        }
        balance
    }

    fn last_block_height(&self) -> u32 {
        self.storage.last_block().map(|b| b.height).unwrap_or(0)
    }

    fn is_confirmed(&self, unspent: &UnspentOutput, last_height: u32) -> bool {
        if self.confirmations_threshold == 0 || unspent.transaction.is_outgoing {
            return true;
        }

        match &unspent.block {
            Some(block) => block.height + self.confirmations_threshold <= last_height + 1,
            None => false,
        }
    }

    fn is_spendable(&self, unspent: &UnspentOutput, last_height: u32) -> bool {
        self.is_confirmed(unspent, last_height) && self.plugin_manager.is_spendable(unspent, last_height)
    }
}

impl UnspentOutputSource for UnspentOutputProvider {
    fn spendable_outputs(&self) -> Vec<UnspentOutput> {
        let last_height = self.last_block_height();
        self.storage
            .unspent_outputs()
            .into_iter()
            .filter(|unspent| self.is_spendable(unspent, last_height))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::{Block, BlockHeader};
    use crate::core::public_key::PublicKey;
    use crate::core::script::{locking_script, ScriptType};
    use crate::core::transaction::{FullTransaction, Transaction, TransactionInput, TransactionOutput};
    use crate::storage::MemoryStorage;
    use secp256k1::{Secp256k1, SecretKey};

    fn key() -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[4u8; 32]).unwrap();
        let raw = secp256k1::PublicKey::from_secret_key(&secp, &sk).serialize().to_vec();
        PublicKey::new(0, 0, true, raw).unwrap()
    }

    fn block_at(storage: &MemoryStorage, height: u32) -> Block {
        let header = BlockHeader::new(1, [0u8; 32], [0u8; 32], 1_600_000_000, 0x207f_ffff, height);
        let block = Block::new(header, height);
        storage.add_block(block.clone());
        block
    }

    fn receive(storage: &MemoryStorage, key: &PublicKey, value: u64, block: Option<&Block>, outgoing: bool) {
        let mut header = Transaction::default();
        header.block_hash = block.map(|b| b.hash());
        header.is_mine = true;
        header.is_outgoing = outgoing;
        let input = TransactionInput::new([value as u8; 32], 0, 0);
        let mut output = TransactionOutput::new(
            value,
            0,
            locking_script(ScriptType::P2PKH, &key.public_key_hash).unwrap(),
            ScriptType::P2PKH,
        );
        output.public_key_path = Some(key.path.clone());
        storage.add_transaction(FullTransaction::new(header, vec![input], vec![output]));
    }

    #[test]
    fn test_confirmations_threshold() {
        let storage = Arc::new(MemoryStorage::new());
        let key = key();
        storage.save_public_keys(vec![key.clone()]);

        let deep = block_at(&storage, 100);
        let shallow = block_at(&storage, 104);
        block_at(&storage, 105);

        receive(&storage, &key, 1_000, Some(&deep), false);
        receive(&storage, &key, 2_000, Some(&shallow), false);
        receive(&storage, &key, 4_000, None, false);
        receive(&storage, &key, 8_000, None, true);

        let provider = UnspentOutputProvider::new(storage.clone(), 6, Arc::new(PluginManager::new()));
        let values: Vec<u64> = {
            let mut v: Vec<u64> = provider.spendable_outputs().iter().map(|u| u.output.value).collect();
            v.sort();
            v
        };

        assert_eq!(values, vec![1_000, 8_000]);
        assert_eq!(
            provider.balance(),
            BalanceInfo {
                spendable: 9_000,
                unspendable: 6_000
            }
        );
    }
}
