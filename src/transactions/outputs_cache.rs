//! Values of own outputs, keyed by outpoint
//!
//! Lets the extractor recognise spends of wallet outputs without a storage
//! round trip, including outputs of transactions earlier in the same batch.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::transaction::{TransactionInput, TransactionOutput};
use crate::crypto::Hash256;
use crate::storage::Storage;

#[derive(Default)]
pub struct OutputsCache {
    outputs: RwLock<HashMap<(Hash256, u32), u64>>,
}

impl OutputsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache every own output known to storage
    pub fn load(storage: &Arc<dyn Storage>) -> Self {
        let cache = Self::new();
        for key in storage.public_keys() {
            cache.add(&storage.outputs_of_public_key(&key));
        }
        cache
    }

    /// Remember the own outputs among `outputs`
    pub fn add(&self, outputs: &[TransactionOutput]) {
        let mut cached = self.outputs.write();
        for output in outputs.iter().filter(|o| o.is_mine()) {
            cached.insert((output.transaction_hash, output.index), output.value);
        }
    }

    pub fn has_outputs(&self, inputs: &[TransactionInput]) -> bool {
        let cached = self.outputs.read();
        inputs
            .iter()
            .any(|i| cached.contains_key(&(i.previous_output_tx_hash, i.previous_output_index)))
    }

    /// Value of the own output spent by `input`
    pub fn value_spent_by(&self, input: &TransactionInput) -> Option<u64> {
        self.outputs
            .read()
            .get(&(input.previous_output_tx_hash, input.previous_output_index))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::script::ScriptType;

    #[test]
    fn test_only_own_outputs_are_cached() {
        let cache = OutputsCache::new();
        let mut own = TransactionOutput::new(700, 1, Vec::new(), ScriptType::P2PKH);
        own.transaction_hash = [1u8; 32];
        own.public_key_path = Some("0/0/0".to_string());
        let mut foreign = TransactionOutput::new(300, 0, Vec::new(), ScriptType::P2PKH);
        foreign.transaction_hash = [1u8; 32];
        cache.add(&[own, foreign]);

        let spends_own = TransactionInput::new([1u8; 32], 1, 0);
        let spends_foreign = TransactionInput::new([1u8; 32], 0, 0);

        assert!(cache.has_outputs(&[spends_foreign.clone(), spends_own.clone()]));
        assert!(!cache.has_outputs(&[spends_foreign.clone()]));
        assert_eq!(cache.value_spent_by(&spends_own), Some(700));
        assert_eq!(cache.value_spent_by(&spends_foreign), None);
    }
}
