//! Own outputs that peers cannot match by key hash alone
//!
//! A BIP37 filter matching a P2PKH or P2SH output also matches the inputs
//! that later spend it, because the spending script contains the key. For
//! P2PK, P2WPKH, nested P2WPKH and P2TR outputs it does not, so their
//! outpoints have to be in the filter explicitly.

use std::sync::Arc;

use super::bloom_filter_manager::BloomFilterProvider;
use super::watched::outpoint;
use crate::core::script::ScriptType;
use crate::core::transaction::TransactionOutput;
use crate::storage::Storage;

const IRREGULAR_SCRIPT_TYPES: [ScriptType; 4] = [
    ScriptType::P2PK,
    ScriptType::P2WPKH,
    ScriptType::P2WPKHSH,
    ScriptType::P2TR,
];

pub struct IrregularOutputFinder {
    storage: Arc<dyn Storage>,
}

impl IrregularOutputFinder {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn has_irregular_output(&self, outputs: &[TransactionOutput]) -> bool {
        outputs
            .iter()
            .any(|o| o.is_mine() && IRREGULAR_SCRIPT_TYPES.contains(&o.script_type))
    }
}

impl BloomFilterProvider for IrregularOutputFinder {
    fn filter_elements(&self) -> Vec<Vec<u8>> {
        let best_height = self.storage.last_block().map(|b| b.height).unwrap_or(0);

        self.storage
            .outputs_for_bloom_filter(best_height, &IRREGULAR_SCRIPT_TYPES)
            .iter()
            .map(|o| outpoint(&o.transaction_hash, o.index))
            .collect()
    }
}
