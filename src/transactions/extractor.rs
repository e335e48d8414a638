//! Transaction classification
//!
//! Classifies output scripts, attaches owning wallet keys, decides whether a
//! transaction is ours and outgoing, and fills in addresses of inputs and
//! outputs for our transactions.

use std::sync::Arc;

use super::outputs_cache::OutputsCache;
use super::plugin::PluginManager;
use crate::core::address::AddressConverter;
use crate::core::public_key::PublicKey;
use crate::core::script::{
    classify, p2pkh_public_key, p2sh_redeem_script, p2wpkh_program, p2wpkh_sh_program, ScriptType,
};
use crate::core::transaction::{FullTransaction, TransactionOutput};
use crate::crypto::hash160;
use crate::storage::Storage;

pub struct TransactionExtractor {
    storage: Arc<dyn Storage>,
    address_converter: Arc<dyn AddressConverter>,
    plugin_manager: Arc<PluginManager>,
    outputs_cache: Arc<OutputsCache>,
}

impl TransactionExtractor {
    pub fn new(
        storage: Arc<dyn Storage>,
        address_converter: Arc<dyn AddressConverter>,
        plugin_manager: Arc<PluginManager>,
        outputs_cache: Arc<OutputsCache>,
    ) -> Self {
        Self {
            storage,
            address_converter,
            plugin_manager,
            outputs_cache,
        }
    }

    pub fn extract(&self, transaction: &mut FullTransaction) {
        self.extract_outputs(transaction);

        if self.outputs_cache.has_outputs(&transaction.inputs) {
            transaction.header.is_mine = true;
            transaction.header.is_outgoing = true;
        }

        if transaction.header.is_mine {
            self.outputs_cache.add(&transaction.outputs);
            self.extract_addresses(transaction);
            self.extract_inputs(transaction);
        }
    }

    pub fn extract_outputs(&self, transaction: &mut FullTransaction) {
        let mut null_data_index = None;

        for (position, output) in transaction.outputs.iter_mut().enumerate() {
            let Some(classified) = classify(&output.locking_script) else {
                continue;
            };
            output.script_type = classified.script_type;
            output.key_hash = Some(classified.payload);

            if output.script_type == ScriptType::NullData {
                null_data_index = Some(position);
                continue;
            }

            if let Some(public_key) = self.public_key(output) {
                output.public_key_path = Some(public_key.path);
            }
        }

        if let Some(index) = null_data_index {
            self.plugin_manager
                .process_transaction_with_null_data(transaction, index, self.storage.as_ref());
        }

        if transaction.outputs.iter().any(|o| o.is_mine()) {
            transaction.header.is_mine = true;
        }
    }

    /// Owning key of an output; nested segwit outputs are retyped on match
    fn public_key(&self, output: &mut TransactionOutput) -> Option<PublicKey> {
        let payload = output.key_hash.clone()?;

        match output.script_type {
            ScriptType::P2PK | ScriptType::P2PKH | ScriptType::P2WPKH => {
                self.storage.public_key_by_key_or_key_hash(&payload)
            }
            ScriptType::P2SH => {
                let public_key = self.storage.public_key_by_script_hash_p2wpkh(&payload)?;
                output.script_type = ScriptType::P2WPKHSH;
                output.key_hash = Some(public_key.public_key_hash.to_vec());
                Some(public_key)
            }
            ScriptType::P2TR => self.storage.public_key_by_hash_p2tr(&payload),
            _ => None,
        }
    }

    fn extract_addresses(&self, transaction: &mut FullTransaction) {
        for output in transaction.outputs.iter_mut() {
            let Some(payload) = &output.key_hash else {
                continue;
            };

            let address_payload = match output.script_type {
                ScriptType::NullData | ScriptType::Unknown => continue,
                ScriptType::P2PK => hash160(payload).to_vec(),
                ScriptType::P2WPKHSH => hash160(&p2wpkh_program(payload)).to_vec(),
                _ => payload.clone(),
            };

            if let Ok(address) = self.address_converter.convert(&address_payload, output.script_type) {
                output.address = Some(address.string);
            }
        }
    }

    fn extract_inputs(&self, transaction: &mut FullTransaction) {
        for input in transaction.inputs.iter_mut() {
            if let Some(previous) = self.storage.previous_output(input) {
                input.address = previous.address;
                input.key_hash = previous.key_hash;
                continue;
            }

            let (payload, script_type) = if let Some(redeem_script) = p2sh_redeem_script(&input.sig_script) {
                (redeem_script, ScriptType::P2SH)
            } else if let Some(public_key) = p2pkh_public_key(&input.sig_script) {
                (public_key, ScriptType::P2PKH)
            } else if let Some(program) = p2wpkh_sh_program(&input.sig_script) {
                (program, ScriptType::P2WPKHSH)
            } else if input.sig_script.is_empty() && input.witness.len() == 2 && input.witness[1].len() == 33 {
                (input.witness[1].clone(), ScriptType::P2WPKH)
            } else {
                continue;
            };

            let key_hash = hash160(&payload);
            if let Ok(address) = self.address_converter.convert(&key_hash, script_type) {
                input.key_hash = Some(address.payload);
                input.address = Some(address.string);
            }
        }
    }
}
