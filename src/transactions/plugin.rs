//! Output plugins
//!
//! A plugin rewrites the recipient of an outgoing transaction and records
//! what it did in a null-data output, so the receiving wallet can recognise
//! and later redeem the output. The null-data script is
//! `OP_RETURN {plugin-id} {plugin chunks}...`.
//!
//! `LockHeightPlugin` locks funds until a block height with
//! `OP_CHECKLOCKTIMEVERIFY` in a P2SH redeem script.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::core::address::{Address, AddressConverter, AddressError};
use crate::core::script::{
    parse_chunks, push, Chunk, ScriptType, OP_1, OP_CHECKLOCKTIMEVERIFY, OP_CHECKSIG, OP_DROP,
    OP_DUP, OP_EQUALVERIFY, OP_HASH160, OP_RETURN,
};
use crate::core::transaction::FullTransaction;
use crate::crypto::hash160;
use crate::storage::{Storage, UnspentOutput};

/// Id of the lock-height plugin, also its opcode in the null-data output
pub const LOCK_HEIGHT_PLUGIN_ID: u8 = OP_1;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Unknown plugin {0}")]
    UnknownPlugin(u8),
    #[error("Plugin supports only P2PKH recipients")]
    UnsupportedAddressType,
    #[error("Invalid plugin data: {0}")]
    InvalidData(String),
    #[error("Address error: {0}")]
    Address(#[from] AddressError),
}

/// Per-plugin parameters of an outgoing transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginData {
    LockHeight { unlock_height: u32 },
}

impl PluginData {
    pub fn plugin_id(&self) -> u8 {
        match self {
            PluginData::LockHeight { .. } => LOCK_HEIGHT_PLUGIN_ID,
        }
    }
}

pub trait Plugin: Send + Sync {
    fn id(&self) -> u8;

    /// New recipient address and the chunks this plugin appends to the
    /// null-data output, id included
    fn process_outputs(&self, recipient: &Address, data: &PluginData) -> Result<(Address, Vec<u8>), PluginError>;

    /// Consume this plugin's chunks and mark the outputs they describe
    fn process_transaction_with_null_data(
        &self,
        transaction: &mut FullTransaction,
        chunks: &mut dyn Iterator<Item = Chunk>,
        storage: &dyn Storage,
    ) -> Result<(), PluginError>;

    fn is_spendable(&self, output: &UnspentOutput, last_block_height: u32) -> bool;

    /// Bytes this plugin adds to the null-data output
    fn null_data_size(&self, data: &PluginData) -> usize;
}

// =============================================================================
// Plugin Manager
// =============================================================================

#[derive(Default)]
pub struct PluginManager {
    plugins: RwLock<HashMap<u8, Arc<dyn Plugin>>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        self.plugins.write().insert(plugin.id(), plugin);
    }

    fn plugin(&self, id: u8) -> Result<Arc<dyn Plugin>, PluginError> {
        self.plugins
            .read()
            .get(&id)
            .cloned()
            .ok_or(PluginError::UnknownPlugin(id))
    }

    /// Run every plugin over the recipient; returns the final recipient and
    /// the null-data locking script, if any plugin data was given
    pub fn process_outputs(
        &self,
        recipient: Address,
        data: &[PluginData],
    ) -> Result<(Address, Option<Vec<u8>>), PluginError> {
        if data.is_empty() {
            return Ok((recipient, None));
        }

        let mut recipient = recipient;
        let mut null_data = vec![OP_RETURN];
        for item in data {
            let (address, chunks) = self.plugin(item.plugin_id())?.process_outputs(&recipient, item)?;
            recipient = address;
            null_data.extend(chunks);
        }

        Ok((recipient, Some(null_data)))
    }

    /// Size of the null-data locking script the given plugin data produces
    pub fn null_data_size(&self, data: &[PluginData]) -> Result<usize, PluginError> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut size = 1;
        for item in data {
            size += self.plugin(item.plugin_id())?.null_data_size(item);
        }
        Ok(size)
    }

    /// Let plugins named in the null-data output at `output_index` mark outputs
    pub fn process_transaction_with_null_data(
        &self,
        transaction: &mut FullTransaction,
        output_index: usize,
        storage: &dyn Storage,
    ) {
        let Some(script) = transaction.outputs.get(output_index).map(|o| o.locking_script.clone()) else {
            return;
        };
        let Some(chunks) = parse_chunks(&script) else {
            return;
        };

        // skip OP_RETURN
        let mut chunks = chunks.into_iter().skip(1);
        while let Some(id_chunk) = chunks.next() {
            let Ok(plugin) = self.plugin(id_chunk.opcode) else {
                break;
            };
            if let Err(e) = plugin.process_transaction_with_null_data(transaction, &mut chunks, storage) {
                log::debug!("Plugin {} skipped {}: {}", id_chunk.opcode, transaction.header.hash_hex(), e);
            }
        }
    }

    /// Outputs without a plugin are spendable; outputs of unknown plugins are not
    pub fn is_spendable(&self, output: &UnspentOutput, last_block_height: u32) -> bool {
        match output.output.plugin_id {
            None => true,
            Some(id) => match self.plugin(id) {
                Ok(plugin) => plugin.is_spendable(output, last_block_height),
                Err(_) => false,
            },
        }
    }
}

// =============================================================================
// Lock Height Plugin
// =============================================================================

pub struct LockHeightPlugin {
    address_converter: Arc<dyn AddressConverter>,
}

impl LockHeightPlugin {
    pub fn new(address_converter: Arc<dyn AddressConverter>) -> Self {
        Self { address_converter }
    }

    /// `{height} OP_CLTV OP_DROP OP_DUP OP_HASH160 {pkh} OP_EQUALVERIFY OP_CHECKSIG`
    pub fn redeem_script(unlock_height: u32, public_key_hash: &[u8]) -> Vec<u8> {
        let mut script = push(&script_number(unlock_height));
        script.extend([OP_CHECKLOCKTIMEVERIFY, OP_DROP, OP_DUP, OP_HASH160]);
        script.extend(push(public_key_hash));
        script.extend([OP_EQUALVERIFY, OP_CHECKSIG]);
        script
    }
}

impl Plugin for LockHeightPlugin {
    fn id(&self) -> u8 {
        LOCK_HEIGHT_PLUGIN_ID
    }

    fn process_outputs(&self, recipient: &Address, data: &PluginData) -> Result<(Address, Vec<u8>), PluginError> {
        let PluginData::LockHeight { unlock_height } = data;
        if recipient.script_type() != ScriptType::P2PKH {
            return Err(PluginError::UnsupportedAddressType);
        }

        let redeem_script = Self::redeem_script(*unlock_height, &recipient.payload);
        let address = self
            .address_converter
            .convert(&hash160(&redeem_script), ScriptType::P2SH)?;

        let mut chunks = vec![LOCK_HEIGHT_PLUGIN_ID];
        chunks.extend(push(&unlock_height.to_le_bytes()));
        chunks.extend(push(&recipient.payload));
        Ok((address, chunks))
    }

    fn process_transaction_with_null_data(
        &self,
        transaction: &mut FullTransaction,
        chunks: &mut dyn Iterator<Item = Chunk>,
        storage: &dyn Storage,
    ) -> Result<(), PluginError> {
        let height_data = chunks
            .next()
            .and_then(|c| c.data)
            .ok_or_else(|| PluginError::InvalidData("missing unlock height".to_string()))?;
        let public_key_hash = chunks
            .next()
            .and_then(|c| c.data)
            .ok_or_else(|| PluginError::InvalidData("missing key hash".to_string()))?;

        let height_bytes: [u8; 4] = height_data
            .as_slice()
            .try_into()
            .map_err(|_| PluginError::InvalidData(format!("unlock height of {} bytes", height_data.len())))?;
        let unlock_height = u32::from_le_bytes(height_bytes);

        let redeem_script = Self::redeem_script(unlock_height, &public_key_hash);
        let script_hash = hash160(&redeem_script);

        let Some(output) = transaction
            .outputs
            .iter_mut()
            .find(|o| o.script_type == ScriptType::P2SH && o.key_hash.as_deref() == Some(&script_hash[..]))
        else {
            return Ok(());
        };

        output.plugin_id = Some(LOCK_HEIGHT_PLUGIN_ID);
        output.plugin_data = Some(unlock_height.to_string());

        if let Some(public_key) = storage.public_key_by_key_or_key_hash(&public_key_hash) {
            output.redeem_script = Some(redeem_script);
            output.public_key_path = Some(public_key.path);
            transaction.header.is_mine = true;
        }

        Ok(())
    }

    fn is_spendable(&self, output: &UnspentOutput, last_block_height: u32) -> bool {
        output
            .output
            .plugin_data
            .as_deref()
            .and_then(|data| data.parse::<u32>().ok())
            .map(|unlock_height| unlock_height <= last_block_height)
            .unwrap_or(false)
    }

    fn null_data_size(&self, _data: &PluginData) -> usize {
        // id, 4-byte height push, 20-byte key hash push
        1 + 5 + 21
    }
}

/// Minimal script number encoding of a non-negative value
fn script_number(value: u32) -> Vec<u8> {
    let mut bytes: Vec<u8> = value.to_le_bytes().to_vec();
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    if bytes.last().map_or(false, |b| b & 0x80 != 0) {
        bytes.push(0);
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::Base58AddressConverter;
    use crate::core::script::{classify, locking_script};
    use crate::core::transaction::{Transaction, TransactionInput, TransactionOutput};
    use crate::storage::MemoryStorage;

    fn manager() -> (PluginManager, Arc<dyn AddressConverter>) {
        let converter: Arc<dyn AddressConverter> = Arc::new(Base58AddressConverter::new(0x6f, 0xc4));
        let manager = PluginManager::new();
        manager.add_plugin(Arc::new(LockHeightPlugin::new(converter.clone())));
        (manager, converter)
    }

    #[test]
    fn test_script_number() {
        assert_eq!(script_number(0), Vec::<u8>::new());
        assert_eq!(script_number(0x7f), vec![0x7f]);
        assert_eq!(script_number(0x80), vec![0x80, 0x00]);
        assert_eq!(script_number(700_000), vec![0x60, 0xae, 0x0a]);
    }

    #[test]
    fn test_lock_height_round_trip() {
        let (manager, converter) = manager();
        let recipient = converter.convert(&[5u8; 20], ScriptType::P2PKH).unwrap();
        let data = [PluginData::LockHeight { unlock_height: 1_000 }];

        let (locked, null_data) = manager.process_outputs(recipient, &data).unwrap();
        let null_data = null_data.unwrap();
        assert_eq!(locked.script_type(), ScriptType::P2SH);
        assert_eq!(null_data.len(), manager.null_data_size(&data).unwrap());

        let locked_output = TransactionOutput::new(10_000, 0, locked.locking_script(), ScriptType::P2SH);
        let memo = TransactionOutput::new(0, 1, null_data, ScriptType::NullData);
        let mut tx = FullTransaction::new(
            Transaction::default(),
            vec![TransactionInput::new([1u8; 32], 0, 0)],
            vec![locked_output, memo],
        );
        tx.outputs[0].key_hash = classify(&tx.outputs[0].locking_script).map(|c| c.payload);

        let storage = MemoryStorage::new();
        manager.process_transaction_with_null_data(&mut tx, 1, &storage);

        assert_eq!(tx.outputs[0].plugin_id, Some(LOCK_HEIGHT_PLUGIN_ID));
        assert_eq!(tx.outputs[0].plugin_data.as_deref(), Some("1000"));
        // the key is not ours, so the output stays foreign
        assert!(!tx.outputs[0].is_mine());
    }

    #[test]
    fn test_rejects_non_p2pkh_recipient() {
        let (manager, converter) = manager();
        let recipient = converter.convert(&[5u8; 20], ScriptType::P2SH).unwrap();
        assert!(matches!(
            manager.process_outputs(recipient, &[PluginData::LockHeight { unlock_height: 1 }]),
            Err(PluginError::UnsupportedAddressType)
        ));
    }

    #[test]
    fn test_redeem_script_shape() {
        let script = LockHeightPlugin::redeem_script(500, &[9u8; 20]);
        assert_eq!(script[3], OP_CHECKLOCKTIMEVERIFY);
        assert_eq!(&script[script.len() - 2..], &[OP_EQUALVERIFY, OP_CHECKSIG]);
        assert!(locking_script(ScriptType::P2SH, &hash160(&script)).is_some());
    }
}
