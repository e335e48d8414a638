//! Outgoing transaction assembly
//!
//! The builder turns a `SendRequest` into a `MutableTransaction` in three
//! steps: resolve the recipient (plugins may rewrite it), pick inputs and
//! change, then lay out and order the outputs. The signer turns the result
//! into a `FullTransaction`.

use std::cmp::Ordering;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::dust::DustCalculator;
use super::plugin::{PluginData, PluginError, PluginManager};
use super::selector::{SelectionParameters, SendValueError, UnspentOutputQueue, UnspentOutputSelector};
use super::signer::{SignerError, TransactionSigner};
use super::size::SizeCalculator;
use crate::core::address::{Address, AddressConverter, AddressError};
use crate::core::public_key::PublicKey;
use crate::core::script::ScriptType;
use crate::core::transaction::{
    FullTransaction, Transaction, TransactionInput, TransactionOutput, TransactionStatus, SEQUENCE_NO_RBF,
    SEQUENCE_RBF, TX_VERSION,
};
use crate::storage::{Storage, UnspentOutput};
use crate::wallet::PublicKeyManagerError;
use crate::wallet::PublicKeyManager;

#[derive(Error, Debug)]
pub enum BuilderError {
    #[error("Invalid address: {0}")]
    Address(#[from] AddressError),
    #[error("{0}")]
    SendValue(#[from] SendValueError),
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),
    #[error("No change key: {0}")]
    ChangeKey(#[from] PublicKeyManagerError),
    #[error("Signing failed: {0}")]
    Signer(#[from] SignerError),
}

/// Order of inputs and outputs in a built transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionDataSortType {
    None,
    #[default]
    Shuffle,
    /// BIP69 lexicographic ordering
    Bip69,
}

impl TransactionDataSortType {
    fn sort_inputs(&self, inputs: &mut [InputToSign]) {
        match self {
            TransactionDataSortType::None => {}
            TransactionDataSortType::Shuffle => inputs.shuffle(&mut rand::thread_rng()),
            TransactionDataSortType::Bip69 => inputs.sort_by(|a, b| bip69_input_order(&a.input, &b.input)),
        }
    }

    fn sort_outputs(&self, outputs: &mut [TransactionOutput]) {
        match self {
            TransactionDataSortType::None => {}
            TransactionDataSortType::Shuffle => outputs.shuffle(&mut rand::thread_rng()),
            TransactionDataSortType::Bip69 => outputs.sort_by(|a, b| {
                a.value
                    .cmp(&b.value)
                    .then_with(|| a.locking_script.cmp(&b.locking_script))
            }),
        }
    }
}

/// Previous transaction hash as displayed (byte-reversed), then output index
fn bip69_input_order(a: &TransactionInput, b: &TransactionInput) -> Ordering {
    a.previous_output_tx_hash
        .iter()
        .rev()
        .cmp(b.previous_output_tx_hash.iter().rev())
        .then_with(|| a.previous_output_index.cmp(&b.previous_output_index))
}

// =============================================================================
// Send Request
// =============================================================================

/// Everything needed to build one outgoing transaction
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub address: String,
    pub value: u64,
    /// sat/vbyte
    pub fee_rate: u64,
    pub sender_pay: bool,
    pub sort_type: TransactionDataSortType,
    pub rbf_enabled: bool,
    /// Spend exactly these outputs instead of running coin selection
    pub unspent_outputs: Option<Vec<UnspentOutput>>,
    pub plugin_data: Vec<PluginData>,
    pub dust_threshold: Option<u64>,
}

impl SendRequest {
    pub fn new(address: impl Into<String>, value: u64, fee_rate: u64) -> Self {
        Self {
            address: address.into(),
            value,
            fee_rate,
            sender_pay: true,
            sort_type: TransactionDataSortType::default(),
            rbf_enabled: true,
            unspent_outputs: None,
            plugin_data: Vec::new(),
            dust_threshold: None,
        }
    }
}

// =============================================================================
// Mutable Transaction
// =============================================================================

/// An input together with what the signer needs to unlock it
#[derive(Debug, Clone)]
pub struct InputToSign {
    pub input: TransactionInput,
    pub previous_output: TransactionOutput,
    pub public_key: PublicKey,
}

/// A transaction under construction
#[derive(Debug, Clone)]
pub struct MutableTransaction {
    pub header: Transaction,
    pub inputs_to_sign: Vec<InputToSign>,
    pub outputs: Vec<TransactionOutput>,
    pub recipient_address: Address,
    pub recipient_value: u64,
    pub change_address: Option<Address>,
    pub change_value: u64,
}

impl MutableTransaction {
    pub fn input_value(&self) -> u64 {
        self.inputs_to_sign.iter().map(|i| i.previous_output.value).sum()
    }

    pub fn output_value(&self) -> u64 {
        self.outputs.iter().map(|o| o.value).sum()
    }

    pub fn fee(&self) -> u64 {
        self.input_value().saturating_sub(self.output_value())
    }

    /// Transaction with empty unlocking data, ready for signature hashing
    pub fn unsigned(&self) -> FullTransaction {
        let inputs = self.inputs_to_sign.iter().map(|i| i.input.clone()).collect();
        FullTransaction::new(self.header.clone(), inputs, self.outputs.clone())
    }
}

// =============================================================================
// Builder
// =============================================================================

pub struct TransactionBuilder {
    storage: Arc<dyn Storage>,
    address_converter: Arc<dyn AddressConverter>,
    selector: Arc<dyn UnspentOutputSelector>,
    size_calculator: Arc<dyn SizeCalculator>,
    dust_calculator: Arc<DustCalculator>,
    public_key_manager: Arc<PublicKeyManager>,
    plugin_manager: Arc<PluginManager>,
    signer: TransactionSigner,
    change_script_type: ScriptType,
}

impl TransactionBuilder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        address_converter: Arc<dyn AddressConverter>,
        selector: Arc<dyn UnspentOutputSelector>,
        size_calculator: Arc<dyn SizeCalculator>,
        dust_calculator: Arc<DustCalculator>,
        public_key_manager: Arc<PublicKeyManager>,
        plugin_manager: Arc<PluginManager>,
        signer: TransactionSigner,
        change_script_type: ScriptType,
    ) -> Self {
        Self {
            storage,
            address_converter,
            selector,
            size_calculator,
            dust_calculator,
            public_key_manager,
            plugin_manager,
            signer,
            change_script_type,
        }
    }

    pub fn change_script_type(&self) -> ScriptType {
        self.change_script_type
    }

    /// Build and sign; the result is an own, outgoing, not yet relayed transaction
    pub fn build_transaction(&self, request: &SendRequest) -> Result<FullTransaction, BuilderError> {
        let mutable = self.build_unsigned(request)?;
        let mut transaction = self.signer.sign(&mutable)?;

        transaction.header.status = TransactionStatus::New;
        transaction.header.is_mine = true;
        transaction.header.is_outgoing = true;
        transaction.header.timestamp = chrono::Utc::now().timestamp();

        log::info!(
            "Built transaction {}: {} inputs, {} outputs, fee {}",
            transaction.header.hash_hex(),
            transaction.inputs.len(),
            transaction.outputs.len(),
            mutable.fee()
        );
        Ok(transaction)
    }

    /// Recipient, inputs, change and ordered outputs, without signatures
    pub fn build_unsigned(&self, request: &SendRequest) -> Result<MutableTransaction, BuilderError> {
        let recipient = self.address_converter.convert_str(&request.address)?;
        let (recipient, null_data) = self.plugin_manager.process_outputs(recipient, &request.plugin_data)?;
        let plugin_data_size = null_data.as_ref().map(|d| d.len()).unwrap_or(0);

        let parameters = SelectionParameters {
            value: request.value,
            fee_rate: request.fee_rate,
            output_script_type: recipient.script_type(),
            change_type: self.change_script_type,
            sender_pay: request.sender_pay,
            plugin_data_size,
            dust_threshold: request.dust_threshold,
        };

        let selected = match &request.unspent_outputs {
            Some(outputs) => {
                let mut queue = UnspentOutputQueue::new(
                    &parameters,
                    self.size_calculator.as_ref(),
                    self.dust_calculator.as_ref(),
                    None,
                );
                queue.set(outputs.clone());
                queue.calculate()?
            }
            None => self.selector.select(&parameters)?,
        };

        let sequence = if request.rbf_enabled { SEQUENCE_RBF } else { SEQUENCE_NO_RBF };
        let mut inputs_to_sign: Vec<InputToSign> = selected
            .outputs
            .into_iter()
            .map(|unspent| InputToSign {
                input: TransactionInput::new(unspent.output.transaction_hash, unspent.output.index, sequence),
                previous_output: unspent.output,
                public_key: unspent.public_key,
            })
            .collect();
        request.sort_type.sort_inputs(&mut inputs_to_sign);

        let mut recipient_output = TransactionOutput::new(
            selected.recipient_value,
            0,
            recipient.locking_script(),
            recipient.script_type(),
        );
        recipient_output.address = Some(recipient.string.clone());
        let mut outputs = vec![recipient_output];

        let mut change_address = None;
        if let Some(change_value) = selected.change_value {
            let change_key = self.public_key_manager.change_public_key()?;
            let address = self
                .address_converter
                .convert_public_key(&change_key, self.change_script_type)?;

            let mut change = TransactionOutput::new(
                change_value,
                0,
                address.locking_script(),
                self.change_script_type,
            );
            change.public_key_path = Some(change_key.path.clone());
            change.address = Some(address.string.clone());
            outputs.push(change);
            change_address = Some(address);
        }
        request.sort_type.sort_outputs(&mut outputs);

        if let Some(null_data) = null_data {
            outputs.push(TransactionOutput::new(0, 0, null_data, ScriptType::NullData));
        }

        let last_block_height = self.storage.last_block().map(|b| b.height).unwrap_or(0);

        Ok(MutableTransaction {
            header: Transaction::new(TX_VERSION, last_block_height),
            inputs_to_sign,
            outputs,
            recipient_address: recipient,
            recipient_value: selected.recipient_value,
            change_address,
            change_value: selected.change_value.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::SegwitAddressConverter;
    use crate::core::block::{Block, BlockHeader};
    use crate::core::script::locking_script;
    use crate::storage::MemoryStorage;
    use crate::transactions::plugin::LockHeightPlugin;
    use crate::transactions::selector::{GreedyUnspentOutputSelector, UnspentOutputSelectorChain};
    use crate::transactions::size::TransactionSizeCalculator;
    use crate::transactions::unspent_output_provider::UnspentOutputProvider;
    use crate::wallet::{KeyChain, Purpose, SeedKeyChain};
    use crate::core::address::{AddressConverterChain, Base58AddressConverter};

    struct Fixture {
        storage: Arc<MemoryStorage>,
        key_chain: Arc<SeedKeyChain>,
        builder: TransactionBuilder,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let key_chain = Arc::new(SeedKeyChain::from_seed(&[7u8; 32], Purpose::Bip84, 1).unwrap());
        let public_key_manager = Arc::new(PublicKeyManager::new(storage.clone(), key_chain.clone(), 5));
        public_key_manager.fill_gap().unwrap();

        let mut converter = AddressConverterChain::new();
        converter.push(Box::new(Base58AddressConverter::new(111, 196)));
        converter.prepend(Box::new(SegwitAddressConverter::new("tb")));
        let converter: Arc<dyn AddressConverter> = Arc::new(converter);

        let plugin_manager = Arc::new(PluginManager::new());
        plugin_manager.add_plugin(Arc::new(LockHeightPlugin::new(converter.clone())));

        let size: Arc<dyn SizeCalculator> = Arc::new(TransactionSizeCalculator::new());
        let dust = Arc::new(DustCalculator::new(3, size.clone()));
        let provider = Arc::new(UnspentOutputProvider::new(storage.clone(), 0, plugin_manager.clone()));
        let mut chain = UnspentOutputSelectorChain::new(provider.clone());
        chain.push(Box::new(GreedyUnspentOutputSelector::new(size.clone(), dust.clone(), provider, None)));

        let header = BlockHeader::new(1, [0u8; 32], [0u8; 32], 1_600_000_000, 0x207f_ffff, 0);
        storage.add_block(Block::new(header, 500));

        let builder = TransactionBuilder::new(
            storage.clone(),
            converter,
            Arc::new(chain),
            size,
            dust,
            public_key_manager,
            plugin_manager,
            TransactionSigner::new(key_chain.clone()),
            ScriptType::P2WPKH,
        );

        Fixture {
            storage,
            key_chain,
            builder,
        }
    }

    fn fund(fixture: &Fixture, value: u64, seed: u8) {
        let key = fixture.key_chain.public_key(0, seed as u32, true).unwrap();
        let mut header = Transaction::default();
        header.is_mine = true;
        let mut output = TransactionOutput::new(
            value,
            0,
            locking_script(ScriptType::P2WPKH, &key.public_key_hash).unwrap(),
            ScriptType::P2WPKH,
        );
        output.public_key_path = Some(key.path.clone());
        output.key_hash = Some(key.public_key_hash.to_vec());
        let input = TransactionInput::new([seed; 32], 0, 0);
        fixture
            .storage
            .add_transaction(FullTransaction::new(header, vec![input], vec![output]));
    }

    fn recipient(fixture: &Fixture) -> String {
        let key = fixture.key_chain.public_key(3, 0, true).unwrap();
        Base58AddressConverter::new(111, 196)
            .convert_public_key(&key, ScriptType::P2PKH)
            .unwrap()
            .string
    }

    #[test]
    fn test_build_with_change() {
        let fixture = fixture();
        fund(&fixture, 100_000, 1);

        let mut request = SendRequest::new(recipient(&fixture), 40_000, 2);
        request.sort_type = TransactionDataSortType::None;
        let mutable = fixture.builder.build_unsigned(&request).unwrap();

        assert_eq!(mutable.inputs_to_sign.len(), 1);
        assert_eq!(mutable.outputs.len(), 2);
        assert_eq!(mutable.outputs[0].value, 40_000);
        assert_eq!(mutable.outputs[0].script_type, ScriptType::P2PKH);
        assert_eq!(mutable.outputs[1].script_type, ScriptType::P2WPKH);
        assert!(mutable.outputs[1].is_mine());
        assert_eq!(mutable.header.lock_time, 500);
        assert_eq!(mutable.inputs_to_sign[0].input.sequence, SEQUENCE_RBF);
        assert_eq!(mutable.fee(), 100_000 - 40_000 - mutable.change_value);
    }

    #[test]
    fn test_rbf_disabled_sequence() {
        let fixture = fixture();
        fund(&fixture, 100_000, 1);

        let mut request = SendRequest::new(recipient(&fixture), 40_000, 2);
        request.rbf_enabled = false;
        let mutable = fixture.builder.build_unsigned(&request).unwrap();
        assert_eq!(mutable.inputs_to_sign[0].input.sequence, SEQUENCE_NO_RBF);
    }

    #[test]
    fn test_built_transaction_is_signed_and_new() {
        let fixture = fixture();
        fund(&fixture, 100_000, 1);

        let request = SendRequest::new(recipient(&fixture), 40_000, 2);
        let transaction = fixture.builder.build_transaction(&request).unwrap();

        assert_eq!(transaction.header.status, TransactionStatus::New);
        assert!(transaction.header.is_mine && transaction.header.is_outgoing);
        assert!(transaction.header.segwit);
        assert_eq!(transaction.inputs[0].witness.len(), 2);
        assert_eq!(FullTransaction::deserialize(&transaction.serialize()).unwrap().hash(), transaction.hash());
    }

    #[test]
    fn test_explicit_unspent_outputs() {
        let fixture = fixture();
        fund(&fixture, 30_000, 1);
        fund(&fixture, 90_000, 2);

        let chosen: Vec<UnspentOutput> = fixture
            .storage
            .unspent_outputs()
            .into_iter()
            .filter(|u| u.output.value == 90_000)
            .collect();
        let mut request = SendRequest::new(recipient(&fixture), 20_000, 2);
        request.unspent_outputs = Some(chosen);

        let mutable = fixture.builder.build_unsigned(&request).unwrap();
        assert_eq!(mutable.input_value(), 90_000);
    }

    #[test]
    fn test_lock_height_plugin_output() {
        let fixture = fixture();
        fund(&fixture, 100_000, 1);

        let mut request = SendRequest::new(recipient(&fixture), 40_000, 2);
        request.sort_type = TransactionDataSortType::Bip69;
        request.plugin_data = vec![PluginData::LockHeight { unlock_height: 700 }];
        let mutable = fixture.builder.build_unsigned(&request).unwrap();

        assert_eq!(mutable.recipient_address.script_type(), ScriptType::P2SH);
        let null_data = mutable.outputs.last().unwrap();
        assert_eq!(null_data.script_type, ScriptType::NullData);
        assert_eq!(null_data.value, 0);
        assert!(mutable.outputs.iter().any(|o| o.script_type == ScriptType::P2SH && o.value == 40_000));
    }

    #[test]
    fn test_insufficient_funds() {
        let fixture = fixture();
        fund(&fixture, 1_000, 1);

        let request = SendRequest::new(recipient(&fixture), 40_000, 2);
        assert!(matches!(
            fixture.builder.build_unsigned(&request),
            Err(BuilderError::SendValue(SendValueError::InsufficientUnspentOutputs))
        ));
    }

    #[test]
    fn test_bip69_ordering() {
        let mut a = TransactionInput::new([0u8; 32], 1, 0);
        let mut b = TransactionInput::new([0u8; 32], 0, 0);
        assert_eq!(bip69_input_order(&a, &b), Ordering::Greater);

        // Last internal byte is the most significant in display order
        a.previous_output_tx_hash[31] = 1;
        b.previous_output_tx_hash[0] = 9;
        assert_eq!(bip69_input_order(&a, &b), Ordering::Greater);
    }
}
