//! Fee estimation
//!
//! Runs the builder's recipient and input steps without signing. When the
//! caller has no recipient yet, the wallet's own change address stands in.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::builder::{BuilderError, SendRequest, TransactionBuilder};
use super::dust::DustCalculator;
use super::plugin::{PluginData, PluginManager};
use super::size::SizeCalculator;
use super::unspent_output_provider::UnspentOutputSource;
use crate::core::address::AddressConverter;
use crate::core::script::ScriptType;
use crate::core::transaction::TransactionOutput;
use crate::wallet::PublicKeyManager;

/// Outcome of a dry-run build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendInfo {
    pub spent_outputs: Vec<TransactionOutput>,
    pub fee: u64,
    pub change_value: Option<u64>,
    pub change_address: Option<String>,
}

pub struct TransactionFeeCalculator {
    builder: Arc<TransactionBuilder>,
    source: Arc<dyn UnspentOutputSource>,
    size_calculator: Arc<dyn SizeCalculator>,
    dust_calculator: Arc<DustCalculator>,
    public_key_manager: Arc<PublicKeyManager>,
    address_converter: Arc<dyn AddressConverter>,
    plugin_manager: Arc<PluginManager>,
}

impl TransactionFeeCalculator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        builder: Arc<TransactionBuilder>,
        source: Arc<dyn UnspentOutputSource>,
        size_calculator: Arc<dyn SizeCalculator>,
        dust_calculator: Arc<DustCalculator>,
        public_key_manager: Arc<PublicKeyManager>,
        address_converter: Arc<dyn AddressConverter>,
        plugin_manager: Arc<PluginManager>,
    ) -> Self {
        Self {
            builder,
            source,
            size_calculator,
            dust_calculator,
            public_key_manager,
            address_converter,
            plugin_manager,
        }
    }

    /// Dry-run `request`; an empty address means the recipient is not known yet
    pub fn send_info(&self, request: &SendRequest) -> Result<SendInfo, BuilderError> {
        let mut request = request.clone();
        if request.address.is_empty() {
            request.address = self.placeholder_address()?;
        }

        let mutable = self.builder.build_unsigned(&request)?;
        let fee = mutable.fee();
        let change_value = mutable.change_address.as_ref().map(|_| mutable.change_value);

        Ok(SendInfo {
            spent_outputs: mutable.inputs_to_sign.into_iter().map(|i| i.previous_output).collect(),
            fee,
            change_value,
            change_address: mutable.change_address.map(|a| a.string),
        })
    }

    pub fn fee(&self, request: &SendRequest) -> Result<u64, BuilderError> {
        Ok(self.send_info(request)?.fee)
    }

    /// Everything spendable minus the fee of spending it all, clamped at zero
    pub fn maximum_spendable_value(
        &self,
        address: Option<&str>,
        fee_rate: u64,
        plugin_data: &[PluginData],
    ) -> Result<u64, BuilderError> {
        let outputs = self.source.spendable_outputs();
        if outputs.is_empty() {
            return Ok(0);
        }

        let recipient_type = self.recipient_script_type(address, plugin_data)?;
        let plugin_data_size = self.plugin_manager.null_data_size(plugin_data)?;
        let previous_outputs: Vec<_> = outputs.into_iter().map(|u| u.output).collect();
        let total: u64 = previous_outputs.iter().map(|o| o.value).sum();

        let fee = self
            .size_calculator
            .transaction_size(&previous_outputs, &[recipient_type], plugin_data_size) as u64
            * fee_rate;
        Ok(total.saturating_sub(fee))
    }

    /// Smallest value the recipient output may carry
    pub fn minimum_spendable_value(
        &self,
        address: Option<&str>,
        plugin_data: &[PluginData],
        dust_threshold: Option<u64>,
    ) -> Result<u64, BuilderError> {
        let recipient_type = self.recipient_script_type(address, plugin_data)?;
        Ok(self.dust_calculator.dust(recipient_type, dust_threshold) + 1)
    }

    fn recipient_script_type(
        &self,
        address: Option<&str>,
        plugin_data: &[PluginData],
    ) -> Result<ScriptType, BuilderError> {
        let Some(address) = address else {
            return Ok(self.builder.change_script_type());
        };

        let recipient = self.address_converter.convert_str(address)?;
        let (recipient, _) = self.plugin_manager.process_outputs(recipient, plugin_data)?;
        Ok(recipient.script_type())
    }

    fn placeholder_address(&self) -> Result<String, BuilderError> {
        let change_key = self.public_key_manager.change_public_key()?;
        let address = self
            .address_converter
            .convert_public_key(&change_key, self.builder.change_script_type())?;
        Ok(address.string)
    }
}
