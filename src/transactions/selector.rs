//! Coin selection
//!
//! `UnspentOutputQueue` does the arithmetic for one candidate set of outputs.
//! Selectors decide which sets to try; `UnspentOutputSelectorChain` runs
//! them in order and returns the first success.

use std::sync::Arc;

use thiserror::Error;

use super::dust::DustCalculator;
use super::size::SizeCalculator;
use super::unspent_output_provider::UnspentOutputSource;
use crate::core::script::ScriptType;
use crate::storage::UnspentOutput;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendValueError {
    #[error("Value is dust")]
    Dust,
    #[error("No outputs to spend")]
    EmptyOutputs,
    #[error("Insufficient unspent outputs")]
    InsufficientUnspentOutputs,
    #[error("No single output matches the value")]
    NoSingleOutput,
    #[error("An output failed to spend before")]
    HasOutputFailedToSpend,
}

/// What a selection has to pay for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionParameters {
    pub value: u64,
    /// sat/vbyte
    pub fee_rate: u64,
    pub output_script_type: ScriptType,
    pub change_type: ScriptType,
    /// Fee added on top of `value` when true, deducted from it otherwise
    pub sender_pay: bool,
    pub plugin_data_size: usize,
    pub dust_threshold: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedUnspentOutputInfo {
    pub outputs: Vec<UnspentOutput>,
    pub recipient_value: u64,
    pub change_value: Option<u64>,
}

// =============================================================================
// Queue
// =============================================================================

pub struct UnspentOutputQueue<'a> {
    parameters: &'a SelectionParameters,
    size_calculator: &'a dyn SizeCalculator,
    outputs_limit: Option<usize>,
    selected: Vec<UnspentOutput>,
    total_value: u64,
    recipient_dust: u64,
    change_dust: u64,
}

impl<'a> UnspentOutputQueue<'a> {
    pub fn new(
        parameters: &'a SelectionParameters,
        size_calculator: &'a dyn SizeCalculator,
        dust_calculator: &DustCalculator,
        outputs_limit: Option<usize>,
    ) -> Self {
        Self {
            recipient_dust: dust_calculator.dust(parameters.output_script_type, parameters.dust_threshold),
            change_dust: dust_calculator.dust(parameters.change_type, parameters.dust_threshold),
            parameters,
            size_calculator,
            outputs_limit,
            selected: Vec::new(),
            total_value: 0,
        }
    }

    /// Add an output, evicting the oldest one past the outputs limit
    pub fn push(&mut self, output: UnspentOutput) {
        self.total_value += output.output.value;
        self.selected.push(output);

        if let Some(limit) = self.outputs_limit.filter(|l| *l > 0) {
            if self.selected.len() > limit {
                let evicted = self.selected.remove(0);
                self.total_value -= evicted.output.value;
            }
        }
    }

    pub fn set(&mut self, outputs: Vec<UnspentOutput>) {
        self.selected.clear();
        self.total_value = 0;
        for output in outputs {
            self.push(output);
        }
    }

    pub fn calculate(&self) -> Result<SelectedUnspentOutputInfo, SendValueError> {
        if self.selected.is_empty() {
            return Err(SendValueError::EmptyOutputs);
        }

        let params = self.parameters;
        let previous_outputs: Vec<_> = self.selected.iter().map(|u| u.output.clone()).collect();
        let fee = self.size_calculator.transaction_size(
            &previous_outputs,
            &[params.output_script_type],
            params.plugin_data_size,
        ) as u64
            * params.fee_rate;

        let (receive_value, sent_value) = if params.sender_pay {
            (params.value, params.value + fee)
        } else {
            (params.value.saturating_sub(fee), params.value)
        };

        if self.total_value < sent_value {
            return Err(SendValueError::InsufficientUnspentOutputs);
        }
        if receive_value <= self.recipient_dust {
            return Err(SendValueError::Dust);
        }

        let remainder = self.total_value - receive_value - fee;
        let change_fee = self.size_calculator.output_size(params.change_type) as u64 * params.fee_rate;
        let change_value = remainder
            .checked_sub(change_fee)
            .filter(|change| *change > self.change_dust);

        Ok(SelectedUnspentOutputInfo {
            outputs: self.selected.clone(),
            recipient_value: receive_value,
            change_value,
        })
    }
}

// =============================================================================
// Selectors
// =============================================================================

pub trait UnspentOutputSelector: Send + Sync {
    fn select(&self, parameters: &SelectionParameters) -> Result<SelectedUnspentOutputInfo, SendValueError>;
}

/// Outputs that failed to spend go last, smaller values first
fn sorted_spendable(source: &dyn UnspentOutputSource) -> Vec<UnspentOutput> {
    let mut outputs = source.spendable_outputs();
    outputs.sort_by_key(|u| (u.output.failed_to_spend, u.output.value));
    outputs
}

/// Adds outputs in ascending value until the value and fee are covered
pub struct GreedyUnspentOutputSelector {
    size_calculator: Arc<dyn SizeCalculator>,
    dust_calculator: Arc<DustCalculator>,
    source: Arc<dyn UnspentOutputSource>,
    outputs_limit: Option<usize>,
}

impl GreedyUnspentOutputSelector {
    pub fn new(
        size_calculator: Arc<dyn SizeCalculator>,
        dust_calculator: Arc<DustCalculator>,
        source: Arc<dyn UnspentOutputSource>,
        outputs_limit: Option<usize>,
    ) -> Self {
        Self {
            size_calculator,
            dust_calculator,
            source,
            outputs_limit,
        }
    }
}

impl UnspentOutputSelector for GreedyUnspentOutputSelector {
    fn select(&self, parameters: &SelectionParameters) -> Result<SelectedUnspentOutputInfo, SendValueError> {
        // the received value may end up lower, never higher
        let dust = self
            .dust_calculator
            .dust(parameters.output_script_type, parameters.dust_threshold);
        if parameters.value < dust {
            return Err(SendValueError::Dust);
        }

        let mut queue = UnspentOutputQueue::new(
            parameters,
            self.size_calculator.as_ref(),
            &self.dust_calculator,
            self.outputs_limit,
        );

        let mut last_error = SendValueError::InsufficientUnspentOutputs;
        for output in sorted_spendable(self.source.as_ref()) {
            queue.push(output);
            match queue.calculate() {
                Ok(info) => return Ok(info),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

/// Looks for one output that covers the value without leaving change
pub struct SingleNoChangeUnspentOutputSelector {
    size_calculator: Arc<dyn SizeCalculator>,
    dust_calculator: Arc<DustCalculator>,
    source: Arc<dyn UnspentOutputSource>,
}

impl SingleNoChangeUnspentOutputSelector {
    pub fn new(
        size_calculator: Arc<dyn SizeCalculator>,
        dust_calculator: Arc<DustCalculator>,
        source: Arc<dyn UnspentOutputSource>,
    ) -> Self {
        Self {
            size_calculator,
            dust_calculator,
            source,
        }
    }
}

impl UnspentOutputSelector for SingleNoChangeUnspentOutputSelector {
    fn select(&self, parameters: &SelectionParameters) -> Result<SelectedUnspentOutputInfo, SendValueError> {
        let dust = self
            .dust_calculator
            .dust(parameters.output_script_type, parameters.dust_threshold);
        if parameters.value <= dust {
            return Err(SendValueError::Dust);
        }

        let outputs = sorted_spendable(self.source.as_ref());
        if outputs.is_empty() {
            return Err(SendValueError::EmptyOutputs);
        }
        if outputs.iter().any(|u| u.output.failed_to_spend) {
            return Err(SendValueError::HasOutputFailedToSpend);
        }

        let mut queue = UnspentOutputQueue::new(parameters, self.size_calculator.as_ref(), &self.dust_calculator, None);
        for output in outputs {
            queue.set(vec![output]);
            if let Ok(info) = queue.calculate() {
                if info.change_value.is_none() {
                    return Ok(info);
                }
            }
        }
        Err(SendValueError::NoSingleOutput)
    }
}

/// Ordered selectors; the first success wins, otherwise the last error
pub struct UnspentOutputSelectorChain {
    selectors: Vec<Box<dyn UnspentOutputSelector>>,
    source: Arc<dyn UnspentOutputSource>,
}

impl UnspentOutputSelectorChain {
    pub fn new(source: Arc<dyn UnspentOutputSource>) -> Self {
        Self {
            selectors: Vec::new(),
            source,
        }
    }

    pub fn push(&mut self, selector: Box<dyn UnspentOutputSelector>) {
        self.selectors.push(selector);
    }

    /// Give `selector` priority over the existing ones
    pub fn prepend(&mut self, selector: Box<dyn UnspentOutputSelector>) {
        self.selectors.insert(0, selector);
    }

    pub fn all_spendable(&self) -> Vec<UnspentOutput> {
        self.source.spendable_outputs()
    }
}

impl UnspentOutputSelector for UnspentOutputSelectorChain {
    fn select(&self, parameters: &SelectionParameters) -> Result<SelectedUnspentOutputInfo, SendValueError> {
        let mut last_error = SendValueError::EmptyOutputs;
        for selector in &self.selectors {
            match selector.select(parameters) {
                Ok(info) => return Ok(info),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::public_key::PublicKey;
    use crate::core::transaction::{Transaction, TransactionOutput};
    use crate::transactions::size::TransactionSizeCalculator;
    use secp256k1::{Secp256k1, SecretKey};

    /// Every transaction is 30 vbytes, every output 10
    struct FixedSize;

    impl SizeCalculator for FixedSize {
        fn transaction_size(&self, _previous: &[TransactionOutput], _outputs: &[ScriptType], _plugin: usize) -> usize {
            30
        }

        fn output_size(&self, _script_type: ScriptType) -> usize {
            10
        }

        fn input_size(&self, _script_type: ScriptType) -> usize {
            10
        }

        fn witness_size(&self, _script_type: ScriptType) -> usize {
            0
        }
    }

    struct Outputs(Vec<UnspentOutput>);

    impl UnspentOutputSource for Outputs {
        fn spendable_outputs(&self) -> Vec<UnspentOutput> {
            self.0.clone()
        }
    }

    fn unspent(values: &[u64]) -> Arc<Outputs> {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[5u8; 32]).unwrap();
        let raw = secp256k1::PublicKey::from_secret_key(&secp, &sk).serialize().to_vec();
        let public_key = PublicKey::new(0, 0, true, raw).unwrap();

        Arc::new(Outputs(
            values
                .iter()
                .enumerate()
                .map(|(i, value)| {
                    let mut output = TransactionOutput::new(*value, 0, Vec::new(), ScriptType::P2PKH);
                    output.transaction_hash = [i as u8 + 1; 32];
                    UnspentOutput {
                        output,
                        public_key: public_key.clone(),
                        transaction: Transaction::default(),
                        block: None,
                    }
                })
                .collect(),
        ))
    }

    fn parameters(value: u64, fee_rate: u64, sender_pay: bool) -> SelectionParameters {
        SelectionParameters {
            value,
            fee_rate,
            output_script_type: ScriptType::P2PKH,
            change_type: ScriptType::P2PKH,
            sender_pay,
            plugin_data_size: 0,
            dust_threshold: None,
        }
    }

    fn greedy(size: Arc<dyn SizeCalculator>, source: Arc<Outputs>, limit: Option<usize>) -> GreedyUnspentOutputSelector {
        let dust = Arc::new(DustCalculator::new(3, size.clone()));
        GreedyUnspentOutputSelector::new(size, dust, source, limit)
    }

    #[test]
    fn test_fixed_size_selection() {
        let selector = greedy(Arc::new(FixedSize), unspent(&[10_000, 5_000]), None);

        let info = selector.select(&parameters(12_000, 5, false)).unwrap();

        assert_eq!(info.outputs.len(), 2);
        assert_eq!(info.recipient_value, 11_850);
        // 15000 - 11850 - 150 - 50
        assert_eq!(info.change_value, Some(2_950));
    }

    #[test]
    fn test_sender_pays_fee() {
        let selector = greedy(Arc::new(FixedSize), unspent(&[10_000, 5_000]), None);

        let info = selector.select(&parameters(4_000, 5, true)).unwrap();

        assert_eq!(info.outputs.len(), 1);
        assert_eq!(info.outputs[0].output.value, 5_000);
        assert_eq!(info.recipient_value, 4_000);
        assert_eq!(info.change_value, Some(800));
    }

    #[test]
    fn test_dust_threshold() {
        let selector = greedy(Arc::new(FixedSize), unspent(&[10_000]), None);
        let mut params = parameters(100, 1, true);
        params.dust_threshold = Some(100);

        assert_eq!(selector.select(&params), Err(SendValueError::Dust));
    }

    #[test]
    fn test_insufficient_outputs() {
        let selector = greedy(Arc::new(TransactionSizeCalculator::new()), unspent(&[1_000, 2_000]), None);
        assert_eq!(
            selector.select(&parameters(50_000, 1, true)),
            Err(SendValueError::InsufficientUnspentOutputs)
        );
    }

    #[test]
    fn test_outputs_limit_evicts_smallest() {
        let selector = greedy(Arc::new(FixedSize), unspent(&[1_000, 2_000, 3_000, 9_000]), Some(2));

        let info = selector.select(&parameters(10_000, 1, true)).unwrap();

        let mut values: Vec<u64> = info.outputs.iter().map(|u| u.output.value).collect();
        values.sort();
        assert_eq!(values, vec![3_000, 9_000]);
    }

    fn outpoints(info: &SelectedUnspentOutputInfo) -> std::collections::HashSet<([u8; 32], u32)> {
        info.outputs
            .iter()
            .map(|u| (u.output.transaction_hash, u.output.index))
            .collect()
    }

    #[test]
    fn test_outputs_are_selected_once() {
        let size: Arc<dyn SizeCalculator> = Arc::new(FixedSize);
        let dust = Arc::new(DustCalculator::new(3, size.clone()));
        let source = unspent(&[1_000, 2_000, 3_000, 4_000, 5_000, 6_000, 7_000, 8_000]);

        let selector = greedy(size.clone(), source.clone(), Some(3));
        let info = selector.select(&parameters(20_000, 1, true)).unwrap();
        assert_eq!(info.outputs.len(), 3);
        assert_eq!(outpoints(&info).len(), 3);
        assert_eq!(info.outputs.iter().map(|u| u.output.value).sum::<u64>(), 21_000);

        let mut chain = UnspentOutputSelectorChain::new(source.clone());
        chain.push(Box::new(SingleNoChangeUnspentOutputSelector::new(
            size.clone(),
            dust.clone(),
            source.clone(),
        )));
        chain.push(Box::new(GreedyUnspentOutputSelector::new(size, dust, source, Some(4))));

        let info = chain.select(&parameters(25_000, 1, true)).unwrap();
        assert_eq!(outpoints(&info).len(), info.outputs.len());
        assert_eq!(info.outputs.len(), 4);
    }

    #[test]
    fn test_failed_to_spend_goes_last() {
        let source = unspent(&[1_000, 8_000]);
        let mut outputs = source.0.clone();
        outputs[0].output.failed_to_spend = true;
        let selector = greedy(Arc::new(FixedSize), Arc::new(Outputs(outputs)), None);

        let info = selector.select(&parameters(5_000, 1, true)).unwrap();
        assert_eq!(info.outputs.len(), 1);
        assert_eq!(info.outputs[0].output.value, 8_000);
    }

    #[test]
    fn test_single_no_change() {
        let size: Arc<dyn SizeCalculator> = Arc::new(FixedSize);
        let dust = Arc::new(DustCalculator::new(3, size.clone()));
        let selector = SingleNoChangeUnspentOutputSelector::new(size.clone(), dust.clone(), unspent(&[3_000, 5_100]));

        // 70 left over, 60 after the change output fee, which is not above dust
        let info = selector.select(&parameters(5_000, 1, true)).unwrap();
        assert_eq!(info.outputs[0].output.value, 5_100);
        assert_eq!(info.change_value, None);

        let selector = SingleNoChangeUnspentOutputSelector::new(size.clone(), dust.clone(), unspent(&[3_000, 9_000]));
        assert_eq!(selector.select(&parameters(5_000, 1, true)), Err(SendValueError::NoSingleOutput));

        let selector = SingleNoChangeUnspentOutputSelector::new(size, dust, unspent(&[]));
        assert_eq!(selector.select(&parameters(5_000, 1, true)), Err(SendValueError::EmptyOutputs));
    }

    #[test]
    fn test_chain_prefers_prepended() {
        let size: Arc<dyn SizeCalculator> = Arc::new(FixedSize);
        let dust = Arc::new(DustCalculator::new(3, size.clone()));
        let source = unspent(&[3_000, 5_100]);

        let mut chain = UnspentOutputSelectorChain::new(source.clone());
        chain.push(Box::new(GreedyUnspentOutputSelector::new(
            size.clone(),
            dust.clone(),
            source.clone(),
            None,
        )));

        let greedy_pick = chain.select(&parameters(5_000, 1, true)).unwrap();
        assert_eq!(greedy_pick.outputs.len(), 2);

        chain.prepend(Box::new(SingleNoChangeUnspentOutputSelector::new(size, dust, source)));
        let single_pick = chain.select(&parameters(5_000, 1, true)).unwrap();
        assert_eq!(single_pick.outputs.len(), 1);
        assert_eq!(chain.all_spendable().len(), 2);
    }
}
