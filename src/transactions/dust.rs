//! Dust threshold
//!
//! An output is dust when spending it costs more than it is worth at the
//! dust relay fee rate: the size of the output plus the input that later
//! spends it, times the rate.

use std::sync::Arc;

use super::size::SizeCalculator;
use crate::core::script::ScriptType;

pub struct DustCalculator {
    /// sat/vbyte
    min_fee_rate: u64,
    size_calculator: Arc<dyn SizeCalculator>,
}

impl DustCalculator {
    pub fn new(min_fee_rate: u64, size_calculator: Arc<dyn SizeCalculator>) -> Self {
        Self {
            min_fee_rate,
            size_calculator,
        }
    }

    /// Dust limit for an output of `script_type`; an explicit threshold wins
    pub fn dust(&self, script_type: ScriptType, dust_threshold: Option<u64>) -> u64 {
        if let Some(threshold) = dust_threshold {
            return threshold;
        }

        let calculator = &self.size_calculator;
        let mut size = calculator.output_size(script_type);
        if script_type.is_witness() {
            size += calculator.input_size(ScriptType::P2WPKH) + calculator.witness_size(ScriptType::P2WPKH) / 4;
        } else {
            size += calculator.input_size(ScriptType::P2PKH);
        }

        size as u64 * self.min_fee_rate
    }
}
