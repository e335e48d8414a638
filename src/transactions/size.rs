//! Transaction size estimation
//!
//! Sizes are computed in weight units and rounded up to virtual bytes.
//! Non-witness data weighs 4 per byte, witness data 1 per byte.
//!
//!   Part            Weight
//!   ====            ======
//!   Empty tx        40 (version, counts, lock time); 42 with segwit marker
//!   Input           (32 + 4 + 1 + scriptSig + 4) x 4, plus witness
//!   Output          (8 + 1 + locking script) x 4

use crate::core::script::{push, ScriptType};
use crate::core::transaction::TransactionOutput;

/// DER signature with sighash byte, plus its push
pub const ECDSA_SIGNATURE_LENGTH: usize = 72 + 1;
pub const SCHNORR_SIGNATURE_LENGTH: usize = 64 + 1;
pub const PUBLIC_KEY_LENGTH: usize = 33 + 1;
/// `0014{key-hash}` pushed in the scriptSig of a nested segwit input
const P2WPKH_SH_LENGTH: usize = 22 + 1;

const LEGACY_TX: usize = 16 + 4 + 4 + 16;
const WITNESS_TX: usize = LEGACY_TX + 1 + 1;
/// Empty witness stack of a non-witness input in a segwit transaction
const LEGACY_WITNESS_DATA: usize = 1;
/// Stack item count, signature and public key
pub const P2WPKH_WITNESS_DATA: usize = 1 + ECDSA_SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH;
pub const P2TR_WITNESS_DATA: usize = 1 + SCHNORR_SIGNATURE_LENGTH;

/// Size estimates used by coin selection and fee calculation
pub trait SizeCalculator: Send + Sync {
    /// Virtual size of a transaction spending `previous_outputs` into outputs
    /// of the given types plus a null-data output of `plugin_data_size` bytes
    fn transaction_size(
        &self,
        previous_outputs: &[TransactionOutput],
        outputs: &[ScriptType],
        plugin_data_size: usize,
    ) -> usize;

    fn output_size(&self, script_type: ScriptType) -> usize;

    fn input_size(&self, script_type: ScriptType) -> usize;

    /// Witness bytes of an input spending `script_type`
    fn witness_size(&self, script_type: ScriptType) -> usize;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionSizeCalculator;

impl TransactionSizeCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Size of the inputs the signer knows how to unlock
    fn previous_output_input_size(&self, output: &TransactionOutput) -> usize {
        let sig_script_length = match output.script_type {
            ScriptType::P2SH => match &output.redeem_script {
                Some(redeem_script) => ECDSA_SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH + push(redeem_script).len(),
                None => 0,
            },
            script_type => sig_script_length(script_type),
        };
        32 + 4 + 1 + sig_script_length + 4
    }

    /// Virtual size of fully specified outputs, null data included
    pub fn transaction_size_with_outputs(
        &self,
        previous_outputs: &[TransactionOutput],
        outputs: &[TransactionOutput],
    ) -> usize {
        let mut weight = self.inputs_weight(previous_outputs);
        for output in outputs {
            let script_size = match output.script_type {
                ScriptType::NullData | ScriptType::Unknown => output.locking_script.len(),
                script_type => script_type.locking_script_size(),
            };
            weight += output_size_by_script_size(script_size) * 4;
        }
        to_vbytes(weight)
    }

    fn inputs_weight(&self, previous_outputs: &[TransactionOutput]) -> usize {
        let segwit = previous_outputs.iter().any(|o| o.script_type.is_witness());
        let base = if segwit { WITNESS_TX } else { LEGACY_TX };

        base + previous_outputs
            .iter()
            .map(|output| {
                let witness = if segwit { self.witness_size(output.script_type) } else { 0 };
                self.previous_output_input_size(output) * 4 + witness
            })
            .sum::<usize>()
    }
}

impl SizeCalculator for TransactionSizeCalculator {
    fn transaction_size(
        &self,
        previous_outputs: &[TransactionOutput],
        outputs: &[ScriptType],
        plugin_data_size: usize,
    ) -> usize {
        let mut weight = self.inputs_weight(previous_outputs);
        weight += outputs.iter().map(|t| self.output_size(*t)).sum::<usize>() * 4;
        if plugin_data_size > 0 {
            weight += output_size_by_script_size(plugin_data_size) * 4;
        }
        to_vbytes(weight)
    }

    fn output_size(&self, script_type: ScriptType) -> usize {
        output_size_by_script_size(script_type.locking_script_size())
    }

    fn input_size(&self, script_type: ScriptType) -> usize {
        32 + 4 + 1 + sig_script_length(script_type) + 4
    }

    fn witness_size(&self, script_type: ScriptType) -> usize {
        match script_type {
            ScriptType::P2WPKH | ScriptType::P2WPKHSH => P2WPKH_WITNESS_DATA,
            ScriptType::P2TR => P2TR_WITNESS_DATA,
            _ => LEGACY_WITNESS_DATA,
        }
    }
}

fn sig_script_length(script_type: ScriptType) -> usize {
    match script_type {
        ScriptType::P2PKH => ECDSA_SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH,
        ScriptType::P2PK => ECDSA_SIGNATURE_LENGTH,
        ScriptType::P2WPKHSH => P2WPKH_SH_LENGTH,
        _ => 0,
    }
}

fn output_size_by_script_size(size: usize) -> usize {
    8 + 1 + size
}

fn to_vbytes(weight: usize) -> usize {
    weight.div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spent(script_type: ScriptType) -> TransactionOutput {
        TransactionOutput::new(10_000, 0, Vec::new(), script_type)
    }

    #[test]
    fn test_empty_transaction() {
        let calculator = TransactionSizeCalculator::new();
        assert_eq!(calculator.transaction_size(&[], &[], 0), 10);
    }

    #[test]
    fn test_witness_inputs_are_cheaper() {
        let calculator = TransactionSizeCalculator::new();
        let legacy = calculator.transaction_size(&[spent(ScriptType::P2PKH)], &[ScriptType::P2PKH], 0);
        let nested = calculator.transaction_size(&[spent(ScriptType::P2WPKHSH)], &[ScriptType::P2PKH], 0);
        let native = calculator.transaction_size(&[spent(ScriptType::P2WPKH)], &[ScriptType::P2PKH], 0);
        let taproot = calculator.transaction_size(&[spent(ScriptType::P2TR)], &[ScriptType::P2PKH], 0);

        // 10 + 148 + 34
        assert_eq!(legacy, 192);
        assert!(native < nested && nested < legacy);
        assert!(taproot < native);
    }

    #[test]
    fn test_native_segwit_size() {
        let calculator = TransactionSizeCalculator::new();
        // (42 + 41 * 4 + 108 + 31 * 4) / 4 rounded up
        let size = calculator.transaction_size(&[spent(ScriptType::P2WPKH)], &[ScriptType::P2WPKH], 0);
        assert_eq!(size, 110);
    }

    #[test]
    fn test_plugin_data_output() {
        let calculator = TransactionSizeCalculator::new();
        let without = calculator.transaction_size(&[spent(ScriptType::P2PKH)], &[ScriptType::P2SH], 0);
        let with = calculator.transaction_size(&[spent(ScriptType::P2PKH)], &[ScriptType::P2SH], 28);
        assert_eq!(with - without, 8 + 1 + 28);
    }

    #[test]
    fn test_redeem_script_input() {
        let calculator = TransactionSizeCalculator::new();
        let mut output = spent(ScriptType::P2SH);
        let plain = calculator.transaction_size(&[output.clone()], &[], 0);
        output.redeem_script = Some(vec![0u8; 30]);
        let redeemable = calculator.transaction_size(&[output], &[], 0);
        assert_eq!(redeemable - plain, ECDSA_SIGNATURE_LENGTH + PUBLIC_KEY_LENGTH + 31);
    }
}
