//! Transaction models and wire serialization
//!
//! A `FullTransaction` owns its header record, inputs and outputs. The hash
//! is computed once in `FullTransaction::new` and stamped onto every input
//! and output so storage rows can be joined back together.
//!
//!   Size        Field           Description
//!   ====        =====           ===========
//!   4 bytes     Version         Transaction version
//!   0/2 bytes   Marker, Flag    0x00 0x01 when witness data follows
//!   VarInt      InputsCount     Number of inputs
//!   Variable    Inputs          Inputs
//!   VarInt      OutputsCount    Number of outputs
//!   Variable    Outputs         Outputs
//!   Variable    Witnesses       One stack per input (segwit only)
//!   4 bytes     LockTime        Transaction lock time

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::encoding::{put_var_bytes, put_var_int, DecodeError, Reader};
use crate::core::script::{ScriptType, SigHashType};
use crate::crypto::{double_sha256, sha256, tagged_hash, to_reversed_hex, Hash256};

// =============================================================================
// Constants
// =============================================================================

/// Version used for transactions the wallet creates
pub const TX_VERSION: i32 = 2;

/// Sequence number that disables locktime
pub const SEQUENCE_FINAL: u32 = 0xFFFF_FFFF;

/// Sequence used for non-RBF inputs so the lock time stays active
pub const SEQUENCE_NO_RBF: u32 = 0xFFFF_FFFE;

/// Sequence used for RBF opt-in inputs
pub const SEQUENCE_RBF: u32 = 0;

// =============================================================================
// Error Types
// =============================================================================

/// Transaction-related errors
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Input index {0} out of range")]
    InputOutOfRange(usize),
    #[error("Previous output count mismatch: {0} inputs, {1} previous outputs")]
    PrevoutMismatch(usize, usize),
}

// =============================================================================
// Transaction Header
// =============================================================================

/// Relay state of a wallet transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Created locally, not yet seen from the network
    New,
    Relayed,
    /// Double-spent or descending from an invalidated transaction
    Invalid,
}

/// Transaction header record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash256,
    pub block_hash: Option<Hash256>,
    pub version: i32,
    pub lock_time: u32,
    pub timestamp: i64,
    /// Topological position within its block
    pub order: u32,
    pub is_mine: bool,
    pub is_outgoing: bool,
    pub segwit: bool,
    pub status: TransactionStatus,
    pub conflicting_tx_hash: Option<Hash256>,
}

impl Transaction {
    pub fn new(version: i32, lock_time: u32) -> Self {
        Self {
            hash: [0u8; 32],
            block_hash: None,
            version,
            lock_time,
            timestamp: Utc::now().timestamp(),
            order: 0,
            is_mine: false,
            is_outgoing: false,
            segwit: false,
            status: TransactionStatus::Relayed,
            conflicting_tx_hash: None,
        }
    }

    pub fn hash_hex(&self) -> String {
        to_reversed_hex(&self.hash)
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new(TX_VERSION, 0)
    }
}

// =============================================================================
// Transaction Input
// =============================================================================

/// Transaction input (reference to a previous output)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub previous_output_tx_hash: Hash256,
    pub previous_output_index: u32,
    pub sig_script: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
    pub transaction_hash: Hash256,
    /// Public key hash (or public key) recovered from the unlocking data
    pub key_hash: Option<Vec<u8>>,
    pub address: Option<String>,
}

impl TransactionInput {
    pub fn new(previous_output_tx_hash: Hash256, previous_output_index: u32, sequence: u32) -> Self {
        Self {
            previous_output_tx_hash,
            previous_output_index,
            sig_script: Vec::new(),
            sequence,
            witness: Vec::new(),
            transaction_hash: [0u8; 32],
            key_hash: None,
            address: None,
        }
    }

    /// Whether both inputs spend the same previous output
    pub fn spends_same_output(&self, other: &TransactionInput) -> bool {
        self.previous_output_tx_hash == other.previous_output_tx_hash
            && self.previous_output_index == other.previous_output_index
    }

    fn write_outpoint(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.previous_output_tx_hash);
        out.extend_from_slice(&self.previous_output_index.to_le_bytes());
    }

    fn write(&self, out: &mut Vec<u8>) {
        self.write_outpoint(out);
        put_var_bytes(out, &self.sig_script);
        out.extend_from_slice(&self.sequence.to_le_bytes());
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let previous_output_tx_hash = reader.read_hash()?;
        let previous_output_index = reader.read_u32()?;
        let sig_script = reader.read_var_bytes()?;
        let sequence = reader.read_u32()?;

        let mut input = Self::new(previous_output_tx_hash, previous_output_index, sequence);
        input.sig_script = sig_script;
        Ok(input)
    }
}

// =============================================================================
// Transaction Output
// =============================================================================

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: u64,
    pub locking_script: Vec<u8>,
    pub index: u32,
    pub transaction_hash: Hash256,
    /// Path of the owning wallet key, if the output is ours
    pub public_key_path: Option<String>,
    pub script_type: ScriptType,
    /// Key hash, script hash or witness program extracted from the script
    pub key_hash: Option<Vec<u8>>,
    pub address: Option<String>,
    /// Set when a transaction spending this output failed to broadcast
    pub failed_to_spend: bool,
    /// Plugin that produced a non-standard locking script
    pub plugin_id: Option<u8>,
    pub plugin_data: Option<String>,
    /// Script a P2SH output commits to, when the wallet can redeem it
    #[serde(default)]
    pub redeem_script: Option<Vec<u8>>,
}

impl TransactionOutput {
    pub fn new(value: u64, index: u32, locking_script: Vec<u8>, script_type: ScriptType) -> Self {
        Self {
            value,
            locking_script,
            index,
            transaction_hash: [0u8; 32],
            public_key_path: None,
            script_type,
            key_hash: None,
            address: None,
            failed_to_spend: false,
            plugin_id: None,
            plugin_data: None,
            redeem_script: None,
        }
    }

    /// Output belongs to a wallet key
    pub fn is_mine(&self) -> bool {
        self.public_key_path.is_some()
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.value.to_le_bytes());
        put_var_bytes(out, &self.locking_script);
    }

    fn read(reader: &mut Reader<'_>, index: u32) -> Result<Self, DecodeError> {
        let value = reader.read_u64()?;
        let locking_script = reader.read_var_bytes()?;
        Ok(Self::new(value, index, locking_script, ScriptType::Unknown))
    }
}

// =============================================================================
// Full Transaction
// =============================================================================

/// A transaction together with its inputs and outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTransaction {
    pub header: Transaction,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
}

impl FullTransaction {
    /// Assemble a transaction, computing and propagating its hash
    pub fn new(
        mut header: Transaction,
        mut inputs: Vec<TransactionInput>,
        mut outputs: Vec<TransactionOutput>,
    ) -> Self {
        header.segwit = inputs.iter().any(|input| !input.witness.is_empty());
        let hash = double_sha256(&serialize_parts(&header, &inputs, &outputs, false));

        header.hash = hash;
        for input in inputs.iter_mut() {
            input.transaction_hash = hash;
        }
        for (index, output) in outputs.iter_mut().enumerate() {
            output.transaction_hash = hash;
            output.index = index as u32;
        }

        Self {
            header,
            inputs,
            outputs,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.header.hash
    }

    /// Wire serialization, including witness data when any input carries it
    pub fn serialize(&self) -> Vec<u8> {
        serialize_parts(&self.header, &self.inputs, &self.outputs, self.header.segwit)
    }

    /// Serialization without witness data (the txid preimage)
    pub fn serialize_without_witness(&self) -> Vec<u8> {
        serialize_parts(&self.header, &self.inputs, &self.outputs, false)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, TransactionError> {
        let mut reader = Reader::new(bytes);
        let transaction = Self::read(&mut reader)?;
        if !reader.is_empty() {
            return Err(DecodeError::InvalidValue(format!(
                "{} trailing bytes after transaction",
                reader.remaining()
            ))
            .into());
        }
        Ok(transaction)
    }

    /// Read a transaction from the front of `reader`
    pub fn read(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = reader.read_i32()?;

        let mut segwit = false;
        if reader.peek_u8() == Some(0) {
            reader.read_u8()?;
            if reader.read_u8()? != 1 {
                return Err(DecodeError::InvalidValue("bad segwit flag".to_string()));
            }
            segwit = true;
        }

        let input_count = reader.read_count(41)?;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TransactionInput::read(reader)?);
        }

        let output_count = reader.read_count(9)?;
        let mut outputs = Vec::with_capacity(output_count);
        for index in 0..output_count {
            outputs.push(TransactionOutput::read(reader, index as u32)?);
        }

        if segwit {
            for input in inputs.iter_mut() {
                let items = reader.read_count(1)?;
                for _ in 0..items {
                    input.witness.push(reader.read_var_bytes()?);
                }
            }
        }

        let lock_time = reader.read_u32()?;
        let header = Transaction::new(version, lock_time);

        Ok(Self::new(header, inputs, outputs))
    }

    /// Virtual size of the serialized transaction
    pub fn virtual_size(&self) -> usize {
        let base = self.serialize_without_witness().len();
        let total = self.serialize().len();
        (base * 3 + total + 3) / 4
    }
}

fn serialize_parts(
    header: &Transaction,
    inputs: &[TransactionInput],
    outputs: &[TransactionOutput],
    with_witness: bool,
) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&header.version.to_le_bytes());
    if with_witness {
        out.extend_from_slice(&[0x00, 0x01]);
    }

    put_var_int(&mut out, inputs.len() as u64);
    for input in inputs {
        input.write(&mut out);
    }
    put_var_int(&mut out, outputs.len() as u64);
    for output in outputs {
        output.write(&mut out);
    }

    if with_witness {
        for input in inputs {
            put_var_int(&mut out, input.witness.len() as u64);
            for item in &input.witness {
                put_var_bytes(&mut out, item);
            }
        }
    }

    out.extend_from_slice(&header.lock_time.to_le_bytes());
    out
}

// =============================================================================
// Signature Hashes
// =============================================================================

/// Legacy signature hash: inputs blanked, signed input carries the script code
pub fn legacy_sighash(
    tx: &FullTransaction,
    input_index: usize,
    script_code: &[u8],
    sighash: SigHashType,
) -> Result<Hash256, TransactionError> {
    if input_index >= tx.inputs.len() {
        return Err(TransactionError::InputOutOfRange(input_index));
    }

    let inputs: Vec<TransactionInput> = tx
        .inputs
        .iter()
        .enumerate()
        .map(|(index, input)| {
            let mut blank = input.clone();
            blank.witness.clear();
            blank.sig_script = if index == input_index {
                script_code.to_vec()
            } else {
                Vec::new()
            };
            blank
        })
        .collect();

    let mut preimage = serialize_parts(&tx.header, &inputs, &tx.outputs, false);
    preimage.extend_from_slice(&(sighash as u32).to_le_bytes());
    Ok(double_sha256(&preimage))
}

/// BIP143 signature hash for segwit v0 inputs
pub fn segwit_v0_sighash(
    tx: &FullTransaction,
    input_index: usize,
    script_code: &[u8],
    value: u64,
    sighash: SigHashType,
) -> Result<Hash256, TransactionError> {
    let input = tx
        .inputs
        .get(input_index)
        .ok_or(TransactionError::InputOutOfRange(input_index))?;

    let mut prevouts = Vec::new();
    let mut sequences = Vec::new();
    for input in &tx.inputs {
        input.write_outpoint(&mut prevouts);
        sequences.extend_from_slice(&input.sequence.to_le_bytes());
    }
    let mut outputs = Vec::new();
    for output in &tx.outputs {
        output.write(&mut outputs);
    }

    let mut preimage = Vec::new();
    preimage.extend_from_slice(&tx.header.version.to_le_bytes());
    preimage.extend_from_slice(&double_sha256(&prevouts));
    preimage.extend_from_slice(&double_sha256(&sequences));
    input.write_outpoint(&mut preimage);
    put_var_bytes(&mut preimage, script_code);
    preimage.extend_from_slice(&value.to_le_bytes());
    preimage.extend_from_slice(&input.sequence.to_le_bytes());
    preimage.extend_from_slice(&double_sha256(&outputs));
    preimage.extend_from_slice(&tx.header.lock_time.to_le_bytes());
    preimage.extend_from_slice(&(sighash as u32).to_le_bytes());

    Ok(double_sha256(&preimage))
}

/// BIP341 hashes shared by the signature messages of every input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaprootSighashParts {
    pub prevouts: Hash256,
    pub amounts: Hash256,
    pub script_pubkeys: Hash256,
    pub sequences: Hash256,
    pub outputs: Hash256,
}

impl TaprootSighashParts {
    /// `prevouts` holds the value and locking script of every spent output,
    /// in input order.
    pub fn new(tx: &FullTransaction, prevouts: &[(u64, Vec<u8>)]) -> Result<Self, TransactionError> {
        if prevouts.len() != tx.inputs.len() {
            return Err(TransactionError::PrevoutMismatch(tx.inputs.len(), prevouts.len()));
        }

        let mut outpoints = Vec::new();
        let mut sequences = Vec::new();
        for input in &tx.inputs {
            input.write_outpoint(&mut outpoints);
            sequences.extend_from_slice(&input.sequence.to_le_bytes());
        }
        let mut amounts = Vec::new();
        let mut scripts = Vec::new();
        for (value, script) in prevouts {
            amounts.extend_from_slice(&value.to_le_bytes());
            put_var_bytes(&mut scripts, script);
        }
        let mut outputs = Vec::new();
        for output in &tx.outputs {
            output.write(&mut outputs);
        }

        Ok(Self {
            prevouts: sha256(&outpoints),
            amounts: sha256(&amounts),
            script_pubkeys: sha256(&scripts),
            sequences: sha256(&sequences),
            outputs: sha256(&outputs),
        })
    }
}

/// BIP341 key-path signature hash with SIGHASH_DEFAULT
///
/// `prevouts` holds the value and locking script of every spent output, in
/// input order.
pub fn taproot_sighash(
    tx: &FullTransaction,
    input_index: usize,
    prevouts: &[(u64, Vec<u8>)],
) -> Result<Hash256, TransactionError> {
    if input_index >= tx.inputs.len() {
        return Err(TransactionError::InputOutOfRange(input_index));
    }
    let parts = TaprootSighashParts::new(tx, prevouts)?;

    let mut message = vec![0x00, SigHashType::Default as u8];
    message.extend_from_slice(&tx.header.version.to_le_bytes());
    message.extend_from_slice(&tx.header.lock_time.to_le_bytes());
    message.extend_from_slice(&parts.prevouts);
    message.extend_from_slice(&parts.amounts);
    message.extend_from_slice(&parts.script_pubkeys);
    message.extend_from_slice(&parts.sequences);
    message.extend_from_slice(&parts.outputs);
    // key path spend, no annex
    message.push(0x00);
    message.extend_from_slice(&(input_index as u32).to_le_bytes());

    Ok(tagged_hash("TapSighash", &message))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // BIP143 native P2WPKH example, unsigned
    const BIP143_UNSIGNED: &str = "0100000002fff7f7881a8099afa6940d42d1e7f6362bec38171ea3edf433541db4e4ad969f0000000000eeffffffef51e1b804cc89d182d279655c3aa89e815b1b309fe287d9b2b55d57b90ec68a0100000000ffffffff02202cb206000000001976a9148280b37df378db99f66f85c95a783a76ac7a6d5988ac9093510d000000001976a9143bde42dbee7e4dbe6a21b2d50ce2f0167faa815988ac11000000";

    fn sample_transaction() -> FullTransaction {
        let mut input = TransactionInput::new([7u8; 32], 1, SEQUENCE_FINAL);
        input.sig_script = vec![0x51];
        let output = TransactionOutput::new(50_000, 0, vec![0x6a], ScriptType::NullData);
        FullTransaction::new(Transaction::new(TX_VERSION, 0), vec![input], vec![output])
    }

    #[test]
    fn test_hash_propagates_to_inputs_and_outputs() {
        let tx = sample_transaction();
        assert_ne!(tx.hash(), [0u8; 32]);
        assert_eq!(tx.inputs[0].transaction_hash, tx.hash());
        assert_eq!(tx.outputs[0].transaction_hash, tx.hash());
        assert!(!tx.header.segwit);
    }

    #[test]
    fn test_legacy_serialization_parses_back() {
        let tx = sample_transaction();
        let parsed = FullTransaction::deserialize(&tx.serialize()).unwrap();
        assert_eq!(parsed.hash(), tx.hash());
        assert_eq!(parsed.outputs[0].value, 50_000);
    }

    #[test]
    fn test_witness_does_not_change_hash() {
        let mut tx = sample_transaction();
        let legacy_hash = tx.hash();
        tx.inputs[0].witness = vec![vec![1u8; 71], vec![2u8; 33]];
        let signed = FullTransaction::new(tx.header.clone(), tx.inputs.clone(), tx.outputs.clone());

        assert!(signed.header.segwit);
        assert_eq!(signed.hash(), legacy_hash);
        assert!(signed.serialize().len() > signed.serialize_without_witness().len());

        let parsed = FullTransaction::deserialize(&signed.serialize()).unwrap();
        assert_eq!(parsed.inputs[0].witness.len(), 2);
        assert_eq!(parsed.hash(), legacy_hash);
    }

    #[test]
    fn test_bip143_native_p2wpkh_sighash() {
        let tx = FullTransaction::deserialize(&hex::decode(BIP143_UNSIGNED).unwrap()).unwrap();
        let script_code = hex::decode("76a9141d0f172a0ecb48aee1be1f2687d2963ae33f71a188ac").unwrap();

        let sighash = segwit_v0_sighash(&tx, 1, &script_code, 600_000_000, SigHashType::All).unwrap();
        assert_eq!(
            hex::encode(sighash),
            "c37af31116d1b27caf68aae9e3ac82f1477929014d5b917657d0eb49478cb670"
        );
    }

    // BIP341 keyPathSpending transaction, unsigned, and the outputs it spends
    const BIP341_UNSIGNED: &str = "02000000097de20cbff686da83a54981d2b9bab3586f4ca7e48f57f5b55963115f3b334e9c010000000000000000d7b7cab57b1393ace2d064f4d4a2cb8af6def61273e127517d44759b6dafdd990000000000fffffffff8e1f583384333689228c5d28eac13366be082dc57441760d957275419a418420000000000fffffffff0689180aa63b30cb162a73c6d2a38b7eeda2a83ece74310fda0843ad604853b0100000000feffffffaa5202bdf6d8ccd2ee0f0202afbbb7461d9264a25e5bfd3c5a52ee1239e0ba6c0000000000feffffff956149bdc66faa968eb2be2d2faa29718acbfe3941215893a2a3446d32acd050000000000000000000e664b9773b88c09c32cb70a2a3e4da0ced63b7ba3b22f848531bbb1d5d5f4c94010000000000000000e9aa6b8e6c9de67619e6a3924ae25696bb7b694bb677a632a74ef7eadfd4eabf0000000000ffffffffa778eb6a263dc090464cd125c466b5a99667720b1c110468831d058aa1b82af10100000000ffffffff0200ca9a3b000000001976a91406afd46bcdfd22ef94ac122aa11f241244a37ecc88ac807840cb0000000020ac9a87f5594be208f8532db38cff670c450ed2fea8fcdefcc9a663f78bab962b00000000";

    const BIP341_SPENT: [(u64, &str); 9] = [
        (420_000_000, "512053a1f6e454df1aa2776a2814a721372d6258050de330b3c6d10ee8f4e0dda343"),
        (462_000_000, "5120147c9c57132f6e7ecddba9800bb0c4449251c92a1e60371ee77557b6620f3ea3"),
        (294_000_000, "76a914751e76e8199196d454941c45d1b3a323f1433bd688ac"),
        (504_000_000, "5120e4d810fd50586274face62b8a807eb9719cef49c04177cc6b76a9a4251d5450e"),
        (630_000_000, "512091b64d5324723a985170e4dc5a0f84c041804f2cd12660fa5dec09fc21783605"),
        (378_000_000, "00147dd65592d0ab2fe0d0257d571abf032cd9db93dc"),
        (672_000_000, "512075169f4001aa68f15bbed28b218df1d0a62cbbcf1188c6665110c293c907b831"),
        (546_000_000, "5120712447206d7a5238acc7ff53fbe94a3b64539ad291c7cdbc490b7577e4b17df5"),
        (588_000_000, "512077e30a5522dd9f894c3f8b8bd4c4b2cf82ca7da8a3ea6a239655c39c050ab220"),
    ];

    #[test]
    fn test_bip341_key_path_sighash() {
        let tx = FullTransaction::deserialize(&hex::decode(BIP341_UNSIGNED).unwrap()).unwrap();
        let prevouts: Vec<(u64, Vec<u8>)> = BIP341_SPENT
            .iter()
            .map(|(value, script)| (*value, hex::decode(script).unwrap()))
            .collect();

        let parts = TaprootSighashParts::new(&tx, &prevouts).unwrap();
        assert_eq!(
            hex::encode(parts.prevouts),
            "e3b33bb4ef3a52ad1fffb555c0d82828eb22737036eaeb02a235d82b909c4c3f"
        );
        assert_eq!(
            hex::encode(parts.amounts),
            "58a6964a4f5f8f0b642ded0a8a553be7622a719da71d1f5befcefcdee8e0fde6"
        );
        assert_eq!(
            hex::encode(parts.script_pubkeys),
            "23ad0f61ad2bca5ba6a7693f50fce988e17c3780bf2b1e720cfbb38fbdd52e21"
        );
        assert_eq!(
            hex::encode(parts.sequences),
            "18959c7221ab5ce9e26c3cd67b22c24f8baa54bac281d8e6b05e400e6c3a957e"
        );
        assert_eq!(
            hex::encode(parts.outputs),
            "a2e6dab7c1f0dcd297c8d61647fd17d821541ea69c3cc37dcbad7f90d4eb4bc5"
        );

        // input 4 is signed with SIGHASH_DEFAULT
        assert_eq!(
            hex::encode(taproot_sighash(&tx, 4, &prevouts).unwrap()),
            "22f0e85f207257933ce6869c52f47d13799696e1a467a63485c3dc96b35c8081"
        );
        assert!(matches!(
            taproot_sighash(&tx, 4, &prevouts[..8]),
            Err(TransactionError::PrevoutMismatch(9, 8))
        ));
    }

    #[test]
    fn test_sighash_input_out_of_range() {
        let tx = sample_transaction();
        assert!(legacy_sighash(&tx, 3, &[], SigHashType::All).is_err());
        assert!(taproot_sighash(&tx, 0, &[]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = sample_transaction().serialize();
        bytes.push(0);
        assert!(FullTransaction::deserialize(&bytes).is_err());
    }
}
