//! Script classification and construction
//!
//! Output scripts are recognised by fixed byte patterns (length and opcode
//! positions), never by executing them. The same module builds the locking
//! and unlocking scripts the wallet itself produces.

use serde::{Deserialize, Serialize};

use crate::crypto::hash160;

// =============================================================================
// Opcodes
// =============================================================================

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_IF: u8 = 0x63;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DROP: u8 = 0x75;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;
pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
pub const OP_CHECKSEQUENCEVERIFY: u8 = 0xb2;

// =============================================================================
// Signature Hash Types
// =============================================================================

/// Signature hash type appended to every signature the wallet produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum SigHashType {
    /// BIP341 default, taproot only (no trailing byte)
    Default = 0x00,
    /// Sign all inputs and all outputs
    #[default]
    All = 0x01,
}

// =============================================================================
// Script Types
// =============================================================================

/// Standard output script types the wallet can recognise
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ScriptType {
    #[default]
    Unknown,
    P2PKH,
    P2PK,
    P2SH,
    P2WPKH,
    /// P2WPKH nested in P2SH
    P2WPKHSH,
    P2WSH,
    P2TR,
    NullData,
}

impl ScriptType {
    /// Whether spending this output places data in the witness
    pub fn is_witness(&self) -> bool {
        matches!(
            self,
            ScriptType::P2WPKH | ScriptType::P2WPKHSH | ScriptType::P2WSH | ScriptType::P2TR
        )
    }

    /// Size of the locking script in bytes
    pub fn locking_script_size(&self) -> usize {
        match self {
            ScriptType::P2PK => 35,
            ScriptType::P2PKH => 25,
            ScriptType::P2SH | ScriptType::P2WPKHSH => 23,
            ScriptType::P2WPKH => 22,
            ScriptType::P2WSH | ScriptType::P2TR => 34,
            ScriptType::NullData | ScriptType::Unknown => 0,
        }
    }
}

/// Result of classifying a locking script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classified {
    pub script_type: ScriptType,
    /// Key hash, script hash, public key or witness program depending on type
    pub payload: Vec<u8>,
}

// 25 bytes: 76 A9 14 {20-byte-key-hash} 88 AC
fn is_p2pkh(script: &[u8]) -> bool {
    script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
}

// 35/67 bytes: {33/65}{public-key} AC
fn is_p2pk(script: &[u8]) -> bool {
    (script.len() == 35 || script.len() == 67)
        && (script[0] == 33 || script[0] == 65)
        && script[script.len() - 1] == OP_CHECKSIG
}

// 23 bytes: A9 14 {20-byte-script-hash} 87
fn is_p2sh(script: &[u8]) -> bool {
    script.len() == 23 && script[0] == OP_HASH160 && script[1] == 20 && script[22] == OP_EQUAL
}

// 22 bytes: 00 14 {20-byte-key-hash}
fn is_p2wpkh(script: &[u8]) -> bool {
    script.len() == 22 && script[0] == OP_0 && script[1] == 20
}

// 34 bytes: 00 20 {32-byte-script-hash}
fn is_p2wsh(script: &[u8]) -> bool {
    script.len() == 34 && script[0] == OP_0 && script[1] == 32
}

// 34 bytes: 51 20 {32-byte-output-key}
fn is_p2tr(script: &[u8]) -> bool {
    script.len() == 34 && script[0] == OP_1 && script[1] == 32
}

fn is_null_data(script: &[u8]) -> bool {
    script.first() == Some(&OP_RETURN)
}

/// Classify a locking script by byte pattern
pub fn classify(script: &[u8]) -> Option<Classified> {
    let (script_type, payload) = if is_p2pkh(script) {
        (ScriptType::P2PKH, script[3..23].to_vec())
    } else if is_p2pk(script) {
        (ScriptType::P2PK, script[1..script.len() - 1].to_vec())
    } else if is_p2sh(script) {
        (ScriptType::P2SH, script[2..22].to_vec())
    } else if is_p2wpkh(script) {
        (ScriptType::P2WPKH, script[2..].to_vec())
    } else if is_p2wsh(script) {
        (ScriptType::P2WSH, script[2..].to_vec())
    } else if is_p2tr(script) {
        (ScriptType::P2TR, script[2..].to_vec())
    } else if is_null_data(script) {
        (ScriptType::NullData, script.to_vec())
    } else {
        return None;
    };

    Some(Classified {
        script_type,
        payload,
    })
}

// =============================================================================
// Script Construction
// =============================================================================

/// Minimal push of `data` onto the stack
pub fn push(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 5);
    match data.len() {
        0..=0x4b => out.push(data.len() as u8),
        0x4c..=0xff => {
            out.push(OP_PUSHDATA1);
            out.push(data.len() as u8);
        }
        0x100..=0xffff => {
            out.push(OP_PUSHDATA2);
            out.extend_from_slice(&(data.len() as u16).to_le_bytes());
        }
        _ => {
            out.push(OP_PUSHDATA4);
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        }
    }
    out.extend_from_slice(data);
    out
}

/// Build the locking script for a script type and its payload
pub fn locking_script(script_type: ScriptType, payload: &[u8]) -> Option<Vec<u8>> {
    let script = match script_type {
        ScriptType::P2PKH => {
            let mut s = vec![OP_DUP, OP_HASH160];
            s.extend(push(payload));
            s.extend([OP_EQUALVERIFY, OP_CHECKSIG]);
            s
        }
        ScriptType::P2PK => {
            let mut s = push(payload);
            s.push(OP_CHECKSIG);
            s
        }
        ScriptType::P2SH | ScriptType::P2WPKHSH => {
            let mut s = vec![OP_HASH160];
            s.extend(push(payload));
            s.push(OP_EQUAL);
            s
        }
        ScriptType::P2WPKH | ScriptType::P2WSH => {
            let mut s = vec![OP_0];
            s.extend(push(payload));
            s
        }
        ScriptType::P2TR => {
            let mut s = vec![OP_1];
            s.extend(push(payload));
            s
        }
        ScriptType::NullData => {
            let mut s = vec![OP_RETURN];
            s.extend(push(payload));
            s
        }
        ScriptType::Unknown => return None,
    };
    Some(script)
}

/// Witness program `0014{key-hash}` redeemed by a P2WPKH-in-P2SH output
pub fn p2wpkh_program(public_key_hash: &[u8]) -> Vec<u8> {
    let mut program = vec![OP_0];
    program.extend(push(public_key_hash));
    program
}

/// Script hash a P2WPKH-in-P2SH output commits to
pub fn p2wpkh_script_hash(public_key_hash: &[u8]) -> [u8; 20] {
    hash160(&p2wpkh_program(public_key_hash))
}

/// Concatenate pushes of every element, forming a scriptSig
pub fn unlocking_script(items: &[Vec<u8>]) -> Vec<u8> {
    items.iter().flat_map(|item| push(item)).collect()
}

// =============================================================================
// Script Parsing
// =============================================================================

/// One element of a parsed script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub opcode: u8,
    pub data: Option<Vec<u8>>,
}

/// Split a script into opcodes and pushes; `None` when a push runs past the end
pub fn parse_chunks(script: &[u8]) -> Option<Vec<Chunk>> {
    let mut chunks = Vec::new();
    let mut i = 0;

    while i < script.len() {
        let opcode = script[i];
        i += 1;

        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let len = *script.get(i)? as usize;
                i += 1;
                len
            }
            OP_PUSHDATA2 => {
                let bytes = script.get(i..i + 2)?;
                i += 2;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = script.get(i..i + 4)?;
                i += 4;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => {
                chunks.push(Chunk { opcode, data: None });
                continue;
            }
        };

        let data = script.get(i..i + len)?.to_vec();
        i += len;
        chunks.push(Chunk {
            opcode,
            data: Some(data),
        });
    }

    Some(chunks)
}

/// Redeem script of a P2SH scriptSig `{push-sig}...{push-redeem-script}`,
/// recognised when the redeem script ends in a signature check
pub fn p2sh_redeem_script(sig_script: &[u8]) -> Option<Vec<u8>> {
    let chunks = parse_chunks(sig_script)?;
    let redeem = chunks.last()?.data.clone()?;

    let redeem_chunks = parse_chunks(&redeem)?;
    let mut last = redeem_chunks.last()?;
    if last.opcode == OP_ENDIF && redeem_chunks.len() > 1 {
        last = &redeem_chunks[redeem_chunks.len() - 2];
    }

    let checks = [
        OP_CHECKSIG,
        OP_CHECKSIGVERIFY,
        OP_CHECKMULTISIG,
        OP_CHECKMULTISIGVERIFY,
    ];
    if checks.contains(&last.opcode) {
        Some(redeem)
    } else {
        None
    }
}

/// Public key of a P2PKH scriptSig `{signature}{public-key}` (107 ± 1 bytes)
pub fn p2pkh_public_key(sig_script: &[u8]) -> Option<Vec<u8>> {
    if sig_script.len() < 106 || !(71..=74).contains(&sig_script[0]) {
        return None;
    }
    let sign_offset = sig_script[0] as usize;
    let pubkey_size = *sig_script.get(sign_offset + 1)? as usize;

    if (pubkey_size == 33 || pubkey_size == 65) && sig_script.len() == sign_offset + pubkey_size + 2 {
        Some(sig_script[sign_offset + 2..].to_vec())
    } else {
        None
    }
}

/// Witness program of a P2WPKH-in-P2SH scriptSig `16 00 14 {key-hash}`
pub fn p2wpkh_sh_program(sig_script: &[u8]) -> Option<Vec<u8>> {
    if sig_script.len() == 23
        && sig_script[0] == 0x16
        && (sig_script[1] == OP_0 || (0x50..=0x61).contains(&sig_script[1]))
        && sig_script[2] == 0x14
    {
        Some(sig_script[1..].to_vec())
    } else {
        None
    }
}
