//! Input signing
//!
//! Every input is hashed against the unsigned transaction, so signing order
//! does not matter. Legacy and segwit v0 inputs get an ECDSA signature with
//! `SIGHASH_ALL`; taproot inputs get a BIP340 key-path signature with
//! `SIGHASH_DEFAULT`.

use std::sync::Arc;

use secp256k1::SecretKey;
use thiserror::Error;

use super::builder::{InputToSign, MutableTransaction};
use crate::core::script::{locking_script, p2wpkh_program, push, unlocking_script, ScriptType, SigHashType};
use crate::core::transaction::{
    legacy_sighash, segwit_v0_sighash, taproot_sighash, FullTransaction, TransactionError,
};
use crate::crypto::{sign_ecdsa, sign_schnorr_taproot, KeyError};
use crate::wallet::{KeyChain, KeyChainError};

#[derive(Error, Debug)]
pub enum SignerError {
    #[error("Key chain error: {0}")]
    KeyChain(#[from] KeyChainError),
    #[error("Key error: {0}")]
    Key(#[from] KeyError),
    #[error("Signature hash error: {0}")]
    SignatureHash(#[from] TransactionError),
    #[error("Cannot sign {0:?} input")]
    NotSupportedScriptType(ScriptType),
}

/// Unlocking data for one input
struct Unlocking {
    sig_script: Vec<u8>,
    witness: Vec<Vec<u8>>,
}

pub struct TransactionSigner {
    key_chain: Arc<dyn KeyChain>,
}

impl TransactionSigner {
    pub fn new(key_chain: Arc<dyn KeyChain>) -> Self {
        Self { key_chain }
    }

    pub fn sign(&self, transaction: &MutableTransaction) -> Result<FullTransaction, SignerError> {
        let unsigned = transaction.unsigned();
        let prevouts: Vec<(u64, Vec<u8>)> = transaction
            .inputs_to_sign
            .iter()
            .map(|i| (i.previous_output.value, i.previous_output.locking_script.clone()))
            .collect();

        let mut inputs = unsigned.inputs.clone();
        for (index, to_sign) in transaction.inputs_to_sign.iter().enumerate() {
            let unlocking = self.sign_input(&unsigned, index, to_sign, &prevouts)?;
            inputs[index].sig_script = unlocking.sig_script;
            inputs[index].witness = unlocking.witness;
        }

        Ok(FullTransaction::new(unsigned.header, inputs, unsigned.outputs))
    }

    fn sign_input(
        &self,
        unsigned: &FullTransaction,
        index: usize,
        to_sign: &InputToSign,
        prevouts: &[(u64, Vec<u8>)],
    ) -> Result<Unlocking, SignerError> {
        let previous = &to_sign.previous_output;
        let key = &to_sign.public_key;
        let secret_key = self.key_chain.private_key(key.account, key.index, key.external)?;

        let unlocking = match previous.script_type {
            ScriptType::P2PKH => {
                let digest = legacy_sighash(unsigned, index, &previous.locking_script, SigHashType::All)?;
                Unlocking {
                    sig_script: unlocking_script(&[ecdsa_signature(&secret_key, &digest), key.public_key.clone()]),
                    witness: Vec::new(),
                }
            }
            ScriptType::P2PK => {
                let digest = legacy_sighash(unsigned, index, &previous.locking_script, SigHashType::All)?;
                Unlocking {
                    sig_script: unlocking_script(&[ecdsa_signature(&secret_key, &digest)]),
                    witness: Vec::new(),
                }
            }
            // Only P2SH outputs a plugin knows the redeem script of
            ScriptType::P2SH => {
                let redeem_script = previous
                    .redeem_script
                    .as_ref()
                    .ok_or(SignerError::NotSupportedScriptType(ScriptType::P2SH))?;
                let digest = legacy_sighash(unsigned, index, redeem_script, SigHashType::All)?;
                Unlocking {
                    sig_script: unlocking_script(&[
                        ecdsa_signature(&secret_key, &digest),
                        key.public_key.clone(),
                        redeem_script.clone(),
                    ]),
                    witness: Vec::new(),
                }
            }
            ScriptType::P2WPKH | ScriptType::P2WPKHSH => {
                let script_code = locking_script(ScriptType::P2PKH, &key.public_key_hash)
                    .ok_or(SignerError::NotSupportedScriptType(previous.script_type))?;
                let digest = segwit_v0_sighash(unsigned, index, &script_code, previous.value, SigHashType::All)?;
                let sig_script = if previous.script_type == ScriptType::P2WPKHSH {
                    push(&p2wpkh_program(&key.public_key_hash))
                } else {
                    Vec::new()
                };
                Unlocking {
                    sig_script,
                    witness: vec![ecdsa_signature(&secret_key, &digest), key.public_key.clone()],
                }
            }
            ScriptType::P2TR => {
                let digest = taproot_sighash(unsigned, index, prevouts)?;
                Unlocking {
                    sig_script: Vec::new(),
                    witness: vec![sign_schnorr_taproot(&secret_key, &digest)?],
                }
            }
            other => return Err(SignerError::NotSupportedScriptType(other)),
        };

        Ok(unlocking)
    }
}

/// DER signature followed by the sighash byte
fn ecdsa_signature(secret_key: &SecretKey, digest: &[u8; 32]) -> Vec<u8> {
    let mut signature = sign_ecdsa(secret_key, digest);
    signature.push(SigHashType::All as u8);
    signature
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::public_key::PublicKey;
    use crate::core::transaction::{Transaction, TransactionInput, TransactionOutput, TX_VERSION};
    use crate::crypto::{parse_public_key, verify_ecdsa, verify_schnorr};
    use crate::core::address::Address;
    use crate::core::address::AddressType;
    use crate::transactions::plugin::LockHeightPlugin;
    use crate::wallet::{Purpose, SeedKeyChain};

    fn key_chain() -> Arc<SeedKeyChain> {
        Arc::new(SeedKeyChain::from_seed(&[9u8; 32], Purpose::Bip84, 1).unwrap())
    }

    fn mutable(key: &PublicKey, script_type: ScriptType, locking: Vec<u8>) -> MutableTransaction {
        let mut previous = TransactionOutput::new(50_000, 0, locking, script_type);
        previous.transaction_hash = [5u8; 32];
        let payment = TransactionOutput::new(
            49_000,
            0,
            locking_script(ScriptType::P2PKH, &[1u8; 20]).unwrap(),
            ScriptType::P2PKH,
        );

        MutableTransaction {
            header: Transaction::new(TX_VERSION, 100),
            inputs_to_sign: vec![InputToSign {
                input: TransactionInput::new([5u8; 32], 0, 0),
                previous_output: previous,
                public_key: key.clone(),
            }],
            outputs: vec![payment],
            recipient_address: Address {
                address_type: AddressType::PubKeyHash,
                payload: vec![1u8; 20],
                string: String::new(),
            },
            recipient_value: 49_000,
            change_address: None,
            change_value: 0,
        }
    }

    fn strip_sighash(signature: &[u8]) -> &[u8] {
        assert_eq!(signature.last(), Some(&(SigHashType::All as u8)));
        &signature[..signature.len() - 1]
    }

    #[test]
    fn test_sign_p2pkh() {
        let chain = key_chain();
        let key = chain.public_key(0, 0, true).unwrap();
        let locking = locking_script(ScriptType::P2PKH, &key.public_key_hash).unwrap();
        let tx = mutable(&key, ScriptType::P2PKH, locking.clone());

        let signed = TransactionSigner::new(chain).sign(&tx).unwrap();
        assert!(!signed.header.segwit);

        let chunks = crate::core::script::parse_chunks(&signed.inputs[0].sig_script).unwrap();
        let signature = chunks[0].data.clone().unwrap();
        assert_eq!(chunks[1].data.as_deref(), Some(key.public_key.as_slice()));

        let digest = legacy_sighash(&tx.unsigned(), 0, &locking, SigHashType::All).unwrap();
        let public_key = parse_public_key(&key.public_key).unwrap();
        assert!(verify_ecdsa(&public_key, &digest, strip_sighash(&signature)).unwrap());
    }

    #[test]
    fn test_sign_p2wpkh_and_nested() {
        let chain = key_chain();
        let key = chain.public_key(0, 1, true).unwrap();
        let script_code = locking_script(ScriptType::P2PKH, &key.public_key_hash).unwrap();
        let public_key = parse_public_key(&key.public_key).unwrap();

        let native = mutable(
            &key,
            ScriptType::P2WPKH,
            locking_script(ScriptType::P2WPKH, &key.public_key_hash).unwrap(),
        );
        let signed = TransactionSigner::new(chain.clone()).sign(&native).unwrap();
        assert!(signed.header.segwit);
        assert!(signed.inputs[0].sig_script.is_empty());
        assert_eq!(signed.inputs[0].witness[1], key.public_key);
        // Witness data does not change the txid
        assert_eq!(signed.hash(), native.unsigned().hash());

        let digest = segwit_v0_sighash(&native.unsigned(), 0, &script_code, 50_000, SigHashType::All).unwrap();
        assert!(verify_ecdsa(&public_key, &digest, strip_sighash(&signed.inputs[0].witness[0])).unwrap());

        let nested = mutable(
            &key,
            ScriptType::P2WPKHSH,
            locking_script(ScriptType::P2SH, &key.script_hash_p2wpkh).unwrap(),
        );
        let signed = TransactionSigner::new(chain).sign(&nested).unwrap();
        assert_eq!(signed.inputs[0].sig_script, push(&p2wpkh_program(&key.public_key_hash)));
        assert_eq!(signed.inputs[0].witness.len(), 2);
    }

    #[test]
    fn test_sign_p2tr() {
        let chain = key_chain();
        let key = chain.public_key(0, 2, true).unwrap();
        let locking = locking_script(ScriptType::P2TR, &key.converted_for_p2tr).unwrap();
        let tx = mutable(&key, ScriptType::P2TR, locking.clone());

        let signed = TransactionSigner::new(chain).sign(&tx).unwrap();
        let signature = &signed.inputs[0].witness[0];
        assert_eq!(signature.len(), 64);

        let digest = taproot_sighash(&tx.unsigned(), 0, &[(50_000, locking)]).unwrap();
        assert!(verify_schnorr(&key.converted_for_p2tr, &digest, signature).unwrap());
    }

    #[test]
    fn test_sign_lock_height_redeem_script() {
        let chain = key_chain();
        let key = chain.public_key(0, 3, true).unwrap();
        let redeem_script = LockHeightPlugin::redeem_script(90, &key.public_key_hash);
        let payload = crate::crypto::hash160(&redeem_script);

        let mut tx = mutable(&key, ScriptType::P2SH, locking_script(ScriptType::P2SH, &payload).unwrap());
        tx.inputs_to_sign[0].previous_output.redeem_script = Some(redeem_script.clone());

        let signed = TransactionSigner::new(chain).sign(&tx).unwrap();
        let chunks = crate::core::script::parse_chunks(&signed.inputs[0].sig_script).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].data.as_deref(), Some(redeem_script.as_slice()));

        let digest = legacy_sighash(&tx.unsigned(), 0, &redeem_script, SigHashType::All).unwrap();
        let public_key = parse_public_key(&key.public_key).unwrap();
        assert!(verify_ecdsa(&public_key, &digest, strip_sighash(&chunks[0].data.clone().unwrap())).unwrap());
    }

    #[test]
    fn test_unknown_p2sh_is_rejected() {
        let chain = key_chain();
        let key = chain.public_key(0, 4, true).unwrap();
        let tx = mutable(&key, ScriptType::P2SH, locking_script(ScriptType::P2SH, &[3u8; 20]).unwrap());

        assert!(matches!(
            TransactionSigner::new(chain).sign(&tx),
            Err(SignerError::NotSupportedScriptType(ScriptType::P2SH))
        ));
    }
}
