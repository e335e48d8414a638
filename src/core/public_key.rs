//! Wallet public key record
//!
//! Every derived key is stored with the hashes the bloom filter and the
//! transaction extractor match against, so matching never touches secp256k1.

use serde::{Deserialize, Serialize};

use crate::core::script::p2wpkh_script_hash;
use crate::crypto::{hash160, parse_public_key, taproot_output_key, KeyError};

/// A derived wallet key, identified by (account, external, index)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    pub path: String,
    pub account: u32,
    pub index: u32,
    /// Receive chain when true, change chain otherwise
    pub external: bool,
    /// Compressed 33-byte key
    pub public_key: Vec<u8>,
    pub public_key_hash: [u8; 20],
    /// hash160 of the P2WPKH program, the P2SH payload of a nested segwit output
    pub script_hash_p2wpkh: [u8; 20],
    /// BIP86 output key of the key-path only taproot output
    pub converted_for_p2tr: [u8; 32],
}

impl PublicKey {
    pub fn new(account: u32, index: u32, external: bool, public_key: Vec<u8>) -> Result<Self, KeyError> {
        let parsed = parse_public_key(&public_key)?;
        let public_key_hash = hash160(&public_key);

        Ok(Self {
            path: Self::path_for(account, external, index),
            account,
            index,
            external,
            script_hash_p2wpkh: p2wpkh_script_hash(&public_key_hash),
            converted_for_p2tr: taproot_output_key(&parsed)?,
            public_key,
            public_key_hash,
        })
    }

    /// `{account}/{change}/{index}`, change being 0 for the receive chain
    pub fn path_for(account: u32, external: bool, index: u32) -> String {
        format!("{}/{}/{}", account, if external { 0 } else { 1 }, index)
    }

    /// Elements inserted into the bloom filter for this key
    pub fn filter_elements(&self) -> Vec<Vec<u8>> {
        vec![
            self.public_key_hash.to_vec(),
            self.public_key.clone(),
            self.script_hash_p2wpkh.to_vec(),
            self.converted_for_p2tr.to_vec(),
        ]
    }
}
