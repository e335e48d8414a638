//! HD key derivation
//!
//! `KeyChain` is the seam between the wallet and whatever holds the secret
//! material. `SeedKeyChain` derives BIP32 keys along
//! `m/purpose'/coin'/account'/change/index` from a raw seed.
//!
//! Secret material never leaves this module except as a `SecretKey` handed to
//! the signer. `SeedKeyChain` deliberately implements neither `Debug` nor
//! `Serialize`.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use secp256k1::{Scalar, Secp256k1, SecretKey};
use sha2::Sha512;
use thiserror::Error;

use crate::core::public_key::PublicKey;
use crate::core::script::ScriptType;
use crate::crypto::KeyError;

type HmacSha512 = Hmac<Sha512>;

const HARDENED: u32 = 0x8000_0000;
const MASTER_KEY_SALT: &[u8] = b"Bitcoin seed";

/// Key derivation errors
#[derive(Error, Debug)]
pub enum KeyChainError {
    #[error("Seed must be 16 to 64 bytes, got {0}")]
    InvalidSeedLength(usize),
    #[error("Derived an invalid key at index {0}")]
    InvalidChildKey(u32),
    #[error("Key error: {0}")]
    KeyError(#[from] KeyError),
}

// =============================================================================
// Purpose
// =============================================================================

/// BIP43 purpose, which also fixes the script type of wallet outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// P2PKH
    Bip44,
    /// P2WPKH nested in P2SH
    Bip49,
    /// Native P2WPKH
    Bip84,
    /// Key-path P2TR
    Bip86,
}

impl Purpose {
    pub fn number(&self) -> u32 {
        match self {
            Purpose::Bip44 => 44,
            Purpose::Bip49 => 49,
            Purpose::Bip84 => 84,
            Purpose::Bip86 => 86,
        }
    }

    pub fn script_type(&self) -> ScriptType {
        match self {
            Purpose::Bip44 => ScriptType::P2PKH,
            Purpose::Bip49 => ScriptType::P2WPKHSH,
            Purpose::Bip84 => ScriptType::P2WPKH,
            Purpose::Bip86 => ScriptType::P2TR,
        }
    }
}

// =============================================================================
// KeyChain Trait
// =============================================================================

/// Source of wallet keys
pub trait KeyChain: Send + Sync {
    fn public_key(&self, account: u32, index: u32, external: bool) -> Result<PublicKey, KeyChainError>;

    fn public_keys(
        &self,
        account: u32,
        indices: std::ops::Range<u32>,
        external: bool,
    ) -> Result<Vec<PublicKey>, KeyChainError> {
        indices
            .map(|index| self.public_key(account, index, external))
            .collect()
    }

    /// Secret key for signing an input owned by the given key
    fn private_key(&self, account: u32, index: u32, external: bool) -> Result<SecretKey, KeyChainError>;
}

// =============================================================================
// Extended Keys
// =============================================================================

struct ExtendedPrivateKey {
    secret_key: SecretKey,
    chain_code: [u8; 32],
}

impl ExtendedPrivateKey {
    fn master(seed: &[u8]) -> Result<Self, KeyChainError> {
        Self::from_hmac(MASTER_KEY_SALT, seed, 0)
    }

    fn derive(&self, index: u32) -> Result<Self, KeyChainError> {
        let mut data = Vec::with_capacity(37);
        if index >= HARDENED {
            data.push(0);
            data.extend_from_slice(&self.secret_key.secret_bytes());
        } else {
            let secp = Secp256k1::signing_only();
            data.extend_from_slice(&secp256k1::PublicKey::from_secret_key(&secp, &self.secret_key).serialize());
        }
        data.extend_from_slice(&index.to_be_bytes());

        let child = Self::from_hmac(&self.chain_code, &data, index)?;
        let tweak = Scalar::from_be_bytes(child.secret_key.secret_bytes())
            .map_err(|_| KeyChainError::InvalidChildKey(index))?;
        let secret_key = self
            .secret_key
            .add_tweak(&tweak)
            .map_err(|_| KeyChainError::InvalidChildKey(index))?;

        Ok(Self {
            secret_key,
            chain_code: child.chain_code,
        })
    }

    fn from_hmac(key: &[u8], data: &[u8], index: u32) -> Result<Self, KeyChainError> {
        // HMAC accepts keys of any length
        let mut mac = HmacSha512::new_from_slice(key).map_err(|_| KeyChainError::InvalidChildKey(index))?;
        mac.update(data);
        let output = mac.finalize().into_bytes();

        let secret_key =
            SecretKey::from_slice(&output[..32]).map_err(|_| KeyChainError::InvalidChildKey(index))?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&output[32..]);

        Ok(Self { secret_key, chain_code })
    }
}

impl Drop for ExtendedPrivateKey {
    fn drop(&mut self) {
        self.chain_code = [0u8; 32];
    }
}

// =============================================================================
// Seed Key Chain
// =============================================================================

/// BIP32 key chain over a raw seed
pub struct SeedKeyChain {
    purpose: Purpose,
    coin_type: u32,
    master: ExtendedPrivateKey,
    /// Extended keys at `m/purpose'/coin'/account'/change`
    chains: Mutex<HashMap<(u32, bool), ExtendedPrivateKey>>,
}

impl SeedKeyChain {
    pub fn from_seed(seed: &[u8], purpose: Purpose, coin_type: u32) -> Result<Self, KeyChainError> {
        if !(16..=64).contains(&seed.len()) {
            return Err(KeyChainError::InvalidSeedLength(seed.len()));
        }

        Ok(Self {
            purpose,
            coin_type,
            master: ExtendedPrivateKey::master(seed)?,
            chains: Mutex::new(HashMap::new()),
        })
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    fn derive(&self, account: u32, index: u32, external: bool) -> Result<SecretKey, KeyChainError> {
        let mut chains = self.chains.lock();
        if !chains.contains_key(&(account, external)) {
            let chain = self
                .master
                .derive(self.purpose.number() | HARDENED)?
                .derive(self.coin_type | HARDENED)?
                .derive(account | HARDENED)?
                .derive(if external { 0 } else { 1 })?;
            chains.insert((account, external), chain);
        }

        match chains.get(&(account, external)) {
            Some(chain) => Ok(chain.derive(index)?.secret_key),
            None => Err(KeyChainError::InvalidChildKey(index)),
        }
    }
}

impl KeyChain for SeedKeyChain {
    fn public_key(&self, account: u32, index: u32, external: bool) -> Result<PublicKey, KeyChainError> {
        let secret_key = self.derive(account, index, external)?;
        let secp = Secp256k1::signing_only();
        let raw = secp256k1::PublicKey::from_secret_key(&secp, &secret_key).serialize();

        Ok(PublicKey::new(account, index, external, raw.to_vec())?)
    }

    fn private_key(&self, account: u32, index: u32, external: bool) -> Result<SecretKey, KeyChainError> {
        self.derive(account, index, external)
    }
}
