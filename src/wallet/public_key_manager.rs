//! Gap-limit key management
//!
//! Keeps `gap_limit` unused keys after the last used one on both chains of
//! every account up to one past the last used account, and hands out the
//! lowest unused key for receiving and change.

use std::sync::Arc;

use thiserror::Error;

use super::bloom_filter_manager::BloomFilterProvider;
use super::keychain::{KeyChain, KeyChainError};
use crate::core::public_key::PublicKey;
use crate::storage::Storage;

#[derive(Error, Debug)]
pub enum PublicKeyManagerError {
    #[error("No unused public key")]
    NoUnusedPublicKey,
    #[error("Invalid key path: {0}")]
    InvalidPath(String),
    #[error("Key chain error: {0}")]
    KeyChain(#[from] KeyChainError),
}

pub struct PublicKeyManager {
    storage: Arc<dyn Storage>,
    key_chain: Arc<dyn KeyChain>,
    gap_limit: u32,
}

impl PublicKeyManager {
    pub fn new(storage: Arc<dyn Storage>, key_chain: Arc<dyn KeyChain>, gap_limit: u32) -> Self {
        Self {
            storage,
            key_chain,
            gap_limit,
        }
    }

    pub fn receive_public_key(&self) -> Result<PublicKey, PublicKeyManagerError> {
        self.unused_public_key(true)
    }

    pub fn change_public_key(&self) -> Result<PublicKey, PublicKeyManagerError> {
        self.unused_public_key(false)
    }

    /// Derive the key for an `{account}/{change}/{index}` path
    pub fn public_key_by_path(&self, path: &str) -> Result<PublicKey, PublicKeyManagerError> {
        let parts = path
            .split('/')
            .map(|p| p.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| PublicKeyManagerError::InvalidPath(path.to_string()))?;

        match parts.as_slice() {
            [account, change, index] if *change <= 1 => {
                Ok(self.key_chain.public_key(*account, *index, *change == 0)?)
            }
            _ => Err(PublicKeyManagerError::InvalidPath(path.to_string())),
        }
    }

    /// Top up every (account, chain) pair to `gap_limit` unused keys
    pub fn fill_gap(&self) -> Result<(), PublicKeyManagerError> {
        let keys = self.storage.public_keys_with_used_state();
        let last_used_account = keys
            .iter()
            .filter(|(_, used)| *used)
            .map(|(key, _)| key.account)
            .max();

        // one account past the last used one
        let accounts = match last_used_account {
            Some(account) => account + 2,
            None => 1,
        };

        let mut new_keys = Vec::new();
        for account in 0..accounts {
            for external in [true, false] {
                new_keys.extend(self.missing_keys(&keys, account, external)?);
            }
        }

        self.add_keys(new_keys);
        Ok(())
    }

    /// Whether some (account, chain) pair has fewer than `gap_limit` unused
    /// keys after its last used key
    pub fn gap_shifts(&self) -> bool {
        let keys = self.storage.public_keys_with_used_state();
        let Some(last_account) = keys.iter().map(|(key, _)| key.account).max() else {
            return false;
        };

        (0..=last_account).any(|account| {
            [true, false]
                .into_iter()
                .any(|external| gap_keys_count(&keys, account, external) < self.gap_limit)
        })
    }

    pub fn add_keys(&self, keys: Vec<PublicKey>) {
        if keys.is_empty() {
            return;
        }

        log::debug!("Adding {} public keys", keys.len());
        self.storage.save_public_keys(keys);
    }

    fn missing_keys(
        &self,
        keys: &[(PublicKey, bool)],
        account: u32,
        external: bool,
    ) -> Result<Vec<PublicKey>, PublicKeyManagerError> {
        let gap_count = gap_keys_count(keys, account, external);
        if gap_count >= self.gap_limit {
            return Ok(Vec::new());
        }

        let next_index = keys
            .iter()
            .filter(|(key, _)| key.account == account && key.external == external)
            .map(|(key, _)| key.index + 1)
            .max()
            .unwrap_or(0);

        let count = self.gap_limit - gap_count;
        Ok(self
            .key_chain
            .public_keys(account, next_index..next_index + count, external)?)
    }

    fn unused_public_key(&self, external: bool) -> Result<PublicKey, PublicKeyManagerError> {
        self.storage
            .public_keys_with_used_state()
            .into_iter()
            .filter(|(key, used)| key.account == 0 && key.external == external && !used)
            .map(|(key, _)| key)
            .min_by_key(|key| key.index)
            .ok_or(PublicKeyManagerError::NoUnusedPublicKey)
    }
}

/// Keys after the last used one, or all keys when none is used
fn gap_keys_count(keys: &[(PublicKey, bool)], account: u32, external: bool) -> u32 {
    let chain: Vec<&(PublicKey, bool)> = keys
        .iter()
        .filter(|(key, _)| key.account == account && key.external == external)
        .collect();

    let last_used = chain
        .iter()
        .filter(|(_, used)| *used)
        .map(|(key, _)| key.index)
        .max();

    match last_used {
        Some(last) => chain.iter().filter(|(key, _)| key.index > last).count() as u32,
        None => chain.len() as u32,
    }
}

impl BloomFilterProvider for PublicKeyManager {
    fn filter_elements(&self) -> Vec<Vec<u8>> {
        self.storage
            .public_keys()
            .iter()
            .flat_map(|key| key.filter_elements())
            .collect()
    }
}
