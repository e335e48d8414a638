//! Address encoding
//!
//! Base58Check for legacy P2PKH/P2SH addresses and bech32/bech32m for
//! segwit v0 and taproot. Converters are tried through a chain; converters
//! prepended later take priority.

use bech32::{FromBase32, ToBase32, Variant};
use thiserror::Error;

use crate::core::public_key::PublicKey;
use crate::core::script::{locking_script, ScriptType};
use crate::crypto::double_sha256;

// =============================================================================
// Error Types
// =============================================================================

/// Address parsing and encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid base58 encoding: {0}")]
    InvalidBase58(String),
    #[error("Invalid bech32 encoding: {0}")]
    InvalidBech32(String),
    #[error("Invalid checksum")]
    InvalidChecksum,
    #[error("Wrong address prefix")]
    WrongPrefix,
    #[error("Address HRP {0} is not correct")]
    WrongHrp(String),
    #[error("Invalid payload length: {0}")]
    InvalidLength(usize),
    #[error("Unknown address type")]
    UnknownType,
    #[error("No converter accepted the address: {0}")]
    NoConverter(String),
}

// =============================================================================
// Address
// =============================================================================

/// Address encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    PubKeyHash,
    ScriptHash,
    /// Segwit program with its witness version
    Witness(u8),
}

/// A decoded address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub address_type: AddressType,
    /// Key hash, script hash or witness program
    pub payload: Vec<u8>,
    pub string: String,
}

impl Address {
    pub fn script_type(&self) -> ScriptType {
        match self.address_type {
            AddressType::PubKeyHash => ScriptType::P2PKH,
            AddressType::ScriptHash => ScriptType::P2SH,
            AddressType::Witness(0) if self.payload.len() == 20 => ScriptType::P2WPKH,
            AddressType::Witness(0) => ScriptType::P2WSH,
            AddressType::Witness(_) => ScriptType::P2TR,
        }
    }

    pub fn locking_script(&self) -> Vec<u8> {
        locking_script(self.script_type(), &self.payload).unwrap_or_default()
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.string)
    }
}

// =============================================================================
// Converters
// =============================================================================

/// Converts between address strings and locking-script payloads
pub trait AddressConverter: Send + Sync {
    fn convert_str(&self, address: &str) -> Result<Address, AddressError>;

    fn convert(&self, payload: &[u8], script_type: ScriptType) -> Result<Address, AddressError>;

    fn convert_public_key(&self, public_key: &PublicKey, script_type: ScriptType) -> Result<Address, AddressError>;
}

/// Base58Check P2PKH / P2SH converter
pub struct Base58AddressConverter {
    pub_key_hash_prefix: u8,
    script_hash_prefix: u8,
}

impl Base58AddressConverter {
    pub fn new(pub_key_hash_prefix: u8, script_hash_prefix: u8) -> Self {
        Self {
            pub_key_hash_prefix,
            script_hash_prefix,
        }
    }
}

impl AddressConverter for Base58AddressConverter {
    fn convert_str(&self, address: &str) -> Result<Address, AddressError> {
        let data = bs58::decode(address)
            .into_vec()
            .map_err(|e| AddressError::InvalidBase58(e.to_string()))?;
        if data.len() != 25 {
            return Err(AddressError::InvalidLength(data.len()));
        }

        let (body, checksum) = data.split_at(21);
        if double_sha256(body)[..4] != *checksum {
            return Err(AddressError::InvalidChecksum);
        }

        let address_type = if body[0] == self.pub_key_hash_prefix {
            AddressType::PubKeyHash
        } else if body[0] == self.script_hash_prefix {
            AddressType::ScriptHash
        } else {
            return Err(AddressError::WrongPrefix);
        };

        Ok(Address {
            address_type,
            payload: body[1..].to_vec(),
            string: address.to_string(),
        })
    }

    fn convert(&self, payload: &[u8], script_type: ScriptType) -> Result<Address, AddressError> {
        let (address_type, prefix) = match script_type {
            ScriptType::P2PK | ScriptType::P2PKH => (AddressType::PubKeyHash, self.pub_key_hash_prefix),
            ScriptType::P2SH | ScriptType::P2WPKHSH => (AddressType::ScriptHash, self.script_hash_prefix),
            _ => return Err(AddressError::UnknownType),
        };
        if payload.len() != 20 {
            return Err(AddressError::InvalidLength(payload.len()));
        }

        let mut body = vec![prefix];
        body.extend_from_slice(payload);
        let checksum = double_sha256(&body);
        body.extend_from_slice(&checksum[..4]);

        Ok(Address {
            address_type,
            payload: payload.to_vec(),
            string: bs58::encode(body).into_string(),
        })
    }

    fn convert_public_key(&self, public_key: &PublicKey, script_type: ScriptType) -> Result<Address, AddressError> {
        match script_type {
            ScriptType::P2WPKHSH => self.convert(&public_key.script_hash_p2wpkh, script_type),
            _ => self.convert(&public_key.public_key_hash, script_type),
        }
    }
}

/// Bech32 (v0) and bech32m (v1) segwit converter
pub struct SegwitAddressConverter {
    hrp: String,
}

impl SegwitAddressConverter {
    pub fn new(hrp: &str) -> Self {
        Self { hrp: hrp.to_string() }
    }

    fn encode(&self, version: u8, program: &[u8]) -> Result<String, AddressError> {
        let variant = if version == 0 { Variant::Bech32 } else { Variant::Bech32m };
        let mut data = vec![bech32::u5::try_from_u8(version).map_err(|e| AddressError::InvalidBech32(e.to_string()))?];
        data.extend(program.to_base32());

        bech32::encode(&self.hrp, data, variant).map_err(|e| AddressError::InvalidBech32(e.to_string()))
    }
}

impl AddressConverter for SegwitAddressConverter {
    fn convert_str(&self, address: &str) -> Result<Address, AddressError> {
        let (hrp, data, variant) = bech32::decode(address).map_err(|e| AddressError::InvalidBech32(e.to_string()))?;
        if hrp != self.hrp {
            return Err(AddressError::WrongHrp(hrp));
        }
        let (version, program) = data.split_first().ok_or(AddressError::InvalidLength(0))?;
        let version = version.to_u8();
        let program = Vec::<u8>::from_base32(program).map_err(|e| AddressError::InvalidBech32(e.to_string()))?;

        match (version, variant, program.len()) {
            (0, Variant::Bech32, 20) | (0, Variant::Bech32, 32) | (1, Variant::Bech32m, 32) => {}
            (0 | 1, _, 20 | 32) => return Err(AddressError::InvalidChecksum),
            (0 | 1, _, len) => return Err(AddressError::InvalidLength(len)),
            _ => return Err(AddressError::UnknownType),
        }

        Ok(Address {
            address_type: AddressType::Witness(version),
            payload: program,
            string: address.to_lowercase(),
        })
    }

    fn convert(&self, payload: &[u8], script_type: ScriptType) -> Result<Address, AddressError> {
        let version = match (script_type, payload.len()) {
            (ScriptType::P2WPKH, 20) | (ScriptType::P2WSH, 32) => 0,
            (ScriptType::P2TR, 32) => 1,
            (ScriptType::P2WPKH | ScriptType::P2WSH | ScriptType::P2TR, len) => {
                return Err(AddressError::InvalidLength(len))
            }
            _ => return Err(AddressError::UnknownType),
        };

        Ok(Address {
            address_type: AddressType::Witness(version),
            payload: payload.to_vec(),
            string: self.encode(version, payload)?,
        })
    }

    fn convert_public_key(&self, public_key: &PublicKey, script_type: ScriptType) -> Result<Address, AddressError> {
        match script_type {
            ScriptType::P2WPKH => self.convert(&public_key.public_key_hash, script_type),
            ScriptType::P2TR => self.convert(&public_key.converted_for_p2tr, script_type),
            _ => Err(AddressError::UnknownType),
        }
    }
}

/// Ordered converters, first success wins
#[derive(Default)]
pub struct AddressConverterChain {
    converters: Vec<Box<dyn AddressConverter>>,
}

impl AddressConverterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a converter with lower priority than the existing ones
    pub fn push(&mut self, converter: Box<dyn AddressConverter>) {
        self.converters.push(converter);
    }

    /// Add a converter with priority over the existing ones
    pub fn prepend(&mut self, converter: Box<dyn AddressConverter>) {
        self.converters.insert(0, converter);
    }

    fn first_success<F>(&self, f: F) -> Result<Address, AddressError>
    where
        F: Fn(&dyn AddressConverter) -> Result<Address, AddressError>,
    {
        let mut errors = Vec::new();
        for converter in &self.converters {
            match f(converter.as_ref()) {
                Ok(address) => return Ok(address),
                Err(e) => errors.push(e.to_string()),
            }
        }
        Err(AddressError::NoConverter(errors.join("; ")))
    }
}

impl AddressConverter for AddressConverterChain {
    fn convert_str(&self, address: &str) -> Result<Address, AddressError> {
        self.first_success(|c| c.convert_str(address))
    }

    fn convert(&self, payload: &[u8], script_type: ScriptType) -> Result<Address, AddressError> {
        self.first_success(|c| c.convert(payload, script_type))
    }

    fn convert_public_key(&self, public_key: &PublicKey, script_type: ScriptType) -> Result<Address, AddressError> {
        self.first_success(|c| c.convert_public_key(public_key, script_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HASH: &str = "751e76e8199196d454941c45d1b3a323f1433bd6";

    fn mainnet_chain() -> AddressConverterChain {
        let mut chain = AddressConverterChain::new();
        chain.push(Box::new(Base58AddressConverter::new(0x00, 0x05)));
        chain.push(Box::new(SegwitAddressConverter::new("bc")));
        chain
    }

    #[test]
    fn test_base58_p2pkh() {
        let chain = mainnet_chain();
        let hash = hex::decode(KEY_HASH).unwrap();

        let address = chain.convert(&hash, ScriptType::P2PKH).unwrap();
        assert_eq!(address.string, "1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH");

        let parsed = chain.convert_str("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMH").unwrap();
        assert_eq!(parsed.payload, hash);
        assert_eq!(parsed.script_type(), ScriptType::P2PKH);
    }

    #[test]
    fn test_base58_p2sh() {
        let converter = Base58AddressConverter::new(0x00, 0x05);
        let hash = hex::decode(KEY_HASH).unwrap();
        let address = converter.convert(&hash, ScriptType::P2SH).unwrap();
        assert_eq!(address.string, "3CNHUhP3uyB9EUtRLsmvFUmvGdjGdkTxJw");
        assert_eq!(address.locking_script().len(), 23);
    }

    #[test]
    fn test_bech32_p2wpkh() {
        let chain = mainnet_chain();
        let address = chain.convert_str("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4").unwrap();

        assert_eq!(hex::encode(&address.payload), KEY_HASH);
        assert_eq!(address.script_type(), ScriptType::P2WPKH);
        assert_eq!(
            hex::encode(address.locking_script()),
            format!("0014{}", KEY_HASH)
        );
    }

    #[test]
    fn test_bech32m_taproot() {
        let converter = SegwitAddressConverter::new("bc");
        let output_key =
            hex::decode("a60869f0dbcf1dc659c9cecbaf8050135ea9e8cdc487053f1dc6880949dc684c").unwrap();

        let address = converter.convert(&output_key, ScriptType::P2TR).unwrap();
        assert_eq!(
            address.string,
            "bc1p5cyxnuxmeuwuvkwfem96lqzszd02n6xdcjrs20cac6yqjjwudpxqkedrcr"
        );
        assert_eq!(converter.convert_str(&address.string).unwrap().payload, output_key);
    }

    #[test]
    fn test_wrong_network_rejected() {
        let chain = mainnet_chain();
        assert!(chain.convert_str("tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx").is_err());
        assert!(chain.convert_str("1BgGZ9tcN4rm9KBzDn7KprQz87SZ26SAMJ").is_err());
    }

    #[test]
    fn test_prepended_converter_wins() {
        let mut chain = AddressConverterChain::new();
        chain.push(Box::new(Base58AddressConverter::new(0x00, 0x05)));
        chain.prepend(Box::new(Base58AddressConverter::new(0x6f, 0xc4)));

        let hash = hex::decode(KEY_HASH).unwrap();
        let address = chain.convert(&hash, ScriptType::P2PKH).unwrap();
        assert!(address.string.starts_with('m') || address.string.starts_with('n'));
    }
}
