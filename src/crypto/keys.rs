//! Signing primitives over secp256k1
//!
//! ECDSA signatures for legacy and segwit v0 inputs, BIP340 Schnorr
//! signatures for taproot key-path spends, and the BIP86 taproot tweak.

use secp256k1::{ecdsa, Keypair, Message, PublicKey, Scalar, Secp256k1, SecretKey, XOnlyPublicKey};
use thiserror::Error;

use super::hash::tagged_hash;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// Parse a compressed or uncompressed public key
pub fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, KeyError> {
    PublicKey::from_slice(bytes).map_err(|_| KeyError::InvalidPublicKey)
}

/// Sign a 32-byte digest, returning the DER encoded signature
pub fn sign_ecdsa(secret_key: &SecretKey, digest: &[u8; 32]) -> Vec<u8> {
    let secp = Secp256k1::signing_only();
    let message = Message::from_digest(*digest);
    secp.sign_ecdsa(&message, secret_key).serialize_der().to_vec()
}

/// Verify a DER encoded ECDSA signature over a 32-byte digest
pub fn verify_ecdsa(public_key: &PublicKey, digest: &[u8; 32], signature: &[u8]) -> Result<bool, KeyError> {
    let secp = Secp256k1::verification_only();
    let message = Message::from_digest(*digest);
    let sig = ecdsa::Signature::from_der(signature).map_err(|_| KeyError::InvalidSignature)?;

    Ok(secp.verify_ecdsa(&message, &sig, public_key).is_ok())
}

/// BIP86 tweak scalar for a key-path only output: tagged_hash("TapTweak", P)
fn taproot_tweak(internal_key: &XOnlyPublicKey) -> Result<Scalar, KeyError> {
    let tweak = tagged_hash("TapTweak", &internal_key.serialize());
    Scalar::from_be_bytes(tweak).map_err(|_| KeyError::InvalidPrivateKey)
}

/// Output key of a key-path only taproot output for the given public key
pub fn taproot_output_key(public_key: &PublicKey) -> Result<[u8; 32], KeyError> {
    let secp = Secp256k1::verification_only();
    let (internal_key, _) = public_key.x_only_public_key();
    let tweak = taproot_tweak(&internal_key)?;
    let (output_key, _) = internal_key.add_tweak(&secp, &tweak)?;

    Ok(output_key.serialize())
}

/// Sign a taproot sighash with the tweaked secret key (BIP340 Schnorr)
pub fn sign_schnorr_taproot(secret_key: &SecretKey, digest: &[u8; 32]) -> Result<Vec<u8>, KeyError> {
    let secp = Secp256k1::new();
    let public_key = PublicKey::from_secret_key(&secp, secret_key);
    let (internal_key, parity) = public_key.x_only_public_key();

    // The internal key must have an even y coordinate
    let even_key = if parity == secp256k1::Parity::Odd {
        secret_key.negate()
    } else {
        *secret_key
    };
    let tweaked = even_key.add_tweak(&taproot_tweak(&internal_key)?)?;
    let keypair = Keypair::from_secret_key(&secp, &tweaked);

    let signature = secp.sign_schnorr(&Message::from_digest(*digest), &keypair);
    let bytes: &[u8; 64] = signature.as_ref();
    Ok(bytes.to_vec())
}

/// Verify a BIP340 signature against an x-only output key
pub fn verify_schnorr(output_key: &[u8; 32], digest: &[u8; 32], signature: &[u8]) -> Result<bool, KeyError> {
    let secp = Secp256k1::verification_only();
    let key = XOnlyPublicKey::from_slice(output_key).map_err(|_| KeyError::InvalidPublicKey)?;
    let sig = secp256k1::schnorr::Signature::from_slice(signature).map_err(|_| KeyError::InvalidSignature)?;

    Ok(secp.verify_schnorr(&sig, &Message::from_digest(*digest), &key).is_ok())
}
