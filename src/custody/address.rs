//! TRON address encoding
//!
//! `0x41 || last20(keccak256(uncompressed_pubkey[1..]))`, base58check encoded.
//! Valid addresses are 34 characters and start with `T`.

use bitcoin::base58;
use bitcoin::secp256k1::PublicKey;
use sha3::{Digest, Keccak256};

use super::VaultError;

/// Mainnet address version byte
pub const ADDRESS_PREFIX: u8 = 0x41;
/// Encoded length
pub const ADDRESS_LEN: usize = 34;

/// Encode the address controlled by `public_key`
pub fn address_from_public_key(public_key: &PublicKey) -> String {
    let uncompressed = public_key.serialize_uncompressed();
    let hash = Keccak256::digest(&uncompressed[1..]);

    let mut raw = [0u8; 21];
    raw[0] = ADDRESS_PREFIX;
    raw[1..].copy_from_slice(&hash[12..]);

    base58::encode_check(&raw)
}

/// Validate an encoded address and return its 21 raw bytes
pub fn validate_address(address: &str) -> Result<[u8; 21], VaultError> {
    if address.len() != ADDRESS_LEN || !address.starts_with('T') {
        return Err(VaultError::InvalidAddress(format!(
            "{}: expected {} characters starting with 'T'",
            address, ADDRESS_LEN
        )));
    }

    let decoded = base58::decode_check(address)
        .map_err(|e| VaultError::InvalidAddress(format!("{}: {}", address, e)))?;

    let raw: [u8; 21] = decoded.as_slice().try_into().map_err(|_| {
        VaultError::InvalidAddress(format!("{}: decoded length {}", address, decoded.len()))
    })?;

    if raw[0] != ADDRESS_PREFIX {
        return Err(VaultError::InvalidAddress(format!(
            "{}: version byte {:#04x}",
            address, raw[0]
        )));
    }

    Ok(raw)
}

/// Whether `address` is a well-formed address
pub fn is_valid_address(address: &str) -> bool {
    validate_address(address).is_ok()
}

/// Hex form (`41…`) used by contract call parameters
pub fn address_to_hex(address: &str) -> Result<String, VaultError> {
    validate_address(address).map(hex::encode)
}
