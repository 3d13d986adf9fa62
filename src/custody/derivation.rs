//! Hierarchical key derivation
//!
//! Standard BIP-32 along `m/44'/195'/0'/0/{index}`. Index 0 is the
//! partner's collection address; deposit addresses start at 1.

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::NetworkKind;
use std::str::FromStr;
use zeroize::Zeroizing;

use super::address::{address_from_public_key, validate_address};
use super::VaultError;

/// Account-level path; the external chain and index are appended
pub const ACCOUNT_PATH: &str = "m/44'/195'/0'";
/// Seed length in bytes
pub const SEED_LEN: usize = 64;
/// Index reserved for the collection address
pub const COLLECTION_INDEX: u32 = 0;

/// One derived key with its encoded address
pub struct DerivedKey {
    pub index: u32,
    pub secret: SecretKey,
    pub address: String,
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.secret.non_secure_erase();
    }
}

/// Generate a fresh random seed
pub fn generate_seed() -> Zeroizing<Vec<u8>> {
    use rand::RngCore;

    let mut seed = Zeroizing::new(vec![0u8; SEED_LEN]);
    rand::thread_rng().fill_bytes(seed.as_mut_slice());
    seed
}

fn account_xpriv(seed: &[u8]) -> Result<Xpriv, VaultError> {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(NetworkKind::Main, seed)
        .map_err(|e| VaultError::KeyDerivation(format!("master key: {}", e)))?;
    let path = DerivationPath::from_str(ACCOUNT_PATH)
        .map_err(|e| VaultError::KeyDerivation(format!("account path: {}", e)))?;

    master
        .derive_priv(&secp, &path)
        .map_err(|e| VaultError::KeyDerivation(format!("account key: {}", e)))
}

/// Account-level extended public key, stored on the master wallet
pub fn account_xpub(seed: &[u8]) -> Result<String, VaultError> {
    let secp = Secp256k1::new();
    let account = account_xpriv(seed)?;
    Ok(Xpub::from_priv(&secp, &account).to_string())
}

/// Full path for an address index
pub fn address_path(index: u32) -> String {
    format!("{}/0/{}", ACCOUNT_PATH, index)
}

/// Derive the key and address at `index`
///
/// The produced address is validated before it is returned; a failure here
/// means the seed or the derivation is broken.
pub fn derive_key(seed: &[u8], index: u32) -> Result<DerivedKey, VaultError> {
    let secp = Secp256k1::new();
    let account = account_xpriv(seed)?;

    let chain = ChildNumber::from_normal_idx(0)
        .map_err(|e| VaultError::KeyDerivation(e.to_string()))?;
    let child = ChildNumber::from_normal_idx(index)
        .map_err(|e| VaultError::KeyDerivation(format!("index {}: {}", index, e)))?;

    let xpriv = account
        .derive_priv(&secp, &[chain, child])
        .map_err(|e| VaultError::KeyDerivation(format!("index {}: {}", index, e)))?;

    let secret = xpriv.private_key;
    let address = address_from_public_key(&secret.public_key(&secp));
    validate_address(&address).map_err(|e| {
        VaultError::KeyDerivation(format!("derived address failed validation: {}", e))
    })?;

    Ok(DerivedKey {
        index,
        secret,
        address,
    })
}
