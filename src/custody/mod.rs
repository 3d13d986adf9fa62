//! Key Custody Module
//!
//! Seeds, derived keys and deposit addresses. Plaintext key material exists
//! only transiently inside this module.
//!
//! This module contains:
//! - AES-256-GCM sealing of seeds and private keys
//! - BIP-32 derivation and TRON address encoding
//! - The vault that owns master wallets and signing-key access

pub mod address;
pub mod cipher;
pub mod derivation;
pub mod vault;

use thiserror::Error;

use crate::storage::StorageError;

// Re-exports for convenience
pub use address::{address_from_public_key, address_to_hex, is_valid_address, validate_address};
pub use cipher::SealingKey;
pub use vault::KeyCustodyVault;

/// Vault errors
#[derive(Debug, Error)]
pub enum VaultError {
    /// Ciphertext failed authentication or decrypted to the wrong key
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Derivation produced no usable key
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    /// Wallet halted after an integrity failure
    #[error("wallet {0} is halted")]
    WalletHalted(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// No custody record for this address
    #[error("unknown address: {0}")]
    UnknownAddress(String),

    /// Partner has no master wallet yet
    #[error("no master wallet for partner {0}")]
    UnknownWallet(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl VaultError {
    /// Errors that halt the wallet they occurred on
    pub fn halts_wallet(&self) -> bool {
        matches!(self, VaultError::Integrity(_) | VaultError::KeyDerivation(_))
    }
}
