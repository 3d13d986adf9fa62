//! Encryption at rest for seeds and private keys
//!
//! AES-256-GCM under the installation key. Each ciphertext carries
//! associated data naming its owner, so a ciphertext copied onto another
//! record fails authentication instead of decrypting.
//!
//! Sealed format (hex): `version (1) || nonce (12) || ciphertext+tag`.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::VaultError;

const FORMAT_VERSION: u8 = 1;
const NONCE_LEN: usize = 12;

/// Installation-wide sealing key, wiped on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SealingKey([u8; 32]);

impl SealingKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    fn cipher(&self) -> Result<Aes256Gcm, VaultError> {
        Aes256Gcm::new_from_slice(&self.0).map_err(|e| VaultError::Integrity(e.to_string()))
    }

    /// Encrypt `plaintext` bound to `aad`
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| VaultError::Integrity(format!("encryption failed: {}", e)))?;

        let mut sealed = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
        sealed.push(FORMAT_VERSION);
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(hex::encode(sealed))
    }

    /// Decrypt a sealed value; any mismatch is an integrity failure
    pub fn open(&self, sealed: &str, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let raw = hex::decode(sealed)
            .map_err(|e| VaultError::Integrity(format!("sealed value is not hex: {}", e)))?;

        if raw.len() <= 1 + NONCE_LEN {
            return Err(VaultError::Integrity("sealed value truncated".to_string()));
        }
        if raw[0] != FORMAT_VERSION {
            return Err(VaultError::Integrity(format!(
                "unsupported sealed format version {}",
                raw[0]
            )));
        }

        let (nonce_bytes, ciphertext) = raw[1..].split_at(NONCE_LEN);
        let plaintext = self
            .cipher()?
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| VaultError::Integrity("authentication tag mismatch".to_string()))?;

        Ok(Zeroizing::new(plaintext))
    }
}

impl std::fmt::Debug for SealingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SealingKey(..)")
    }
}

/// Associated data for a partner's master seed
pub fn seed_aad(partner_id: &str) -> Vec<u8> {
    format!("seed:{}", partner_id).into_bytes()
}

/// Associated data for a derived private key
pub fn key_aad(wallet_id: &str, index: u32) -> Vec<u8> {
    format!("key:{}:{}", wallet_id, index).into_bytes()
}
