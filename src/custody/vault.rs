//! Key Custody Vault
//!
//! Owns master wallets and every derived private key.
//!
//! ## Lifecycle
//!
//! 1. `ensure_master_wallet` generates and seals a 64-byte seed once per
//!    partner; the collection address is index 0 of that seed.
//! 2. `derive_deposit_address` reserves the next index in storage, derives
//!    the key, seals it and persists the address.
//! 3. `with_signing_key` opens one key for the duration of one closure.
//!
//! An integrity or derivation failure halts the wallet; a halted wallet
//! refuses derivation and signing until an operator clears it.

use bitcoin::secp256k1::{Secp256k1, SecretKey};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::address::address_from_public_key;
use super::cipher::{key_aad, seed_aad, SealingKey};
use super::derivation::{self, COLLECTION_INDEX};
use super::VaultError;
use crate::common::logging::log_security_event;
use crate::storage::{CustodyStore, StorageError};
use crate::types::{new_id, DepositAddress, MasterWallet};

/// Holds the installation key and mediates all key access
pub struct KeyCustodyVault {
    store: Arc<dyn CustodyStore>,
    sealing_key: SealingKey,
    /// Serializes wallet creation within this process
    create_lock: Mutex<()>,
}

impl KeyCustodyVault {
    pub fn new(store: Arc<dyn CustodyStore>, sealing_key: SealingKey) -> Self {
        Self {
            store,
            sealing_key,
            create_lock: Mutex::new(()),
        }
    }

    /// Return the partner's master wallet, creating it on first use
    pub async fn ensure_master_wallet(&self, partner_id: &str) -> Result<MasterWallet, VaultError> {
        if let Some(wallet) = self.store.get_master_wallet(partner_id).await? {
            return Ok(wallet);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(wallet) = self.store.get_master_wallet(partner_id).await? {
            return Ok(wallet);
        }

        let seed = derivation::generate_seed();
        let collection = derivation::derive_key(&seed, COLLECTION_INDEX)?;
        let now = Utc::now();

        let wallet = MasterWallet {
            id: new_id("mw"),
            partner_id: partner_id.to_string(),
            encrypted_seed: self.sealing_key.seal(&seed, &seed_aad(partner_id))?,
            derivation_path: derivation::ACCOUNT_PATH.to_string(),
            last_index: COLLECTION_INDEX,
            public_key: derivation::account_xpub(&seed)?,
            collection_address: collection.address.clone(),
            halted: false,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_master_wallet(&wallet).await {
            Ok(()) => {}
            // Another process won the race; use its wallet
            Err(StorageError::Duplicate(_)) => {
                return self
                    .store
                    .get_master_wallet(partner_id)
                    .await?
                    .ok_or_else(|| VaultError::UnknownWallet(partner_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            target: "custody::vault",
            partner_id = %partner_id,
            wallet_id = %wallet.id,
            collection_address = %wallet.collection_address,
            "Created master wallet"
        );
        log_security_event(
            "master_wallet_created",
            true,
            serde_json::json!({ "partner_id": partner_id, "wallet_id": wallet.id }),
        );

        Ok(wallet)
    }

    /// Collection address for a partner
    pub async fn collection_address(&self, partner_id: &str) -> Result<String, VaultError> {
        Ok(self.wallet_for(partner_id).await?.collection_address)
    }

    /// Derive, seal and persist a fresh deposit address for `user_id`
    pub async fn derive_deposit_address(
        &self,
        partner_id: &str,
        user_id: &str,
    ) -> Result<DepositAddress, VaultError> {
        let wallet = self.wallet_for(partner_id).await?;
        if wallet.halted {
            return Err(VaultError::WalletHalted(wallet.id));
        }

        let index = match self.store.reserve_next_index(&wallet.id).await {
            Ok(index) => index,
            Err(StorageError::InvalidTransition(_)) => {
                return Err(VaultError::WalletHalted(wallet.id))
            }
            Err(e) => return Err(e.into()),
        };

        let derived = self.guard(&wallet, self.derive_at(&wallet, index)).await?;
        let encrypted_private_key = self
            .sealing_key
            .seal(&derived.secret.secret_bytes(), &key_aad(&wallet.id, index))?;

        let now = Utc::now();
        let address = DepositAddress {
            id: new_id("dep"),
            master_wallet_id: wallet.id.clone(),
            partner_id: partner_id.to_string(),
            user_id: user_id.to_string(),
            derivation_index: index,
            address: derived.address.clone(),
            encrypted_private_key,
            is_active: true,
            is_monitored: true,
            total_received: 0,
            total_swept: 0,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_deposit_address(&address).await?;

        info!(
            target: "custody::vault",
            partner_id = %partner_id,
            user_id = %user_id,
            index = index,
            address = %address.address,
            "Derived deposit address"
        );

        Ok(address)
    }

    /// Open the key controlling `address` for a single call of `f`
    ///
    /// `address` may be a deposit address or a collection address. The key
    /// is checked against the address before `f` sees it and erased after.
    pub async fn with_signing_key<F, R>(&self, address: &str, f: F) -> Result<R, VaultError>
    where
        F: FnOnce(&SecretKey) -> R,
    {
        let (wallet, mut secret) = match self.store.get_deposit_address_by_address(address).await? {
            Some(deposit) => {
                let wallet = self
                    .store
                    .get_master_wallet_by_id(&deposit.master_wallet_id)
                    .await?
                    .ok_or_else(|| VaultError::UnknownWallet(deposit.partner_id.clone()))?;
                if wallet.halted {
                    return Err(VaultError::WalletHalted(wallet.id));
                }
                let secret = self.guard(&wallet, self.open_deposit_key(&wallet, &deposit)).await?;
                (wallet, secret)
            }
            None => {
                let wallet = self
                    .store
                    .get_master_wallet_by_collection_address(address)
                    .await?
                    .ok_or_else(|| VaultError::UnknownAddress(address.to_string()))?;
                if wallet.halted {
                    return Err(VaultError::WalletHalted(wallet.id));
                }
                let derived = self
                    .guard(&wallet, self.derive_at(&wallet, COLLECTION_INDEX))
                    .await?;
                (wallet, derived.secret)
            }
        };

        let secp = Secp256k1::new();
        if address_from_public_key(&secret.public_key(&secp)) != address {
            secret.non_secure_erase();
            let err = VaultError::Integrity(format!("key does not control {}", address));
            return self.guard(&wallet, Err(err)).await;
        }

        let result = f(&secret);
        secret.non_secure_erase();
        Ok(result)
    }

    /// Clear a halt after operator review
    pub async fn resume_wallet(&self, partner_id: &str) -> Result<(), VaultError> {
        let wallet = self.wallet_for(partner_id).await?;
        self.store.set_wallet_halted(&wallet.id, false).await?;

        warn!(target: "custody::vault", wallet_id = %wallet.id, "Wallet halt cleared");
        log_security_event(
            "wallet_resumed",
            true,
            serde_json::json!({ "partner_id": partner_id, "wallet_id": wallet.id }),
        );
        Ok(())
    }

    async fn wallet_for(&self, partner_id: &str) -> Result<MasterWallet, VaultError> {
        self.store
            .get_master_wallet(partner_id)
            .await?
            .ok_or_else(|| VaultError::UnknownWallet(partner_id.to_string()))
    }

    fn derive_at(
        &self,
        wallet: &MasterWallet,
        index: u32,
    ) -> Result<derivation::DerivedKey, VaultError> {
        let seed = self
            .sealing_key
            .open(&wallet.encrypted_seed, &seed_aad(&wallet.partner_id))?;
        derivation::derive_key(&seed, index)
    }

    fn open_deposit_key(
        &self,
        wallet: &MasterWallet,
        deposit: &DepositAddress,
    ) -> Result<SecretKey, VaultError> {
        let plaintext = self.sealing_key.open(
            &deposit.encrypted_private_key,
            &key_aad(&wallet.id, deposit.derivation_index),
        )?;
        SecretKey::from_slice(&plaintext)
            .map_err(|e| VaultError::Integrity(format!("sealed key is not a valid scalar: {}", e)))
    }

    /// Halt the wallet when `result` carries a fatal error
    async fn guard<T>(
        &self,
        wallet: &MasterWallet,
        result: Result<T, VaultError>,
    ) -> Result<T, VaultError> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.halts_wallet() {
            error!(
                target: "custody::vault",
                wallet_id = %wallet.id,
                partner_id = %wallet.partner_id,
                error = %err,
                "Halting wallet"
            );
            log_security_event(
                "wallet_halted",
                false,
                serde_json::json!({
                    "partner_id": wallet.partner_id,
                    "wallet_id": wallet.id,
                    "reason": err.to_string(),
                }),
            );
            if let Err(e) = self.store.set_wallet_halted(&wallet.id, true).await {
                error!(target: "custody::vault", wallet_id = %wallet.id, error = %e, "Failed to persist halt");
            }
        }

        Err(err)
    }
}
