//! Custody Wallet Types
//!
//! Master wallets (one per partner) and the deposit addresses derived from
//! them. Key material is only ever held here in sealed (encrypted) form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Partner master wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterWallet {
    /// Unique wallet ID
    pub id: String,
    /// Owning partner
    pub partner_id: String,
    /// Sealed seed (hex, never serialized to read models)
    #[serde(skip_serializing)]
    pub encrypted_seed: String,
    /// Account-level derivation path (e.g. `m/44'/195'/0'`)
    pub derivation_path: String,
    /// Highest derivation index issued so far (0 = collection address only)
    pub last_index: u32,
    /// Account-level extended public key
    pub public_key: String,
    /// Collection address (index 0)
    pub collection_address: String,
    /// Set after an integrity failure; blocks derivation and signing
    pub halted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-user deposit address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositAddress {
    /// Unique record ID
    pub id: String,
    pub master_wallet_id: String,
    pub partner_id: String,
    pub user_id: String,
    /// Unique and monotonic per master wallet
    pub derivation_index: u32,
    /// Base58check address
    pub address: String,
    /// Sealed private key (hex)
    #[serde(skip_serializing)]
    pub encrypted_private_key: String,
    /// Cleared by deactivation, never set again
    pub is_active: bool,
    pub is_monitored: bool,
    /// Cumulative amount received (base units)
    pub total_received: u64,
    /// Cumulative amount swept (base units)
    pub total_swept: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DepositAddress {
    /// Amount received but not yet swept
    pub fn unswept(&self) -> u64 {
        self.total_received.saturating_sub(self.total_swept)
    }

    /// Active addresses that are still being watched
    pub fn is_watchable(&self) -> bool {
        self.is_active && self.is_monitored
    }
}
