//! Ledger Client Module
//!
//! Read access to chain state and the relay used to create and broadcast
//! transfers. The custody core never talks to a node directly; everything
//! goes through these traits so tests can substitute mocks.

pub mod trongrid;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Asset, FrozenStake, ResourceBalance};

pub use trongrid::TronGridClient;

/// Ledger client errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The node answered with an error payload
    #[error("ledger API error: {0}")]
    Api(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("ledger call timed out after {0}ms")]
    Timeout(u64),
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        LedgerError::Http(err.to_string())
    }
}

/// Resource snapshot for one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountResource {
    pub energy_limit: u64,
    pub energy_used: u64,
    /// Staked bandwidth
    pub net_limit: u64,
    pub net_used: u64,
    /// Daily free bandwidth allowance
    pub free_net_limit: u64,
    pub free_net_used: u64,
}

impl AccountResource {
    pub fn energy(&self) -> ResourceBalance {
        ResourceBalance::new(self.energy_limit, self.energy_used)
    }

    /// Staked plus free bandwidth
    pub fn bandwidth(&self) -> ResourceBalance {
        ResourceBalance::new(
            self.net_limit + self.free_net_limit,
            self.net_used + self.free_net_used,
        )
    }
}

/// Account balance and stake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    /// Native balance in sun
    pub balance: u64,
    pub frozen: FrozenStake,
}

/// Keypair produced by the node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedKeypair {
    pub address: String,
    pub private_key: String,
}

/// Transfer built by the relay, awaiting a signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsignedTransfer {
    /// Hex transaction id; the signed digest
    pub txid: String,
    /// Node transaction object, echoed back on broadcast
    pub raw: serde_json::Value,
}

/// Transfer with its 65-byte recoverable signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedTransfer {
    pub unsigned: UnsignedTransfer,
    /// Hex `r || s || v`
    pub signature: String,
}

/// Chain state reads
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn get_account_resource(&self, address: &str) -> Result<AccountResource, LedgerError>;

    async fn get_account(&self, address: &str) -> Result<AccountInfo, LedgerError>;

    /// Balance of `asset` held by `address`, in base units
    async fn get_balance(&self, address: &str, asset: &Asset) -> Result<u64, LedgerError>;

    async fn generate_keypair(&self) -> Result<GeneratedKeypair, LedgerError>;
}

/// Builds and broadcasts transfers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionRelay: Send + Sync {
    async fn create_transfer(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        asset: &Asset,
    ) -> Result<UnsignedTransfer, LedgerError>;

    /// Broadcast and return the transaction hash
    async fn broadcast(&self, signed: &SignedTransfer) -> Result<String, LedgerError>;
}

/// Run a ledger call under a deadline; elapsing counts as failure
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, LedgerError>
where
    F: Future<Output = Result<T, LedgerError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout(limit.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bandwidth_includes_free_allowance() {
        let resource = AccountResource {
            energy_limit: 10_000,
            energy_used: 3_000,
            net_limit: 1_000,
            net_used: 200,
            free_net_limit: 600,
            free_net_used: 600,
        };
        assert_eq!(resource.energy().available, 7_000);
        let bandwidth = resource.bandwidth();
        assert_eq!(bandwidth.total, 1_600);
        assert_eq!(bandwidth.available, 800);
        assert!(bandwidth.is_consistent());
    }

    #[tokio::test]
    async fn test_with_timeout_elapses() {
        let result: Result<(), LedgerError> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(LedgerError::Timeout(10))));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result() {
        let result = with_timeout(Duration::from_secs(1), async { Ok::<_, LedgerError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
