//! Signing Gateway
//!
//! The single path by which funds leave a custody address. The gateway
//! builds a transfer through the relay, signs its txid with the key held by
//! the vault and broadcasts it. Hardware or MPC signers plug in behind the
//! same trait.

use async_trait::async_trait;
use bitcoin::secp256k1::{Message, Secp256k1};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::custody::{KeyCustodyVault, VaultError};
use crate::ledger::{LedgerError, SignedTransfer, TransactionRelay};
use crate::types::Asset;

/// Signing errors
#[derive(Debug, Error)]
pub enum SigningError {
    /// Relay refused to build or broadcast the transfer
    #[error("relay error: {0}")]
    Relay(#[from] LedgerError),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("signing timed out after {0}ms")]
    Timeout(u64),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl SigningError {
    /// Failures a retry cannot fix
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            SigningError::Vault(e) if e.halts_wallet() || matches!(e, VaultError::UnknownAddress(_))
        )
    }
}

/// Run a gateway call under a deadline
pub async fn sign_with_timeout(
    gateway: &dyn SigningGateway,
    limit: Duration,
    from: &str,
    to: &str,
    amount: u64,
    asset: &Asset,
) -> Result<String, SigningError> {
    match tokio::time::timeout(limit, gateway.sign_and_broadcast(from, to, amount, asset)).await {
        Ok(result) => result,
        Err(_) => Err(SigningError::Timeout(limit.as_millis() as u64)),
    }
}

/// Signs and broadcasts a single transfer
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SigningGateway: Send + Sync {
    /// Returns the broadcast transaction hash
    async fn sign_and_broadcast(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        asset: &Asset,
    ) -> Result<String, SigningError>;
}

/// Gateway backed by the key custody vault
pub struct VaultSigningGateway {
    vault: Arc<KeyCustodyVault>,
    relay: Arc<dyn TransactionRelay>,
    timeout: Duration,
}

impl VaultSigningGateway {
    pub fn new(
        vault: Arc<KeyCustodyVault>,
        relay: Arc<dyn TransactionRelay>,
        timeout: Duration,
    ) -> Self {
        Self {
            vault,
            relay,
            timeout,
        }
    }

    async fn execute(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        asset: &Asset,
    ) -> Result<String, SigningError> {
        let unsigned = self.relay.create_transfer(from, to, amount, asset).await?;

        let digest: [u8; 32] = hex::decode(&unsigned.txid)
            .map_err(|e| SigningError::Signature(format!("txid is not hex: {}", e)))?
            .try_into()
            .map_err(|_| SigningError::Signature("txid is not 32 bytes".to_string()))?;
        let message = Message::from_digest(digest);

        let secp = Secp256k1::new();
        let signature = self
            .vault
            .with_signing_key(from, |key| secp.sign_ecdsa_recoverable(&message, key))
            .await?;

        let (recovery_id, compact) = signature.serialize_compact();
        let mut bytes = Vec::with_capacity(65);
        bytes.extend_from_slice(&compact);
        bytes.push(recovery_id.to_i32() as u8);

        debug!(target: "custody::signing", txid = %unsigned.txid, from = %from, "Signed transfer");

        let signed = SignedTransfer {
            unsigned,
            signature: hex::encode(bytes),
        };
        Ok(self.relay.broadcast(&signed).await?)
    }
}

#[async_trait]
impl SigningGateway for VaultSigningGateway {
    async fn sign_and_broadcast(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        asset: &Asset,
    ) -> Result<String, SigningError> {
        match tokio::time::timeout(self.timeout, self.execute(from, to, amount, asset)).await {
            Ok(result) => result,
            Err(_) => {
                let ms = self.timeout.as_millis() as u64;
                warn!(target: "custody::signing", from = %from, to = %to, timeout_ms = ms, "Signing timed out");
                Err(SigningError::Timeout(ms))
            }
        }
    }
}
