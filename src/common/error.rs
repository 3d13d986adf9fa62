//! Common Error Types for the Custody Core
//!
//! Provides unified error handling across all modules. Module-level errors
//! (storage, vault, ledger, signing) convert into [`CustodyError`] so callers
//! at the service boundary see one taxonomy.

use thiserror::Error;

use crate::custody::VaultError;
use crate::ledger::LedgerError;
use crate::signing::SigningError;
use crate::storage::StorageError;

/// Root error type for the custody core
#[derive(Debug, Error)]
pub enum CustodyError {
    /// Malformed input, returned directly and never retried
    #[error("validation error: {0}")]
    Validation(String),

    /// A hard policy gate failed; terminal until policy or limits change
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    /// Not enough energy/bandwidth; the work is re-queued, not retried inline
    #[error("insufficient {kind}: requested {requested}, available {available}")]
    InsufficientResource {
        kind: String,
        requested: u64,
        available: u64,
    },

    /// External signer or broadcast failure
    #[error("signing failure: {0}")]
    SigningFailure(String),

    /// Ciphertext failed authentication; the wallet is halted
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Key derivation failed; implies seed corruption
    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    /// External call exceeded its deadline
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Record lookup failed
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    /// Ledger client errors
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(#[from] super::config::ConfigError),

    /// Logging errors
    #[error("logging error: {0}")]
    Logging(#[from] super::logging::LoggingError),
}

impl CustodyError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a policy violation
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::PolicyViolation(msg.into())
    }

    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if this is a retryable error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CustodyError::InsufficientResource { .. }
                | CustodyError::SigningFailure(_)
                | CustodyError::Timeout(_)
                | CustodyError::Ledger(_)
                | CustodyError::Storage(_)
        )
    }

    /// Fatal errors halt the affected wallet and page an operator
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CustodyError::Integrity(_) | CustodyError::KeyDerivation(_)
        )
    }

    /// Get error code for read models and logs
    pub fn error_code(&self) -> &'static str {
        match self {
            CustodyError::Validation(_) => "VALIDATION_ERROR",
            CustodyError::PolicyViolation(_) => "POLICY_VIOLATION",
            CustodyError::InsufficientResource { .. } => "INSUFFICIENT_RESOURCE",
            CustodyError::SigningFailure(_) => "SIGNING_FAILURE",
            CustodyError::Integrity(_) => "INTEGRITY_ERROR",
            CustodyError::KeyDerivation(_) => "KEY_DERIVATION_ERROR",
            CustodyError::Timeout(_) => "TIMEOUT",
            CustodyError::NotFound(_) => "NOT_FOUND",
            CustodyError::Storage(_) => "STORAGE_ERROR",
            CustodyError::Ledger(_) => "LEDGER_ERROR",
            CustodyError::Config(_) => "CONFIG_ERROR",
            CustodyError::Logging(_) => "LOGGING_ERROR",
        }
    }
}

impl From<StorageError> for CustodyError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => CustodyError::NotFound(what),
            StorageError::InvalidTransition(what) => CustodyError::Validation(what),
            other => CustodyError::Storage(other.to_string()),
        }
    }
}

impl From<VaultError> for CustodyError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::Integrity(msg) => CustodyError::Integrity(msg),
            VaultError::KeyDerivation(msg) => CustodyError::KeyDerivation(msg),
            VaultError::WalletHalted(id) => {
                CustodyError::Integrity(format!("wallet {} is halted", id))
            }
            VaultError::InvalidAddress(msg) => CustodyError::Validation(msg),
            VaultError::UnknownAddress(addr) => CustodyError::NotFound(addr),
            VaultError::UnknownWallet(partner) => {
                CustodyError::NotFound(format!("master wallet for {}", partner))
            }
            VaultError::Storage(e) => e.into(),
        }
    }
}

impl From<LedgerError> for CustodyError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Timeout(ms) => CustodyError::Timeout(ms),
            LedgerError::InvalidAddress(addr) => {
                CustodyError::Validation(format!("ledger returned invalid address: {}", addr))
            }
            other => CustodyError::Ledger(other.to_string()),
        }
    }
}

impl From<SigningError> for CustodyError {
    fn from(err: SigningError) -> Self {
        match err {
            SigningError::Timeout(ms) => CustodyError::Timeout(ms),
            SigningError::Vault(e) => e.into(),
            other => CustodyError::SigningFailure(other.to_string()),
        }
    }
}

/// Result type alias using CustodyError
pub type Result<T> = std::result::Result<T, CustodyError>;
