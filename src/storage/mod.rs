//! Storage Layer Module
//!
//! Provides persistence for wallets, sweeps, resource pools and withdrawals.
//!
//! This module contains:
//! - Storage trait definitions for abstraction
//! - SQLite implementation shared by every worker process

pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use sqlite::SqliteStore;
pub use traits::{
    CustodyStore, DebitOutcome, EnqueueOutcome, ResourceStore, StorageError, StorageResult,
    SweepStore, WalletStore, WithdrawalStore,
};
