//! TRON Custody Core
//!
//! Multi-tenant custody for TRX and TRC-20 deposits:
//!
//! 1. **Key Custody Vault** - Per-partner master seeds sealed at rest, HD
//!    derivation of deposit addresses
//! 2. **Deposit Address Registry** - Address bookkeeping and sweep eligibility
//! 3. **Resource Pool Monitor** - Energy/bandwidth tracking, alerts and
//!    depletion forecasts
//! 4. **Sweep Scheduler** - Moves deposits into the partner collection wallet
//! 5. **Withdrawal Policy Engine** - Hard gates and risk scoring for
//!    auto-approval
//! 6. **Batch Optimizer** - Packs approved withdrawals and dispatches them
//!
//! Every component shares one `CustodyStore`, so several worker processes can
//! run against the same database.

pub mod common;
pub mod core;
pub mod custody;
pub mod ledger;
pub mod registry;
pub mod resources;
pub mod signing;
pub mod storage;
pub mod sweep;
pub mod types;
pub mod withdrawal;

// Re-exports: facade and configuration
pub use crate::core::{Collaborators, CustodyCore};
pub use common::{CustodyConfig, CustodyError, Result};

// Re-exports: components
pub use custody::{KeyCustodyVault, SealingKey};
pub use ledger::{LedgerClient, TransactionRelay, TronGridClient};
pub use registry::DepositAddressRegistry;
pub use resources::{AlertSink, ResourcePoolMonitor, TracingAlertSink};
pub use signing::{SigningError, SigningGateway, VaultSigningGateway};
pub use storage::{CustodyStore, SqliteStore};
pub use sweep::SweepScheduler;
pub use withdrawal::{
    BatchOptimizer, PolicyDecision, WithdrawalPolicyEngine, WithdrawalService,
    WithdrawalSubmission,
};
