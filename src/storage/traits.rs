//! Storage Trait Definitions
//!
//! Abstract persistence interfaces for custody state. The invariants that
//! must hold across worker instances live behind these traits:
//!
//! - `reserve_next_index` is atomic; an index is never handed out twice
//! - at most one sweep entry per address is QUEUED/PROCESSING
//! - `debit_resource` checks, debits and logs in one transaction
//! - a request joins at most one batch

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::types::{
    BatchItem, BatchStatus, DepositAddress, MasterWallet, PoolSnapshot, ResourceKind, ResourcePool,
    ResourceUsageEntry, SweepQueueEntry, SweepRecord, SweepStatus, WhitelistEntry,
    WithdrawalBatch, WithdrawalPolicy, WithdrawalRequest, WithdrawalStatus,
};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Outcome of an atomic resource debit
#[derive(Debug, Clone)]
pub enum DebitOutcome {
    /// Debited; the pool as persisted afterwards
    Debited(ResourcePool),
    /// Not enough left; nothing was written
    Insufficient { available: u64 },
}

/// Outcome of an idempotent enqueue
#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub entry: SweepQueueEntry,
    /// False when an active entry already existed
    pub created: bool,
}

/// Master wallet and deposit address persistence
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Insert a master wallet; `Duplicate` if the partner already has one
    async fn insert_master_wallet(&self, wallet: &MasterWallet) -> StorageResult<()>;

    async fn get_master_wallet(&self, partner_id: &str) -> StorageResult<Option<MasterWallet>>;

    async fn get_master_wallet_by_id(&self, id: &str) -> StorageResult<Option<MasterWallet>>;

    async fn get_master_wallet_by_collection_address(
        &self,
        address: &str,
    ) -> StorageResult<Option<MasterWallet>>;

    /// Atomically bump and return the wallet's last issued index
    async fn reserve_next_index(&self, wallet_id: &str) -> StorageResult<u32>;

    async fn set_wallet_halted(&self, wallet_id: &str, halted: bool) -> StorageResult<()>;

    /// Insert a deposit address; `Duplicate` on index or address reuse
    async fn insert_deposit_address(&self, address: &DepositAddress) -> StorageResult<()>;

    async fn get_deposit_address(&self, id: &str) -> StorageResult<Option<DepositAddress>>;

    async fn get_deposit_address_by_address(
        &self,
        address: &str,
    ) -> StorageResult<Option<DepositAddress>>;

    /// The user's active deposit address under a partner, if any
    async fn find_active_address_for_user(
        &self,
        partner_id: &str,
        user_id: &str,
    ) -> StorageResult<Option<DepositAddress>>;

    /// Active and monitored addresses, optionally for one partner
    async fn list_monitored_addresses(
        &self,
        partner_id: Option<&str>,
    ) -> StorageResult<Vec<DepositAddress>>;

    async fn update_address_flags(
        &self,
        id: &str,
        is_active: bool,
        is_monitored: bool,
    ) -> StorageResult<()>;

    /// Add to the received total and return the updated record
    async fn add_received(&self, id: &str, amount: u64) -> StorageResult<DepositAddress>;
}

/// Sweep queue and sweep log persistence
#[async_trait]
pub trait SweepStore: Send + Sync {
    /// Insert unless the address already has an active entry, in which case
    /// that entry is returned
    async fn enqueue_sweep(&self, entry: &SweepQueueEntry) -> StorageResult<EnqueueOutcome>;

    async fn get_sweep_entry(&self, id: &str) -> StorageResult<Option<SweepQueueEntry>>;

    /// Atomically claim the next due entry (QUEUED → PROCESSING)
    async fn claim_next_sweep(&self, now: DateTime<Utc>) -> StorageResult<Option<SweepQueueEntry>>;

    /// PROCESSING → QUEUED with a new schedule; the expiry moves with the
    /// schedule so the entry keeps its original window
    async fn requeue_sweep(
        &self,
        id: &str,
        scheduled_at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<&str>,
    ) -> StorageResult<()>;

    /// PROCESSING → COMPLETED, append the record and add to the swept total
    async fn complete_sweep(&self, entry_id: &str, record: &SweepRecord) -> StorageResult<()>;

    /// PROCESSING → FAILED and append the failure record
    async fn fail_sweep(
        &self,
        entry_id: &str,
        attempts: u32,
        record: &SweepRecord,
    ) -> StorageResult<()>;

    /// QUEUED → CANCELLED; false if the entry was not QUEUED
    async fn cancel_sweep(&self, id: &str, now: DateTime<Utc>) -> StorageResult<bool>;

    /// Mark overdue QUEUED entries EXPIRED; returns how many
    async fn expire_sweeps(&self, now: DateTime<Utc>) -> StorageResult<u64>;

    /// PROCESSING entries not touched since `cutoff`
    async fn stale_sweeps(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<SweepQueueEntry>>;

    async fn active_sweep_for_address(
        &self,
        deposit_address_id: &str,
    ) -> StorageResult<Option<SweepQueueEntry>>;

    async fn count_sweeps_by_status(&self) -> StorageResult<HashMap<SweepStatus, u64>>;

    async fn sweep_records_for_address(
        &self,
        deposit_address_id: &str,
    ) -> StorageResult<Vec<SweepRecord>>;
}

/// Resource pool persistence
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn insert_pool(&self, pool: &ResourcePool) -> StorageResult<()>;

    async fn get_pool(&self, id: &str) -> StorageResult<Option<ResourcePool>>;

    async fn get_pool_by_partner(&self, partner_id: &str) -> StorageResult<Option<ResourcePool>>;

    async fn list_pools(&self) -> StorageResult<Vec<ResourcePool>>;

    /// Persist balances, status, forecast and alert bookkeeping
    async fn save_pool(&self, pool: &ResourcePool) -> StorageResult<()>;

    /// Highest usage-log id for the pool, 0 if none
    async fn usage_watermark(&self, pool_id: &str) -> StorageResult<i64>;

    /// Replace balances and stake with a ledger snapshot, re-applying debits
    /// logged after `after_usage_id`, in one transaction
    async fn apply_snapshot(
        &self,
        pool_id: &str,
        snapshot: &PoolSnapshot,
        after_usage_id: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<ResourcePool>;

    /// Persist forecast, refresh baseline and alert bookkeeping only
    async fn save_refresh_state(&self, pool: &ResourcePool) -> StorageResult<()>;

    /// Check-and-debit plus usage-log append in one transaction
    async fn debit_resource(
        &self,
        pool_id: &str,
        kind: ResourceKind,
        amount: u64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<DebitOutcome>;

    async fn usage_since(
        &self,
        pool_id: &str,
        kind: ResourceKind,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<ResourceUsageEntry>>;
}

/// Withdrawal, policy, whitelist and batch persistence
#[async_trait]
pub trait WithdrawalStore: Send + Sync {
    async fn insert_withdrawal(&self, request: &WithdrawalRequest) -> StorageResult<()>;

    async fn get_withdrawal(&self, id: &str) -> StorageResult<Option<WithdrawalRequest>>;

    /// Persist status, risk score, review reason, tx hash and error, only if
    /// the stored request is still in `from` with the same batch assignment;
    /// `InvalidTransition` otherwise
    async fn transition_withdrawal(
        &self,
        request: &WithdrawalRequest,
        from: WithdrawalStatus,
    ) -> StorageResult<()>;

    /// Sum of the user's requests counting toward limits in `[since, until)`,
    /// excluding `exclude_id`
    async fn user_total_between(
        &self,
        partner_id: &str,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude_id: &str,
    ) -> StorageResult<u64>;

    /// Completed withdrawals to `destination` created before `before`
    async fn completed_count_to_destination(
        &self,
        partner_id: &str,
        destination: &str,
        before: DateTime<Utc>,
    ) -> StorageResult<u32>;

    /// Requests by the user created in `[since, until)`, excluding `exclude_id`
    async fn user_request_count_between(
        &self,
        partner_id: &str,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude_id: &str,
    ) -> StorageResult<u32>;

    /// Volume to a destination counting toward limits in `[since, until)`
    async fn destination_total_between(
        &self,
        partner_id: &str,
        destination: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude_id: &str,
    ) -> StorageResult<u64>;

    async fn list_withdrawals_by_status(
        &self,
        partner_id: &str,
        status: WithdrawalStatus,
    ) -> StorageResult<Vec<WithdrawalRequest>>;

    /// APPROVED requests without a batch
    async fn list_batchable(&self, partner_id: &str) -> StorageResult<Vec<WithdrawalRequest>>;

    async fn partners_with_batchable(&self) -> StorageResult<Vec<String>>;

    async fn upsert_policy(&self, policy: &WithdrawalPolicy) -> StorageResult<()>;

    async fn get_policy(&self, partner_id: &str) -> StorageResult<Option<WithdrawalPolicy>>;

    async fn insert_whitelist_entry(&self, entry: &WhitelistEntry) -> StorageResult<()>;

    async fn get_whitelist_entry(
        &self,
        partner_id: &str,
        address: &str,
    ) -> StorageResult<Option<WhitelistEntry>>;

    /// Insert the batch and stamp its id on every request; `Duplicate` if any
    /// request already belongs to a batch
    async fn insert_batch(&self, batch: &WithdrawalBatch) -> StorageResult<()>;

    async fn get_batch(&self, id: &str) -> StorageResult<Option<WithdrawalBatch>>;

    async fn list_batches_by_status(&self, status: BatchStatus)
        -> StorageResult<Vec<WithdrawalBatch>>;

    /// PENDING → PROCESSING, marking its requests PROCESSING; false if the
    /// batch was not PENDING
    async fn claim_batch(&self, id: &str, now: DateTime<Utc>) -> StorageResult<bool>;

    /// PROCESSING → PENDING with requests back to APPROVED; used when the
    /// batch could not reserve resources and never dispatched
    async fn release_batch(&self, id: &str, now: DateTime<Utc>) -> StorageResult<()>;

    /// Persist one item outcome and the matching request status together
    async fn record_batch_item(
        &self,
        batch_id: &str,
        item: &BatchItem,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn finish_batch(
        &self,
        id: &str,
        status: BatchStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Settle a PROCESSING batch whose dispatch stopped: items still pending
    /// fail with `error` along with their requests, recorded outcomes stay,
    /// and the batch takes its settled status
    async fn abandon_batch(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<WithdrawalBatch>;

    /// `abandon_batch` for every PROCESSING batch not touched since `cutoff`
    async fn reclaim_stale_batches(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<WithdrawalBatch>>;
}

/// Everything the custody core persists
pub trait CustodyStore: WalletStore + SweepStore + ResourceStore + WithdrawalStore {}

impl<T> CustodyStore for T where T: WalletStore + SweepStore + ResourceStore + WithdrawalStore {}
