//! Sweep Queue Types
//!
//! Queue entries move through:
//!
//! ```text
//! QUEUED → PROCESSING → COMPLETED | FAILED
//! QUEUED → EXPIRED | CANCELLED
//! ```
//!
//! A failed attempt returns PROCESSING → QUEUED until the attempt budget is
//! spent.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::asset::Asset;
use super::new_id;

/// Queue lane; higher lanes are drained first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    Normal,
    Priority,
    Emergency,
}

string_enum!(QueueType, "queue type", {
    Normal => "normal",
    Priority => "priority",
    Emergency => "emergency",
});

impl QueueType {
    /// Dequeue priority (higher first)
    pub fn priority(&self) -> u8 {
        match self {
            QueueType::Normal => 1,
            QueueType::Priority => 5,
            QueueType::Emergency => 10,
        }
    }
}

/// Status of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    /// Waiting for a worker
    Queued,
    /// Claimed by a worker; must reach a terminal state
    Processing,
    Completed,
    /// Attempt budget spent
    Failed,
    /// Not consumed before its expiry
    Expired,
    /// Withdrawn while still queued
    Cancelled,
}

string_enum!(SweepStatus, "sweep status", {
    Queued => "queued",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Expired => "expired",
    Cancelled => "cancelled",
});

impl SweepStatus {
    /// At most one entry per address may be in an active state
    pub fn is_active(&self) -> bool {
        matches!(self, SweepStatus::Queued | SweepStatus::Processing)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Valid state machine edges
    pub fn can_transition_to(&self, next: SweepStatus) -> bool {
        use SweepStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Expired)
                | (Queued, Cancelled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Queued)
        )
    }
}

/// A unit of sweep work for one deposit address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepQueueEntry {
    pub id: String,
    pub deposit_address_id: String,
    pub queue_type: QueueType,
    pub status: SweepStatus,
    /// Amount expected at enqueue time (informational)
    pub expected_amount: u64,
    /// Failed attempts so far
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Not dequeued before this time
    pub scheduled_at: DateTime<Utc>,
    /// QUEUED entries past this time expire
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SweepQueueEntry {
    /// Create a new queued entry due immediately
    pub fn new(
        deposit_address_id: String,
        queue_type: QueueType,
        expected_amount: u64,
        now: DateTime<Utc>,
        expiry: Duration,
    ) -> Self {
        Self {
            id: new_id("swq"),
            deposit_address_id,
            queue_type,
            status: SweepStatus::Queued,
            expected_amount,
            attempts: 0,
            last_error: None,
            scheduled_at: now,
            expires_at: now + expiry,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn priority(&self) -> u8 {
        self.queue_type.priority()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == SweepStatus::Queued && now >= self.expires_at
    }

    /// Queued, scheduled and not expired
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SweepStatus::Queued && self.scheduled_at <= now && !self.is_expired(now)
    }
}

/// Outcome recorded in the sweep log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepRecordStatus {
    Completed,
    Failed,
}

string_enum!(SweepRecordStatus, "sweep record status", {
    Completed => "completed",
    Failed => "failed",
});

/// Immutable sweep log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepRecord {
    pub id: String,
    pub queue_entry_id: String,
    pub deposit_address_id: String,
    pub from_address: String,
    pub to_address: String,
    pub amount: u64,
    pub asset: Asset,
    pub tx_hash: Option<String>,
    pub batch_id: Option<String>,
    pub status: SweepRecordStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SweepRecord {
    /// Record a broadcast sweep
    pub fn completed(
        entry: &SweepQueueEntry,
        from_address: &str,
        to_address: &str,
        amount: u64,
        asset: Asset,
        tx_hash: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id("swr"),
            queue_entry_id: entry.id.clone(),
            deposit_address_id: entry.deposit_address_id.clone(),
            from_address: from_address.to_string(),
            to_address: to_address.to_string(),
            amount,
            asset,
            tx_hash: Some(tx_hash),
            batch_id: None,
            status: SweepRecordStatus::Completed,
            error: None,
            created_at: now,
        }
    }

    /// Record a sweep that exhausted its attempts
    pub fn failed(
        entry: &SweepQueueEntry,
        from_address: &str,
        to_address: &str,
        amount: u64,
        asset: Asset,
        error: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id("swr"),
            queue_entry_id: entry.id.clone(),
            deposit_address_id: entry.deposit_address_id.clone(),
            from_address: from_address.to_string(),
            to_address: to_address.to_string(),
            amount,
            asset,
            tx_hash: None,
            batch_id: None,
            status: SweepRecordStatus::Failed,
            error: Some(error),
            created_at: now,
        }
    }
}
