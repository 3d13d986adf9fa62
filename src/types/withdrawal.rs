//! Withdrawal Types
//!
//! Requests, per-partner policy, whitelist entries and dispatch batches.
//!
//! ```text
//! Request: PENDING → APPROVED → PROCESSING → COMPLETED | FAILED
//!          PENDING → REJECTED
//! Batch:   PENDING → PROCESSING → COMPLETED | PARTIAL_FAILURE | FAILED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::asset::Asset;
use super::new_id;

/// Request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Approved,
    Processing,
    Completed,
    Failed,
    Rejected,
}

string_enum!(WithdrawalStatus, "withdrawal status", {
    Pending => "pending",
    Approved => "approved",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Rejected => "rejected",
});

impl WithdrawalStatus {
    /// Counts toward the requester's daily total
    pub fn counts_toward_limits(&self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Approved | WithdrawalStatus::Processing | WithdrawalStatus::Completed
        )
    }
}

/// Requested dispatch priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalPriority {
    Low,
    Normal,
    High,
    Urgent,
}

string_enum!(WithdrawalPriority, "withdrawal priority", {
    Low => "low",
    Normal => "normal",
    High => "high",
    Urgent => "urgent",
});

impl WithdrawalPriority {
    /// Weight contributed to a batch's priority score
    pub fn weight(&self) -> u32 {
        match self {
            WithdrawalPriority::Low => 1,
            WithdrawalPriority::Normal => 2,
            WithdrawalPriority::High => 4,
            WithdrawalPriority::Urgent => 8,
        }
    }
}

/// A withdrawal request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: String,
    pub partner_id: String,
    /// Requesting user
    pub user_id: String,
    pub amount: u64,
    pub asset: Asset,
    pub destination: String,
    pub status: WithdrawalStatus,
    pub priority: WithdrawalPriority,
    /// 0–100, set once all hard gates pass
    pub risk_score: Option<u8>,
    /// Why the request was held for review
    pub review_reason: Option<String>,
    pub batch_id: Option<String>,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WithdrawalRequest {
    /// Create a new pending request
    pub fn new(
        partner_id: String,
        user_id: String,
        amount: u64,
        asset: Asset,
        destination: String,
        priority: WithdrawalPriority,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id("wdr"),
            partner_id,
            user_id,
            amount,
            asset,
            destination,
            status: WithdrawalStatus::Pending,
            priority,
            risk_score: None,
            review_reason: None,
            batch_id: None,
            tx_hash: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Eligible for the batch optimizer
    pub fn is_batchable(&self) -> bool {
        self.status == WithdrawalStatus::Approved && self.batch_id.is_none()
    }
}

/// Per-partner withdrawal policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalPolicy {
    pub partner_id: String,
    pub is_active: bool,
    pub auto_approve_enabled: bool,
    /// Largest single request auto-approved
    pub per_tx_auto_approve_limit: u64,
    /// Largest cumulative per-user daily total auto-approved
    pub daily_auto_approve_limit: u64,
    /// Highest risk score auto-approved (0–100)
    pub risk_threshold: u8,
    /// Destinations must be whitelisted
    pub whitelist_only: bool,
    /// Max requests per batch
    pub max_batch_size: usize,
    /// Max estimated energy per batch
    pub batch_cost_ceiling: u64,
    pub updated_at: DateTime<Utc>,
}

impl WithdrawalPolicy {
    /// Conservative defaults for a freshly onboarded partner
    pub fn new(partner_id: String, now: DateTime<Utc>) -> Self {
        Self {
            partner_id,
            is_active: true,
            auto_approve_enabled: true,
            per_tx_auto_approve_limit: 1_000_000_000,
            daily_auto_approve_limit: 5_000_000_000,
            risk_threshold: 50,
            whitelist_only: false,
            max_batch_size: 20,
            batch_cost_ceiling: 1_300_000,
            updated_at: now,
        }
    }
}

/// Pre-verified withdrawal destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistEntry {
    pub id: String,
    pub partner_id: String,
    pub address: String,
    pub label: Option<String>,
    /// Cap on completed/approved volume per UTC day
    pub daily_limit: Option<u64>,
    /// Cap on completed/approved volume per UTC month
    pub monthly_limit: Option<u64>,
    pub verified_by: String,
    pub verified_at: DateTime<Utc>,
    pub is_active: bool,
}

impl WhitelistEntry {
    pub fn new(
        partner_id: String,
        address: String,
        verified_by: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id("wl"),
            partner_id,
            address,
            label: None,
            daily_limit: None,
            monthly_limit: None,
            verified_by,
            verified_at: now,
            is_active: true,
        }
    }
}

/// Batch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    /// Some items succeeded, some failed
    PartialFailure,
    /// Every item failed
    Failed,
}

string_enum!(BatchStatus, "batch status", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    PartialFailure => "partial_failure",
    Failed => "failed",
});

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::PartialFailure | BatchStatus::Failed
        )
    }
}

/// Per-item dispatch outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Pending,
    Succeeded,
    Failed,
}

string_enum!(ItemOutcome, "item outcome", {
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
});

/// One request inside a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub request_id: String,
    pub amount: u64,
    pub estimated_cost: u64,
    pub outcome: ItemOutcome,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

/// Group of requests dispatched together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalBatch {
    pub id: String,
    pub partner_id: String,
    pub items: Vec<BatchItem>,
    pub total_amount: u64,
    pub estimated_cost: u64,
    pub status: BatchStatus,
    pub priority_score: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WithdrawalBatch {
    pub fn request_ids(&self) -> Vec<String> {
        self.items.iter().map(|i| i.request_id.clone()).collect()
    }

    /// Terminal status implied by item outcomes
    pub fn settled_status(&self) -> BatchStatus {
        let succeeded = self
            .items
            .iter()
            .filter(|i| i.outcome == ItemOutcome::Succeeded)
            .count();

        if succeeded == self.items.len() {
            BatchStatus::Completed
        } else if succeeded > 0 {
            BatchStatus::PartialFailure
        } else {
            BatchStatus::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(outcome: ItemOutcome) -> BatchItem {
        BatchItem {
            request_id: new_id("wdr"),
            amount: 10,
            estimated_cost: 1,
            outcome,
            tx_hash: None,
            error: None,
        }
    }

    fn batch(items: Vec<BatchItem>) -> WithdrawalBatch {
        let now = Utc::now();
        WithdrawalBatch {
            id: new_id("wdb"),
            partner_id: "p1".to_string(),
            total_amount: items.iter().map(|i| i.amount).sum(),
            estimated_cost: items.iter().map(|i| i.estimated_cost).sum(),
            items,
            status: BatchStatus::Processing,
            priority_score: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_settled_status() {
        let all_ok = batch(vec![item(ItemOutcome::Succeeded), item(ItemOutcome::Succeeded)]);
        assert_eq!(all_ok.settled_status(), BatchStatus::Completed);

        let mixed = batch(vec![item(ItemOutcome::Succeeded), item(ItemOutcome::Failed)]);
        assert_eq!(mixed.settled_status(), BatchStatus::PartialFailure);

        let none_ok = batch(vec![item(ItemOutcome::Failed), item(ItemOutcome::Failed)]);
        assert_eq!(none_ok.settled_status(), BatchStatus::Failed);
    }

    #[test]
    fn test_priority_weights_increase() {
        assert!(WithdrawalPriority::Urgent.weight() > WithdrawalPriority::High.weight());
        assert!(WithdrawalPriority::Low < WithdrawalPriority::Normal);
    }

    #[test]
    fn test_batch_status_strings() {
        assert_eq!(BatchStatus::PartialFailure.to_string(), "partial_failure");
        assert_eq!("partial_failure".parse::<BatchStatus>().unwrap(), BatchStatus::PartialFailure);
    }
}
