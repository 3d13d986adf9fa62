//! Withdrawal Service
//!
//! Loads everything the policy engine needs, applies its decisions to stored
//! requests and manages policies and whitelists.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use std::sync::Arc;
use tracing::info;

use super::policy::{EvaluationContext, PolicyDecision, WithdrawalPolicyEngine};
use crate::common::{log_withdrawal_event, CustodyError, Result, WithdrawalSettings};
use crate::custody::is_valid_address;
use crate::storage::{CustodyStore, StorageError};
use crate::types::{
    Asset, WhitelistEntry, WithdrawalPolicy, WithdrawalPriority, WithdrawalRequest,
    WithdrawalStatus,
};

/// New withdrawal as submitted by a partner
#[derive(Debug, Clone)]
pub struct WithdrawalSubmission {
    pub partner_id: String,
    pub user_id: String,
    pub amount: u64,
    pub asset: Asset,
    pub destination: String,
    pub priority: WithdrawalPriority,
}

/// Whitelist entry as submitted by an operator
#[derive(Debug, Clone)]
pub struct WhitelistSubmission {
    pub partner_id: String,
    pub address: String,
    pub label: Option<String>,
    pub daily_limit: Option<u64>,
    pub monthly_limit: Option<u64>,
    pub verified_by: String,
}

pub struct WithdrawalService {
    store: Arc<dyn CustodyStore>,
    engine: WithdrawalPolicyEngine,
    settings: WithdrawalSettings,
}

impl WithdrawalService {
    pub fn new(store: Arc<dyn CustodyStore>, settings: WithdrawalSettings) -> Self {
        Self {
            store,
            engine: WithdrawalPolicyEngine,
            settings,
        }
    }

    pub async fn get_request(&self, request_id: &str) -> Result<WithdrawalRequest> {
        self.store
            .get_withdrawal(request_id)
            .await?
            .ok_or_else(|| CustodyError::not_found(format!("withdrawal {}", request_id)))
    }

    /// Stored policy, or the defaults for a partner that never set one
    pub async fn policy_for(&self, partner_id: &str) -> Result<WithdrawalPolicy> {
        Ok(self
            .store
            .get_policy(partner_id)
            .await?
            .unwrap_or_else(|| WithdrawalPolicy::new(partner_id.to_string(), Utc::now())))
    }

    /// Persist a new request and run it through the policy
    pub async fn submit(
        &self,
        submission: WithdrawalSubmission,
    ) -> Result<(WithdrawalRequest, PolicyDecision)> {
        if submission.amount == 0 {
            return Err(CustodyError::validation("withdrawal amount must be positive"));
        }
        if !is_valid_address(&submission.destination) {
            return Err(CustodyError::validation(format!(
                "invalid destination address: {}",
                submission.destination
            )));
        }

        let request = WithdrawalRequest::new(
            submission.partner_id,
            submission.user_id,
            submission.amount,
            submission.asset,
            submission.destination,
            submission.priority,
            Utc::now(),
        );
        self.store.insert_withdrawal(&request).await?;

        info!(
            target: "custody::withdrawal",
            request_id = %request.id,
            partner_id = %request.partner_id,
            amount = request.amount,
            "Withdrawal submitted"
        );

        self.review(&request.id).await
    }

    /// Evaluate a stored request without changing it
    pub async fn evaluate_withdrawal(&self, request_id: &str) -> Result<PolicyDecision> {
        let request = self.get_request(request_id).await?;
        let policy = self.policy_for(&request.partner_id).await?;
        let context = self.load_context(&request).await?;
        Ok(self.engine.evaluate(&request, &policy, &context))
    }

    /// Evaluate a pending request and record the decision
    ///
    /// Auto-approvable requests move to APPROVED; the rest stay PENDING with
    /// the review reason attached.
    pub async fn review(&self, request_id: &str) -> Result<(WithdrawalRequest, PolicyDecision)> {
        let mut request = self.get_request(request_id).await?;
        if request.status != WithdrawalStatus::Pending {
            return Err(CustodyError::validation(format!(
                "withdrawal {} is {}, not pending",
                request_id, request.status
            )));
        }

        let policy = self.policy_for(&request.partner_id).await?;
        let context = self.load_context(&request).await?;
        let decision = self.engine.evaluate(&request, &policy, &context);

        request.risk_score = decision.risk_score;
        request.review_reason = decision.review_reason();
        request.updated_at = Utc::now();
        if decision.can_auto_approve {
            request.status = WithdrawalStatus::Approved;
        }
        self.store
            .transition_withdrawal(&request, WithdrawalStatus::Pending)
            .await?;

        log_withdrawal_event(
            if decision.can_auto_approve {
                "withdrawal_auto_approved"
            } else {
                "withdrawal_held_for_review"
            },
            &request.id,
            request.amount,
            &request.destination,
            true,
            None,
            request.review_reason.as_deref(),
        );

        Ok((request, decision))
    }

    /// Operator approval of a held request
    pub async fn approve(&self, request_id: &str, approved_by: &str) -> Result<WithdrawalRequest> {
        let mut request = self.get_request(request_id).await?;
        if request.status != WithdrawalStatus::Pending {
            return Err(CustodyError::validation(format!(
                "withdrawal {} is {}, not pending",
                request_id, request.status
            )));
        }

        request.status = WithdrawalStatus::Approved;
        request.updated_at = Utc::now();
        self.store
            .transition_withdrawal(&request, WithdrawalStatus::Pending)
            .await?;

        info!(
            target: "custody::withdrawal",
            request_id = %request_id,
            approved_by = %approved_by,
            "Withdrawal approved manually"
        );
        Ok(request)
    }

    /// Reject a request that has not been batched
    pub async fn reject(&self, request_id: &str, reason: &str) -> Result<WithdrawalRequest> {
        let mut request = self.get_request(request_id).await?;
        let rejectable = request.status == WithdrawalStatus::Pending || request.is_batchable();
        if !rejectable {
            return Err(CustodyError::validation(format!(
                "withdrawal {} can no longer be rejected",
                request_id
            )));
        }

        let from = request.status;
        request.status = WithdrawalStatus::Rejected;
        request.review_reason = Some(reason.to_string());
        request.updated_at = Utc::now();
        self.store.transition_withdrawal(&request, from).await?;

        info!(target: "custody::withdrawal", request_id = %request_id, reason = %reason, "Withdrawal rejected");
        Ok(request)
    }

    pub async fn set_policy(&self, mut policy: WithdrawalPolicy) -> Result<WithdrawalPolicy> {
        if policy.risk_threshold > 100 {
            return Err(CustodyError::validation("risk threshold must be 0-100"));
        }
        if policy.max_batch_size == 0 {
            return Err(CustodyError::validation("max batch size must be at least 1"));
        }
        if policy.batch_cost_ceiling < self.settings.energy_per_transfer {
            return Err(CustodyError::validation(format!(
                "batch cost ceiling {} cannot fit a single transfer ({})",
                policy.batch_cost_ceiling, self.settings.energy_per_transfer
            )));
        }

        policy.updated_at = Utc::now();
        self.store.upsert_policy(&policy).await?;

        info!(
            target: "custody::withdrawal",
            partner_id = %policy.partner_id,
            per_tx_limit = policy.per_tx_auto_approve_limit,
            daily_limit = policy.daily_auto_approve_limit,
            risk_threshold = policy.risk_threshold,
            whitelist_only = policy.whitelist_only,
            "Withdrawal policy updated"
        );
        Ok(policy)
    }

    pub async fn add_whitelist_entry(&self, submission: WhitelistSubmission) -> Result<WhitelistEntry> {
        if !is_valid_address(&submission.address) {
            return Err(CustodyError::validation(format!(
                "invalid whitelist address: {}",
                submission.address
            )));
        }

        let mut entry = WhitelistEntry::new(
            submission.partner_id,
            submission.address,
            submission.verified_by,
            Utc::now(),
        );
        entry.label = submission.label;
        entry.daily_limit = submission.daily_limit;
        entry.monthly_limit = submission.monthly_limit;

        match self.store.insert_whitelist_entry(&entry).await {
            Ok(()) => {}
            Err(StorageError::Duplicate(_)) => {
                return Err(CustodyError::validation(format!(
                    "{} is already whitelisted",
                    entry.address
                )))
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            target: "custody::withdrawal",
            partner_id = %entry.partner_id,
            address = %entry.address,
            verified_by = %entry.verified_by,
            "Whitelist entry added"
        );
        Ok(entry)
    }

    /// Windows are anchored on the request's own timestamp so a later replay
    /// sees the same history
    async fn load_context(&self, request: &WithdrawalRequest) -> Result<EvaluationContext> {
        let at = request.created_at;
        let (day_start, day_end) = day_bounds(at)?;
        let (month_start, month_end) = month_bounds(at)?;
        let velocity_start = at - ChronoDuration::seconds(self.settings.velocity_window_secs);

        let partner = &request.partner_id;
        let destination = &request.destination;

        Ok(EvaluationContext {
            user_daily_total: self
                .store
                .user_total_between(partner, &request.user_id, day_start, day_end, &request.id)
                .await?,
            prior_completed_to_destination: self
                .store
                .completed_count_to_destination(partner, destination, at)
                .await?,
            recent_request_count: self
                .store
                .user_request_count_between(partner, &request.user_id, velocity_start, at, &request.id)
                .await?,
            whitelist: self.store.get_whitelist_entry(partner, destination).await?,
            destination_daily_total: self
                .store
                .destination_total_between(partner, destination, day_start, day_end, &request.id)
                .await?,
            destination_monthly_total: self
                .store
                .destination_total_between(partner, destination, month_start, month_end, &request.id)
                .await?,
        })
    }
}

fn out_of_range() -> CustodyError {
    CustodyError::validation("timestamp out of range")
}

/// UTC day containing `at`
fn day_bounds(at: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start = at
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .ok_or_else(out_of_range)?
        .and_utc();
    Ok((start, start + ChronoDuration::days(1)))
}

/// UTC calendar month containing `at`
fn month_bounds(at: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let first = |year: i32, month: u32| {
        NaiveDate::from_ymd_opt(year, month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .ok_or_else(out_of_range)
    };
    let (next_year, next_month) = if at.month() == 12 {
        (at.year() + 1, 1)
    } else {
        (at.year(), at.month() + 1)
    };
    Ok((first(at.year(), at.month())?, first(next_year, next_month)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteStore, WithdrawalStore};
    use crate::types::{BatchItem, BatchStatus, ItemOutcome, WithdrawalBatch};
    use crate::withdrawal::policy::ReviewAction;
    use chrono::TimeZone;

    const DEST: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

    fn service() -> (Arc<SqliteStore>, WithdrawalService) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let service = WithdrawalService::new(store.clone(), WithdrawalSettings::default());
        (store, service)
    }

    fn submission(amount: u64) -> WithdrawalSubmission {
        WithdrawalSubmission {
            partner_id: "p1".to_string(),
            user_id: "u1".to_string(),
            amount,
            asset: Asset::Trx,
            destination: DEST.to_string(),
            priority: WithdrawalPriority::Normal,
        }
    }

    fn policy(per_tx: u64, daily: u64) -> WithdrawalPolicy {
        let mut policy = WithdrawalPolicy::new("p1".to_string(), Utc::now());
        policy.per_tx_auto_approve_limit = per_tx;
        policy.daily_auto_approve_limit = daily;
        policy.risk_threshold = 100;
        policy
    }

    #[tokio::test]
    async fn test_over_limit_is_held_with_reason() {
        let (store, service) = service();
        service.set_policy(policy(3_000, 100_000)).await.unwrap();

        let (request, decision) = service.submit(submission(5_000)).await.unwrap();
        assert!(!decision.can_auto_approve);
        assert_eq!(request.status, WithdrawalStatus::Pending);
        assert!(request.review_reason.as_deref().unwrap().contains("per-transaction"));

        let stored = store.get_withdrawal(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.review_reason, request.review_reason);
    }

    #[tokio::test]
    async fn test_small_request_is_auto_approved() {
        let (_, service) = service();
        service.set_policy(policy(3_000, 100_000)).await.unwrap();

        let (request, decision) = service.submit(submission(1_000)).await.unwrap();
        assert!(decision.can_auto_approve);
        assert_eq!(request.status, WithdrawalStatus::Approved);
        assert!(request.risk_score.is_some());
        assert!(request.is_batchable());
    }

    #[tokio::test]
    async fn test_daily_limit_counts_approved_history() {
        let (_, service) = service();
        service.set_policy(policy(3_000, 5_000)).await.unwrap();

        service.submit(submission(3_000)).await.unwrap();
        let (_, second) = service.submit(submission(2_000)).await.unwrap();
        assert!(second.can_auto_approve);

        let (held, third) = service.submit(submission(100)).await.unwrap();
        assert_eq!(
            third.gate_failure.unwrap().action,
            ReviewAction::DailyLimitExceeded
        );
        assert_eq!(held.status, WithdrawalStatus::Pending);
    }

    #[tokio::test]
    async fn test_whitelist_only_flow() {
        let (_, service) = service();
        let mut strict = policy(3_000, 100_000);
        strict.whitelist_only = true;
        service.set_policy(strict).await.unwrap();

        let (_, decision) = service.submit(submission(1_000)).await.unwrap();
        assert_eq!(
            decision.gate_failure.unwrap().action,
            ReviewAction::AddressVerification
        );

        service
            .add_whitelist_entry(WhitelistSubmission {
                partner_id: "p1".to_string(),
                address: DEST.to_string(),
                label: Some("exchange".to_string()),
                daily_limit: None,
                monthly_limit: None,
                verified_by: "ops".to_string(),
            })
            .await
            .unwrap();
        let (request, decision) = service.submit(submission(1_000)).await.unwrap();
        assert!(decision.can_auto_approve);

        let context = service.load_context(&request).await.unwrap();
        assert_eq!(context.whitelist.as_ref().map(|w| w.address.as_str()), Some(DEST));
        assert_eq!(context, service.load_context(&request).await.unwrap());
    }

    #[tokio::test]
    async fn test_evaluate_is_read_only_and_repeatable() {
        let (store, service) = service();
        service.set_policy(policy(3_000, 100_000)).await.unwrap();
        let (request, _) = service.submit(submission(5_000)).await.unwrap();

        let first = service.evaluate_withdrawal(&request.id).await.unwrap();
        let second = service.evaluate_withdrawal(&request.id).await.unwrap();
        assert_eq!(first, second);

        let stored = store.get_withdrawal(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WithdrawalStatus::Pending);
    }

    #[tokio::test]
    async fn test_manual_approve_and_reject() {
        let (_, service) = service();
        service.set_policy(policy(3_000, 100_000)).await.unwrap();

        let (held, _) = service.submit(submission(5_000)).await.unwrap();
        let approved = service.approve(&held.id, "ops").await.unwrap();
        assert_eq!(approved.status, WithdrawalStatus::Approved);
        assert!(service.approve(&held.id, "ops").await.is_err());

        let rejected = service.reject(&held.id, "customer request").await.unwrap();
        assert_eq!(rejected.status, WithdrawalStatus::Rejected);
        assert!(service.reject(&held.id, "again").await.is_err());
    }

    #[tokio::test]
    async fn test_batched_request_cannot_be_rejected() {
        let (store, service) = service();
        service.set_policy(policy(3_000, 100_000)).await.unwrap();
        let (request, _) = service.submit(submission(1_000)).await.unwrap();

        let batch = WithdrawalBatch {
            id: "wb_1".to_string(),
            partner_id: "p1".to_string(),
            items: vec![BatchItem {
                request_id: request.id.clone(),
                amount: request.amount,
                estimated_cost: 65_000,
                outcome: ItemOutcome::Pending,
                tx_hash: None,
                error: None,
            }],
            total_amount: request.amount,
            estimated_cost: 65_000,
            status: BatchStatus::Pending,
            priority_score: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.insert_batch(&batch).await.unwrap();

        assert!(matches!(
            service.reject(&request.id, "too late").await,
            Err(CustodyError::Validation(_))
        ));
        let stored = store.get_withdrawal(&request.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WithdrawalStatus::Approved);
        assert_eq!(stored.batch_id.as_deref(), Some("wb_1"));
    }

    #[tokio::test]
    async fn test_input_validation() {
        let (_, service) = service();

        assert!(matches!(
            service.submit(submission(0)).await,
            Err(CustodyError::Validation(_))
        ));
        let mut bad = submission(10);
        bad.destination = "not-an-address".to_string();
        assert!(matches!(service.submit(bad).await, Err(CustodyError::Validation(_))));

        let mut zero_batch = policy(1, 1);
        zero_batch.max_batch_size = 0;
        assert!(service.set_policy(zero_batch).await.is_err());
    }

    #[test]
    fn test_calendar_bounds() {
        let at = Utc.with_ymd_and_hms(2024, 12, 31, 18, 0, 0).unwrap();
        let (day_start, day_end) = day_bounds(at).unwrap();
        assert_eq!(day_start, Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap());
        assert_eq!(day_end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());

        let (month_start, month_end) = month_bounds(at).unwrap();
        assert_eq!(month_start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(month_end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }
}
