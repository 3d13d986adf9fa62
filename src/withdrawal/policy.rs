//! Withdrawal Policy Engine
//!
//! Pure evaluation of a request against a policy snapshot and a context
//! loaded ahead of time. Nothing here reads a clock or touches storage, so
//! the same inputs always produce the same decision.
//!
//! Hard gates run in order and the first failure short-circuits:
//!
//! 1. policy active                  → `manual_review`
//! 2. auto-approve enabled           → `manual_review`
//! 3. per-transaction limit          → `manual_review`
//! 4. cumulative daily limit         → `daily_limit_exceeded`
//! 5. whitelist membership and caps  → `address_verification`
//!
//! If every gate passes a 0–100 risk score is computed and compared with
//! the policy's risk threshold.

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use crate::types::{string_enum, WhitelistEntry, WithdrawalPolicy, WithdrawalRequest};

const AMOUNT_WEIGHT: u32 = 35;
const NOVELTY_WEIGHT: u32 = 30;
const VELOCITY_WEIGHT: u32 = 20;
const TIME_OF_DAY_WEIGHT: u32 = 15;

/// Recommended follow-up when a hard gate fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    ManualReview,
    DailyLimitExceeded,
    AddressVerification,
}

string_enum!(ReviewAction, "review action", {
    ManualReview => "manual_review",
    DailyLimitExceeded => "daily_limit_exceeded",
    AddressVerification => "address_verification",
});

/// Facts about the requester and destination, loaded before evaluation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    /// Requester's volume already counting toward today's limit
    pub user_daily_total: u64,
    /// Completed withdrawals to this destination before the request
    pub prior_completed_to_destination: u32,
    /// Requester's other requests inside the velocity window
    pub recent_request_count: u32,
    pub whitelist: Option<WhitelistEntry>,
    /// Volume to this destination already counted today
    pub destination_daily_total: u64,
    /// Volume to this destination already counted this month
    pub destination_monthly_total: u64,
}

/// Gate that stopped a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateFailure {
    pub action: ReviewAction,
    pub reason: String,
}

/// Per-factor scores (each 0–100) before weighting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactors {
    pub amount: u8,
    pub novelty: u8,
    pub velocity: u8,
    pub time_of_day: u8,
}

impl RiskFactors {
    /// Weighted total, 0–100
    pub fn score(&self) -> u8 {
        let weighted = self.amount as u32 * AMOUNT_WEIGHT
            + self.novelty as u32 * NOVELTY_WEIGHT
            + self.velocity as u32 * VELOCITY_WEIGHT
            + self.time_of_day as u32 * TIME_OF_DAY_WEIGHT;
        ((weighted + 50) / 100).min(100) as u8
    }
}

/// Outcome of an evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub can_auto_approve: bool,
    /// Set only when every hard gate passed
    pub risk_score: Option<u8>,
    pub factors: Option<RiskFactors>,
    pub gate_failure: Option<GateFailure>,
}

impl PolicyDecision {
    fn blocked(action: ReviewAction, reason: String) -> Self {
        Self {
            can_auto_approve: false,
            risk_score: None,
            factors: None,
            gate_failure: Some(GateFailure { action, reason }),
        }
    }

    /// Why the request was not auto-approved, if it was not
    pub fn review_reason(&self) -> Option<String> {
        match (&self.gate_failure, self.risk_score) {
            (Some(gate), _) => Some(format!("{}: {}", gate.action, gate.reason)),
            (None, Some(score)) if !self.can_auto_approve => {
                Some(format!("manual_review: risk score {} above threshold", score))
            }
            _ => None,
        }
    }
}

/// Stateless evaluator
#[derive(Debug, Clone, Copy, Default)]
pub struct WithdrawalPolicyEngine;

impl WithdrawalPolicyEngine {
    pub fn evaluate(
        &self,
        request: &WithdrawalRequest,
        policy: &WithdrawalPolicy,
        context: &EvaluationContext,
    ) -> PolicyDecision {
        if let Some(failure) = Self::check_gates(request, policy, context) {
            return PolicyDecision::blocked(failure.action, failure.reason);
        }

        let factors = RiskFactors {
            amount: amount_tier(request.amount, policy.per_tx_auto_approve_limit),
            novelty: novelty_risk(context.prior_completed_to_destination),
            velocity: velocity_risk(context.recent_request_count),
            time_of_day: time_of_day_risk(request.created_at.hour()),
        };
        let score = factors.score();

        PolicyDecision {
            can_auto_approve: score <= policy.risk_threshold,
            risk_score: Some(score),
            factors: Some(factors),
            gate_failure: None,
        }
    }

    fn check_gates(
        request: &WithdrawalRequest,
        policy: &WithdrawalPolicy,
        context: &EvaluationContext,
    ) -> Option<GateFailure> {
        let fail = |action, reason: String| Some(GateFailure { action, reason });

        if !policy.is_active {
            return fail(ReviewAction::ManualReview, "withdrawal policy is inactive".into());
        }
        if !policy.auto_approve_enabled {
            return fail(ReviewAction::ManualReview, "auto-approval is disabled".into());
        }
        if request.amount > policy.per_tx_auto_approve_limit {
            return fail(
                ReviewAction::ManualReview,
                format!(
                    "amount {} exceeds per-transaction auto-approve limit {}",
                    request.amount, policy.per_tx_auto_approve_limit
                ),
            );
        }

        let daily = context.user_daily_total.saturating_add(request.amount);
        if daily > policy.daily_auto_approve_limit {
            return fail(
                ReviewAction::DailyLimitExceeded,
                format!(
                    "daily total {} would exceed daily auto-approve limit {}",
                    daily, policy.daily_auto_approve_limit
                ),
            );
        }

        if policy.whitelist_only {
            let entry = match &context.whitelist {
                Some(entry) if entry.is_active => entry,
                _ => {
                    return fail(
                        ReviewAction::AddressVerification,
                        format!("destination {} is not whitelisted", request.destination),
                    )
                }
            };
            if let Some(cap) = entry.daily_limit {
                let total = context.destination_daily_total.saturating_add(request.amount);
                if total > cap {
                    return fail(
                        ReviewAction::AddressVerification,
                        format!("destination daily total {} exceeds whitelist cap {}", total, cap),
                    );
                }
            }
            if let Some(cap) = entry.monthly_limit {
                let total = context.destination_monthly_total.saturating_add(request.amount);
                if total > cap {
                    return fail(
                        ReviewAction::AddressVerification,
                        format!("destination monthly total {} exceeds whitelist cap {}", total, cap),
                    );
                }
            }
        }

        None
    }
}

/// Size relative to the per-transaction limit
fn amount_tier(amount: u64, per_tx_limit: u64) -> u8 {
    if per_tx_limit == 0 {
        return 100;
    }
    let pct = amount as u128 * 100 / per_tx_limit as u128;
    match pct {
        0..=10 => 10,
        11..=25 => 30,
        26..=50 => 50,
        51..=75 => 70,
        _ => 90,
    }
}

/// Unused destinations are the riskiest
fn novelty_risk(prior_completed: u32) -> u8 {
    match prior_completed {
        0 => 100,
        1 => 60,
        2..=4 => 30,
        _ => 10,
    }
}

fn velocity_risk(recent_requests: u32) -> u8 {
    match recent_requests {
        0 => 0,
        1..=2 => 25,
        3..=5 => 60,
        _ => 100,
    }
}

/// UTC hour of the request
fn time_of_day_risk(hour: u32) -> u8 {
    match hour {
        0..=5 => 100,
        6..=7 | 22..=23 => 50,
        _ => 0,
    }
}
