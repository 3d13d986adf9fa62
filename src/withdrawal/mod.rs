//! Withdrawal Module
//!
//! Policy evaluation, request lifecycle and batch dispatch for outgoing
//! withdrawals.

pub mod batch;
pub mod policy;
pub mod service;

pub use batch::{pack, priority_score, BatchCycleSummary, BatchOptimizer, PackingLimits};
pub use policy::{
    EvaluationContext, GateFailure, PolicyDecision, ReviewAction, RiskFactors,
    WithdrawalPolicyEngine,
};
pub use service::{WhitelistSubmission, WithdrawalService, WithdrawalSubmission};
