//! Sweep Module
//!
//! Consolidates deposit balances into the partner's collection wallet.

pub mod scheduler;

pub use scheduler::{CycleSummary, SweepOutcome, SweepScheduler};
