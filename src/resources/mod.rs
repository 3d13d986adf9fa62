//! Resource Pool Module
//!
//! Energy and bandwidth accounting for collection wallets, with depletion
//! forecasting and alerting.

pub mod alerts;
pub mod monitor;
pub mod prediction;

pub use alerts::{AlertSink, ResourceAlert, TracingAlertSink};
pub use monitor::{RefreshSummary, ResourcePoolMonitor};
pub use prediction::{predict_depletion, MAX_CONFIDENCE};
