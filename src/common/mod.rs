//! Common Infrastructure Module
//!
//! Shared utilities and configuration for the custody core.
//!
//! This module contains:
//! - Configuration loading from environment variables
//! - Structured logging setup
//! - The root error taxonomy

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use config::{
    ConfigError, CustodyConfig, Network, ResourceSettings, SweepSettings, TimeoutSettings,
    WithdrawalSettings,
};
pub use error::{CustodyError, Result};
pub use logging::{
    init_from_config, init_logging, log_resource_alert, log_security_event, log_sweep_event,
    log_withdrawal_event, EventCategory, LogEvent, LogLevel, LoggingError,
};
