//! Structured Logging for the Custody Core
//!
//! Provides structured logging with:
//! - JSON output for log aggregation on mainnet
//! - Correlation IDs tying sweep/withdrawal events to their records
//! - Security events for integrity failures that need an operator
//!
//! # Usage
//!
//! ```rust,ignore
//! use tron_custody::common::logging::{init_logging, LogLevel};
//!
//! init_logging(LogLevel::Info, true)?; // JSON mode for production
//! tracing::info!(target: "custody::sweep", entry_id = %id, "Sweep completed");
//! ```

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

// ============================================================================
// Log Levels
// ============================================================================

/// Application log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

// ============================================================================
// Structured Event Types
// ============================================================================

/// Event categories for structured logging
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Key custody (wallet creation, derivation)
    Custody,
    /// Sweep queue events
    Sweep,
    /// Resource pool events
    Resource,
    /// Withdrawal evaluation and batching
    Withdrawal,
    /// Security events (integrity failures, halts)
    Security,
    /// System events (startup, shutdown)
    System,
}

/// Structured log event
#[derive(Debug, Serialize)]
pub struct LogEvent {
    /// Event timestamp (ISO 8601)
    pub timestamp: String,
    /// Log level
    pub level: String,
    /// Event category
    pub category: EventCategory,
    /// Human-readable message
    pub message: String,
    /// Correlation ID (record id the event belongs to)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Additional structured data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

/// Error details for error events
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    /// Create a new log event
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: format!("{:?}", level).to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            error: None,
        }
    }

    /// Add correlation ID
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Add structured data
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Add error details
    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    /// Render this event as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}",
                self.message
            )
        })
    }
}

// ============================================================================
// Event Helpers
// ============================================================================

/// Log a security-related event
///
/// Integrity failures go through here so an operator alert can key on the
/// `custody::security` target.
pub fn log_security_event(event_type: &str, success: bool, details: serde_json::Value) {
    let level = if success { LogLevel::Info } else { LogLevel::Error };
    let event = LogEvent::new(level, EventCategory::Security, event_type).with_data(
        serde_json::json!({
            "success": success,
            "details": details
        }),
    );

    if success {
        tracing::info!(target: "custody::security", "{}", event.to_json());
    } else {
        tracing::error!(target: "custody::security", "{}", event.to_json());
    }
}

/// Log a sweep lifecycle event
pub fn log_sweep_event(
    event_type: &str,
    entry_id: &str,
    address: &str,
    amount: u64,
    success: bool,
    tx_hash: Option<&str>,
    error: Option<&str>,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(level, EventCategory::Sweep, event_type)
        .with_correlation_id(entry_id)
        .with_data(serde_json::json!({
            "address": address,
            "amount": amount,
            "tx_hash": tx_hash,
            "success": success
        }));

    if let Some(err) = error {
        event = event.with_error("SWEEP_ERROR", err);
    }

    if success {
        tracing::info!(target: "custody::sweep", "{}", event.to_json());
    } else {
        tracing::warn!(target: "custody::sweep", "{}", event.to_json());
    }
}

/// Log a withdrawal event
pub fn log_withdrawal_event(
    event_type: &str,
    request_id: &str,
    amount: u64,
    destination: &str,
    success: bool,
    tx_hash: Option<&str>,
    error: Option<&str>,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Error };
    let mut event = LogEvent::new(level, EventCategory::Withdrawal, event_type)
        .with_correlation_id(request_id)
        .with_data(serde_json::json!({
            "request_id": request_id,
            "amount": amount,
            "destination": destination,
            "tx_hash": tx_hash,
            "success": success
        }));

    if let Some(err) = error {
        event = event.with_error("WITHDRAWAL_ERROR", err);
    }

    if success {
        tracing::info!(target: "custody::withdrawal", "{}", event.to_json());
    } else {
        tracing::error!(target: "custody::withdrawal", "{}", event.to_json());
    }
}

/// Log a resource pool alert
pub fn log_resource_alert(pool_id: &str, status: &str, available_pct: f64, message: &str) {
    let event = LogEvent::new(LogLevel::Warn, EventCategory::Resource, message)
        .with_correlation_id(pool_id)
        .with_data(serde_json::json!({
            "pool_id": pool_id,
            "status": status,
            "available_pct": available_pct
        }));

    tracing::warn!(target: "custody::resource", "{}", event.to_json());
}

// ============================================================================
// Initialization
// ============================================================================

/// Initialize the logging system
///
/// # Arguments
/// * `level` - Minimum log level to output
/// * `json_format` - Use JSON format (recommended for production)
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let level_name = format!("{:?}", level).to_lowercase();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tron_custody={lvl},custody={lvl},custody_worker={lvl}",
            lvl = level_name
        ))
    });

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from CustodyConfig
pub fn init_from_config(config: &super::config::CustodyConfig) -> Result<(), LoggingError> {
    let level = LogLevel::from(config.log_level.as_str());
    let json_format = config.network == super::config::Network::Mainnet;

    init_logging(level, json_format)
}

/// Logging errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

// ============================================================================
// Tests
// ============================================================================
