//! Resource alerts
//!
//! Only severity-increasing transitions alert. Recoveries are silent, and a
//! level that already fired inside the dedup window is not repeated.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::common::log_resource_alert;
use crate::types::{ResourcePool, ResourceStatus};

/// Alert raised for a pool whose status worsened
#[derive(Debug, Clone, Serialize)]
pub struct ResourceAlert {
    pub pool_id: String,
    pub partner_id: String,
    pub previous: ResourceStatus,
    pub status: ResourceStatus,
    pub energy_available_pct: f64,
    pub raised_at: DateTime<Utc>,
}

impl ResourceAlert {
    pub fn message(&self) -> String {
        format!(
            "Resource pool for {} moved {} → {} ({:.1}% energy available)",
            self.partner_id, self.previous, self.status, self.energy_available_pct
        )
    }
}

/// Delivery channel for alerts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &ResourceAlert);
}

/// Writes alerts to the structured log
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn deliver(&self, alert: &ResourceAlert) {
        log_resource_alert(
            &alert.pool_id,
            alert.status.as_str(),
            alert.energy_available_pct,
            &alert.message(),
        );
    }
}

/// Decide whether moving from `previous` to `next` alerts, given when each
/// level last fired on the pool
pub fn should_alert(
    pool: &ResourcePool,
    previous: ResourceStatus,
    next: ResourceStatus,
    now: DateTime<Utc>,
    dedup_window: Duration,
) -> bool {
    if next.severity() <= previous.severity() {
        return false;
    }
    match pool.alert_marks.last(next) {
        Some(at) => now - at >= dedup_window,
        None => true,
    }
}
