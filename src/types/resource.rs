//! Resource Pool Types
//!
//! Energy and bandwidth accounting for a collection wallet. Status follows a
//! severity ladder:
//!
//! ```text
//! SUFFICIENT → WARNING → CRITICAL → DEPLETED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::new_id;

/// Which resource a debit or snapshot refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Energy,
    Bandwidth,
}

string_enum!(ResourceKind, "resource kind", {
    Energy => "energy",
    Bandwidth => "bandwidth",
});

/// Pool health; variant order is severity order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    Sufficient,
    Warning,
    Critical,
    Depleted,
}

string_enum!(ResourceStatus, "resource status", {
    Sufficient => "SUFFICIENT",
    Warning => "WARNING",
    Critical => "CRITICAL",
    Depleted => "DEPLETED",
});

impl ResourceStatus {
    pub fn severity(&self) -> u8 {
        *self as u8
    }
}

/// Percentage thresholds of available resource
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// At or below this percentage the pool is WARNING
    pub warning_pct: f64,
    /// At or below this percentage the pool is CRITICAL
    pub critical_pct: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning_pct: 30.0,
            critical_pct: 10.0,
        }
    }
}

impl Thresholds {
    /// Classify a balance against these thresholds
    pub fn classify(&self, balance: &ResourceBalance) -> ResourceStatus {
        if balance.total == 0 || balance.available == 0 {
            return ResourceStatus::Depleted;
        }
        let pct = balance.available_pct();
        if pct <= self.critical_pct {
            ResourceStatus::Critical
        } else if pct <= self.warning_pct {
            ResourceStatus::Warning
        } else {
            ResourceStatus::Sufficient
        }
    }
}

/// Total/used/available triple; `available + used == total` always holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBalance {
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

impl ResourceBalance {
    /// Build from a ledger snapshot; usage above the limit is clamped
    pub fn new(total: u64, used: u64) -> Self {
        let used = used.min(total);
        Self {
            total,
            used,
            available: total - used,
        }
    }

    pub fn available_pct(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.available as f64 / self.total as f64 * 100.0
    }

    /// Debit `amount`, or `None` if not enough is available
    pub fn debit(&self, amount: u64) -> Option<Self> {
        if self.available < amount {
            return None;
        }
        Some(Self {
            total: self.total,
            used: self.used + amount,
            available: self.available - amount,
        })
    }

    /// Debit as much of `amount` as is available
    pub fn debit_saturating(&self, amount: u64) -> Self {
        Self::new(self.total, self.used.saturating_add(amount))
    }

    pub fn is_consistent(&self) -> bool {
        self.available + self.used == self.total
    }
}

/// Native coin frozen to generate resources (sun)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenStake {
    pub for_energy: u64,
    pub for_bandwidth: u64,
}

impl FrozenStake {
    pub fn total(&self) -> u64 {
        self.for_energy + self.for_bandwidth
    }
}

/// Linear depletion forecast derived from the usage log
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DepletionForecast {
    /// Average energy consumed per day over the history window
    pub daily_average_usage: u64,
    /// None when there is no measurable consumption
    pub predicted_depletion: Option<DateTime<Utc>>,
    /// 0.0 – MAX_CONFIDENCE, grows with available history
    pub confidence: f64,
}

/// When each alert level last fired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertMarks {
    pub warning: Option<DateTime<Utc>>,
    pub critical: Option<DateTime<Utc>>,
    pub depleted: Option<DateTime<Utc>>,
}

impl AlertMarks {
    pub fn last(&self, level: ResourceStatus) -> Option<DateTime<Utc>> {
        match level {
            ResourceStatus::Sufficient => None,
            ResourceStatus::Warning => self.warning,
            ResourceStatus::Critical => self.critical,
            ResourceStatus::Depleted => self.depleted,
        }
    }

    pub fn mark(&mut self, level: ResourceStatus, at: DateTime<Utc>) {
        match level {
            ResourceStatus::Sufficient => {}
            ResourceStatus::Warning => self.warning = Some(at),
            ResourceStatus::Critical => self.critical = Some(at),
            ResourceStatus::Depleted => self.depleted = Some(at),
        }
    }
}

/// Balances and stake read from the ledger for one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub energy: ResourceBalance,
    pub bandwidth: ResourceBalance,
    pub frozen: FrozenStake,
}

/// Resource pool for one collection wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePool {
    pub id: String,
    pub partner_id: String,
    pub collection_address: String,
    pub energy: ResourceBalance,
    pub bandwidth: ResourceBalance,
    pub frozen: FrozenStake,
    pub thresholds: Thresholds,
    pub status: ResourceStatus,
    pub forecast: DepletionForecast,
    /// Status as last classified by a refresh; the alert baseline.
    /// Debits move `status` but never this.
    pub refreshed_status: Option<ResourceStatus>,
    /// Level of the most recent alert
    pub last_alert_status: Option<ResourceStatus>,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub alert_marks: AlertMarks,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourcePool {
    /// Create an empty pool awaiting its first refresh
    pub fn new(
        partner_id: String,
        collection_address: String,
        thresholds: Thresholds,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id("pool"),
            partner_id,
            collection_address,
            energy: ResourceBalance::default(),
            bandwidth: ResourceBalance::default(),
            frozen: FrozenStake::default(),
            thresholds,
            status: ResourceStatus::Depleted,
            forecast: DepletionForecast::default(),
            refreshed_status: None,
            last_alert_status: None,
            last_alert_at: None,
            alert_marks: AlertMarks::default(),
            last_checked_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn balance(&self, kind: ResourceKind) -> &ResourceBalance {
        match kind {
            ResourceKind::Energy => &self.energy,
            ResourceKind::Bandwidth => &self.bandwidth,
        }
    }

    pub fn balance_mut(&mut self, kind: ResourceKind) -> &mut ResourceBalance {
        match kind {
            ResourceKind::Energy => &mut self.energy,
            ResourceKind::Bandwidth => &mut self.bandwidth,
        }
    }

    /// Worse of the energy and bandwidth classifications
    pub fn compute_status(&self) -> ResourceStatus {
        self.thresholds
            .classify(&self.energy)
            .max(self.thresholds.classify(&self.bandwidth))
    }
}

/// Append-only consumption record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsageEntry {
    pub id: i64,
    pub pool_id: String,
    pub kind: ResourceKind,
    pub amount: u64,
    /// Free-form reason, e.g. `sweep:<entry>` or `batch:<id>`
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_clamps_overuse() {
        let balance = ResourceBalance::new(1_000, 1_500);
        assert_eq!(balance.available, 0);
        assert_eq!(balance.used, 1_000);
        assert!(balance.is_consistent());
    }

    #[test]
    fn test_debit_keeps_invariant() {
        let balance = ResourceBalance::new(10_000, 2_000);
        let after = balance.debit(3_000).unwrap();
        assert_eq!(after.available, 5_000);
        assert!(after.is_consistent());
        assert!(after.debit(5_001).is_none());

        let drained = after.debit_saturating(9_000);
        assert_eq!(drained.available, 0);
        assert!(drained.is_consistent());
    }

    #[test]
    fn test_alert_marks_per_level() {
        let now = Utc::now();
        let mut marks = AlertMarks::default();
        marks.mark(ResourceStatus::Critical, now);
        marks.mark(ResourceStatus::Sufficient, now);

        assert_eq!(marks.last(ResourceStatus::Critical), Some(now));
        assert_eq!(marks.last(ResourceStatus::Warning), None);
        assert_eq!(marks.last(ResourceStatus::Sufficient), None);
    }

    #[test]
    fn test_threshold_classification() {
        let t = Thresholds::default();
        assert_eq!(t.classify(&ResourceBalance::new(10_000, 9_500)), ResourceStatus::Critical);
        assert_eq!(t.classify(&ResourceBalance::new(10_000, 7_000)), ResourceStatus::Warning);
        assert_eq!(t.classify(&ResourceBalance::new(10_000, 1_000)), ResourceStatus::Sufficient);
        assert_eq!(t.classify(&ResourceBalance::new(10_000, 10_000)), ResourceStatus::Depleted);
        assert_eq!(t.classify(&ResourceBalance::new(0, 0)), ResourceStatus::Depleted);
    }

    #[test]
    fn test_severity_order() {
        assert!(ResourceStatus::Critical > ResourceStatus::Warning);
        assert!(ResourceStatus::Depleted > ResourceStatus::Critical);
        assert_eq!(ResourceStatus::Sufficient.severity(), 0);
    }

    #[test]
    fn test_pool_status_is_worst_of_both() {
        let mut pool = ResourcePool::new(
            "p1".to_string(),
            "Taddr".to_string(),
            Thresholds::default(),
            Utc::now(),
        );
        pool.energy = ResourceBalance::new(10_000, 0);
        pool.bandwidth = ResourceBalance::new(5_000, 4_000);
        assert_eq!(pool.compute_status(), ResourceStatus::Warning);
    }
}
