//! Resource Pool Monitor
//!
//! Keeps each collection wallet's energy/bandwidth pool in step with the
//! ledger, classifies it against its thresholds, forecasts depletion and
//! raises alerts. `consume` is the only path that debits a pool.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::alerts::{should_alert, AlertSink, ResourceAlert};
use super::prediction::predict_depletion;
use crate::common::{CustodyError, ResourceSettings, Result};
use crate::ledger::{with_timeout, LedgerClient};
use crate::storage::{CustodyStore, DebitOutcome};
use crate::types::{PoolSnapshot, ResourceKind, ResourcePool, ResourceStatus, Thresholds};

/// Monitor over every registered pool
pub struct ResourcePoolMonitor {
    store: Arc<dyn CustodyStore>,
    ledger: Arc<dyn LedgerClient>,
    alerts: Arc<dyn AlertSink>,
    settings: ResourceSettings,
    ledger_timeout: Duration,
    running: Arc<RwLock<bool>>,
}

/// Result of one refresh pass
#[derive(Debug, Default, Clone)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
    pub alerts: usize,
}

impl std::fmt::Display for RefreshSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "refreshed: {}, failed: {}, alerts: {}",
            self.refreshed, self.failed, self.alerts
        )
    }
}

impl ResourcePoolMonitor {
    pub fn new(
        store: Arc<dyn CustodyStore>,
        ledger: Arc<dyn LedgerClient>,
        alerts: Arc<dyn AlertSink>,
        settings: ResourceSettings,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            alerts,
            settings,
            ledger_timeout,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Thresholds from configuration
    pub fn default_thresholds(&self) -> Thresholds {
        Thresholds {
            warning_pct: self.settings.warning_pct,
            critical_pct: self.settings.critical_pct,
        }
    }

    /// Register the pool for a partner's collection wallet
    ///
    /// Returns the existing pool if the partner already has one.
    pub async fn register_pool(
        &self,
        partner_id: &str,
        collection_address: &str,
        thresholds: Option<Thresholds>,
    ) -> Result<ResourcePool> {
        let thresholds = thresholds.unwrap_or_else(|| self.default_thresholds());
        validate_thresholds(&thresholds)?;

        if let Some(existing) = self.store.get_pool_by_partner(partner_id).await? {
            return Ok(existing);
        }

        let pool = ResourcePool::new(
            partner_id.to_string(),
            collection_address.to_string(),
            thresholds,
            Utc::now(),
        );
        self.store.insert_pool(&pool).await?;

        info!(
            target: "custody::resource",
            pool_id = %pool.id,
            partner_id = %partner_id,
            address = %collection_address,
            "Registered resource pool"
        );

        Ok(pool)
    }

    async fn load(&self, pool_id: &str) -> Result<ResourcePool> {
        self.store
            .get_pool(pool_id)
            .await?
            .ok_or_else(|| CustodyError::not_found(format!("resource pool {}", pool_id)))
    }

    /// Pool for a partner
    pub async fn pool_status(&self, partner_id: &str) -> Result<ResourcePool> {
        self.store
            .get_pool_by_partner(partner_id)
            .await?
            .ok_or_else(|| CustodyError::not_found(format!("resource pool for {}", partner_id)))
    }

    /// Pull a fresh snapshot from the ledger and recompute status, forecast
    /// and alerts
    ///
    /// The snapshot is applied in one storage transaction that re-applies
    /// any debit logged after the ledger was queried, so a concurrent
    /// `consume` is never lost. The alert baseline is the status this method last
    /// classified, not whatever a debit left behind.
    pub async fn refresh(&self, pool_id: &str) -> Result<ResourcePool> {
        let pool = self.load(pool_id).await?;
        let watermark = self.store.usage_watermark(pool_id).await?;

        let resource = with_timeout(
            self.ledger_timeout,
            self.ledger.get_account_resource(&pool.collection_address),
        )
        .await?;
        let account = with_timeout(
            self.ledger_timeout,
            self.ledger.get_account(&pool.collection_address),
        )
        .await?;

        let snapshot = PoolSnapshot {
            energy: resource.energy(),
            bandwidth: resource.bandwidth(),
            frozen: account.frozen,
        };
        let now = Utc::now();
        let mut pool = self
            .store
            .apply_snapshot(pool_id, &snapshot, watermark, now)
            .await?;

        // A never-checked pool is judged against a healthy baseline
        let previous = pool.refreshed_status.unwrap_or(ResourceStatus::Sufficient);

        let window_start = now - ChronoDuration::hours(self.settings.history_window_hours as i64);
        let usage = self
            .store
            .usage_since(&pool.id, ResourceKind::Energy, window_start)
            .await?;
        pool.forecast = predict_depletion(
            &usage,
            pool.energy.available,
            now,
            self.settings.history_window_hours,
        );

        let dedup = ChronoDuration::seconds(self.settings.alert_dedup_secs as i64);
        let alert = if should_alert(&pool, previous, pool.status, now, dedup) {
            pool.last_alert_status = Some(pool.status);
            pool.last_alert_at = Some(now);
            pool.alert_marks.mark(pool.status, now);
            Some(ResourceAlert {
                pool_id: pool.id.clone(),
                partner_id: pool.partner_id.clone(),
                previous,
                status: pool.status,
                energy_available_pct: pool.energy.available_pct(),
                raised_at: now,
            })
        } else {
            None
        };

        pool.refreshed_status = Some(pool.status);
        pool.last_checked_at = Some(now);
        self.store.save_refresh_state(&pool).await?;

        if let Some(alert) = alert {
            self.alerts.deliver(&alert).await;
        } else if pool.status < previous {
            debug!(
                target: "custody::resource",
                pool_id = %pool.id,
                from = %previous,
                to = %pool.status,
                "Pool recovered"
            );
        }

        debug!(
            target: "custody::resource",
            pool_id = %pool.id,
            status = %pool.status,
            energy_available = pool.energy.available,
            daily_average = pool.forecast.daily_average_usage,
            "Pool refreshed"
        );

        Ok(pool)
    }

    /// Refresh every pool; failures are logged and counted
    pub async fn refresh_all(&self) -> Result<RefreshSummary> {
        let mut summary = RefreshSummary::default();

        for pool in self.store.list_pools().await? {
            let before = pool.last_alert_at;
            match self.refresh(&pool.id).await {
                Ok(updated) => {
                    summary.refreshed += 1;
                    if updated.last_alert_at != before {
                        summary.alerts += 1;
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        target: "custody::resource",
                        pool_id = %pool.id,
                        error = %e,
                        "Pool refresh failed"
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Debit `amount` of `kind`, logging the usage in the same transaction
    pub async fn consume(
        &self,
        pool_id: &str,
        kind: ResourceKind,
        amount: u64,
        reason: &str,
    ) -> Result<ResourcePool> {
        match self
            .store
            .debit_resource(pool_id, kind, amount, reason, Utc::now())
            .await?
        {
            DebitOutcome::Debited(pool) => {
                debug!(
                    target: "custody::resource",
                    pool_id = %pool_id,
                    kind = %kind,
                    amount = amount,
                    remaining = pool.balance(kind).available,
                    reason = %reason,
                    "Consumed resource"
                );
                Ok(pool)
            }
            DebitOutcome::Insufficient { available } => {
                warn!(
                    target: "custody::resource",
                    pool_id = %pool_id,
                    kind = %kind,
                    requested = amount,
                    available = available,
                    "Insufficient resource"
                );
                Err(CustodyError::InsufficientResource {
                    kind: kind.to_string(),
                    requested: amount,
                    available,
                })
            }
        }
    }

    /// Whether the pool currently holds at least `amount` of `kind`
    pub async fn has_sufficient(&self, pool_id: &str, kind: ResourceKind, amount: u64) -> Result<bool> {
        let pool = self.load(pool_id).await?;
        Ok(pool.balance(kind).available >= amount)
    }

    /// Periodic refresh loop; returns after `stop`
    pub async fn run(&self) -> Result<()> {
        *self.running.write().await = true;

        info!(
            target: "custody::resource",
            interval_secs = self.settings.refresh_interval_secs,
            "Resource monitor started"
        );

        let mut ticker = interval(Duration::from_secs(self.settings.refresh_interval_secs));
        loop {
            ticker.tick().await;
            if !*self.running.read().await {
                break;
            }

            match self.refresh_all().await {
                Ok(summary) if summary.failed > 0 || summary.alerts > 0 => {
                    info!(target: "custody::resource", "[refresh] {}", summary);
                }
                Ok(_) => {}
                Err(e) => error!(target: "custody::resource", error = %e, "Refresh pass failed"),
            }
        }

        info!(target: "custody::resource", "Resource monitor stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }
}

fn validate_thresholds(thresholds: &Thresholds) -> Result<()> {
    let in_range = |pct: f64| (0.0..=100.0).contains(&pct);
    if !in_range(thresholds.warning_pct) || !in_range(thresholds.critical_pct) {
        return Err(CustodyError::validation("thresholds must be percentages"));
    }
    if thresholds.critical_pct > thresholds.warning_pct {
        return Err(CustodyError::validation(
            "critical threshold must not exceed warning threshold",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{AccountInfo, AccountResource, LedgerError, MockLedgerClient};
    use crate::resources::alerts::MockAlertSink;
    use crate::storage::{ResourceStore, SqliteStore};
    use std::sync::Mutex;

    fn ledger_with(resource: AccountResource) -> MockLedgerClient {
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_get_account_resource()
            .returning(move |_| Ok(resource));
        ledger
            .expect_get_account()
            .returning(|_| Ok(AccountInfo::default()));
        ledger
    }

    fn snapshot(energy_limit: u64, energy_used: u64) -> AccountResource {
        AccountResource {
            energy_limit,
            energy_used,
            net_limit: 5_000,
            net_used: 0,
            free_net_limit: 600,
            free_net_used: 0,
        }
    }

    fn monitor(
        store: Arc<SqliteStore>,
        ledger: MockLedgerClient,
        alerts: MockAlertSink,
    ) -> ResourcePoolMonitor {
        ResourcePoolMonitor::new(
            store,
            Arc::new(ledger),
            Arc::new(alerts),
            ResourceSettings::default(),
            Duration::from_secs(1),
        )
    }

    /// Ledger whose energy usage can be changed between refreshes
    fn switchable_ledger(used: Arc<Mutex<u64>>) -> MockLedgerClient {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_get_account_resource().returning(move |_| {
            Ok(snapshot(10_000, *used.lock().unwrap()))
        });
        ledger
            .expect_get_account()
            .returning(|_| Ok(AccountInfo::default()));
        ledger
    }

    #[tokio::test]
    async fn test_critical_pool_alerts_exactly_once() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut alerts = MockAlertSink::new();
        alerts
            .expect_deliver()
            .withf(|alert: &ResourceAlert| alert.status == ResourceStatus::Critical)
            .times(1)
            .returning(|_| ());

        let monitor = monitor(store.clone(), ledger_with(snapshot(10_000, 9_500)), alerts);
        let pool = monitor.register_pool("p1", "Tcollect", None).await.unwrap();

        let first = monitor.refresh(&pool.id).await.unwrap();
        assert_eq!(first.status, ResourceStatus::Critical);
        assert_eq!(first.energy.available, 500);

        let second = monitor.refresh(&pool.id).await.unwrap();
        assert_eq!(second.status, ResourceStatus::Critical);
        assert_eq!(second.last_alert_status, Some(ResourceStatus::Critical));
    }

    #[tokio::test]
    async fn test_recovery_is_silent_and_relapse_is_deduplicated() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let used = Arc::new(Mutex::new(9_500));
        let mut alerts = MockAlertSink::new();
        alerts.expect_deliver().times(1).returning(|_| ());

        let monitor = monitor(store, switchable_ledger(used.clone()), alerts);
        let pool = monitor.register_pool("p1", "Tcollect", None).await.unwrap();

        monitor.refresh(&pool.id).await.unwrap();
        *used.lock().unwrap() = 2_000;
        let recovered = monitor.refresh(&pool.id).await.unwrap();
        assert_eq!(recovered.status, ResourceStatus::Sufficient);

        *used.lock().unwrap() = 9_500;
        let relapsed = monitor.refresh(&pool.id).await.unwrap();
        assert_eq!(relapsed.status, ResourceStatus::Critical);
    }

    #[tokio::test]
    async fn test_escalation_alerts_each_level() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let used = Arc::new(Mutex::new(8_000));
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let mut alerts = MockAlertSink::new();
        alerts.expect_deliver().returning(move |alert| {
            sink.lock().unwrap().push(alert.status);
        });

        let monitor = monitor(store, switchable_ledger(used.clone()), alerts);
        let pool = monitor.register_pool("p1", "Tcollect", None).await.unwrap();

        monitor.refresh(&pool.id).await.unwrap();
        *used.lock().unwrap() = 9_500;
        monitor.refresh(&pool.id).await.unwrap();
        *used.lock().unwrap() = 10_000;
        monitor.refresh(&pool.id).await.unwrap();

        assert_eq!(
            *delivered.lock().unwrap(),
            vec![ResourceStatus::Warning, ResourceStatus::Critical, ResourceStatus::Depleted]
        );
    }

    fn recording_sink() -> (MockAlertSink, Arc<Mutex<Vec<ResourceStatus>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        let mut alerts = MockAlertSink::new();
        alerts.expect_deliver().returning(move |alert| {
            sink.lock().unwrap().push(alert.status);
        });
        (alerts, delivered)
    }

    #[tokio::test]
    async fn test_drop_caused_by_consume_alerts_on_next_refresh() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let used = Arc::new(Mutex::new(0));
        let (alerts, delivered) = recording_sink();

        let monitor = monitor(store.clone(), switchable_ledger(used.clone()), alerts);
        let pool = monitor.register_pool("p1", "Tcollect", None).await.unwrap();
        monitor.refresh(&pool.id).await.unwrap();

        let debited = monitor
            .consume(&pool.id, ResourceKind::Energy, 9_500, "batch:wb_1")
            .await
            .unwrap();
        assert_eq!(debited.status, ResourceStatus::Critical);
        assert!(delivered.lock().unwrap().is_empty());

        *used.lock().unwrap() = 9_500;
        let refreshed = monitor.refresh(&pool.id).await.unwrap();
        assert_eq!(refreshed.status, ResourceStatus::Critical);
        assert_eq!(refreshed.energy.available, 500);
        assert_eq!(*delivered.lock().unwrap(), vec![ResourceStatus::Critical]);
    }

    #[tokio::test]
    async fn test_level_fires_once_per_window_across_other_levels() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let used = Arc::new(Mutex::new(9_500));
        let (alerts, delivered) = recording_sink();

        let monitor = monitor(store, switchable_ledger(used.clone()), alerts);
        let pool = monitor.register_pool("p1", "Tcollect", None).await.unwrap();

        for step in [9_500, 2_000, 8_000, 9_500] {
            *used.lock().unwrap() = step;
            monitor.refresh(&pool.id).await.unwrap();
        }

        assert_eq!(
            *delivered.lock().unwrap(),
            vec![ResourceStatus::Critical, ResourceStatus::Warning]
        );
    }

    #[tokio::test]
    async fn test_consume_keeps_energy_invariant() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut alerts = MockAlertSink::new();
        alerts.expect_deliver().returning(|_| ());
        let monitor = monitor(store.clone(), ledger_with(snapshot(100_000, 0)), alerts);
        let pool = monitor.register_pool("p1", "Tcollect", None).await.unwrap();
        monitor.refresh(&pool.id).await.unwrap();

        let after = monitor
            .consume(&pool.id, ResourceKind::Energy, 65_000, "sweep:swq_1")
            .await
            .unwrap();
        assert_eq!(after.energy.available, 35_000);
        assert!(after.energy.is_consistent());
        assert!(monitor
            .has_sufficient(&pool.id, ResourceKind::Energy, 35_000)
            .await
            .unwrap());

        let err = monitor
            .consume(&pool.id, ResourceKind::Energy, 65_000, "sweep:swq_2")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CustodyError::InsufficientResource { requested: 65_000, available: 35_000, .. }
        ));
        assert!(err.is_retryable());

        let usage = store
            .usage_since(&pool.id, ResourceKind::Energy, Utc::now() - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(usage.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_feeds_forecast_from_usage() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut alerts = MockAlertSink::new();
        alerts.expect_deliver().returning(|_| ());
        let monitor = monitor(store, ledger_with(snapshot(1_000_000, 0)), alerts);
        let pool = monitor.register_pool("p1", "Tcollect", None).await.unwrap();
        monitor.refresh(&pool.id).await.unwrap();

        monitor
            .consume(&pool.id, ResourceKind::Energy, 1_000, "sweep:swq_1")
            .await
            .unwrap();
        let refreshed = monitor.refresh(&pool.id).await.unwrap();
        assert_eq!(refreshed.forecast.daily_average_usage, 24_000);
        assert!(refreshed.forecast.predicted_depletion.is_some());
        assert!(refreshed.forecast.confidence > 0.0);
    }

    #[tokio::test]
    async fn test_register_is_idempotent_and_validates() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let monitor = monitor(store, MockLedgerClient::new(), MockAlertSink::new());

        let first = monitor.register_pool("p1", "Tcollect", None).await.unwrap();
        let again = monitor.register_pool("p1", "Tcollect", None).await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(monitor.pool_status("p1").await.unwrap().id, first.id);

        let inverted = Thresholds {
            warning_pct: 10.0,
            critical_pct: 30.0,
        };
        assert!(matches!(
            monitor.register_pool("p2", "Tother", Some(inverted)).await,
            Err(CustodyError::Validation(_))
        ));
        assert!(matches!(
            monitor.pool_status("p9").await,
            Err(CustodyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_all_counts_failures() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let mut ledger = MockLedgerClient::new();
        ledger.expect_get_account_resource().returning(|address| {
            if address == "Tgood" {
                Ok(snapshot(10_000, 0))
            } else {
                Err(LedgerError::Http("unreachable".to_string()))
            }
        });
        ledger
            .expect_get_account()
            .returning(|_| Ok(AccountInfo::default()));

        let monitor = monitor(store, ledger, MockAlertSink::new());
        monitor.register_pool("p1", "Tgood", None).await.unwrap();
        monitor.register_pool("p2", "Tbad", None).await.unwrap();

        let summary = monitor.refresh_all().await.unwrap();
        assert_eq!(summary.refreshed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.alerts, 0);
    }
}
