//! Resource pool and usage log tables

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};

use super::{db_err, get_opt_time, get_time, get_u64, insert_err, parse_col, SqliteStore};
use crate::storage::traits::{DebitOutcome, ResourceStore, StorageError, StorageResult};
use crate::types::{
    AlertMarks, DepletionForecast, FrozenStake, PoolSnapshot, ResourceBalance, ResourceKind,
    ResourcePool, ResourceStatus, ResourceUsageEntry, Thresholds,
};

fn parse_opt_status(row: &rusqlite::Row, col: &str) -> rusqlite::Result<Option<ResourceStatus>> {
    match row.get::<_, Option<String>>(col)? {
        Some(raw) => raw.parse::<ResourceStatus>().map(Some).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        }),
        None => Ok(None),
    }
}

impl SqliteStore {
    fn row_to_pool(row: &rusqlite::Row) -> rusqlite::Result<ResourcePool> {
        Ok(ResourcePool {
            id: row.get("id")?,
            partner_id: row.get("partner_id")?,
            collection_address: row.get("collection_address")?,
            energy: ResourceBalance {
                total: get_u64(row, "energy_total")?,
                used: get_u64(row, "energy_used")?,
                available: get_u64(row, "energy_available")?,
            },
            bandwidth: ResourceBalance {
                total: get_u64(row, "bandwidth_total")?,
                used: get_u64(row, "bandwidth_used")?,
                available: get_u64(row, "bandwidth_available")?,
            },
            frozen: FrozenStake {
                for_energy: get_u64(row, "frozen_for_energy")?,
                for_bandwidth: get_u64(row, "frozen_for_bandwidth")?,
            },
            thresholds: Thresholds {
                warning_pct: row.get("warning_pct")?,
                critical_pct: row.get("critical_pct")?,
            },
            status: parse_col(row, "status")?,
            forecast: DepletionForecast {
                daily_average_usage: get_u64(row, "daily_average_usage")?,
                predicted_depletion: get_opt_time(row, "predicted_depletion_at")?,
                confidence: row.get("prediction_confidence")?,
            },
            refreshed_status: parse_opt_status(row, "refreshed_status")?,
            last_alert_status: parse_opt_status(row, "last_alert_status")?,
            last_alert_at: get_opt_time(row, "last_alert_at")?,
            alert_marks: AlertMarks {
                warning: get_opt_time(row, "warning_alert_at")?,
                critical: get_opt_time(row, "critical_alert_at")?,
                depleted: get_opt_time(row, "depleted_alert_at")?,
            },
            last_checked_at: get_opt_time(row, "last_checked_at")?,
            created_at: get_time(row, "created_at")?,
            updated_at: get_time(row, "updated_at")?,
        })
    }

    fn row_to_usage(row: &rusqlite::Row) -> rusqlite::Result<ResourceUsageEntry> {
        Ok(ResourceUsageEntry {
            id: row.get("id")?,
            pool_id: row.get("pool_id")?,
            kind: parse_col(row, "kind")?,
            amount: get_u64(row, "amount")?,
            reason: row.get("reason")?,
            created_at: get_time(row, "created_at")?,
        })
    }

    fn insert_pool_sync(&self, pool: &ResourcePool) -> StorageResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO resource_pools (
                id, partner_id, collection_address, warning_pct, critical_pct,
                status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                pool.id,
                pool.partner_id,
                pool.collection_address,
                pool.thresholds.warning_pct,
                pool.thresholds.critical_pct,
                pool.status.as_str(),
                pool.created_at.timestamp(),
                pool.updated_at.timestamp(),
            ],
        )
        .map_err(|e| insert_err(e, &format!("resource pool for partner {}", pool.partner_id)))?;

        // Balances, stake and forecast go through the regular save paths
        Self::save_pool_conn(&conn, pool)?;
        Self::save_refresh_state_conn(&conn, pool)
    }

    fn save_pool_conn(conn: &rusqlite::Connection, pool: &ResourcePool) -> StorageResult<()> {
        if !pool.energy.is_consistent() || !pool.bandwidth.is_consistent() {
            return Err(StorageError::InvalidData(format!(
                "pool {} balances do not add up",
                pool.id
            )));
        }

        let rows = conn
            .execute(
                r#"
                UPDATE resource_pools SET
                    energy_total = ?1, energy_used = ?2, energy_available = ?3,
                    bandwidth_total = ?4, bandwidth_used = ?5, bandwidth_available = ?6,
                    frozen_for_energy = ?7, frozen_for_bandwidth = ?8,
                    warning_pct = ?9, critical_pct = ?10, status = ?11,
                    updated_at = ?12
                WHERE id = ?13
                "#,
                params![
                    pool.energy.total as i64,
                    pool.energy.used as i64,
                    pool.energy.available as i64,
                    pool.bandwidth.total as i64,
                    pool.bandwidth.used as i64,
                    pool.bandwidth.available as i64,
                    pool.frozen.for_energy as i64,
                    pool.frozen.for_bandwidth as i64,
                    pool.thresholds.warning_pct,
                    pool.thresholds.critical_pct,
                    pool.status.as_str(),
                    pool.updated_at.timestamp(),
                    pool.id,
                ],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::NotFound(pool.id.clone()));
        }
        Ok(())
    }

    fn save_refresh_state_conn(conn: &rusqlite::Connection, pool: &ResourcePool) -> StorageResult<()> {
        let rows = conn
            .execute(
                r#"
                UPDATE resource_pools SET
                    daily_average_usage = ?1, predicted_depletion_at = ?2,
                    prediction_confidence = ?3, refreshed_status = ?4,
                    last_alert_status = ?5, last_alert_at = ?6,
                    warning_alert_at = ?7, critical_alert_at = ?8, depleted_alert_at = ?9,
                    last_checked_at = ?10
                WHERE id = ?11
                "#,
                params![
                    pool.forecast.daily_average_usage as i64,
                    pool.forecast.predicted_depletion.map(|t| t.timestamp()),
                    pool.forecast.confidence,
                    pool.refreshed_status.map(|s| s.as_str()),
                    pool.last_alert_status.map(|s| s.as_str()),
                    pool.last_alert_at.map(|t| t.timestamp()),
                    pool.alert_marks.warning.map(|t| t.timestamp()),
                    pool.alert_marks.critical.map(|t| t.timestamp()),
                    pool.alert_marks.depleted.map(|t| t.timestamp()),
                    pool.last_checked_at.map(|t| t.timestamp()),
                    pool.id,
                ],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::NotFound(pool.id.clone()));
        }
        Ok(())
    }

    fn load_pool_tx(tx: &Transaction, pool_id: &str) -> StorageResult<ResourcePool> {
        tx.query_row(
            "SELECT * FROM resource_pools WHERE id = ?1",
            params![pool_id],
            Self::row_to_pool,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| StorageError::NotFound(pool_id.to_string()))
    }

    fn apply_snapshot_sync(
        &self,
        pool_id: &str,
        snapshot: &PoolSnapshot,
        after_usage_id: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<ResourcePool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut pool = Self::load_pool_tx(&tx, pool_id)?;

        // Debits logged after the watermark are not in the snapshot
        let pending = |kind: ResourceKind| -> StorageResult<u64> {
            let sum: i64 = tx
                .query_row(
                    r#"
                    SELECT COALESCE(SUM(amount), 0) FROM resource_usage_log
                    WHERE pool_id = ?1 AND kind = ?2 AND id > ?3
                    "#,
                    params![pool_id, kind.as_str(), after_usage_id],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            Ok(sum as u64)
        };

        pool.energy = snapshot
            .energy
            .debit_saturating(pending(ResourceKind::Energy)?);
        pool.bandwidth = snapshot
            .bandwidth
            .debit_saturating(pending(ResourceKind::Bandwidth)?);
        pool.frozen = snapshot.frozen;
        pool.status = pool.compute_status();
        pool.updated_at = now;
        Self::save_pool_conn(&tx, &pool)?;

        tx.commit().map_err(db_err)?;
        Ok(pool)
    }

    fn get_pool_sync(&self, column: &str, value: &str) -> StorageResult<Option<ResourcePool>> {
        let conn = self.conn()?;
        let sql = format!("SELECT * FROM resource_pools WHERE {} = ?1", column);

        conn.query_row(&sql, params![value], Self::row_to_pool)
            .optional()
            .map_err(db_err)
    }

    fn list_pools_sync(&self) -> StorageResult<Vec<ResourcePool>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM resource_pools ORDER BY created_at ASC, rowid ASC")
            .map_err(db_err)?;

        let pools = stmt
            .query_map([], Self::row_to_pool)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(pools)
    }

    fn save_pool_sync(&self, pool: &ResourcePool) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        Self::save_pool_conn(&tx, pool)?;
        Self::save_refresh_state_conn(&tx, pool)?;
        tx.commit().map_err(db_err)
    }

    fn save_refresh_state_sync(&self, pool: &ResourcePool) -> StorageResult<()> {
        let conn = self.conn()?;
        Self::save_refresh_state_conn(&conn, pool)
    }

    fn debit_resource_sync(
        &self,
        pool_id: &str,
        kind: ResourceKind,
        amount: u64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<DebitOutcome> {
        let mut conn = self.conn()?;
        let tx: Transaction = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut pool = Self::load_pool_tx(&tx, pool_id)?;

        let balance = *pool.balance(kind);
        let debited = match balance.debit(amount) {
            Some(debited) => debited,
            None => {
                return Ok(DebitOutcome::Insufficient {
                    available: balance.available,
                })
            }
        };

        *pool.balance_mut(kind) = debited;
        pool.status = pool.compute_status();
        pool.updated_at = now;
        Self::save_pool_conn(&tx, &pool)?;

        tx.execute(
            r#"
            INSERT INTO resource_usage_log (pool_id, kind, amount, reason, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![pool_id, kind.as_str(), amount as i64, reason, now.timestamp()],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(DebitOutcome::Debited(pool))
    }

    fn usage_watermark_sync(&self, pool_id: &str) -> StorageResult<i64> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT COALESCE(MAX(id), 0) FROM resource_usage_log WHERE pool_id = ?1",
            params![pool_id],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    fn usage_since_sync(
        &self,
        pool_id: &str,
        kind: ResourceKind,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<ResourceUsageEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT * FROM resource_usage_log
                WHERE pool_id = ?1 AND kind = ?2 AND created_at >= ?3
                ORDER BY created_at ASC, id ASC
                "#,
            )
            .map_err(db_err)?;

        let entries = stmt
            .query_map(
                params![pool_id, kind.as_str(), since.timestamp()],
                Self::row_to_usage,
            )
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(entries)
    }
}

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn insert_pool(&self, pool: &ResourcePool) -> StorageResult<()> {
        self.insert_pool_sync(pool)
    }

    async fn get_pool(&self, id: &str) -> StorageResult<Option<ResourcePool>> {
        self.get_pool_sync("id", id)
    }

    async fn get_pool_by_partner(&self, partner_id: &str) -> StorageResult<Option<ResourcePool>> {
        self.get_pool_sync("partner_id", partner_id)
    }

    async fn list_pools(&self) -> StorageResult<Vec<ResourcePool>> {
        self.list_pools_sync()
    }

    async fn save_pool(&self, pool: &ResourcePool) -> StorageResult<()> {
        self.save_pool_sync(pool)
    }

    async fn apply_snapshot(
        &self,
        pool_id: &str,
        snapshot: &PoolSnapshot,
        after_usage_id: i64,
        now: DateTime<Utc>,
    ) -> StorageResult<ResourcePool> {
        self.apply_snapshot_sync(pool_id, snapshot, after_usage_id, now)
    }

    async fn usage_watermark(&self, pool_id: &str) -> StorageResult<i64> {
        self.usage_watermark_sync(pool_id)
    }

    async fn save_refresh_state(&self, pool: &ResourcePool) -> StorageResult<()> {
        self.save_refresh_state_sync(pool)
    }

    async fn debit_resource(
        &self,
        pool_id: &str,
        kind: ResourceKind,
        amount: u64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<DebitOutcome> {
        self.debit_resource_sync(pool_id, kind, amount, reason, now)
    }

    async fn usage_since(
        &self,
        pool_id: &str,
        kind: ResourceKind,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<ResourceUsageEntry>> {
        self.usage_since_sync(pool_id, kind, since)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seeded_pool(store: &SqliteStore, energy_total: u64, energy_used: u64) -> ResourcePool {
        let now = Utc::now();
        let mut pool = ResourcePool::new(
            "p1".to_string(),
            "Tcollectp1".to_string(),
            Thresholds::default(),
            now,
        );
        pool.energy = ResourceBalance::new(energy_total, energy_used);
        pool.bandwidth = ResourceBalance::new(5_000, 0);
        pool.status = pool.compute_status();
        store.insert_pool(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_insert_and_reload_pool() {
        let store = SqliteStore::in_memory().unwrap();
        let pool = seeded_pool(&store, 10_000, 2_000).await;

        let loaded = store.get_pool_by_partner("p1").await.unwrap().unwrap();
        assert_eq!(loaded.id, pool.id);
        assert_eq!(loaded.energy, pool.energy);
        assert_eq!(loaded.status, ResourceStatus::Sufficient);
        assert!(loaded.last_alert_status.is_none());

        let duplicate = store.insert_pool(&pool).await;
        assert!(matches!(duplicate, Err(StorageError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_save_pool_roundtrips_forecast_and_alerts() {
        let store = SqliteStore::in_memory().unwrap();
        let mut pool = seeded_pool(&store, 10_000, 0).await;
        let now = Utc::now();

        pool.forecast = DepletionForecast {
            daily_average_usage: 24_000,
            predicted_depletion: Some(now + Duration::hours(10)),
            confidence: 0.5,
        };
        pool.last_alert_status = Some(ResourceStatus::Warning);
        pool.last_alert_at = Some(now);
        store.save_pool(&pool).await.unwrap();

        let loaded = store.get_pool(&pool.id).await.unwrap().unwrap();
        assert_eq!(loaded.forecast.daily_average_usage, 24_000);
        assert_eq!(
            loaded.forecast.predicted_depletion.map(|t| t.timestamp()),
            Some((now + Duration::hours(10)).timestamp())
        );
        assert_eq!(loaded.last_alert_status, Some(ResourceStatus::Warning));
    }

    #[tokio::test]
    async fn test_save_rejects_inconsistent_balance() {
        let store = SqliteStore::in_memory().unwrap();
        let mut pool = seeded_pool(&store, 10_000, 0).await;
        pool.energy.available = 1;

        let result = store.save_pool(&pool).await;
        assert!(matches!(result, Err(StorageError::InvalidData(_))));
    }

    #[tokio::test]
    async fn test_debit_logs_usage() {
        let store = SqliteStore::in_memory().unwrap();
        let pool = seeded_pool(&store, 10_000, 0).await;
        let now = Utc::now();

        let outcome = store
            .debit_resource(&pool.id, ResourceKind::Energy, 3_000, "sweep:swq_1", now)
            .await
            .unwrap();
        let after = match outcome {
            DebitOutcome::Debited(p) => p,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(after.energy.available, 7_000);
        assert_eq!(after.energy.used, 3_000);

        let usage = store
            .usage_since(&pool.id, ResourceKind::Energy, now - Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].amount, 3_000);
        assert_eq!(usage[0].reason, "sweep:swq_1");

        let bandwidth = store
            .usage_since(&pool.id, ResourceKind::Bandwidth, now - Duration::minutes(1))
            .await
            .unwrap();
        assert!(bandwidth.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_keeps_debits_logged_after_watermark() {
        let store = SqliteStore::in_memory().unwrap();
        let pool = seeded_pool(&store, 10_000, 0).await;
        let now = Utc::now();

        store
            .debit_resource(&pool.id, ResourceKind::Energy, 1_000, "sweep:swq_1", now)
            .await
            .unwrap();
        let watermark = store.usage_watermark(&pool.id).await.unwrap();
        assert!(watermark > 0);

        // debit lands while the ledger snapshot is in flight
        store
            .debit_resource(&pool.id, ResourceKind::Energy, 9_000, "batch:wb_1", now)
            .await
            .unwrap();

        let snapshot = PoolSnapshot {
            energy: ResourceBalance::new(10_000, 0),
            bandwidth: ResourceBalance::new(5_000, 0),
            frozen: FrozenStake::default(),
        };
        let applied = store
            .apply_snapshot(&pool.id, &snapshot, watermark, now)
            .await
            .unwrap();
        assert_eq!(applied.energy.available, 1_000);
        assert_eq!(applied.energy.used, 9_000);
        assert_eq!(applied.status, ResourceStatus::Critical);

        let reloaded = store.get_pool(&pool.id).await.unwrap().unwrap();
        assert_eq!(reloaded.energy, applied.energy);
    }

    #[tokio::test]
    async fn test_refresh_state_leaves_balances_alone() {
        let store = SqliteStore::in_memory().unwrap();
        let mut pool = seeded_pool(&store, 10_000, 0).await;
        store
            .debit_resource(&pool.id, ResourceKind::Energy, 4_000, "sweep:swq_1", Utc::now())
            .await
            .unwrap();

        // stale in-memory copy still shows the full balance
        pool.refreshed_status = Some(ResourceStatus::Sufficient);
        pool.alert_marks.mark(ResourceStatus::Warning, Utc::now());
        store.save_refresh_state(&pool).await.unwrap();

        let reloaded = store.get_pool(&pool.id).await.unwrap().unwrap();
        assert_eq!(reloaded.energy.available, 6_000);
        assert_eq!(reloaded.refreshed_status, Some(ResourceStatus::Sufficient));
        assert!(reloaded.alert_marks.warning.is_some());
        assert!(reloaded.alert_marks.critical.is_none());
    }

    #[tokio::test]
    async fn test_debit_refuses_overdraft() {
        let store = SqliteStore::in_memory().unwrap();
        let pool = seeded_pool(&store, 10_000, 9_500).await;

        let outcome = store
            .debit_resource(&pool.id, ResourceKind::Energy, 600, "batch:b1", Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, DebitOutcome::Insufficient { available: 500 }));

        let reloaded = store.get_pool(&pool.id).await.unwrap().unwrap();
        assert_eq!(reloaded.energy.available, 500);
        assert!(store
            .usage_since(&pool.id, ResourceKind::Energy, Utc::now() - Duration::hours(1))
            .await
            .unwrap()
            .is_empty());
    }
}
