//! Sweep queue and sweep log tables

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::HashMap;

use super::{db_err, get_time, get_u64, insert_err, parse_col, SqliteStore};
use crate::storage::traits::{EnqueueOutcome, StorageError, StorageResult, SweepStore};
use crate::types::{SweepQueueEntry, SweepRecord, SweepStatus};

impl SqliteStore {
    fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<SweepQueueEntry> {
        Ok(SweepQueueEntry {
            id: row.get("id")?,
            deposit_address_id: row.get("deposit_address_id")?,
            queue_type: parse_col(row, "queue_type")?,
            status: parse_col(row, "status")?,
            expected_amount: get_u64(row, "expected_amount")?,
            attempts: row.get::<_, i64>("attempts")? as u32,
            last_error: row.get("last_error")?,
            scheduled_at: get_time(row, "scheduled_at")?,
            expires_at: get_time(row, "expires_at")?,
            created_at: get_time(row, "created_at")?,
            updated_at: get_time(row, "updated_at")?,
        })
    }

    fn row_to_sweep_record(row: &rusqlite::Row) -> rusqlite::Result<SweepRecord> {
        Ok(SweepRecord {
            id: row.get("id")?,
            queue_entry_id: row.get("queue_entry_id")?,
            deposit_address_id: row.get("deposit_address_id")?,
            from_address: row.get("from_address")?,
            to_address: row.get("to_address")?,
            amount: get_u64(row, "amount")?,
            asset: parse_col(row, "asset")?,
            tx_hash: row.get("tx_hash")?,
            batch_id: row.get("batch_id")?,
            status: parse_col(row, "status")?,
            error: row.get("error")?,
            created_at: get_time(row, "created_at")?,
        })
    }

    fn active_entry_tx(
        tx: &Transaction,
        deposit_address_id: &str,
    ) -> StorageResult<Option<SweepQueueEntry>> {
        tx.query_row(
            r#"
            SELECT * FROM sweep_queue
            WHERE deposit_address_id = ?1 AND status IN ('queued', 'processing')
            "#,
            params![deposit_address_id],
            Self::row_to_entry,
        )
        .optional()
        .map_err(db_err)
    }

    fn insert_record_tx(tx: &Transaction, record: &SweepRecord) -> StorageResult<()> {
        tx.execute(
            r#"
            INSERT INTO sweep_log (
                id, queue_entry_id, deposit_address_id, from_address, to_address,
                amount, asset, tx_hash, batch_id, status, error, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                record.id,
                record.queue_entry_id,
                record.deposit_address_id,
                record.from_address,
                record.to_address,
                record.amount as i64,
                record.asset.to_string(),
                record.tx_hash,
                record.batch_id,
                record.status.as_str(),
                record.error,
                record.created_at.timestamp(),
            ],
        )
        .map_err(|e| insert_err(e, &format!("sweep record {}", record.id)))?;
        Ok(())
    }

    /// Move a PROCESSING entry to `next`, or fail with `InvalidTransition`
    fn finish_entry_tx(
        tx: &Transaction,
        entry_id: &str,
        next: SweepStatus,
        attempts: u32,
        last_error: Option<&str>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let rows = tx
            .execute(
                r#"
                UPDATE sweep_queue
                SET status = ?1, attempts = ?2, last_error = ?3, updated_at = ?4
                WHERE id = ?5 AND status = 'processing'
                "#,
                params![next.as_str(), attempts as i64, last_error, now.timestamp(), entry_id],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::InvalidTransition(format!(
                "sweep entry {} is not processing",
                entry_id
            )));
        }
        Ok(())
    }

    fn enqueue_sweep_sync(&self, entry: &SweepQueueEntry) -> StorageResult<EnqueueOutcome> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        if let Some(existing) = Self::active_entry_tx(&tx, &entry.deposit_address_id)? {
            return Ok(EnqueueOutcome {
                entry: existing,
                created: false,
            });
        }

        tx.execute(
            r#"
            INSERT INTO sweep_queue (
                id, deposit_address_id, queue_type, priority, status, expected_amount,
                attempts, last_error, scheduled_at, expires_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                entry.id,
                entry.deposit_address_id,
                entry.queue_type.as_str(),
                entry.priority() as i64,
                entry.status.as_str(),
                entry.expected_amount as i64,
                entry.attempts as i64,
                entry.last_error,
                entry.scheduled_at.timestamp(),
                entry.expires_at.timestamp(),
                entry.created_at.timestamp(),
                entry.updated_at.timestamp(),
            ],
        )
        .map_err(|e| insert_err(e, &format!("active sweep for {}", entry.deposit_address_id)))?;

        tx.commit().map_err(db_err)?;

        Ok(EnqueueOutcome {
            entry: entry.clone(),
            created: true,
        })
    }

    fn get_sweep_entry_sync(&self, id: &str) -> StorageResult<Option<SweepQueueEntry>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM sweep_queue WHERE id = ?1",
            params![id],
            Self::row_to_entry,
        )
        .optional()
        .map_err(db_err)
    }

    fn claim_next_sweep_sync(&self, now: DateTime<Utc>) -> StorageResult<Option<SweepQueueEntry>> {
        let conn = self.conn()?;

        // Single statement: the subselect and the update see the same snapshot
        conn.query_row(
            r#"
            UPDATE sweep_queue
            SET status = 'processing', updated_at = ?1
            WHERE id = (
                SELECT id FROM sweep_queue
                WHERE status = 'queued' AND scheduled_at <= ?1 AND expires_at > ?1
                ORDER BY priority DESC, created_at ASC, rowid ASC
                LIMIT 1
            )
            RETURNING *
            "#,
            params![now.timestamp()],
            Self::row_to_entry,
        )
        .optional()
        .map_err(db_err)
    }

    fn requeue_sweep_sync(
        &self,
        id: &str,
        scheduled_at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<&str>,
    ) -> StorageResult<()> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                r#"
                UPDATE sweep_queue
                SET status = 'queued', scheduled_at = ?1, expires_at = ?1 + (expires_at - scheduled_at),
                    attempts = ?2, last_error = COALESCE(?3, last_error), updated_at = unixepoch()
                WHERE id = ?4 AND status = 'processing'
                "#,
                params![scheduled_at.timestamp(), attempts as i64, last_error, id],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::InvalidTransition(format!(
                "sweep entry {} is not processing",
                id
            )));
        }
        Ok(())
    }

    fn complete_sweep_sync(&self, entry_id: &str, record: &SweepRecord) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let attempts: i64 = tx
            .query_row(
                "SELECT attempts FROM sweep_queue WHERE id = ?1",
                params![entry_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StorageError::NotFound(entry_id.to_string()))?;

        Self::finish_entry_tx(
            &tx,
            entry_id,
            SweepStatus::Completed,
            attempts as u32,
            None,
            record.created_at,
        )?;
        Self::insert_record_tx(&tx, record)?;

        let rows = tx
            .execute(
                r#"
                UPDATE deposit_addresses
                SET total_swept = total_swept + ?1, updated_at = ?2
                WHERE id = ?3 AND total_swept + ?1 <= total_received
                "#,
                params![
                    record.amount as i64,
                    record.created_at.timestamp(),
                    record.deposit_address_id
                ],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::InvalidData(format!(
                "sweeping {} from {} would exceed its received total",
                record.amount, record.deposit_address_id
            )));
        }

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn fail_sweep_sync(
        &self,
        entry_id: &str,
        attempts: u32,
        record: &SweepRecord,
    ) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        Self::finish_entry_tx(
            &tx,
            entry_id,
            SweepStatus::Failed,
            attempts,
            record.error.as_deref(),
            record.created_at,
        )?;
        Self::insert_record_tx(&tx, record)?;

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn cancel_sweep_sync(&self, id: &str, now: DateTime<Utc>) -> StorageResult<bool> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                "UPDATE sweep_queue SET status = 'cancelled', updated_at = ?1 WHERE id = ?2 AND status = 'queued'",
                params![now.timestamp(), id],
            )
            .map_err(db_err)?;

        Ok(rows > 0)
    }

    fn expire_sweeps_sync(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                "UPDATE sweep_queue SET status = 'expired', updated_at = ?1 WHERE status = 'queued' AND expires_at <= ?1",
                params![now.timestamp()],
            )
            .map_err(db_err)?;

        Ok(rows as u64)
    }

    fn stale_sweeps_sync(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<SweepQueueEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM sweep_queue WHERE status = 'processing' AND updated_at <= ?1 ORDER BY updated_at ASC, rowid ASC",
            )
            .map_err(db_err)?;

        let entries = stmt
            .query_map(params![cutoff.timestamp()], Self::row_to_entry)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(entries)
    }

    fn active_sweep_for_address_sync(
        &self,
        deposit_address_id: &str,
    ) -> StorageResult<Option<SweepQueueEntry>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err)?;
        Self::active_entry_tx(&tx, deposit_address_id)
    }

    fn count_sweeps_by_status_sync(&self) -> StorageResult<HashMap<SweepStatus, u64>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM sweep_queue GROUP BY status")
            .map_err(db_err)?;

        let mut counts = HashMap::new();
        let rows = stmt
            .query_map([], |row| {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((status, count as u64))
            })
            .map_err(db_err)?;

        for row in rows {
            let (status, count) = row.map_err(db_err)?;
            let status = status
                .parse::<SweepStatus>()
                .map_err(|e| StorageError::InvalidData(e.to_string()))?;
            counts.insert(status, count);
        }

        Ok(counts)
    }

    fn sweep_records_for_address_sync(
        &self,
        deposit_address_id: &str,
    ) -> StorageResult<Vec<SweepRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM sweep_log WHERE deposit_address_id = ?1 ORDER BY created_at ASC, rowid ASC",
            )
            .map_err(db_err)?;

        let records = stmt
            .query_map(params![deposit_address_id], Self::row_to_sweep_record)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(records)
    }
}

#[async_trait]
impl SweepStore for SqliteStore {
    async fn enqueue_sweep(&self, entry: &SweepQueueEntry) -> StorageResult<EnqueueOutcome> {
        self.enqueue_sweep_sync(entry)
    }

    async fn get_sweep_entry(&self, id: &str) -> StorageResult<Option<SweepQueueEntry>> {
        self.get_sweep_entry_sync(id)
    }

    async fn claim_next_sweep(&self, now: DateTime<Utc>) -> StorageResult<Option<SweepQueueEntry>> {
        self.claim_next_sweep_sync(now)
    }

    async fn requeue_sweep(
        &self,
        id: &str,
        scheduled_at: DateTime<Utc>,
        attempts: u32,
        last_error: Option<&str>,
    ) -> StorageResult<()> {
        self.requeue_sweep_sync(id, scheduled_at, attempts, last_error)
    }

    async fn complete_sweep(&self, entry_id: &str, record: &SweepRecord) -> StorageResult<()> {
        self.complete_sweep_sync(entry_id, record)
    }

    async fn fail_sweep(
        &self,
        entry_id: &str,
        attempts: u32,
        record: &SweepRecord,
    ) -> StorageResult<()> {
        self.fail_sweep_sync(entry_id, attempts, record)
    }

    async fn cancel_sweep(&self, id: &str, now: DateTime<Utc>) -> StorageResult<bool> {
        self.cancel_sweep_sync(id, now)
    }

    async fn expire_sweeps(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        self.expire_sweeps_sync(now)
    }

    async fn stale_sweeps(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<SweepQueueEntry>> {
        self.stale_sweeps_sync(cutoff)
    }

    async fn active_sweep_for_address(
        &self,
        deposit_address_id: &str,
    ) -> StorageResult<Option<SweepQueueEntry>> {
        self.active_sweep_for_address_sync(deposit_address_id)
    }

    async fn count_sweeps_by_status(&self) -> StorageResult<HashMap<SweepStatus, u64>> {
        self.count_sweeps_by_status_sync()
    }

    async fn sweep_records_for_address(
        &self,
        deposit_address_id: &str,
    ) -> StorageResult<Vec<SweepRecord>> {
        self.sweep_records_for_address_sync(deposit_address_id)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{seed_address, seed_wallet};
    use super::*;
    use crate::storage::traits::WalletStore;
    use crate::types::{Asset, QueueType, SweepRecordStatus};
    use chrono::Duration;

    fn entry_for(address_id: &str, queue_type: QueueType, now: DateTime<Utc>) -> SweepQueueEntry {
        SweepQueueEntry::new(address_id.to_string(), queue_type, 1_000, now, Duration::hours(24))
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_per_address() {
        let store = SqliteStore::in_memory().unwrap();
        let wallet = seed_wallet(&store, "p1").await;
        let addr = seed_address(&store, &wallet, "u1", 1).await;
        let now = Utc::now();

        let first = store
            .enqueue_sweep(&entry_for(&addr.id, QueueType::Normal, now))
            .await
            .unwrap();
        assert!(first.created);

        let second = store
            .enqueue_sweep(&entry_for(&addr.id, QueueType::Emergency, now))
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.entry.id, first.entry.id);

        let counts = store.count_sweeps_by_status().await.unwrap();
        assert_eq!(counts.get(&SweepStatus::Queued), Some(&1));
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority_then_age() {
        let store = SqliteStore::in_memory().unwrap();
        let wallet = seed_wallet(&store, "p1").await;
        let a = seed_address(&store, &wallet, "u1", 1).await;
        let b = seed_address(&store, &wallet, "u2", 2).await;
        let c = seed_address(&store, &wallet, "u3", 3).await;
        let now = Utc::now();

        let normal_old = entry_for(&a.id, QueueType::Normal, now - Duration::minutes(10));
        let emergency = entry_for(&b.id, QueueType::Emergency, now - Duration::minutes(1));
        let normal_new = entry_for(&c.id, QueueType::Normal, now - Duration::minutes(5));
        for entry in [&normal_old, &emergency, &normal_new] {
            store.enqueue_sweep(entry).await.unwrap();
        }

        let order: Vec<String> = vec![
            store.claim_next_sweep(now).await.unwrap().unwrap().id,
            store.claim_next_sweep(now).await.unwrap().unwrap().id,
            store.claim_next_sweep(now).await.unwrap().unwrap().id,
        ];
        assert_eq!(order, vec![emergency.id, normal_old.id, normal_new.id]);
        assert!(store.claim_next_sweep(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_skips_future_and_expired() {
        let store = SqliteStore::in_memory().unwrap();
        let wallet = seed_wallet(&store, "p1").await;
        let a = seed_address(&store, &wallet, "u1", 1).await;
        let b = seed_address(&store, &wallet, "u2", 2).await;
        let now = Utc::now();

        let mut later = entry_for(&a.id, QueueType::Normal, now);
        later.scheduled_at = now + Duration::minutes(5);
        store.enqueue_sweep(&later).await.unwrap();

        let stale = SweepQueueEntry::new(
            b.id.clone(),
            QueueType::Normal,
            1,
            now - Duration::hours(2),
            Duration::hours(1),
        );
        store.enqueue_sweep(&stale).await.unwrap();

        assert!(store.claim_next_sweep(now).await.unwrap().is_none());

        assert_eq!(store.expire_sweeps(now).await.unwrap(), 1);
        let expired = store.get_sweep_entry(&stale.id).await.unwrap().unwrap();
        assert_eq!(expired.status, SweepStatus::Expired);

        let claimed = store
            .claim_next_sweep(now + Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, later.id);
        assert_eq!(claimed.status, SweepStatus::Processing);
    }

    #[tokio::test]
    async fn test_complete_sweep_updates_totals() {
        let store = SqliteStore::in_memory().unwrap();
        let wallet = seed_wallet(&store, "p1").await;
        let addr = seed_address(&store, &wallet, "u1", 1).await;
        store.add_received(&addr.id, 5_000).await.unwrap();
        let now = Utc::now();

        let entry = entry_for(&addr.id, QueueType::Normal, now);
        store.enqueue_sweep(&entry).await.unwrap();
        let claimed = store.claim_next_sweep(now).await.unwrap().unwrap();

        let record = SweepRecord::completed(
            &claimed,
            &addr.address,
            &wallet.collection_address,
            5_000,
            Asset::Trx,
            "tx1".to_string(),
            now,
        );
        store.complete_sweep(&claimed.id, &record).await.unwrap();

        let reloaded = store.get_deposit_address(&addr.id).await.unwrap().unwrap();
        assert_eq!(reloaded.total_swept, 5_000);
        assert_eq!(reloaded.unswept(), 0);

        let records = store.sweep_records_for_address(&addr.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SweepRecordStatus::Completed);
        assert_eq!(records[0].tx_hash.as_deref(), Some("tx1"));

        assert!(store.active_sweep_for_address(&addr.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_sweep_cannot_exceed_received() {
        let store = SqliteStore::in_memory().unwrap();
        let wallet = seed_wallet(&store, "p1").await;
        let addr = seed_address(&store, &wallet, "u1", 1).await;
        store.add_received(&addr.id, 100).await.unwrap();
        let now = Utc::now();

        store
            .enqueue_sweep(&entry_for(&addr.id, QueueType::Normal, now))
            .await
            .unwrap();
        let claimed = store.claim_next_sweep(now).await.unwrap().unwrap();
        let record = SweepRecord::completed(
            &claimed,
            &addr.address,
            "Tcollect",
            101,
            Asset::Trx,
            "tx1".to_string(),
            now,
        );

        let result = store.complete_sweep(&claimed.id, &record).await;
        assert!(matches!(result, Err(StorageError::InvalidData(_))));

        // Rolled back: still processing, nothing logged
        let entry = store.get_sweep_entry(&claimed.id).await.unwrap().unwrap();
        assert_eq!(entry.status, SweepStatus::Processing);
        assert!(store.sweep_records_for_address(&addr.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_and_fail() {
        let store = SqliteStore::in_memory().unwrap();
        let wallet = seed_wallet(&store, "p1").await;
        let addr = seed_address(&store, &wallet, "u1", 1).await;
        let now = Utc::now();

        store
            .enqueue_sweep(&entry_for(&addr.id, QueueType::Normal, now))
            .await
            .unwrap();
        let claimed = store.claim_next_sweep(now).await.unwrap().unwrap();

        store
            .requeue_sweep(&claimed.id, now + Duration::seconds(30), 1, Some("timeout"))
            .await
            .unwrap();
        let requeued = store.get_sweep_entry(&claimed.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, SweepStatus::Queued);
        assert_eq!(requeued.attempts, 1);
        assert_eq!(requeued.last_error.as_deref(), Some("timeout"));

        // requeue only applies to processing entries
        let result = store.requeue_sweep(&claimed.id, now, 2, None).await;
        assert!(matches!(result, Err(StorageError::InvalidTransition(_))));

        let claimed = store
            .claim_next_sweep(now + Duration::seconds(30))
            .await
            .unwrap()
            .unwrap();
        let record = SweepRecord::failed(
            &claimed,
            &addr.address,
            "Tcollect",
            0,
            Asset::Trx,
            "broadcast rejected".to_string(),
            now,
        );
        store.fail_sweep(&claimed.id, 2, &record).await.unwrap();

        let failed = store.get_sweep_entry(&claimed.id).await.unwrap().unwrap();
        assert_eq!(failed.status, SweepStatus::Failed);
        assert_eq!(failed.attempts, 2);

        // A terminal entry frees the address for a new one
        let again = store
            .enqueue_sweep(&entry_for(&addr.id, QueueType::Normal, now))
            .await
            .unwrap();
        assert!(again.created);
    }

    #[tokio::test]
    async fn test_requeue_moves_expiry_with_schedule() {
        let store = SqliteStore::in_memory().unwrap();
        let wallet = seed_wallet(&store, "p1").await;
        let addr = seed_address(&store, &wallet, "u1", 1).await;
        let now = Utc::now();

        store
            .enqueue_sweep(&entry_for(&addr.id, QueueType::Normal, now))
            .await
            .unwrap();
        let claimed = store.claim_next_sweep(now).await.unwrap().unwrap();
        let original_expiry = claimed.expires_at;

        let retry_at = now + Duration::hours(20);
        store
            .requeue_sweep(&claimed.id, retry_at, 1, Some("timeout"))
            .await
            .unwrap();
        let requeued = store.get_sweep_entry(&claimed.id).await.unwrap().unwrap();
        assert_eq!(
            requeued.expires_at.timestamp(),
            retry_at.timestamp() + Duration::hours(24).num_seconds()
        );

        // past the first window but inside the moved one
        let late = original_expiry + Duration::hours(1);
        assert_eq!(store.expire_sweeps(late).await.unwrap(), 0);
        let reclaimed = store.claim_next_sweep(late).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed.id);
    }

    #[tokio::test]
    async fn test_stale_sweeps_only_lists_old_processing() {
        let store = SqliteStore::in_memory().unwrap();
        let wallet = seed_wallet(&store, "p1").await;
        let a = seed_address(&store, &wallet, "u1", 1).await;
        let b = seed_address(&store, &wallet, "u2", 2).await;
        let c = seed_address(&store, &wallet, "u3", 3).await;
        let now = Utc::now();
        let hour_ago = now - Duration::hours(1);

        store
            .enqueue_sweep(&entry_for(&a.id, QueueType::Emergency, hour_ago))
            .await
            .unwrap();
        let old = store.claim_next_sweep(hour_ago).await.unwrap().unwrap();
        store
            .enqueue_sweep(&entry_for(&b.id, QueueType::Emergency, hour_ago))
            .await
            .unwrap();
        store.claim_next_sweep(now).await.unwrap().unwrap();
        store
            .enqueue_sweep(&entry_for(&c.id, QueueType::Normal, hour_ago))
            .await
            .unwrap();

        let stale = store
            .stale_sweeps(now - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
        assert_eq!(stale[0].status, SweepStatus::Processing);
    }

    #[tokio::test]
    async fn test_cancel_only_when_queued() {
        let store = SqliteStore::in_memory().unwrap();
        let wallet = seed_wallet(&store, "p1").await;
        let a = seed_address(&store, &wallet, "u1", 1).await;
        let b = seed_address(&store, &wallet, "u2", 2).await;
        let now = Utc::now();

        let queued = entry_for(&a.id, QueueType::Normal, now);
        store.enqueue_sweep(&queued).await.unwrap();
        assert!(store.cancel_sweep(&queued.id, now).await.unwrap());
        assert!(!store.cancel_sweep(&queued.id, now).await.unwrap());

        let processing = entry_for(&b.id, QueueType::Normal, now);
        store.enqueue_sweep(&processing).await.unwrap();
        store.claim_next_sweep(now).await.unwrap().unwrap();
        assert!(!store.cancel_sweep(&processing.id, now).await.unwrap());
    }
}
