//! Withdrawal, policy, whitelist and batch tables

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};

use super::{db_err, get_time, get_u64, insert_err, parse_col, SqliteStore};
use crate::storage::traits::{StorageError, StorageResult, WithdrawalStore};
use crate::types::{
    BatchItem, BatchStatus, ItemOutcome, WhitelistEntry, WithdrawalBatch, WithdrawalPolicy,
    WithdrawalRequest, WithdrawalStatus,
};

/// Statuses whose amounts count toward limits, as a SQL list
const LIMIT_STATUSES: &str = "('approved', 'processing', 'completed')";

impl SqliteStore {
    fn row_to_withdrawal(row: &rusqlite::Row) -> rusqlite::Result<WithdrawalRequest> {
        Ok(WithdrawalRequest {
            id: row.get("id")?,
            partner_id: row.get("partner_id")?,
            user_id: row.get("user_id")?,
            amount: get_u64(row, "amount")?,
            asset: parse_col(row, "asset")?,
            destination: row.get("destination")?,
            status: parse_col(row, "status")?,
            priority: parse_col(row, "priority")?,
            risk_score: row.get::<_, Option<i64>>("risk_score")?.map(|s| s as u8),
            review_reason: row.get("review_reason")?,
            batch_id: row.get("batch_id")?,
            tx_hash: row.get("tx_hash")?,
            error: row.get("error")?,
            created_at: get_time(row, "created_at")?,
            updated_at: get_time(row, "updated_at")?,
        })
    }

    fn row_to_policy(row: &rusqlite::Row) -> rusqlite::Result<WithdrawalPolicy> {
        Ok(WithdrawalPolicy {
            partner_id: row.get("partner_id")?,
            is_active: row.get("is_active")?,
            auto_approve_enabled: row.get("auto_approve_enabled")?,
            per_tx_auto_approve_limit: get_u64(row, "per_tx_auto_approve_limit")?,
            daily_auto_approve_limit: get_u64(row, "daily_auto_approve_limit")?,
            risk_threshold: row.get::<_, i64>("risk_threshold")? as u8,
            whitelist_only: row.get("whitelist_only")?,
            max_batch_size: row.get::<_, i64>("max_batch_size")? as usize,
            batch_cost_ceiling: get_u64(row, "batch_cost_ceiling")?,
            updated_at: get_time(row, "updated_at")?,
        })
    }

    fn row_to_whitelist(row: &rusqlite::Row) -> rusqlite::Result<WhitelistEntry> {
        Ok(WhitelistEntry {
            id: row.get("id")?,
            partner_id: row.get("partner_id")?,
            address: row.get("address")?,
            label: row.get("label")?,
            daily_limit: row.get::<_, Option<i64>>("daily_limit")?.map(|v| v as u64),
            monthly_limit: row.get::<_, Option<i64>>("monthly_limit")?.map(|v| v as u64),
            verified_by: row.get("verified_by")?,
            verified_at: get_time(row, "verified_at")?,
            is_active: row.get("is_active")?,
        })
    }

    fn row_to_batch_item(row: &rusqlite::Row) -> rusqlite::Result<BatchItem> {
        Ok(BatchItem {
            request_id: row.get("request_id")?,
            amount: get_u64(row, "amount")?,
            estimated_cost: get_u64(row, "estimated_cost")?,
            outcome: parse_col(row, "outcome")?,
            tx_hash: row.get("tx_hash")?,
            error: row.get("error")?,
        })
    }

    /// Batch header only; items are attached by `load_batch`
    fn row_to_batch(row: &rusqlite::Row) -> rusqlite::Result<WithdrawalBatch> {
        Ok(WithdrawalBatch {
            id: row.get("id")?,
            partner_id: row.get("partner_id")?,
            items: Vec::new(),
            total_amount: get_u64(row, "total_amount")?,
            estimated_cost: get_u64(row, "estimated_cost")?,
            status: parse_col(row, "status")?,
            priority_score: row.get::<_, i64>("priority_score")? as u32,
            created_at: get_time(row, "created_at")?,
            updated_at: get_time(row, "updated_at")?,
        })
    }

    fn load_batch_items(
        conn: &rusqlite::Connection,
        batch: &mut WithdrawalBatch,
    ) -> StorageResult<()> {
        let mut stmt = conn
            .prepare("SELECT * FROM batch_items WHERE batch_id = ?1 ORDER BY position ASC")
            .map_err(db_err)?;

        batch.items = stmt
            .query_map(params![batch.id], Self::row_to_batch_item)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(())
    }

    fn query_withdrawals(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> StorageResult<Vec<WithdrawalRequest>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(db_err)?;

        let requests = stmt
            .query_map(params, Self::row_to_withdrawal)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(requests)
    }

    fn query_scalar(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> StorageResult<i64> {
        let conn = self.conn()?;
        conn.query_row(sql, params, |row| row.get(0)).map_err(db_err)
    }

    fn insert_withdrawal_sync(&self, request: &WithdrawalRequest) -> StorageResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO withdrawal_requests (
                id, partner_id, user_id, amount, asset, destination, status, priority,
                risk_score, review_reason, batch_id, tx_hash, error, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
            params![
                request.id,
                request.partner_id,
                request.user_id,
                request.amount as i64,
                request.asset.to_string(),
                request.destination,
                request.status.as_str(),
                request.priority.as_str(),
                request.risk_score.map(|s| s as i64),
                request.review_reason,
                request.batch_id,
                request.tx_hash,
                request.error,
                request.created_at.timestamp(),
                request.updated_at.timestamp(),
            ],
        )
        .map_err(|e| insert_err(e, &format!("withdrawal {}", request.id)))?;

        Ok(())
    }

    fn get_withdrawal_sync(&self, id: &str) -> StorageResult<Option<WithdrawalRequest>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM withdrawal_requests WHERE id = ?1",
            params![id],
            Self::row_to_withdrawal,
        )
        .optional()
        .map_err(db_err)
    }

    fn transition_withdrawal_sync(
        &self,
        request: &WithdrawalRequest,
        from: WithdrawalStatus,
    ) -> StorageResult<()> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                r#"
                UPDATE withdrawal_requests SET
                    status = ?1, risk_score = ?2, review_reason = ?3,
                    tx_hash = ?4, error = ?5, updated_at = ?6
                WHERE id = ?7 AND status = ?8 AND batch_id IS ?9
                "#,
                params![
                    request.status.as_str(),
                    request.risk_score.map(|s| s as i64),
                    request.review_reason,
                    request.tx_hash,
                    request.error,
                    request.updated_at.timestamp(),
                    request.id,
                    from.as_str(),
                    request.batch_id,
                ],
            )
            .map_err(db_err)?;

        if rows == 0 {
            let current: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT status, batch_id FROM withdrawal_requests WHERE id = ?1",
                    params![request.id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(db_err)?;
            return Err(match current {
                None => StorageError::NotFound(request.id.clone()),
                Some((status, batch_id)) => StorageError::InvalidTransition(format!(
                    "withdrawal {} is {}{}, expected {}",
                    request.id,
                    status,
                    batch_id.map(|b| format!(" in batch {}", b)).unwrap_or_default(),
                    from
                )),
            });
        }
        Ok(())
    }

    fn upsert_policy_sync(&self, policy: &WithdrawalPolicy) -> StorageResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO withdrawal_policies (
                partner_id, is_active, auto_approve_enabled, per_tx_auto_approve_limit,
                daily_auto_approve_limit, risk_threshold, whitelist_only, max_batch_size,
                batch_cost_ceiling, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(partner_id) DO UPDATE SET
                is_active = excluded.is_active,
                auto_approve_enabled = excluded.auto_approve_enabled,
                per_tx_auto_approve_limit = excluded.per_tx_auto_approve_limit,
                daily_auto_approve_limit = excluded.daily_auto_approve_limit,
                risk_threshold = excluded.risk_threshold,
                whitelist_only = excluded.whitelist_only,
                max_batch_size = excluded.max_batch_size,
                batch_cost_ceiling = excluded.batch_cost_ceiling,
                updated_at = excluded.updated_at
            "#,
            params![
                policy.partner_id,
                policy.is_active,
                policy.auto_approve_enabled,
                policy.per_tx_auto_approve_limit as i64,
                policy.daily_auto_approve_limit as i64,
                policy.risk_threshold as i64,
                policy.whitelist_only,
                policy.max_batch_size as i64,
                policy.batch_cost_ceiling as i64,
                policy.updated_at.timestamp(),
            ],
        )
        .map_err(db_err)?;

        Ok(())
    }

    fn get_policy_sync(&self, partner_id: &str) -> StorageResult<Option<WithdrawalPolicy>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM withdrawal_policies WHERE partner_id = ?1",
            params![partner_id],
            Self::row_to_policy,
        )
        .optional()
        .map_err(db_err)
    }

    fn insert_whitelist_entry_sync(&self, entry: &WhitelistEntry) -> StorageResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO whitelist_entries (
                id, partner_id, address, label, daily_limit, monthly_limit,
                verified_by, verified_at, is_active
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                entry.id,
                entry.partner_id,
                entry.address,
                entry.label,
                entry.daily_limit.map(|v| v as i64),
                entry.monthly_limit.map(|v| v as i64),
                entry.verified_by,
                entry.verified_at.timestamp(),
                entry.is_active,
            ],
        )
        .map_err(|e| insert_err(e, &format!("whitelist entry {}", entry.address)))?;

        Ok(())
    }

    fn get_whitelist_entry_sync(
        &self,
        partner_id: &str,
        address: &str,
    ) -> StorageResult<Option<WhitelistEntry>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT * FROM whitelist_entries WHERE partner_id = ?1 AND address = ?2",
            params![partner_id, address],
            Self::row_to_whitelist,
        )
        .optional()
        .map_err(db_err)
    }

    fn insert_batch_sync(&self, batch: &WithdrawalBatch) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        tx.execute(
            r#"
            INSERT INTO withdrawal_batches (
                id, partner_id, total_amount, estimated_cost, status, priority_score,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                batch.id,
                batch.partner_id,
                batch.total_amount as i64,
                batch.estimated_cost as i64,
                batch.status.as_str(),
                batch.priority_score as i64,
                batch.created_at.timestamp(),
                batch.updated_at.timestamp(),
            ],
        )
        .map_err(|e| insert_err(e, &format!("batch {}", batch.id)))?;

        for (position, item) in batch.items.iter().enumerate() {
            tx.execute(
                r#"
                INSERT INTO batch_items (
                    batch_id, request_id, position, amount, estimated_cost, outcome, tx_hash, error
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
                params![
                    batch.id,
                    item.request_id,
                    position as i64,
                    item.amount as i64,
                    item.estimated_cost as i64,
                    item.outcome.as_str(),
                    item.tx_hash,
                    item.error,
                ],
            )
            .map_err(|e| insert_err(e, &format!("request {} already batched", item.request_id)))?;

            let rows = tx
                .execute(
                    r#"
                    UPDATE withdrawal_requests SET batch_id = ?1, updated_at = ?2
                    WHERE id = ?3 AND status = 'approved' AND batch_id IS NULL
                    "#,
                    params![batch.id, batch.created_at.timestamp(), item.request_id],
                )
                .map_err(db_err)?;

            if rows == 0 {
                return Err(StorageError::Duplicate(format!(
                    "request {} is not an unbatched approved request",
                    item.request_id
                )));
            }
        }

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn get_batch_sync(&self, id: &str) -> StorageResult<Option<WithdrawalBatch>> {
        let conn = self.conn()?;
        let batch = conn
            .query_row(
                "SELECT * FROM withdrawal_batches WHERE id = ?1",
                params![id],
                Self::row_to_batch,
            )
            .optional()
            .map_err(db_err)?;

        match batch {
            Some(mut batch) => {
                Self::load_batch_items(&conn, &mut batch)?;
                Ok(Some(batch))
            }
            None => Ok(None),
        }
    }

    fn list_batches_by_status_sync(&self, status: BatchStatus) -> StorageResult<Vec<WithdrawalBatch>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT * FROM withdrawal_batches WHERE status = ?1
                ORDER BY priority_score DESC, created_at ASC, rowid ASC
                "#,
            )
            .map_err(db_err)?;

        let mut batches = stmt
            .query_map(params![status.as_str()], Self::row_to_batch)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        for batch in batches.iter_mut() {
            Self::load_batch_items(&conn, batch)?;
        }

        Ok(batches)
    }

    fn claim_batch_sync(&self, id: &str, now: DateTime<Utc>) -> StorageResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let rows = tx
            .execute(
                "UPDATE withdrawal_batches SET status = 'processing', updated_at = ?1 WHERE id = ?2 AND status = 'pending'",
                params![now.timestamp(), id],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE withdrawal_requests SET status = 'processing', updated_at = ?1 WHERE batch_id = ?2 AND status = 'approved'",
            params![now.timestamp(), id],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    fn release_batch_sync(&self, id: &str, now: DateTime<Utc>) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let rows = tx
            .execute(
                "UPDATE withdrawal_batches SET status = 'pending', updated_at = ?1 WHERE id = ?2 AND status = 'processing'",
                params![now.timestamp(), id],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::InvalidTransition(format!(
                "batch {} is not processing",
                id
            )));
        }

        tx.execute(
            "UPDATE withdrawal_requests SET status = 'approved', updated_at = ?1 WHERE batch_id = ?2 AND status = 'processing'",
            params![now.timestamp(), id],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn record_batch_item_sync(
        &self,
        batch_id: &str,
        item: &BatchItem,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let request_status = match item.outcome {
            ItemOutcome::Succeeded => WithdrawalStatus::Completed,
            ItemOutcome::Failed => WithdrawalStatus::Failed,
            ItemOutcome::Pending => {
                return Err(StorageError::InvalidTransition(format!(
                    "item {} has no outcome yet",
                    item.request_id
                )))
            }
        };

        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let rows = tx
            .execute(
                r#"
                UPDATE batch_items SET outcome = ?1, tx_hash = ?2, error = ?3
                WHERE batch_id = ?4 AND request_id = ?5 AND outcome = 'pending'
                "#,
                params![
                    item.outcome.as_str(),
                    item.tx_hash,
                    item.error,
                    batch_id,
                    item.request_id
                ],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::InvalidTransition(format!(
                "item {} in batch {} is not pending",
                item.request_id, batch_id
            )));
        }

        let rows = tx
            .execute(
                r#"
                UPDATE withdrawal_requests SET status = ?1, tx_hash = ?2, error = ?3, updated_at = ?4
                WHERE id = ?5 AND batch_id = ?6 AND status = 'processing'
                "#,
                params![
                    request_status.as_str(),
                    item.tx_hash,
                    item.error,
                    now.timestamp(),
                    item.request_id,
                    batch_id
                ],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::InvalidTransition(format!(
                "withdrawal {} is not processing in batch {}",
                item.request_id, batch_id
            )));
        }

        // each recorded item renews the batch's processing lease
        tx.execute(
            "UPDATE withdrawal_batches SET updated_at = ?1 WHERE id = ?2 AND status = 'processing'",
            params![now.timestamp(), batch_id],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(())
    }

    fn finish_batch_sync(&self, id: &str, status: BatchStatus, now: DateTime<Utc>) -> StorageResult<()> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                "UPDATE withdrawal_batches SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'processing'",
                params![status.as_str(), now.timestamp(), id],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::InvalidTransition(format!(
                "batch {} is not processing",
                id
            )));
        }
        Ok(())
    }

    /// Fail the batch's pending items with their requests and give the batch
    /// its settled status
    fn settle_abandoned_tx(
        tx: &Transaction,
        batch: &mut WithdrawalBatch,
        error: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        tx.execute(
            r#"
            UPDATE withdrawal_requests SET status = 'failed', error = ?1, updated_at = ?2
            WHERE batch_id = ?3 AND status = 'processing' AND id IN (
                SELECT request_id FROM batch_items WHERE batch_id = ?3 AND outcome = 'pending'
            )
            "#,
            params![error, now.timestamp(), batch.id],
        )
        .map_err(db_err)?;
        tx.execute(
            "UPDATE batch_items SET outcome = 'failed', error = ?1 WHERE batch_id = ?2 AND outcome = 'pending'",
            params![error, batch.id],
        )
        .map_err(db_err)?;

        Self::load_batch_items(tx, batch)?;
        batch.status = batch.settled_status();
        batch.updated_at = now;
        tx.execute(
            "UPDATE withdrawal_batches SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![batch.status.as_str(), now.timestamp(), batch.id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn abandon_batch_sync(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<WithdrawalBatch> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut batch = tx
            .query_row(
                "SELECT * FROM withdrawal_batches WHERE id = ?1",
                params![id],
                Self::row_to_batch,
            )
            .optional()
            .map_err(db_err)?
            .ok_or_else(|| StorageError::NotFound(format!("batch {}", id)))?;

        if batch.status != BatchStatus::Processing {
            return Err(StorageError::InvalidTransition(format!(
                "batch {} is {}, not processing",
                id, batch.status
            )));
        }

        Self::settle_abandoned_tx(&tx, &mut batch, error, now)?;
        tx.commit().map_err(db_err)?;
        Ok(batch)
    }

    fn reclaim_stale_batches_sync(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<WithdrawalBatch>> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let mut batches = {
            let mut stmt = tx
                .prepare(
                    "SELECT * FROM withdrawal_batches WHERE status = 'processing' AND updated_at <= ?1 ORDER BY updated_at ASC, rowid ASC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![cutoff.timestamp()], Self::row_to_batch)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };

        for batch in batches.iter_mut() {
            Self::settle_abandoned_tx(&tx, batch, error, now)?;
        }

        tx.commit().map_err(db_err)?;
        Ok(batches)
    }
}

#[async_trait]
impl WithdrawalStore for SqliteStore {
    async fn insert_withdrawal(&self, request: &WithdrawalRequest) -> StorageResult<()> {
        self.insert_withdrawal_sync(request)
    }

    async fn get_withdrawal(&self, id: &str) -> StorageResult<Option<WithdrawalRequest>> {
        self.get_withdrawal_sync(id)
    }

    async fn transition_withdrawal(
        &self,
        request: &WithdrawalRequest,
        from: WithdrawalStatus,
    ) -> StorageResult<()> {
        self.transition_withdrawal_sync(request, from)
    }

    async fn user_total_between(
        &self,
        partner_id: &str,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude_id: &str,
    ) -> StorageResult<u64> {
        let sql = format!(
            r#"
            SELECT COALESCE(SUM(amount), 0) FROM withdrawal_requests
            WHERE partner_id = ?1 AND user_id = ?2 AND status IN {}
              AND created_at >= ?3 AND created_at < ?4 AND id != ?5
            "#,
            LIMIT_STATUSES
        );
        let total = self.query_scalar(
            &sql,
            params![partner_id, user_id, since.timestamp(), until.timestamp(), exclude_id],
        )?;
        Ok(total as u64)
    }

    async fn completed_count_to_destination(
        &self,
        partner_id: &str,
        destination: &str,
        before: DateTime<Utc>,
    ) -> StorageResult<u32> {
        let count = self.query_scalar(
            r#"
            SELECT COUNT(*) FROM withdrawal_requests
            WHERE partner_id = ?1 AND destination = ?2 AND status = 'completed'
              AND created_at < ?3
            "#,
            params![partner_id, destination, before.timestamp()],
        )?;
        Ok(count as u32)
    }

    async fn user_request_count_between(
        &self,
        partner_id: &str,
        user_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude_id: &str,
    ) -> StorageResult<u32> {
        let count = self.query_scalar(
            r#"
            SELECT COUNT(*) FROM withdrawal_requests
            WHERE partner_id = ?1 AND user_id = ?2
              AND created_at >= ?3 AND created_at < ?4 AND id != ?5
            "#,
            params![partner_id, user_id, since.timestamp(), until.timestamp(), exclude_id],
        )?;
        Ok(count as u32)
    }

    async fn destination_total_between(
        &self,
        partner_id: &str,
        destination: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
        exclude_id: &str,
    ) -> StorageResult<u64> {
        let sql = format!(
            r#"
            SELECT COALESCE(SUM(amount), 0) FROM withdrawal_requests
            WHERE partner_id = ?1 AND destination = ?2 AND status IN {}
              AND created_at >= ?3 AND created_at < ?4 AND id != ?5
            "#,
            LIMIT_STATUSES
        );
        let total = self.query_scalar(
            &sql,
            params![partner_id, destination, since.timestamp(), until.timestamp(), exclude_id],
        )?;
        Ok(total as u64)
    }

    async fn list_withdrawals_by_status(
        &self,
        partner_id: &str,
        status: WithdrawalStatus,
    ) -> StorageResult<Vec<WithdrawalRequest>> {
        self.query_withdrawals(
            r#"
            SELECT * FROM withdrawal_requests WHERE partner_id = ?1 AND status = ?2
            ORDER BY created_at ASC, rowid ASC
            "#,
            params![partner_id, status.as_str()],
        )
    }

    async fn list_batchable(&self, partner_id: &str) -> StorageResult<Vec<WithdrawalRequest>> {
        self.query_withdrawals(
            r#"
            SELECT * FROM withdrawal_requests
            WHERE partner_id = ?1 AND status = 'approved' AND batch_id IS NULL
            ORDER BY created_at ASC, rowid ASC
            "#,
            params![partner_id],
        )
    }

    async fn partners_with_batchable(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT DISTINCT partner_id FROM withdrawal_requests
                WHERE status = 'approved' AND batch_id IS NULL
                ORDER BY partner_id
                "#,
            )
            .map_err(db_err)?;

        let partners = stmt
            .query_map([], |row| row.get(0))
            .map_err(db_err)?
            .collect::<Result<Vec<String>, _>>()
            .map_err(db_err)?;

        Ok(partners)
    }

    async fn upsert_policy(&self, policy: &WithdrawalPolicy) -> StorageResult<()> {
        self.upsert_policy_sync(policy)
    }

    async fn get_policy(&self, partner_id: &str) -> StorageResult<Option<WithdrawalPolicy>> {
        self.get_policy_sync(partner_id)
    }

    async fn insert_whitelist_entry(&self, entry: &WhitelistEntry) -> StorageResult<()> {
        self.insert_whitelist_entry_sync(entry)
    }

    async fn get_whitelist_entry(
        &self,
        partner_id: &str,
        address: &str,
    ) -> StorageResult<Option<WhitelistEntry>> {
        self.get_whitelist_entry_sync(partner_id, address)
    }

    async fn insert_batch(&self, batch: &WithdrawalBatch) -> StorageResult<()> {
        self.insert_batch_sync(batch)
    }

    async fn get_batch(&self, id: &str) -> StorageResult<Option<WithdrawalBatch>> {
        self.get_batch_sync(id)
    }

    async fn list_batches_by_status(
        &self,
        status: BatchStatus,
    ) -> StorageResult<Vec<WithdrawalBatch>> {
        self.list_batches_by_status_sync(status)
    }

    async fn claim_batch(&self, id: &str, now: DateTime<Utc>) -> StorageResult<bool> {
        self.claim_batch_sync(id, now)
    }

    async fn release_batch(&self, id: &str, now: DateTime<Utc>) -> StorageResult<()> {
        self.release_batch_sync(id, now)
    }

    async fn record_batch_item(
        &self,
        batch_id: &str,
        item: &BatchItem,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.record_batch_item_sync(batch_id, item, now)
    }

    async fn finish_batch(
        &self,
        id: &str,
        status: BatchStatus,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        self.finish_batch_sync(id, status, now)
    }

    async fn abandon_batch(
        &self,
        id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<WithdrawalBatch> {
        self.abandon_batch_sync(id, error, now)
    }

    async fn reclaim_stale_batches(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<WithdrawalBatch>> {
        self.reclaim_stale_batches_sync(cutoff, error, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{new_id, Asset, WithdrawalPriority};
    use chrono::Duration;

    fn request(user: &str, amount: u64, dest: &str, at: DateTime<Utc>) -> WithdrawalRequest {
        WithdrawalRequest::new(
            "p1".to_string(),
            user.to_string(),
            amount,
            Asset::Trx,
            dest.to_string(),
            WithdrawalPriority::Normal,
            at,
        )
    }

    async fn approved(store: &SqliteStore, amount: u64, at: DateTime<Utc>) -> WithdrawalRequest {
        let mut req = request("u1", amount, "Tdest", at);
        req.status = WithdrawalStatus::Approved;
        store.insert_withdrawal(&req).await.unwrap();
        req
    }

    fn batch_of(requests: &[&WithdrawalRequest], now: DateTime<Utc>) -> WithdrawalBatch {
        let items: Vec<BatchItem> = requests
            .iter()
            .map(|r| BatchItem {
                request_id: r.id.clone(),
                amount: r.amount,
                estimated_cost: 100,
                outcome: ItemOutcome::Pending,
                tx_hash: None,
                error: None,
            })
            .collect();
        WithdrawalBatch {
            id: new_id("wdb"),
            partner_id: "p1".to_string(),
            total_amount: items.iter().map(|i| i.amount).sum(),
            estimated_cost: items.iter().map(|i| i.estimated_cost).sum(),
            items,
            status: BatchStatus::Pending,
            priority_score: 2,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_update_get() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let mut req = request("u1", 5_000, "Tdest", now);
        store.insert_withdrawal(&req).await.unwrap();

        req.status = WithdrawalStatus::Pending;
        req.risk_score = Some(62);
        req.review_reason = Some("manual_review".to_string());
        store
            .transition_withdrawal(&req, WithdrawalStatus::Pending)
            .await
            .unwrap();

        let loaded = store.get_withdrawal(&req.id).await.unwrap().unwrap();
        assert_eq!(loaded.risk_score, Some(62));
        assert_eq!(loaded.review_reason.as_deref(), Some("manual_review"));
        assert_eq!(loaded.asset, Asset::Trx);
        assert_eq!(loaded.priority, WithdrawalPriority::Normal);
    }

    #[tokio::test]
    async fn test_user_total_counts_only_limit_statuses() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let day_start = now - Duration::hours(1);

        approved(&store, 1_000, now).await;
        let mut completed = request("u1", 2_000, "Tdest", now);
        completed.status = WithdrawalStatus::Completed;
        store.insert_withdrawal(&completed).await.unwrap();
        let mut rejected = request("u1", 4_000, "Tdest", now);
        rejected.status = WithdrawalStatus::Rejected;
        store.insert_withdrawal(&rejected).await.unwrap();
        // Previous day
        approved(&store, 8_000, now - Duration::hours(2)).await;

        let current = request("u1", 500, "Tdest", now);
        store.insert_withdrawal(&current).await.unwrap();

        let total = store
            .user_total_between("p1", "u1", day_start, now + Duration::seconds(1), &current.id)
            .await
            .unwrap();
        assert_eq!(total, 3_000);

        let count = store
            .user_request_count_between("p1", "u1", day_start, now + Duration::seconds(1), &current.id)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_destination_history() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let mut done = request("u1", 700, "Tknown", now - Duration::days(3));
        done.status = WithdrawalStatus::Completed;
        store.insert_withdrawal(&done).await.unwrap();

        assert_eq!(
            store.completed_count_to_destination("p1", "Tknown", now).await.unwrap(),
            1
        );
        assert_eq!(
            store.completed_count_to_destination("p1", "Tnew", now).await.unwrap(),
            0
        );
        assert_eq!(
            store
                .destination_total_between("p1", "Tknown", now - Duration::days(30), now, "none")
                .await
                .unwrap(),
            700
        );
    }

    #[tokio::test]
    async fn test_policy_upsert() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        assert!(store.get_policy("p1").await.unwrap().is_none());

        let mut policy = WithdrawalPolicy::new("p1".to_string(), now);
        store.upsert_policy(&policy).await.unwrap();

        policy.whitelist_only = true;
        policy.risk_threshold = 40;
        store.upsert_policy(&policy).await.unwrap();

        let loaded = store.get_policy("p1").await.unwrap().unwrap();
        assert!(loaded.whitelist_only);
        assert_eq!(loaded.risk_threshold, 40);
    }

    #[tokio::test]
    async fn test_whitelist_entry_unique_per_partner() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let mut entry = WhitelistEntry::new("p1".to_string(), "Tdest".to_string(), "ops".to_string(), now);
        entry.daily_limit = Some(10_000);
        store.insert_whitelist_entry(&entry).await.unwrap();

        let loaded = store.get_whitelist_entry("p1", "Tdest").await.unwrap().unwrap();
        assert_eq!(loaded.daily_limit, Some(10_000));
        assert!(loaded.monthly_limit.is_none());

        let again = WhitelistEntry::new("p1".to_string(), "Tdest".to_string(), "ops".to_string(), now);
        let result = store.insert_whitelist_entry(&again).await;
        assert!(matches!(result, Err(StorageError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_request_joins_at_most_one_batch() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let a = approved(&store, 100, now).await;
        let b = approved(&store, 200, now).await;

        let first = batch_of(&[&a], now);
        store.insert_batch(&first).await.unwrap();

        let second = batch_of(&[&b, &a], now);
        let result = store.insert_batch(&second).await;
        assert!(matches!(result, Err(StorageError::Duplicate(_))));

        // The failed batch left nothing behind
        assert!(store.get_batch(&second.id).await.unwrap().is_none());
        let reloaded_b = store.get_withdrawal(&b.id).await.unwrap().unwrap();
        assert!(reloaded_b.batch_id.is_none());

        let batchable = store.list_batchable("p1").await.unwrap();
        assert_eq!(batchable.len(), 1);
        assert_eq!(batchable[0].id, b.id);
        assert_eq!(store.partners_with_batchable().await.unwrap(), vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn test_batch_lifecycle() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let a = approved(&store, 100, now).await;
        let b = approved(&store, 200, now).await;
        let batch = batch_of(&[&a, &b], now);
        store.insert_batch(&batch).await.unwrap();

        assert!(store.claim_batch(&batch.id, now).await.unwrap());
        assert!(!store.claim_batch(&batch.id, now).await.unwrap());
        let a_loaded = store.get_withdrawal(&a.id).await.unwrap().unwrap();
        assert_eq!(a_loaded.status, WithdrawalStatus::Processing);

        let mut ok = batch.items[0].clone();
        ok.outcome = ItemOutcome::Succeeded;
        ok.tx_hash = Some("tx_a".to_string());
        store.record_batch_item(&batch.id, &ok, now).await.unwrap();

        let mut bad = batch.items[1].clone();
        bad.outcome = ItemOutcome::Failed;
        bad.error = Some("broadcast rejected".to_string());
        store.record_batch_item(&batch.id, &bad, now).await.unwrap();

        // Outcomes are written once
        let again = store.record_batch_item(&batch.id, &ok, now).await;
        assert!(matches!(again, Err(StorageError::InvalidTransition(_))));

        let loaded = store.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(loaded.settled_status(), BatchStatus::PartialFailure);
        store
            .finish_batch(&batch.id, loaded.settled_status(), now)
            .await
            .unwrap();

        let finished = store.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(finished.status, BatchStatus::PartialFailure);
        assert_eq!(finished.items[0].tx_hash.as_deref(), Some("tx_a"));

        let a_done = store.get_withdrawal(&a.id).await.unwrap().unwrap();
        assert_eq!(a_done.status, WithdrawalStatus::Completed);
        let b_done = store.get_withdrawal(&b.id).await.unwrap().unwrap();
        assert_eq!(b_done.status, WithdrawalStatus::Failed);
    }

    #[tokio::test]
    async fn test_stale_transition_cannot_unbatch_request() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let stale = approved(&store, 100, now).await;
        let batch = batch_of(&[&stale], now);
        store.insert_batch(&batch).await.unwrap();

        // copy read before the batch took the request
        let mut rejected = stale.clone();
        rejected.status = WithdrawalStatus::Rejected;
        rejected.review_reason = Some("customer request".to_string());
        let result = store
            .transition_withdrawal(&rejected, WithdrawalStatus::Approved)
            .await;
        assert!(matches!(result, Err(StorageError::InvalidTransition(_))));

        let loaded = store.get_withdrawal(&stale.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WithdrawalStatus::Approved);
        assert_eq!(loaded.batch_id.as_deref(), Some(batch.id.as_str()));

        let missing = request("u1", 1, "Tdest", now);
        let result = store
            .transition_withdrawal(&missing, WithdrawalStatus::Pending)
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_item_outcome_requires_processing_request() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let a = approved(&store, 100, now).await;
        let batch = batch_of(&[&a], now);
        store.insert_batch(&batch).await.unwrap();
        store.claim_batch(&batch.id, now).await.unwrap();

        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE withdrawal_requests SET status = 'rejected' WHERE id = ?1",
                params![a.id],
            )
            .unwrap();

        let mut failed = batch.items[0].clone();
        failed.outcome = ItemOutcome::Failed;
        failed.error = Some("timed out".to_string());
        let result = store.record_batch_item(&batch.id, &failed, now).await;
        assert!(matches!(result, Err(StorageError::InvalidTransition(_))));

        let loaded = store.get_withdrawal(&a.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, WithdrawalStatus::Rejected);
        // the item write rolled back with it
        let batch = store.get_batch(&batch.id).await.unwrap().unwrap();
        assert_eq!(batch.items[0].outcome, ItemOutcome::Pending);
    }

    #[tokio::test]
    async fn test_release_batch_returns_requests() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let a = approved(&store, 100, now).await;
        let batch = batch_of(&[&a], now);
        store.insert_batch(&batch).await.unwrap();
        store.claim_batch(&batch.id, now).await.unwrap();

        store.release_batch(&batch.id, now).await.unwrap();

        let pending = store.list_batches_by_status(BatchStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].items.len(), 1);
        let a_loaded = store.get_withdrawal(&a.id).await.unwrap().unwrap();
        assert_eq!(a_loaded.status, WithdrawalStatus::Approved);
        assert_eq!(a_loaded.batch_id.as_deref(), Some(batch.id.as_str()));
    }

    #[tokio::test]
    async fn test_reclaim_settles_stale_batch_and_keeps_outcomes() {
        let store = SqliteStore::in_memory().unwrap();
        let now = Utc::now();
        let hour_ago = now - Duration::hours(1);
        let a = approved(&store, 100, hour_ago).await;
        let b = approved(&store, 200, hour_ago).await;
        let c = approved(&store, 300, hour_ago).await;

        let stale = batch_of(&[&a, &b], hour_ago);
        store.insert_batch(&stale).await.unwrap();
        store.claim_batch(&stale.id, hour_ago).await.unwrap();
        let mut sent = stale.items[0].clone();
        sent.outcome = ItemOutcome::Succeeded;
        sent.tx_hash = Some("tx_a".to_string());
        store.record_batch_item(&stale.id, &sent, hour_ago).await.unwrap();

        let live = batch_of(&[&c], now);
        store.insert_batch(&live).await.unwrap();
        store.claim_batch(&live.id, now).await.unwrap();

        let reclaimed = store
            .reclaim_stale_batches(now - Duration::minutes(10), "lease expired", now)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, stale.id);
        assert_eq!(reclaimed[0].status, BatchStatus::PartialFailure);

        let stored = store.get_batch(&stale.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BatchStatus::PartialFailure);
        assert_eq!(stored.items[0].outcome, ItemOutcome::Succeeded);
        assert_eq!(stored.items[0].tx_hash.as_deref(), Some("tx_a"));
        assert_eq!(stored.items[1].outcome, ItemOutcome::Failed);
        assert_eq!(stored.items[1].error.as_deref(), Some("lease expired"));

        let a_loaded = store.get_withdrawal(&a.id).await.unwrap().unwrap();
        assert_eq!(a_loaded.status, WithdrawalStatus::Completed);
        let b_loaded = store.get_withdrawal(&b.id).await.unwrap().unwrap();
        assert_eq!(b_loaded.status, WithdrawalStatus::Failed);
        assert_eq!(b_loaded.error.as_deref(), Some("lease expired"));

        // a batch inside its lease is left to its dispatcher
        let live = store.get_batch(&live.id).await.unwrap().unwrap();
        assert_eq!(live.status, BatchStatus::Processing);
        let c_loaded = store.get_withdrawal(&c.id).await.unwrap().unwrap();
        assert_eq!(c_loaded.status, WithdrawalStatus::Processing);
    }
}
