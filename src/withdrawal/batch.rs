//! Batch Optimizer
//!
//! Packs approved, unbatched withdrawals into batches and dispatches them
//! from the partner's collection wallet.
//!
//! ```text
//! PENDING → PROCESSING → COMPLETED | PARTIAL_FAILURE | FAILED
//! ```
//!
//! FAILED means every item failed; any success makes it PARTIAL_FAILURE.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::common::{log_withdrawal_event, CustodyError, Result, WithdrawalSettings};
use crate::resources::ResourcePoolMonitor;
use crate::signing::{sign_with_timeout, SigningGateway};
use crate::storage::{CustodyStore, StorageError};
use crate::types::{
    new_id, BatchItem, BatchStatus, ItemOutcome, ResourceKind, WithdrawalBatch, WithdrawalPolicy,
    WithdrawalRequest, WithdrawalStatus,
};

/// Limits one batch must respect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackingLimits {
    pub max_items: usize,
    pub cost_ceiling: u64,
    pub cost_per_item: u64,
}

impl PackingLimits {
    pub fn from_policy(policy: &WithdrawalPolicy, cost_per_item: u64) -> Self {
        Self {
            max_items: policy.max_batch_size,
            cost_ceiling: policy.batch_cost_ceiling,
            cost_per_item,
        }
    }
}

/// Greedy sequential packing
///
/// Requests are ordered by priority, then amount, both descending. The
/// current batch is closed as soon as the next request would break either
/// limit. A request that cannot fit even in an empty batch is left out.
pub fn pack(mut requests: Vec<WithdrawalRequest>, limits: PackingLimits) -> Vec<Vec<WithdrawalRequest>> {
    requests.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.amount.cmp(&a.amount))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });

    let max_items = limits.max_items.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<WithdrawalRequest> = Vec::new();
    let mut current_cost = 0u64;

    for request in requests {
        if limits.cost_per_item > limits.cost_ceiling {
            warn!(
                target: "custody::withdrawal",
                request_id = %request.id,
                cost = limits.cost_per_item,
                ceiling = limits.cost_ceiling,
                "Request exceeds batch cost ceiling on its own"
            );
            continue;
        }

        let next_cost = current_cost + limits.cost_per_item;
        if !current.is_empty() && (current.len() + 1 > max_items || next_cost > limits.cost_ceiling) {
            batches.push(std::mem::take(&mut current));
            current_cost = 0;
        }

        current_cost += limits.cost_per_item;
        current.push(request);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Σ item weights plus one point per hour the oldest item has waited, capped
pub fn priority_score(requests: &[WithdrawalRequest], now: DateTime<Utc>, age_bonus_cap: u32) -> u32 {
    let weights: u32 = requests.iter().map(|r| r.priority.weight()).sum();
    let age_bonus = requests
        .iter()
        .map(|r| (now - r.created_at).num_hours().max(0) as u64)
        .max()
        .unwrap_or(0)
        .min(age_bonus_cap as u64) as u32;
    weights + age_bonus
}

/// Result of one optimizer cycle
#[derive(Debug, Default, Clone)]
pub struct BatchCycleSummary {
    pub recovered: usize,
    pub created: usize,
    pub dispatched: usize,
    pub deferred: usize,
    pub items_succeeded: usize,
    pub items_failed: usize,
}

impl BatchCycleSummary {
    pub fn has_activity(&self) -> bool {
        self.recovered > 0 || self.created > 0 || self.dispatched > 0 || self.deferred > 0
    }
}

impl std::fmt::Display for BatchCycleSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "recovered: {}, created: {}, dispatched: {}, deferred: {}, items ok: {}, items failed: {}",
            self.recovered,
            self.created,
            self.dispatched, self.deferred, self.items_succeeded, self.items_failed
        )
    }
}

/// Builds and dispatches withdrawal batches
pub struct BatchOptimizer {
    store: Arc<dyn CustodyStore>,
    resources: Arc<ResourcePoolMonitor>,
    gateway: Arc<dyn SigningGateway>,
    settings: WithdrawalSettings,
    signing_timeout: Duration,
    running: Arc<RwLock<bool>>,
}

impl BatchOptimizer {
    pub fn new(
        store: Arc<dyn CustodyStore>,
        resources: Arc<ResourcePoolMonitor>,
        gateway: Arc<dyn SigningGateway>,
        settings: WithdrawalSettings,
        signing_timeout: Duration,
    ) -> Self {
        Self {
            store,
            resources,
            gateway,
            settings,
            signing_timeout,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<WithdrawalBatch> {
        self.store
            .get_batch(batch_id)
            .await?
            .ok_or_else(|| CustodyError::not_found(format!("batch {}", batch_id)))
    }

    /// Pack a partner's approved, unbatched requests into new batches
    pub async fn build_batches(&self, partner_id: &str) -> Result<Vec<WithdrawalBatch>> {
        let now = Utc::now();
        let policy = self
            .store
            .get_policy(partner_id)
            .await?
            .unwrap_or_else(|| WithdrawalPolicy::new(partner_id.to_string(), now));
        let limits = PackingLimits::from_policy(&policy, self.settings.energy_per_transfer);

        let requests = self.store.list_batchable(partner_id).await?;
        let mut created = Vec::new();

        for group in pack(requests, limits) {
            let batch = WithdrawalBatch {
                id: new_id("wb"),
                partner_id: partner_id.to_string(),
                items: group
                    .iter()
                    .map(|r| BatchItem {
                        request_id: r.id.clone(),
                        amount: r.amount,
                        estimated_cost: limits.cost_per_item,
                        outcome: ItemOutcome::Pending,
                        tx_hash: None,
                        error: None,
                    })
                    .collect(),
                total_amount: group.iter().map(|r| r.amount).sum(),
                estimated_cost: limits.cost_per_item * group.len() as u64,
                status: BatchStatus::Pending,
                priority_score: priority_score(&group, now, self.settings.age_bonus_cap),
                created_at: now,
                updated_at: now,
            };

            match self.store.insert_batch(&batch).await {
                Ok(()) => {
                    info!(
                        target: "custody::withdrawal",
                        batch_id = %batch.id,
                        partner_id = %partner_id,
                        items = batch.items.len(),
                        total_amount = batch.total_amount,
                        priority_score = batch.priority_score,
                        "Batch created"
                    );
                    created.push(batch);
                }
                // another optimizer got there first
                Err(StorageError::Duplicate(what)) => {
                    debug!(target: "custody::withdrawal", reason = %what, "Skipped contended batch");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(created)
    }

    /// Dispatch a pending batch
    ///
    /// The whole batch's energy is reserved up front; if that fails the batch
    /// goes back to PENDING untouched. Once items start going out, a failure
    /// to record one stops the dispatch and settles the batch with its
    /// unsent items failed.
    pub async fn dispatch(&self, batch_id: &str) -> Result<WithdrawalBatch> {
        let batch = self.get_batch(batch_id).await?;
        let now = Utc::now();

        if !self.store.claim_batch(batch_id, now).await? {
            return Err(CustodyError::validation(format!(
                "batch {} is {}, not pending",
                batch_id, batch.status
            )));
        }

        let source = match self.reserve(&batch).await {
            Ok(source) => source,
            Err(e) => {
                self.store.release_batch(batch_id, Utc::now()).await?;
                return Err(e);
            }
        };

        for item in &batch.items {
            let settled = self.send_item(&source, item).await;
            if let Err(e) = self
                .store
                .record_batch_item(batch_id, &settled, Utc::now())
                .await
            {
                error!(
                    target: "custody::withdrawal",
                    batch_id = %batch_id,
                    request_id = %settled.request_id,
                    tx_hash = ?settled.tx_hash,
                    error = %e,
                    "Batch item outcome could not be recorded"
                );
                self.store
                    .abandon_batch(batch_id, &format!("dispatch stopped: {}", e), Utc::now())
                    .await?;
                return Err(e.into());
            }
        }

        let mut batch = self.get_batch(batch_id).await?;
        let status = batch.settled_status();
        self.store.finish_batch(batch_id, status, Utc::now()).await?;
        batch.status = status;

        info!(
            target: "custody::withdrawal",
            batch_id = %batch_id,
            status = %status,
            items = batch.items.len(),
            "Batch dispatched"
        );

        Ok(batch)
    }

    /// Collection address to pay from, after reserving the batch's energy
    async fn reserve(&self, batch: &WithdrawalBatch) -> Result<String> {
        let wallet = self
            .store
            .get_master_wallet(&batch.partner_id)
            .await?
            .ok_or_else(|| CustodyError::not_found(format!("master wallet for {}", batch.partner_id)))?;
        let pool = self
            .store
            .get_pool_by_partner(&batch.partner_id)
            .await?
            .ok_or_else(|| CustodyError::not_found(format!("resource pool for {}", batch.partner_id)))?;

        if batch.estimated_cost > 0 {
            self.resources
                .consume(
                    &pool.id,
                    ResourceKind::Energy,
                    batch.estimated_cost,
                    &format!("batch:{}", batch.id),
                )
                .await?;
        }

        Ok(wallet.collection_address)
    }

    /// Sign and broadcast one item; every failure is kept on the item
    async fn send_item(&self, source: &str, item: &BatchItem) -> BatchItem {
        let mut settled = item.clone();

        let request = match self.store.get_withdrawal(&item.request_id).await {
            Ok(Some(request)) if request.status == WithdrawalStatus::Processing => request,
            Ok(Some(request)) => {
                return failed_item(settled, format!("request is {}", request.status));
            }
            Ok(None) => return failed_item(settled, "request not found".to_string()),
            Err(e) => return failed_item(settled, e.to_string()),
        };

        match sign_with_timeout(
            self.gateway.as_ref(),
            self.signing_timeout,
            source,
            &request.destination,
            request.amount,
            &request.asset,
        )
        .await
        {
            Ok(tx_hash) => {
                log_withdrawal_event(
                    "withdrawal_sent",
                    &request.id,
                    request.amount,
                    &request.destination,
                    true,
                    Some(&tx_hash),
                    None,
                );
                settled.outcome = ItemOutcome::Succeeded;
                settled.tx_hash = Some(tx_hash);
                settled
            }
            Err(e) => {
                let message = e.to_string();
                log_withdrawal_event(
                    "withdrawal_failed",
                    &request.id,
                    request.amount,
                    &request.destination,
                    false,
                    None,
                    Some(&message),
                );
                failed_item(settled, message)
            }
        }
    }

    /// Settle PROCESSING batches that recorded nothing within the lease
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - chrono::Duration::seconds(self.settings.processing_lease_secs as i64);
        let settled = self
            .store
            .reclaim_stale_batches(cutoff, "processing lease expired", now)
            .await?;

        for batch in &settled {
            warn!(
                target: "custody::withdrawal",
                batch_id = %batch.id,
                status = %batch.status,
                "Stale batch settled"
            );
        }
        Ok(settled.len())
    }

    /// Settle stale batches, build new batches for every partner, then
    /// dispatch pending batches in priority order
    pub async fn run_cycle(&self) -> Result<BatchCycleSummary> {
        let mut summary = BatchCycleSummary {
            recovered: self.recover_stale(Utc::now()).await?,
            ..BatchCycleSummary::default()
        };

        for partner_id in self.store.partners_with_batchable().await? {
            match self.build_batches(&partner_id).await {
                Ok(batches) => summary.created += batches.len(),
                Err(e) => warn!(
                    target: "custody::withdrawal",
                    partner_id = %partner_id,
                    error = %e,
                    "Batch build failed"
                ),
            }
        }

        for batch in self.store.list_batches_by_status(BatchStatus::Pending).await? {
            match self.dispatch(&batch.id).await {
                Ok(done) => {
                    summary.dispatched += 1;
                    for item in &done.items {
                        match item.outcome {
                            ItemOutcome::Succeeded => summary.items_succeeded += 1,
                            ItemOutcome::Failed => summary.items_failed += 1,
                            ItemOutcome::Pending => {}
                        }
                    }
                }
                Err(e @ CustodyError::InsufficientResource { .. }) => {
                    summary.deferred += 1;
                    debug!(target: "custody::withdrawal", batch_id = %batch.id, reason = %e, "Batch deferred");
                }
                Err(e) => {
                    error!(target: "custody::withdrawal", batch_id = %batch.id, error = %e, "Batch dispatch failed");
                }
            }
        }

        Ok(summary)
    }

    /// Periodic worker; returns after `stop`
    pub async fn run(&self) -> Result<()> {
        *self.running.write().await = true;

        info!(
            target: "custody::withdrawal",
            interval_secs = self.settings.batch_interval_secs,
            "Batch optimizer started"
        );

        let mut ticker = interval(Duration::from_secs(self.settings.batch_interval_secs));
        loop {
            ticker.tick().await;
            if !*self.running.read().await {
                break;
            }

            match self.run_cycle().await {
                Ok(summary) if summary.has_activity() => {
                    info!(target: "custody::withdrawal", "[batch] {}", summary);
                }
                Ok(_) => {}
                Err(e) => error!(target: "custody::withdrawal", error = %e, "Batch cycle failed"),
            }
        }

        info!(target: "custody::withdrawal", "Batch optimizer stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }
}

fn failed_item(mut item: BatchItem, error: String) -> BatchItem {
    item.outcome = ItemOutcome::Failed;
    item.error = Some(error);
    item
}
