//! Sweep Scheduler
//!
//! Drains the sweep queue. Each claimed entry reserves one sweep's energy,
//! goes through the signing gateway and then either completes, goes back on
//! the queue with a delay, or fails once its attempts are spent.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::common::{log_sweep_event, CustodyError, Result, SweepSettings};
use crate::registry::DepositAddressRegistry;
use crate::resources::ResourcePoolMonitor;
use crate::signing::{sign_with_timeout, SigningGateway};
use crate::storage::{CustodyStore, EnqueueOutcome};
use crate::types::{QueueType, ResourceKind, SweepQueueEntry, SweepRecord, SweepStatus};

/// What happened to one claimed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    Completed { tx_hash: String, amount: u64 },
    /// Attempt charged, back on the queue after the retry delay
    Retrying { attempts: u32, error: String },
    /// Not enough resource; back on the queue with no attempt charged
    Deferred { reason: String },
    Failed { error: String },
}

/// Result of one scheduler cycle
#[derive(Debug, Default, Clone)]
pub struct CycleSummary {
    pub recovered: usize,
    pub expired: u64,
    pub enqueued: usize,
    pub completed: usize,
    pub retrying: usize,
    pub deferred: usize,
    pub failed: usize,
}

impl CycleSummary {
    pub fn has_activity(&self) -> bool {
        self.recovered > 0
            || self.expired > 0
            || self.enqueued > 0
            || self.completed > 0
            || self.retrying > 0
            || self.deferred > 0
            || self.failed > 0
    }

    fn record(&mut self, outcome: &SweepOutcome) {
        match outcome {
            SweepOutcome::Completed { .. } => self.completed += 1,
            SweepOutcome::Retrying { .. } => self.retrying += 1,
            SweepOutcome::Deferred { .. } => self.deferred += 1,
            SweepOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

impl std::fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "recovered: {}, expired: {}, enqueued: {}, completed: {}, retrying: {}, deferred: {}, failed: {}",
            self.recovered,
            self.expired,
            self.enqueued,
            self.completed,
            self.retrying,
            self.deferred,
            self.failed
        )
    }
}

/// Queue-backed sweep worker
pub struct SweepScheduler {
    store: Arc<dyn CustodyStore>,
    registry: Arc<DepositAddressRegistry>,
    resources: Arc<ResourcePoolMonitor>,
    gateway: Arc<dyn SigningGateway>,
    settings: SweepSettings,
    signing_timeout: Duration,
    running: Arc<RwLock<bool>>,
}

impl SweepScheduler {
    pub fn new(
        store: Arc<dyn CustodyStore>,
        registry: Arc<DepositAddressRegistry>,
        resources: Arc<ResourcePoolMonitor>,
        gateway: Arc<dyn SigningGateway>,
        settings: SweepSettings,
        signing_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            resources,
            gateway,
            settings,
            signing_timeout,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Queue a sweep for an address
    ///
    /// Idempotent: if the address already has a queued or processing entry,
    /// that entry is returned unchanged.
    pub async fn enqueue(
        &self,
        deposit_address_id: &str,
        queue_type: QueueType,
        expected_amount: u64,
    ) -> Result<EnqueueOutcome> {
        let address = self
            .store
            .get_deposit_address(deposit_address_id)
            .await?
            .ok_or_else(|| {
                CustodyError::not_found(format!("deposit address {}", deposit_address_id))
            })?;
        if !address.is_active {
            return Err(CustodyError::validation(format!(
                "address {} is deactivated",
                address.address
            )));
        }

        let entry = SweepQueueEntry::new(
            deposit_address_id.to_string(),
            queue_type,
            expected_amount,
            Utc::now(),
            ChronoDuration::seconds(self.settings.expiry_secs as i64),
        );
        let outcome = self.store.enqueue_sweep(&entry).await?;

        if outcome.created {
            info!(
                target: "custody::sweep",
                entry_id = %outcome.entry.id,
                address = %address.address,
                queue = %queue_type,
                expected_amount = expected_amount,
                "Sweep queued"
            );
        } else {
            debug!(
                target: "custody::sweep",
                entry_id = %outcome.entry.id,
                address = %address.address,
                "Sweep already active"
            );
        }

        Ok(outcome)
    }

    /// Cancel a queued entry
    pub async fn cancel(&self, entry_id: &str) -> Result<()> {
        if self.store.cancel_sweep(entry_id, Utc::now()).await? {
            info!(target: "custody::sweep", entry_id = %entry_id, "Sweep cancelled");
            return Ok(());
        }

        match self.store.get_sweep_entry(entry_id).await? {
            None => Err(CustodyError::not_found(format!("sweep entry {}", entry_id))),
            Some(entry) => Err(CustodyError::validation(format!(
                "sweep entry {} is {}; only queued entries can be cancelled",
                entry_id, entry.status
            ))),
        }
    }

    /// Expire overdue queued entries
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64> {
        let expired = self.store.expire_sweeps(now).await?;
        if expired > 0 {
            info!(target: "custody::sweep", count = expired, "Expired stale sweeps");
        }
        Ok(expired)
    }

    /// Settle PROCESSING entries whose worker stopped touching them
    ///
    /// Each one is charged an attempt, so it is retried or failed like any
    /// other broken-off attempt.
    pub async fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - ChronoDuration::seconds(self.settings.processing_lease_secs as i64);
        let mut recovered = 0;

        for entry in self.store.stale_sweeps(cutoff).await? {
            match self.release(&entry, "processing lease expired".to_string()).await {
                Ok(_) => recovered += 1,
                Err(e) => warn!(
                    target: "custody::sweep",
                    entry_id = %entry.id,
                    error = %e,
                    "Stale sweep could not be settled"
                ),
            }
        }

        if recovered > 0 {
            warn!(target: "custody::sweep", count = recovered, "Recovered stale sweeps");
        }
        Ok(recovered)
    }

    /// Per-status entry counts
    pub async fn stats(&self) -> Result<HashMap<SweepStatus, u64>> {
        Ok(self.store.count_sweeps_by_status().await?)
    }

    fn retry_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + ChronoDuration::seconds(self.settings.retry_delay_secs as i64)
    }

    /// Put the entry back without charging an attempt
    async fn defer(&self, entry: &SweepQueueEntry, reason: String) -> Result<SweepOutcome> {
        self.store
            .requeue_sweep(&entry.id, self.retry_at(Utc::now()), entry.attempts, Some(&reason))
            .await?;
        debug!(target: "custody::sweep", entry_id = %entry.id, reason = %reason, "Sweep deferred");
        Ok(SweepOutcome::Deferred { reason })
    }

    /// Charge an attempt; requeue or fail depending on what is left
    async fn charge_attempt(
        &self,
        entry: &SweepQueueEntry,
        from_address: &str,
        to_address: &str,
        amount: u64,
        error: String,
        permanent: bool,
    ) -> Result<SweepOutcome> {
        let now = Utc::now();
        let attempts = entry.attempts + 1;

        if permanent || attempts >= self.settings.max_attempts {
            let record = SweepRecord::failed(
                entry,
                from_address,
                to_address,
                amount,
                self.settings.asset.clone(),
                error.clone(),
                now,
            );
            self.store.fail_sweep(&entry.id, attempts, &record).await?;
            log_sweep_event(
                "sweep_failed",
                &entry.id,
                from_address,
                amount,
                false,
                None,
                Some(&error),
            );
            return Ok(SweepOutcome::Failed { error });
        }

        self.store
            .requeue_sweep(&entry.id, self.retry_at(now), attempts, Some(&error))
            .await?;
        warn!(
            target: "custody::sweep",
            entry_id = %entry.id,
            attempts = attempts,
            max_attempts = self.settings.max_attempts,
            error = %error,
            "Sweep attempt failed; requeued"
        );
        Ok(SweepOutcome::Retrying { attempts, error })
    }

    /// Charge an attempt against an entry whose processing broke off
    async fn release(&self, entry: &SweepQueueEntry, error: String) -> Result<SweepOutcome> {
        let address = self.store.get_deposit_address(&entry.deposit_address_id).await?;
        let wallet = match &address {
            Some(address) => {
                self.store
                    .get_master_wallet_by_id(&address.master_wallet_id)
                    .await?
            }
            None => None,
        };

        match (address, wallet) {
            (Some(address), Some(wallet)) => {
                self.charge_attempt(
                    entry,
                    &address.address,
                    &wallet.collection_address,
                    0,
                    error,
                    false,
                )
                .await
            }
            // unresolvable addresses fail the entry outright
            (address, _) => {
                let from = address.map(|a| a.address).unwrap_or_default();
                self.charge_attempt(entry, &from, "", 0, error, true).await
            }
        }
    }

    /// Process a claimed (PROCESSING) entry to its next state
    ///
    /// An error part way through still settles the entry through an attempt
    /// charge; `Err` means even that failed and the entry waits for lease
    /// recovery.
    pub async fn process_entry(&self, entry: &SweepQueueEntry) -> Result<SweepOutcome> {
        match self.advance(entry).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(target: "custody::sweep", entry_id = %entry.id, error = %e, "Sweep processing error");
                self.release(entry, e.to_string()).await
            }
        }
    }

    async fn advance(&self, entry: &SweepQueueEntry) -> Result<SweepOutcome> {
        let address = self
            .store
            .get_deposit_address(&entry.deposit_address_id)
            .await?
            .ok_or_else(|| {
                CustodyError::not_found(format!("deposit address {}", entry.deposit_address_id))
            })?;
        let wallet = self
            .store
            .get_master_wallet_by_id(&address.master_wallet_id)
            .await?
            .ok_or_else(|| {
                CustodyError::not_found(format!("master wallet {}", address.master_wallet_id))
            })?;
        let collection = wallet.collection_address;

        if !address.is_active {
            return self
                .charge_attempt(entry, &address.address, &collection, 0, "address deactivated".into(), true)
                .await;
        }

        let amount = match self.registry.sweepable_for(&address).await {
            Ok(0) => {
                return self
                    .charge_attempt(entry, &address.address, &collection, 0, "nothing to sweep".into(), false)
                    .await
            }
            Ok(amount) => amount,
            Err(e) => {
                return self
                    .charge_attempt(entry, &address.address, &collection, 0, e.to_string(), false)
                    .await
            }
        };

        let pool = match self.store.get_pool_by_partner(&address.partner_id).await? {
            Some(pool) => pool,
            None => {
                return self
                    .defer(entry, format!("no resource pool for {}", address.partner_id))
                    .await
            }
        };

        if self.settings.energy_per_sweep > 0 {
            let reason = format!("sweep:{}", entry.id);
            match self
                .resources
                .consume(&pool.id, ResourceKind::Energy, self.settings.energy_per_sweep, &reason)
                .await
            {
                Ok(_) => {}
                Err(e @ CustodyError::InsufficientResource { .. }) => {
                    return self.defer(entry, e.to_string()).await;
                }
                Err(e) => return Err(e),
            }
        }

        match sign_with_timeout(
            self.gateway.as_ref(),
            self.signing_timeout,
            &address.address,
            &collection,
            amount,
            &self.settings.asset,
        )
        .await
        {
            Ok(tx_hash) => {
                let record = SweepRecord::completed(
                    entry,
                    &address.address,
                    &collection,
                    amount,
                    self.settings.asset.clone(),
                    tx_hash.clone(),
                    Utc::now(),
                );
                if let Err(e) = self.store.complete_sweep(&entry.id, &record).await {
                    error!(
                        target: "custody::sweep",
                        entry_id = %entry.id,
                        tx_hash = %tx_hash,
                        error = %e,
                        "Sweep broadcast but could not be recorded"
                    );
                    // funds already moved; never retry this entry
                    return self
                        .charge_attempt(
                            entry,
                            &address.address,
                            &collection,
                            amount,
                            format!("broadcast as {} but not recorded: {}", tx_hash, e),
                            true,
                        )
                        .await;
                }
                log_sweep_event(
                    "sweep_completed",
                    &entry.id,
                    &address.address,
                    amount,
                    true,
                    Some(&tx_hash),
                    None,
                );
                Ok(SweepOutcome::Completed { tx_hash, amount })
            }
            Err(e) => {
                let permanent = e.is_permanent();
                self.charge_attempt(entry, &address.address, &collection, amount, e.to_string(), permanent)
                    .await
            }
        }
    }

    /// One pass: recover and expire, auto-enqueue eligible addresses, then
    /// drain
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let now = Utc::now();
        let mut summary = CycleSummary {
            recovered: self.recover_stale(now).await?,
            expired: self.expire_stale(now).await?,
            ..CycleSummary::default()
        };

        for address in self.registry.eligible_addresses(None).await? {
            match self
                .enqueue(&address.id, QueueType::Normal, address.unswept())
                .await
            {
                Ok(outcome) if outcome.created => summary.enqueued += 1,
                Ok(_) => {}
                Err(e) => warn!(
                    target: "custody::sweep",
                    address = %address.address,
                    error = %e,
                    "Auto-enqueue failed"
                ),
            }
        }

        for _ in 0..self.settings.entries_per_cycle {
            let Some(entry) = self.store.claim_next_sweep(Utc::now()).await? else {
                break;
            };
            match self.process_entry(&entry).await {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    summary.failed += 1;
                    error!(
                        target: "custody::sweep",
                        entry_id = %entry.id,
                        error = %e,
                        "Sweep left processing until its lease expires"
                    );
                }
            }
        }

        Ok(summary)
    }

    /// Periodic worker; returns after `stop`
    pub async fn run(&self) -> Result<()> {
        *self.running.write().await = true;

        info!(
            target: "custody::sweep",
            interval_secs = self.settings.poll_interval_secs,
            entries_per_cycle = self.settings.entries_per_cycle,
            "Sweep scheduler started"
        );

        let mut ticker = interval(Duration::from_secs(self.settings.poll_interval_secs));
        loop {
            ticker.tick().await;
            if !*self.running.read().await {
                break;
            }

            match self.run_cycle().await {
                Ok(summary) if summary.has_activity() => {
                    info!(target: "custody::sweep", "[cycle] {}", summary);
                }
                Ok(_) => {}
                Err(e) => error!(target: "custody::sweep", error = %e, "Sweep cycle failed"),
            }
        }

        info!(target: "custody::sweep", "Sweep scheduler stopped");
        Ok(())
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ResourceSettings;
    use crate::custody::VaultError;
    use crate::ledger::{AccountInfo, AccountResource, MockLedgerClient};
    use crate::resources::alerts::MockAlertSink;
    use crate::signing::{MockSigningGateway, SigningError};
    use crate::storage::sqlite::test_support::{execute, seed_address, seed_wallet};
    use crate::storage::{ResourceStore, SqliteStore, SweepStore, WalletStore};
    use crate::types::{DepositAddress, MasterWallet, SweepRecordStatus};

    const BALANCE: u64 = 50_000_000;

    struct Harness {
        store: Arc<SqliteStore>,
        scheduler: SweepScheduler,
        wallet: MasterWallet,
        address: DepositAddress,
        pool_id: String,
    }

    fn settings() -> SweepSettings {
        SweepSettings {
            max_attempts: 3,
            retry_delay_secs: 300,
            energy_per_sweep: 65_000,
            entries_per_cycle: 10,
            ..SweepSettings::default()
        }
    }

    fn ledger(energy_limit: u64) -> MockLedgerClient {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_get_balance().returning(|_, _| Ok(BALANCE));
        ledger.expect_get_account_resource().returning(move |_| {
            Ok(AccountResource {
                energy_limit,
                net_limit: 10_000,
                ..AccountResource::default()
            })
        });
        ledger
            .expect_get_account()
            .returning(|_| Ok(AccountInfo::default()));
        ledger
    }

    async fn harness(gateway: MockSigningGateway, energy_limit: u64) -> Harness {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let wallet = seed_wallet(&store, "p1").await;
        let address = seed_address(&store, &wallet, "u1", 1).await;
        store.add_received(&address.id, 30_000_000).await.unwrap();

        let ledger: Arc<MockLedgerClient> = Arc::new(ledger(energy_limit));
        let registry = Arc::new(DepositAddressRegistry::new(
            store.clone(),
            ledger.clone(),
            settings(),
            Duration::from_secs(1),
        ));
        let mut alerts = MockAlertSink::new();
        alerts.expect_deliver().returning(|_| ());
        let resources = Arc::new(ResourcePoolMonitor::new(
            store.clone(),
            ledger,
            Arc::new(alerts),
            ResourceSettings::default(),
            Duration::from_secs(1),
        ));
        let pool = resources
            .register_pool("p1", &wallet.collection_address, None)
            .await
            .unwrap();
        resources.refresh(&pool.id).await.unwrap();

        let scheduler = SweepScheduler::new(
            store.clone(),
            registry,
            resources,
            Arc::new(gateway),
            settings(),
            Duration::from_secs(1),
        );

        Harness {
            store,
            scheduler,
            wallet,
            address,
            pool_id: pool.id,
        }
    }

    async fn claim(h: &Harness) -> SweepQueueEntry {
        h.store.claim_next_sweep(Utc::now()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_successful_sweep_updates_totals_and_pool() {
        let mut gateway = MockSigningGateway::new();
        gateway
            .expect_sign_and_broadcast()
            .withf(|from, to, amount, _| {
                from == "Tdepp11" && to == "Tcollectp1" && *amount == 30_000_000
            })
            .times(1)
            .returning(|_, _, _, _| Ok("txhash1".to_string()));
        let h = harness(gateway, 1_000_000).await;

        h.scheduler
            .enqueue(&h.address.id, QueueType::Normal, 30_000_000)
            .await
            .unwrap();
        let entry = claim(&h).await;
        let outcome = h.scheduler.process_entry(&entry).await.unwrap();
        assert_eq!(
            outcome,
            SweepOutcome::Completed {
                tx_hash: "txhash1".to_string(),
                amount: 30_000_000
            }
        );

        let address = h.store.get_deposit_address(&h.address.id).await.unwrap().unwrap();
        assert_eq!(address.total_swept, 30_000_000);
        assert!(address.total_swept <= address.total_received);

        let records = h.store.sweep_records_for_address(&h.address.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SweepRecordStatus::Completed);
        assert_eq!(records[0].to_address, h.wallet.collection_address);

        let pool = h.store.get_pool(&h.pool_id).await.unwrap().unwrap();
        assert_eq!(pool.energy.available, 1_000_000 - 65_000);
        assert!(pool.energy.is_consistent());
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let h = harness(MockSigningGateway::new(), 1_000_000).await;

        let first = h
            .scheduler
            .enqueue(&h.address.id, QueueType::Normal, 1)
            .await
            .unwrap();
        let second = h
            .scheduler
            .enqueue(&h.address.id, QueueType::Emergency, 2)
            .await
            .unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.entry.id, second.entry.id);

        let stats = h.scheduler.stats().await.unwrap();
        assert_eq!(stats.get(&SweepStatus::Queued), Some(&1));
    }

    #[tokio::test]
    async fn test_insufficient_energy_defers_without_charge() {
        let mut gateway = MockSigningGateway::new();
        gateway.expect_sign_and_broadcast().never();
        let h = harness(gateway, 10_000).await;

        h.scheduler
            .enqueue(&h.address.id, QueueType::Normal, 0)
            .await
            .unwrap();
        let entry = claim(&h).await;
        let outcome = h.scheduler.process_entry(&entry).await.unwrap();
        assert!(matches!(outcome, SweepOutcome::Deferred { .. }));

        let entry = h.store.get_sweep_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, SweepStatus::Queued);
        assert_eq!(entry.attempts, 0);
        assert!(entry.scheduled_at > Utc::now());
    }

    #[tokio::test]
    async fn test_failures_retry_then_fail() {
        let mut gateway = MockSigningGateway::new();
        gateway
            .expect_sign_and_broadcast()
            .times(3)
            .returning(|_, _, _, _| Err(SigningError::Timeout(1_000)));
        let h = harness(gateway, 10_000_000).await;

        h.scheduler
            .enqueue(&h.address.id, QueueType::Normal, 0)
            .await
            .unwrap();

        let mut entry = claim(&h).await;
        for expected in 1..=2 {
            let outcome = h.scheduler.process_entry(&entry).await.unwrap();
            assert!(matches!(outcome, SweepOutcome::Retrying { attempts, .. } if attempts == expected));
            // pull the retry forward instead of waiting out the delay
            entry = h
                .store
                .claim_next_sweep(Utc::now() + ChronoDuration::seconds(301))
                .await
                .unwrap()
                .unwrap();
        }

        let outcome = h.scheduler.process_entry(&entry).await.unwrap();
        assert!(matches!(outcome, SweepOutcome::Failed { .. }));

        let entry = h.store.get_sweep_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, SweepStatus::Failed);
        assert_eq!(entry.attempts, 3);

        let records = h.store.sweep_records_for_address(&h.address.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SweepRecordStatus::Failed);

        let address = h.store.get_deposit_address(&h.address.id).await.unwrap().unwrap();
        assert_eq!(address.total_swept, 0);
    }

    #[tokio::test]
    async fn test_integrity_failure_fails_immediately() {
        let mut gateway = MockSigningGateway::new();
        gateway.expect_sign_and_broadcast().times(1).returning(|_, _, _, _| {
            Err(SigningError::Vault(VaultError::Integrity("tag mismatch".into())))
        });
        let h = harness(gateway, 10_000_000).await;

        h.scheduler
            .enqueue(&h.address.id, QueueType::Normal, 0)
            .await
            .unwrap();
        let entry = claim(&h).await;
        let outcome = h.scheduler.process_entry(&entry).await.unwrap();
        assert!(matches!(outcome, SweepOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_cancel_only_while_queued() {
        let h = harness(MockSigningGateway::new(), 1_000_000).await;

        let queued = h
            .scheduler
            .enqueue(&h.address.id, QueueType::Normal, 0)
            .await
            .unwrap();
        h.scheduler.cancel(&queued.entry.id).await.unwrap();

        let again = h
            .scheduler
            .enqueue(&h.address.id, QueueType::Normal, 0)
            .await
            .unwrap();
        assert!(again.created);
        claim(&h).await;
        assert!(matches!(
            h.scheduler.cancel(&again.entry.id).await,
            Err(CustodyError::Validation(_))
        ));
        assert!(matches!(
            h.scheduler.cancel("swq_missing").await,
            Err(CustodyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_run_cycle_enqueues_and_drains() {
        let mut gateway = MockSigningGateway::new();
        gateway
            .expect_sign_and_broadcast()
            .times(1)
            .returning(|_, _, _, _| Ok("txhash".to_string()));
        let h = harness(gateway, 1_000_000).await;

        let summary = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(summary.enqueued, 1);
        assert_eq!(summary.completed, 1);
        assert!(summary.has_activity());

        let stats = h.scheduler.stats().await.unwrap();
        assert_eq!(stats.get(&SweepStatus::Completed), Some(&1));
    }

    #[tokio::test]
    async fn test_unrecorded_broadcast_fails_entry_instead_of_stranding() {
        let h = harness(MockSigningGateway::new(), 1_000_000).await;
        let mut gateway = MockSigningGateway::new();
        let store = h.store.clone();
        gateway
            .expect_sign_and_broadcast()
            .times(1)
            .returning(move |_, _, _, _| {
                // a concurrent writer leaves nothing unswept
                execute(&store, "UPDATE deposit_addresses SET total_swept = total_received");
                Ok("txhash-lost".to_string())
            });
        let scheduler = SweepScheduler::new(
            h.store.clone(),
            Arc::new(DepositAddressRegistry::new(
                h.store.clone(),
                Arc::new(ledger(1_000_000)),
                settings(),
                Duration::from_secs(1),
            )),
            h.scheduler.resources.clone(),
            Arc::new(gateway),
            settings(),
            Duration::from_secs(1),
        );

        scheduler
            .enqueue(&h.address.id, QueueType::Normal, 0)
            .await
            .unwrap();
        let entry = claim(&h).await;
        let outcome = scheduler.process_entry(&entry).await.unwrap();
        assert!(matches!(outcome, SweepOutcome::Failed { ref error } if error.contains("txhash-lost")));

        let entry = h.store.get_sweep_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, SweepStatus::Failed);
        let records = h.store.sweep_records_for_address(&h.address.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, SweepRecordStatus::Failed);
    }

    #[tokio::test]
    async fn test_recover_stale_requeues_abandoned_entry() {
        let h = harness(MockSigningGateway::new(), 1_000_000).await;
        h.scheduler
            .enqueue(&h.address.id, QueueType::Normal, 0)
            .await
            .unwrap();
        let entry = claim(&h).await;

        // inside its lease the entry belongs to the worker that claimed it
        assert_eq!(h.scheduler.recover_stale(Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + ChronoDuration::hours(1);
        assert_eq!(h.scheduler.recover_stale(later).await.unwrap(), 1);

        let entry = h.store.get_sweep_entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, SweepStatus::Queued);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.last_error.as_deref(), Some("processing lease expired"));
        assert!(h.store.stale_sweeps(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_stale() {
        let h = harness(MockSigningGateway::new(), 1_000_000).await;
        h.scheduler
            .enqueue(&h.address.id, QueueType::Normal, 0)
            .await
            .unwrap();

        let expired = h
            .scheduler
            .expire_stale(Utc::now() + ChronoDuration::days(2))
            .await
            .unwrap();
        assert_eq!(expired, 1);
        assert!(h.store.claim_next_sweep(Utc::now()).await.unwrap().is_none());
    }
}
