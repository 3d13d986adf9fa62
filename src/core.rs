//! Custody Core
//!
//! Wires the components together and exposes the operations an outer API
//! layer calls. Workers (`sweeps`, `batches`, `resources`) are shared so a
//! binary can spawn their loops next to the facade.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::common::{CustodyConfig, CustodyError, Result};
use crate::custody::{validate_address, KeyCustodyVault, SealingKey};
use crate::ledger::{with_timeout, LedgerClient, TransactionRelay, TronGridClient};
use crate::registry::DepositAddressRegistry;
use crate::resources::{AlertSink, ResourcePoolMonitor, TracingAlertSink};
use crate::signing::{SigningGateway, VaultSigningGateway};
use crate::storage::{CustodyStore, SqliteStore};
use crate::sweep::SweepScheduler;
use crate::types::{
    DepositAddress, QueueType, ResourcePool, SweepQueueEntry, WhitelistEntry, WithdrawalBatch,
    WithdrawalPolicy, WithdrawalRequest,
};
use crate::withdrawal::{
    BatchOptimizer, PolicyDecision, WhitelistSubmission, WithdrawalService, WithdrawalSubmission,
};

/// External collaborators the core is built around
pub struct Collaborators {
    pub store: Arc<dyn CustodyStore>,
    pub ledger: Arc<dyn LedgerClient>,
    pub relay: Arc<dyn TransactionRelay>,
    pub alerts: Arc<dyn AlertSink>,
    /// Overrides the vault-backed gateway, e.g. for an external signer
    pub gateway: Option<Arc<dyn SigningGateway>>,
}

pub struct CustodyCore {
    store: Arc<dyn CustodyStore>,
    ledger: Arc<dyn LedgerClient>,
    ledger_timeout: std::time::Duration,
    vault: Arc<KeyCustodyVault>,
    registry: Arc<DepositAddressRegistry>,
    resources: Arc<ResourcePoolMonitor>,
    sweeps: Arc<SweepScheduler>,
    withdrawals: Arc<WithdrawalService>,
    batches: Arc<BatchOptimizer>,
    /// Serializes address lookups-then-derivations so a user gets one address
    address_lock: Mutex<()>,
}

impl CustodyCore {
    pub fn new(config: &CustodyConfig, sealing_key: SealingKey, parts: Collaborators) -> Self {
        let Collaborators {
            store,
            ledger,
            relay,
            alerts,
            gateway,
        } = parts;
        let ledger_timeout = config.timeouts.ledger();
        let signing_timeout = config.timeouts.signing();

        let vault = Arc::new(KeyCustodyVault::new(store.clone(), sealing_key));
        let gateway: Arc<dyn SigningGateway> = match gateway {
            Some(gateway) => gateway,
            None => Arc::new(VaultSigningGateway::new(vault.clone(), relay, signing_timeout)),
        };

        let registry = Arc::new(DepositAddressRegistry::new(
            store.clone(),
            ledger.clone(),
            config.sweep.clone(),
            ledger_timeout,
        ));
        let resources = Arc::new(ResourcePoolMonitor::new(
            store.clone(),
            ledger.clone(),
            alerts,
            config.resources.clone(),
            ledger_timeout,
        ));
        let sweeps = Arc::new(SweepScheduler::new(
            store.clone(),
            registry.clone(),
            resources.clone(),
            gateway.clone(),
            config.sweep.clone(),
            signing_timeout,
        ));
        let withdrawals = Arc::new(WithdrawalService::new(
            store.clone(),
            config.withdrawals.clone(),
        ));
        let batches = Arc::new(BatchOptimizer::new(
            store.clone(),
            resources.clone(),
            gateway,
            config.withdrawals.clone(),
            signing_timeout,
        ));

        Self {
            store,
            ledger,
            ledger_timeout,
            vault,
            registry,
            resources,
            sweeps,
            withdrawals,
            batches,
            address_lock: Mutex::new(()),
        }
    }

    /// Open the configured database and connect to the configured ledger API
    pub fn from_config(config: &CustodyConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::new(&config.db_path)?);
        let client = Arc::new(TronGridClient::new(
            &config.ledger_api,
            config.ledger_api_key.clone(),
        ));
        let sealing_key = SealingKey::new(config.installation_key_bytes()?);

        Ok(Self::new(
            config,
            sealing_key,
            Collaborators {
                store,
                ledger: client.clone(),
                relay: client,
                alerts: Arc::new(TracingAlertSink),
                gateway: None,
            },
        ))
    }

    pub fn vault(&self) -> &Arc<KeyCustodyVault> {
        &self.vault
    }

    pub fn registry(&self) -> &Arc<DepositAddressRegistry> {
        &self.registry
    }

    pub fn resources(&self) -> &Arc<ResourcePoolMonitor> {
        &self.resources
    }

    pub fn sweeps(&self) -> &Arc<SweepScheduler> {
        &self.sweeps
    }

    pub fn withdrawals(&self) -> &Arc<WithdrawalService> {
        &self.withdrawals
    }

    pub fn batches(&self) -> &Arc<BatchOptimizer> {
        &self.batches
    }

    /// The user's deposit address under a partner, created on first call
    ///
    /// A first call for a partner also creates its master wallet and
    /// registers the collection wallet's resource pool.
    pub async fn generate_deposit_address(
        &self,
        partner_id: &str,
        user_id: &str,
    ) -> Result<DepositAddress> {
        if partner_id.is_empty() || user_id.is_empty() {
            return Err(CustodyError::validation("partner and user ids are required"));
        }

        let wallet = self.vault.ensure_master_wallet(partner_id).await?;
        if self.store.get_pool_by_partner(partner_id).await?.is_none() {
            self.resources
                .register_pool(partner_id, &wallet.collection_address, None)
                .await?;
        }

        let _guard = self.address_lock.lock().await;
        if let Some(existing) = self
            .store
            .find_active_address_for_user(partner_id, user_id)
            .await?
        {
            return Ok(existing);
        }
        Ok(self.vault.derive_deposit_address(partner_id, user_id).await?)
    }

    /// Queue a sweep of the address's unswept balance
    pub async fn enqueue_sweep(
        &self,
        deposit_address_id: &str,
        queue_type: QueueType,
    ) -> Result<SweepQueueEntry> {
        let address = self
            .store
            .get_deposit_address(deposit_address_id)
            .await?
            .ok_or_else(|| {
                CustodyError::not_found(format!("deposit address {}", deposit_address_id))
            })?;
        let outcome = self
            .sweeps
            .enqueue(deposit_address_id, queue_type, address.unswept())
            .await?;
        Ok(outcome.entry)
    }

    pub async fn cancel_sweep(&self, entry_id: &str) -> Result<()> {
        self.sweeps.cancel(entry_id).await
    }

    pub async fn record_deposit(&self, address: &str, amount: u64) -> Result<DepositAddress> {
        self.registry.record_deposit(address, amount).await
    }

    pub async fn get_pool_status(&self, partner_id: &str) -> Result<ResourcePool> {
        self.resources.pool_status(partner_id).await
    }

    pub async fn submit_withdrawal(
        &self,
        submission: WithdrawalSubmission,
    ) -> Result<(WithdrawalRequest, PolicyDecision)> {
        self.withdrawals.submit(submission).await
    }

    pub async fn evaluate_withdrawal(&self, request_id: &str) -> Result<PolicyDecision> {
        self.withdrawals.evaluate_withdrawal(request_id).await
    }

    pub async fn get_batch_status(&self, batch_id: &str) -> Result<WithdrawalBatch> {
        self.batches.get_batch(batch_id).await
    }

    pub async fn set_policy(&self, policy: WithdrawalPolicy) -> Result<WithdrawalPolicy> {
        self.withdrawals.set_policy(policy).await
    }

    pub async fn add_whitelist_entry(&self, submission: WhitelistSubmission) -> Result<WhitelistEntry> {
        self.withdrawals.add_whitelist_entry(submission).await
    }

    /// Ask the ledger for a throwaway keypair and check its address format
    pub async fn ledger_self_check(&self) -> Result<()> {
        let keypair = with_timeout(self.ledger_timeout, self.ledger.generate_keypair()).await?;
        validate_address(&keypair.address)?;
        info!(target: "custody::ledger", "Ledger self-check passed");
        Ok(())
    }
}
