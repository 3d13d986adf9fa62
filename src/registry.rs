//! Deposit Address Registry
//!
//! Monitoring state and sweep eligibility for deposit addresses. Deposits
//! are detected outside the core and reported through `record_deposit`;
//! eligibility is always decided against the live on-chain balance.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::common::{CustodyError, Result, SweepSettings};
use crate::ledger::{with_timeout, LedgerClient};
use crate::storage::CustodyStore;
use crate::types::{sun_to_display, DepositAddress};

/// Registry over the deposit addresses held in storage
pub struct DepositAddressRegistry {
    store: Arc<dyn CustodyStore>,
    ledger: Arc<dyn LedgerClient>,
    settings: SweepSettings,
    ledger_timeout: Duration,
}

impl DepositAddressRegistry {
    pub fn new(
        store: Arc<dyn CustodyStore>,
        ledger: Arc<dyn LedgerClient>,
        settings: SweepSettings,
        ledger_timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            settings,
            ledger_timeout,
        }
    }

    /// Look up an address record
    pub async fn get(&self, address: &str) -> Result<DepositAddress> {
        self.store
            .get_deposit_address_by_address(address)
            .await?
            .ok_or_else(|| CustodyError::not_found(format!("deposit address {}", address)))
    }

    /// Credit an externally detected deposit
    pub async fn record_deposit(&self, address: &str, amount: u64) -> Result<DepositAddress> {
        if amount == 0 {
            return Err(CustodyError::validation("deposit amount must be positive"));
        }

        let record = self.get(address).await?;
        if !record.is_active {
            return Err(CustodyError::validation(format!(
                "deposit to deactivated address {}",
                address
            )));
        }

        let updated = self.store.add_received(&record.id, amount).await?;

        info!(
            target: "custody::registry",
            address = %address,
            amount = %sun_to_display(amount),
            total_received = updated.total_received,
            "Recorded deposit"
        );

        Ok(updated)
    }

    /// On-chain balance of the configured sweep asset
    async fn onchain_balance(&self, address: &str) -> Result<u64> {
        let balance = with_timeout(
            self.ledger_timeout,
            self.ledger.get_balance(address, &self.settings.asset),
        )
        .await?;
        Ok(balance)
    }

    /// Balance above the reserve, or zero
    fn spendable(&self, balance: u64) -> u64 {
        balance.saturating_sub(self.settings.min_reserve)
    }

    /// Active, monitored, and holding more than the minimum sweep amount
    /// above the reserve
    pub async fn is_sweep_eligible(&self, address: &str) -> Result<bool> {
        let record = self.get(address).await?;
        self.check_eligible(&record).await
    }

    async fn check_eligible(&self, record: &DepositAddress) -> Result<bool> {
        if !record.is_watchable() {
            return Ok(false);
        }
        let balance = self.onchain_balance(&record.address).await?;
        Ok(self.spendable(balance) > self.settings.min_sweep_amount)
    }

    /// `min(balance - reserve, received - swept)`
    pub async fn sweepable_amount(&self, address: &str) -> Result<u64> {
        let record = self.get(address).await?;
        self.sweepable_for(&record).await
    }

    pub(crate) async fn sweepable_for(&self, record: &DepositAddress) -> Result<u64> {
        let balance = self.onchain_balance(&record.address).await?;
        Ok(self.spendable(balance).min(record.unswept()))
    }

    /// Permanently retire an address; monitoring stops with it
    pub async fn deactivate(&self, address: &str) -> Result<()> {
        let record = self.get(address).await?;
        self.store.update_address_flags(&record.id, false, false).await?;

        info!(target: "custody::registry", address = %address, "Deactivated deposit address");
        Ok(())
    }

    /// Toggle monitoring on an active address
    pub async fn set_monitored(&self, address: &str, monitored: bool) -> Result<()> {
        let record = self.get(address).await?;
        if !record.is_active {
            return Err(CustodyError::validation(format!(
                "address {} is deactivated",
                address
            )));
        }
        self.store
            .update_address_flags(&record.id, true, monitored)
            .await?;

        debug!(target: "custody::registry", address = %address, monitored = monitored, "Monitoring updated");
        Ok(())
    }

    /// Addresses that currently pass eligibility, optionally for one partner
    ///
    /// Ledger failures on individual addresses are logged and skipped so one
    /// bad lookup does not stall the scan.
    pub async fn eligible_addresses(&self, partner_id: Option<&str>) -> Result<Vec<DepositAddress>> {
        let candidates = self.store.list_monitored_addresses(partner_id).await?;
        let mut eligible = Vec::new();

        for record in candidates {
            match self.check_eligible(&record).await {
                Ok(true) => eligible.push(record),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        target: "custody::registry",
                        address = %record.address,
                        error = %e,
                        "Eligibility check failed"
                    );
                }
            }
        }

        Ok(eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerError, MockLedgerClient};
    use crate::storage::sqlite::test_support::{seed_address, seed_wallet};
    use crate::storage::SqliteStore;

    fn settings() -> SweepSettings {
        SweepSettings {
            min_sweep_amount: 10_000,
            min_reserve: 1_000,
            ..SweepSettings::default()
        }
    }

    fn ledger_with_balance(balance: u64) -> MockLedgerClient {
        let mut ledger = MockLedgerClient::new();
        ledger
            .expect_get_balance()
            .returning(move |_, _| Ok(balance));
        ledger
    }

    async fn setup(ledger: MockLedgerClient) -> (DepositAddressRegistry, Arc<SqliteStore>, DepositAddress) {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let wallet = seed_wallet(&store, "p1").await;
        let addr = seed_address(&store, &wallet, "u1", 1).await;
        let registry = DepositAddressRegistry::new(
            store.clone(),
            Arc::new(ledger),
            settings(),
            Duration::from_secs(1),
        );
        (registry, store, addr)
    }

    #[tokio::test]
    async fn test_record_deposit_accumulates() {
        let (registry, _, addr) = setup(MockLedgerClient::new()).await;

        registry.record_deposit(&addr.address, 4_000).await.unwrap();
        let updated = registry.record_deposit(&addr.address, 6_000).await.unwrap();
        assert_eq!(updated.total_received, 10_000);

        assert!(matches!(
            registry.record_deposit(&addr.address, 0).await,
            Err(CustodyError::Validation(_))
        ));
        assert!(matches!(
            registry.record_deposit("Tunknown", 5).await,
            Err(CustodyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_eligibility_uses_reserve_and_minimum() {
        // 11_000 - 1_000 reserve = 10_000, not above the 10_000 minimum
        let (registry, _, addr) = setup(ledger_with_balance(11_000)).await;
        assert!(!registry.is_sweep_eligible(&addr.address).await.unwrap());

        let (registry, _, addr) = setup(ledger_with_balance(11_001)).await;
        assert!(registry.is_sweep_eligible(&addr.address).await.unwrap());
    }

    #[tokio::test]
    async fn test_unmonitored_is_never_eligible() {
        let (registry, _, addr) = setup(ledger_with_balance(1_000_000)).await;
        registry.set_monitored(&addr.address, false).await.unwrap();
        assert!(!registry.is_sweep_eligible(&addr.address).await.unwrap());

        registry.set_monitored(&addr.address, true).await.unwrap();
        assert!(registry.is_sweep_eligible(&addr.address).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweepable_is_min_of_balance_and_unswept() {
        let (registry, _, addr) = setup(ledger_with_balance(50_000)).await;
        registry.record_deposit(&addr.address, 30_000).await.unwrap();
        assert_eq!(registry.sweepable_amount(&addr.address).await.unwrap(), 30_000);

        let (registry, _, addr) = setup(ledger_with_balance(20_000)).await;
        registry.record_deposit(&addr.address, 30_000).await.unwrap();
        assert_eq!(registry.sweepable_amount(&addr.address).await.unwrap(), 19_000);
    }

    #[tokio::test]
    async fn test_deactivation_is_terminal() {
        let (registry, _, addr) = setup(ledger_with_balance(1_000_000)).await;
        registry.deactivate(&addr.address).await.unwrap();

        assert!(!registry.is_sweep_eligible(&addr.address).await.unwrap());
        assert!(matches!(
            registry.set_monitored(&addr.address, true).await,
            Err(CustodyError::Validation(_))
        ));
        assert!(registry.record_deposit(&addr.address, 10).await.is_err());
    }

    #[tokio::test]
    async fn test_eligible_addresses_skips_ledger_failures() {
        let mut ledger = MockLedgerClient::new();
        ledger.expect_get_balance().returning(|address, _| {
            if address.ends_with('1') {
                Ok(1_000_000)
            } else {
                Err(LedgerError::Http("connection reset".to_string()))
            }
        });

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let wallet = seed_wallet(&store, "p1").await;
        let good = seed_address(&store, &wallet, "u1", 1).await;
        seed_address(&store, &wallet, "u2", 2).await;
        let registry =
            DepositAddressRegistry::new(store, Arc::new(ledger), settings(), Duration::from_secs(1));

        let eligible = registry.eligible_addresses(Some("p1")).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, good.id);
    }
}
