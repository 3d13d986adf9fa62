//! SQLite Persistent Storage
//!
//! Durable storage for all custody state. Uses connection pooling via r2d2
//! for concurrent access; multi-statement mutations run inside
//! `BEGIN IMMEDIATE` transactions so concurrent workers serialize on the
//! write lock instead of racing.
//!
//! Uniqueness invariants are enforced by the schema itself:
//! - `UNIQUE(master_wallet_id, derivation_index)` on deposit addresses
//! - a partial unique index over active sweep queue entries
//! - `UNIQUE(request_id)` on batch items

mod resources;
mod sweeps;
mod wallets;
mod withdrawals;

use chrono::{DateTime, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use super::traits::StorageError;
use crate::types::from_unix;

/// SQLite-backed custody store with connection pooling
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(|conn| {
            conn.busy_timeout(Duration::from_secs(10))?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
            conn.pragma_update(None, "foreign_keys", "ON")
        });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.pragma_update(None, "foreign_keys", "ON"));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS master_wallets (
                id TEXT PRIMARY KEY,
                partner_id TEXT NOT NULL UNIQUE,
                encrypted_seed TEXT NOT NULL,
                derivation_path TEXT NOT NULL,
                last_index INTEGER NOT NULL DEFAULT 0,
                public_key TEXT NOT NULL,
                collection_address TEXT NOT NULL UNIQUE,
                halted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS deposit_addresses (
                id TEXT PRIMARY KEY,
                master_wallet_id TEXT NOT NULL REFERENCES master_wallets(id),
                partner_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                derivation_index INTEGER NOT NULL,
                address TEXT NOT NULL UNIQUE,
                encrypted_private_key TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                is_monitored INTEGER NOT NULL DEFAULT 1,
                total_received INTEGER NOT NULL DEFAULT 0,
                total_swept INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (master_wallet_id, derivation_index),
                CHECK (derivation_index > 0),
                CHECK (total_swept <= total_received)
            );

            CREATE INDEX IF NOT EXISTS idx_deposit_addresses_user
                ON deposit_addresses(partner_id, user_id);

            CREATE TABLE IF NOT EXISTS sweep_queue (
                id TEXT PRIMARY KEY,
                deposit_address_id TEXT NOT NULL REFERENCES deposit_addresses(id),
                queue_type TEXT NOT NULL,
                priority INTEGER NOT NULL,
                status TEXT NOT NULL,
                expected_amount INTEGER NOT NULL DEFAULT 0,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                scheduled_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_sweep_queue_one_active
                ON sweep_queue(deposit_address_id)
                WHERE status IN ('queued', 'processing');
            CREATE INDEX IF NOT EXISTS idx_sweep_queue_due
                ON sweep_queue(status, priority DESC, created_at ASC);

            CREATE TABLE IF NOT EXISTS sweep_log (
                id TEXT PRIMARY KEY,
                queue_entry_id TEXT NOT NULL REFERENCES sweep_queue(id),
                deposit_address_id TEXT NOT NULL REFERENCES deposit_addresses(id),
                from_address TEXT NOT NULL,
                to_address TEXT NOT NULL,
                amount INTEGER NOT NULL,
                asset TEXT NOT NULL,
                tx_hash TEXT,
                batch_id TEXT,
                status TEXT NOT NULL,
                error TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sweep_log_address
                ON sweep_log(deposit_address_id);

            CREATE TABLE IF NOT EXISTS resource_pools (
                id TEXT PRIMARY KEY,
                partner_id TEXT NOT NULL UNIQUE,
                collection_address TEXT NOT NULL UNIQUE,
                energy_total INTEGER NOT NULL DEFAULT 0,
                energy_used INTEGER NOT NULL DEFAULT 0,
                energy_available INTEGER NOT NULL DEFAULT 0,
                bandwidth_total INTEGER NOT NULL DEFAULT 0,
                bandwidth_used INTEGER NOT NULL DEFAULT 0,
                bandwidth_available INTEGER NOT NULL DEFAULT 0,
                frozen_for_energy INTEGER NOT NULL DEFAULT 0,
                frozen_for_bandwidth INTEGER NOT NULL DEFAULT 0,
                warning_pct REAL NOT NULL,
                critical_pct REAL NOT NULL,
                status TEXT NOT NULL,
                daily_average_usage INTEGER NOT NULL DEFAULT 0,
                predicted_depletion_at INTEGER,
                prediction_confidence REAL NOT NULL DEFAULT 0,
                refreshed_status TEXT,
                last_alert_status TEXT,
                last_alert_at INTEGER,
                warning_alert_at INTEGER,
                critical_alert_at INTEGER,
                depleted_alert_at INTEGER,
                last_checked_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                CHECK (energy_available + energy_used = energy_total),
                CHECK (bandwidth_available + bandwidth_used = bandwidth_total)
            );

            CREATE TABLE IF NOT EXISTS resource_usage_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                pool_id TEXT NOT NULL REFERENCES resource_pools(id),
                kind TEXT NOT NULL,
                amount INTEGER NOT NULL,
                reason TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_resource_usage_pool_time
                ON resource_usage_log(pool_id, kind, created_at);

            CREATE TABLE IF NOT EXISTS withdrawal_requests (
                id TEXT PRIMARY KEY,
                partner_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                asset TEXT NOT NULL,
                destination TEXT NOT NULL,
                status TEXT NOT NULL,
                priority TEXT NOT NULL,
                risk_score INTEGER CHECK (risk_score BETWEEN 0 AND 100),
                review_reason TEXT,
                batch_id TEXT,
                tx_hash TEXT,
                error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_withdrawals_user
                ON withdrawal_requests(partner_id, user_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_withdrawals_destination
                ON withdrawal_requests(partner_id, destination, status);
            CREATE INDEX IF NOT EXISTS idx_withdrawals_status
                ON withdrawal_requests(partner_id, status);

            CREATE TABLE IF NOT EXISTS withdrawal_policies (
                partner_id TEXT PRIMARY KEY,
                is_active INTEGER NOT NULL,
                auto_approve_enabled INTEGER NOT NULL,
                per_tx_auto_approve_limit INTEGER NOT NULL,
                daily_auto_approve_limit INTEGER NOT NULL,
                risk_threshold INTEGER NOT NULL CHECK (risk_threshold BETWEEN 0 AND 100),
                whitelist_only INTEGER NOT NULL,
                max_batch_size INTEGER NOT NULL,
                batch_cost_ceiling INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS whitelist_entries (
                id TEXT PRIMARY KEY,
                partner_id TEXT NOT NULL,
                address TEXT NOT NULL,
                label TEXT,
                daily_limit INTEGER,
                monthly_limit INTEGER,
                verified_by TEXT NOT NULL,
                verified_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                UNIQUE (partner_id, address)
            );

            CREATE TABLE IF NOT EXISTS withdrawal_batches (
                id TEXT PRIMARY KEY,
                partner_id TEXT NOT NULL,
                total_amount INTEGER NOT NULL,
                estimated_cost INTEGER NOT NULL,
                status TEXT NOT NULL,
                priority_score INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_batches_status
                ON withdrawal_batches(status, priority_score DESC);

            CREATE TABLE IF NOT EXISTS batch_items (
                batch_id TEXT NOT NULL REFERENCES withdrawal_batches(id),
                request_id TEXT NOT NULL UNIQUE REFERENCES withdrawal_requests(id),
                position INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                estimated_cost INTEGER NOT NULL,
                outcome TEXT NOT NULL DEFAULT 'pending',
                tx_hash TEXT,
                error TEXT,
                PRIMARY KEY (batch_id, request_id)
            );
            "#,
        )
        .map_err(db_err)?;

        Ok(())
    }
}

/// Map a generic rusqlite error
pub(crate) fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// Map an insert error, turning constraint hits into `Duplicate`
pub(crate) fn insert_err(e: rusqlite::Error, what: &str) -> StorageError {
    if let rusqlite::Error::SqliteFailure(ref err, _) = e {
        // SQLITE_CONSTRAINT_PRIMARYKEY / SQLITE_CONSTRAINT_UNIQUE
        if err.extended_code == 1555 || err.extended_code == 2067 {
            return StorageError::Duplicate(what.to_string());
        }
    }
    db_err(e)
}

/// Parse a stored enum column inside a row mapper
pub(crate) fn parse_col<T>(row: &rusqlite::Row, col: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(col)?;
    raw.parse().map_err(|e: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn get_u64(row: &rusqlite::Row, col: &str) -> rusqlite::Result<u64> {
    Ok(row.get::<_, i64>(col)? as u64)
}

pub(crate) fn get_time(row: &rusqlite::Row, col: &str) -> rusqlite::Result<DateTime<Utc>> {
    Ok(from_unix(row.get(col)?))
}

pub(crate) fn get_opt_time(
    row: &rusqlite::Row,
    col: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(col)?.map(from_unix))
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;

    use super::SqliteStore;
    use crate::storage::traits::WalletStore;
    use crate::types::{new_id, DepositAddress, MasterWallet};

    pub async fn seed_wallet(store: &SqliteStore, partner_id: &str) -> MasterWallet {
        let now = Utc::now();
        let wallet = MasterWallet {
            id: new_id("mw"),
            partner_id: partner_id.to_string(),
            encrypted_seed: "00".to_string(),
            derivation_path: "m/44'/195'/0'".to_string(),
            last_index: 0,
            public_key: "xpub".to_string(),
            collection_address: format!("Tcollect{}", partner_id),
            halted: false,
            created_at: now,
            updated_at: now,
        };
        store.insert_master_wallet(&wallet).await.unwrap();
        wallet
    }

    pub async fn seed_address(
        store: &SqliteStore,
        wallet: &MasterWallet,
        user_id: &str,
        index: u32,
    ) -> DepositAddress {
        let now = Utc::now();
        let address = DepositAddress {
            id: new_id("dep"),
            master_wallet_id: wallet.id.clone(),
            partner_id: wallet.partner_id.clone(),
            user_id: user_id.to_string(),
            derivation_index: index,
            address: format!("Tdep{}{}", wallet.partner_id, index),
            encrypted_private_key: "00".to_string(),
            is_active: true,
            is_monitored: true,
            total_received: 0,
            total_swept: 0,
            created_at: now,
            updated_at: now,
        };
        store.insert_deposit_address(&address).await.unwrap();
        address
    }

    /// Run a statement directly, for tests that need rows no API produces
    pub fn execute(store: &SqliteStore, sql: &str) -> usize {
        store.conn().unwrap().execute(sql, []).unwrap()
    }
}
