//! Master wallet and deposit address tables

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use super::{db_err, get_time, get_u64, insert_err, SqliteStore};
use crate::storage::traits::{StorageError, StorageResult, WalletStore};
use crate::types::{DepositAddress, MasterWallet};

impl SqliteStore {
    fn row_to_wallet(row: &rusqlite::Row) -> rusqlite::Result<MasterWallet> {
        Ok(MasterWallet {
            id: row.get("id")?,
            partner_id: row.get("partner_id")?,
            encrypted_seed: row.get("encrypted_seed")?,
            derivation_path: row.get("derivation_path")?,
            last_index: row.get::<_, i64>("last_index")? as u32,
            public_key: row.get("public_key")?,
            collection_address: row.get("collection_address")?,
            halted: row.get("halted")?,
            created_at: get_time(row, "created_at")?,
            updated_at: get_time(row, "updated_at")?,
        })
    }

    pub(crate) fn row_to_address(row: &rusqlite::Row) -> rusqlite::Result<DepositAddress> {
        Ok(DepositAddress {
            id: row.get("id")?,
            master_wallet_id: row.get("master_wallet_id")?,
            partner_id: row.get("partner_id")?,
            user_id: row.get("user_id")?,
            derivation_index: row.get::<_, i64>("derivation_index")? as u32,
            address: row.get("address")?,
            encrypted_private_key: row.get("encrypted_private_key")?,
            is_active: row.get("is_active")?,
            is_monitored: row.get("is_monitored")?,
            total_received: get_u64(row, "total_received")?,
            total_swept: get_u64(row, "total_swept")?,
            created_at: get_time(row, "created_at")?,
            updated_at: get_time(row, "updated_at")?,
        })
    }

    fn insert_master_wallet_sync(&self, wallet: &MasterWallet) -> StorageResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO master_wallets (
                id, partner_id, encrypted_seed, derivation_path, last_index,
                public_key, collection_address, halted, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                wallet.id,
                wallet.partner_id,
                wallet.encrypted_seed,
                wallet.derivation_path,
                wallet.last_index as i64,
                wallet.public_key,
                wallet.collection_address,
                wallet.halted,
                wallet.created_at.timestamp(),
                wallet.updated_at.timestamp(),
            ],
        )
        .map_err(|e| insert_err(e, &format!("master wallet for partner {}", wallet.partner_id)))?;

        Ok(())
    }

    fn get_master_wallet_sync(&self, column: &str, value: &str) -> StorageResult<Option<MasterWallet>> {
        let conn = self.conn()?;
        let sql = format!("SELECT * FROM master_wallets WHERE {} = ?1", column);

        conn.query_row(&sql, params![value], Self::row_to_wallet)
            .optional()
            .map_err(db_err)
    }

    fn reserve_next_index_sync(&self, wallet_id: &str) -> StorageResult<u32> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let next: Option<i64> = tx
            .query_row(
                r#"
                UPDATE master_wallets
                SET last_index = last_index + 1, updated_at = unixepoch()
                WHERE id = ?1 AND halted = 0
                RETURNING last_index
                "#,
                params![wallet_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;

        let next = match next {
            Some(index) => index,
            None => {
                let halted: Option<bool> = tx
                    .query_row(
                        "SELECT halted FROM master_wallets WHERE id = ?1",
                        params![wallet_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                return Err(match halted {
                    Some(_) => StorageError::InvalidTransition(format!(
                        "wallet {} is halted",
                        wallet_id
                    )),
                    None => StorageError::NotFound(wallet_id.to_string()),
                });
            }
        };

        tx.commit().map_err(db_err)?;

        u32::try_from(next)
            .map_err(|_| StorageError::InvalidData(format!("derivation index overflow: {}", next)))
    }

    fn set_wallet_halted_sync(&self, wallet_id: &str, halted: bool) -> StorageResult<()> {
        let conn = self.conn()?;

        let rows = conn
            .execute(
                "UPDATE master_wallets SET halted = ?1, updated_at = unixepoch() WHERE id = ?2",
                params![halted, wallet_id],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::NotFound(wallet_id.to_string()));
        }
        Ok(())
    }

    fn insert_deposit_address_sync(&self, address: &DepositAddress) -> StorageResult<()> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO deposit_addresses (
                id, master_wallet_id, partner_id, user_id, derivation_index,
                address, encrypted_private_key, is_active, is_monitored,
                total_received, total_swept, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                address.id,
                address.master_wallet_id,
                address.partner_id,
                address.user_id,
                address.derivation_index as i64,
                address.address,
                address.encrypted_private_key,
                address.is_active,
                address.is_monitored,
                address.total_received as i64,
                address.total_swept as i64,
                address.created_at.timestamp(),
                address.updated_at.timestamp(),
            ],
        )
        .map_err(|e| {
            insert_err(
                e,
                &format!(
                    "deposit address {} (index {})",
                    address.address, address.derivation_index
                ),
            )
        })?;

        Ok(())
    }

    fn get_address_sync(&self, column: &str, value: &str) -> StorageResult<Option<DepositAddress>> {
        let conn = self.conn()?;
        let sql = format!("SELECT * FROM deposit_addresses WHERE {} = ?1", column);

        conn.query_row(&sql, params![value], Self::row_to_address)
            .optional()
            .map_err(db_err)
    }

    fn find_active_address_for_user_sync(
        &self,
        partner_id: &str,
        user_id: &str,
    ) -> StorageResult<Option<DepositAddress>> {
        let conn = self.conn()?;

        conn.query_row(
            r#"
            SELECT * FROM deposit_addresses
            WHERE partner_id = ?1 AND user_id = ?2 AND is_active = 1
            ORDER BY derivation_index ASC
            LIMIT 1
            "#,
            params![partner_id, user_id],
            Self::row_to_address,
        )
        .optional()
        .map_err(db_err)
    }

    fn list_monitored_addresses_sync(
        &self,
        partner_id: Option<&str>,
    ) -> StorageResult<Vec<DepositAddress>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT * FROM deposit_addresses
                WHERE is_active = 1 AND is_monitored = 1
                  AND (?1 IS NULL OR partner_id = ?1)
                ORDER BY created_at ASC, rowid ASC
                "#,
            )
            .map_err(db_err)?;

        let addresses = stmt
            .query_map(params![partner_id], Self::row_to_address)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(addresses)
    }

    fn update_address_flags_sync(
        &self,
        id: &str,
        is_active: bool,
        is_monitored: bool,
    ) -> StorageResult<()> {
        let conn = self.conn()?;

        // is_active only ever goes true -> false
        let rows = conn
            .execute(
                r#"
                UPDATE deposit_addresses
                SET is_active = (is_active AND ?1), is_monitored = ?2,
                    updated_at = unixepoch()
                WHERE id = ?3
                "#,
                params![is_active, is_monitored, id],
            )
            .map_err(db_err)?;

        if rows == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn add_received_sync(&self, id: &str, amount: u64) -> StorageResult<DepositAddress> {
        let conn = self.conn()?;

        conn.query_row(
            r#"
            UPDATE deposit_addresses
            SET total_received = total_received + ?1, updated_at = unixepoch()
            WHERE id = ?2
            RETURNING *
            "#,
            params![amount as i64, id],
            Self::row_to_address,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl WalletStore for SqliteStore {
    async fn insert_master_wallet(&self, wallet: &MasterWallet) -> StorageResult<()> {
        self.insert_master_wallet_sync(wallet)
    }

    async fn get_master_wallet(&self, partner_id: &str) -> StorageResult<Option<MasterWallet>> {
        self.get_master_wallet_sync("partner_id", partner_id)
    }

    async fn get_master_wallet_by_id(&self, id: &str) -> StorageResult<Option<MasterWallet>> {
        self.get_master_wallet_sync("id", id)
    }

    async fn get_master_wallet_by_collection_address(
        &self,
        address: &str,
    ) -> StorageResult<Option<MasterWallet>> {
        self.get_master_wallet_sync("collection_address", address)
    }

    async fn reserve_next_index(&self, wallet_id: &str) -> StorageResult<u32> {
        self.reserve_next_index_sync(wallet_id)
    }

    async fn set_wallet_halted(&self, wallet_id: &str, halted: bool) -> StorageResult<()> {
        self.set_wallet_halted_sync(wallet_id, halted)
    }

    async fn insert_deposit_address(&self, address: &DepositAddress) -> StorageResult<()> {
        self.insert_deposit_address_sync(address)
    }

    async fn get_deposit_address(&self, id: &str) -> StorageResult<Option<DepositAddress>> {
        self.get_address_sync("id", id)
    }

    async fn get_deposit_address_by_address(
        &self,
        address: &str,
    ) -> StorageResult<Option<DepositAddress>> {
        self.get_address_sync("address", address)
    }

    async fn find_active_address_for_user(
        &self,
        partner_id: &str,
        user_id: &str,
    ) -> StorageResult<Option<DepositAddress>> {
        self.find_active_address_for_user_sync(partner_id, user_id)
    }

    async fn list_monitored_addresses(
        &self,
        partner_id: Option<&str>,
    ) -> StorageResult<Vec<DepositAddress>> {
        self.list_monitored_addresses_sync(partner_id)
    }

    async fn update_address_flags(
        &self,
        id: &str,
        is_active: bool,
        is_monitored: bool,
    ) -> StorageResult<()> {
        self.update_address_flags_sync(id, is_active, is_monitored)
    }

    async fn add_received(&self, id: &str, amount: u64) -> StorageResult<DepositAddress> {
        self.add_received_sync(id, amount)
    }
}
