//! Environment-based Configuration for the Custody Core
//!
//! All sensitive values (installation key, API keys) MUST come from environment
//! variables, never from hardcoded values. A `.env` file is honoured by the
//! worker binary via `dotenv`.
//!
//! # Environment Variables
//!
//! ## Network
//! - `CUSTODY_NETWORK` - "mainnet", "shasta" or "nile" (default: "nile")
//! - `CUSTODY_LEDGER_API` - TronGrid-compatible HTTP endpoint
//! - `CUSTODY_LEDGER_API_KEY` - Optional API key sent as `TRON-PRO-API-KEY`
//!
//! ## Key Custody
//! - `CUSTODY_INSTALLATION_KEY` - Hex-encoded 32-byte key sealing seeds and
//!   private keys at rest (required on mainnet)
//! - `CUSTODY_DB_PATH` - SQLite database path (default: "data/custody.db")
//!
//! ## Sweeping
//! - `CUSTODY_SWEEP_INTERVAL_SECS`, `CUSTODY_SWEEP_BATCH`, `CUSTODY_SWEEP_MAX_ATTEMPTS`,
//!   `CUSTODY_SWEEP_RETRY_DELAY_SECS`, `CUSTODY_SWEEP_EXPIRY_SECS`,
//!   `CUSTODY_MIN_SWEEP_AMOUNT`, `CUSTODY_MIN_RESERVE`, `CUSTODY_ENERGY_PER_SWEEP`,
//!   `CUSTODY_SWEEP_ASSET` ("TRX" or "TRC20:<contract>")
//!
//! ## Resources
//! - `CUSTODY_RESOURCE_INTERVAL_SECS`, `CUSTODY_WARNING_PCT`, `CUSTODY_CRITICAL_PCT`,
//!   `CUSTODY_ALERT_DEDUP_SECS`, `CUSTODY_HISTORY_WINDOW_HOURS`
//!
//! ## Withdrawals
//! - `CUSTODY_BATCH_INTERVAL_SECS`, `CUSTODY_ENERGY_PER_TRANSFER`,
//!   `CUSTODY_VELOCITY_WINDOW_SECS`
//!
//! ## Timeouts
//! - `CUSTODY_LEDGER_TIMEOUT_MS`, `CUSTODY_SIGNING_TIMEOUT_MS`
//!
//! ## Logging
//! - `CUSTODY_LOG_LEVEL` - trace, debug, info, warn, error

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::types::Asset;

/// Mainnet USDT (TRC20) contract
pub const MAINNET_USDT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";
/// Nile testnet USDT contract
pub const NILE_USDT: &str = "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("network mismatch: expected {0}, got {1}")]
    NetworkMismatch(String, String),
}

/// Ledger network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Shasta,
    Nile,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" => Ok(Network::Mainnet),
            "shasta" => Ok(Network::Shasta),
            "nile" | "testnet" => Ok(Network::Nile),
            _ => Err(ConfigError::InvalidValue(
                "CUSTODY_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Default TronGrid endpoint for this network
    pub fn default_ledger_api(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://api.trongrid.io",
            Network::Shasta => "https://api.shasta.trongrid.io",
            Network::Nile => "https://nile.trongrid.io",
        }
    }

    /// Default asset swept from deposit addresses
    pub fn default_sweep_asset(&self) -> Asset {
        match self {
            Network::Mainnet => Asset::Trc20(MAINNET_USDT.to_string()),
            Network::Shasta => Asset::Trx,
            Network::Nile => Asset::Trc20(NILE_USDT.to_string()),
        }
    }

    /// Whether a derived development installation key is tolerated
    pub fn allows_dev_key(&self) -> bool {
        !matches!(self, Network::Mainnet)
    }
}

/// Sweep worker tunables
#[derive(Debug, Clone)]
pub struct SweepSettings {
    /// Seconds between sweep cycles
    pub poll_interval_secs: u64,
    /// Maximum entries drained per cycle
    pub entries_per_cycle: usize,
    /// Attempts before an entry is marked FAILED
    pub max_attempts: u32,
    /// Delay before a failed entry becomes due again
    pub retry_delay_secs: u64,
    /// How long a QUEUED entry may wait before it expires
    pub expiry_secs: u64,
    /// Minimum amount worth sweeping (base units)
    pub min_sweep_amount: u64,
    /// Amount left behind on each deposit address
    pub min_reserve: u64,
    /// Energy reserved for one sweep transfer
    pub energy_per_sweep: u64,
    /// A PROCESSING entry untouched this long is taken back from its worker
    pub processing_lease_secs: u64,
    /// Asset being consolidated
    pub asset: Asset,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            entries_per_cycle: 20,
            max_attempts: 3,
            retry_delay_secs: 300,
            expiry_secs: 86_400,
            min_sweep_amount: 10_000_000,
            min_reserve: 1_000_000,
            energy_per_sweep: 65_000,
            processing_lease_secs: 600,
            asset: Asset::Trx,
        }
    }
}

/// Resource monitor tunables
#[derive(Debug, Clone)]
pub struct ResourceSettings {
    pub refresh_interval_secs: u64,
    pub warning_pct: f64,
    pub critical_pct: f64,
    /// Same-level alerts inside this window are suppressed
    pub alert_dedup_secs: u64,
    /// Trailing window used for usage averaging
    pub history_window_hours: u32,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 300,
            warning_pct: 30.0,
            critical_pct: 10.0,
            alert_dedup_secs: 3_600,
            history_window_hours: 168,
        }
    }
}

/// Withdrawal batching tunables
#[derive(Debug, Clone)]
pub struct WithdrawalSettings {
    pub batch_interval_secs: u64,
    /// Energy estimated for one withdrawal transfer
    pub energy_per_transfer: u64,
    /// Trailing window for requester velocity
    pub velocity_window_secs: i64,
    /// Upper bound on the batch age bonus
    pub age_bonus_cap: u32,
    /// A PROCESSING batch with no recorded item this long is settled
    pub processing_lease_secs: u64,
}

impl Default for WithdrawalSettings {
    fn default() -> Self {
        Self {
            batch_interval_secs: 120,
            energy_per_transfer: 65_000,
            velocity_window_secs: 86_400,
            age_bonus_cap: 10,
            processing_lease_secs: 600,
        }
    }
}

/// Deadlines for external calls
#[derive(Debug, Clone)]
pub struct TimeoutSettings {
    pub ledger_ms: u64,
    pub signing_ms: u64,
}

impl TimeoutSettings {
    pub fn ledger(&self) -> Duration {
        Duration::from_millis(self.ledger_ms)
    }

    pub fn signing(&self) -> Duration {
        Duration::from_millis(self.signing_ms)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            ledger_ms: 10_000,
            signing_ms: 30_000,
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct CustodyConfig {
    /// Ledger network
    pub network: Network,

    /// TronGrid-compatible API endpoint
    pub ledger_api: String,

    /// Optional API key
    pub ledger_api_key: Option<String>,

    /// Hex-encoded 32-byte installation key
    pub installation_key: String,

    /// SQLite database path
    pub db_path: String,

    pub sweep: SweepSettings,
    pub resources: ResourceSettings,
    pub withdrawals: WithdrawalSettings,
    pub timeouts: TimeoutSettings,

    /// Log level
    pub log_level: String,
}

impl CustodyConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let network: Network = env::var("CUSTODY_NETWORK")
            .unwrap_or_else(|_| "nile".to_string())
            .parse()?;

        let ledger_api = env::var("CUSTODY_LEDGER_API")
            .unwrap_or_else(|_| network.default_ledger_api().to_string());
        let ledger_api_key = env::var("CUSTODY_LEDGER_API_KEY").ok();

        let installation_key = load_installation_key(network)?;

        let db_path =
            env::var("CUSTODY_DB_PATH").unwrap_or_else(|_| "data/custody.db".to_string());

        let defaults = SweepSettings::default();
        let asset = match env::var("CUSTODY_SWEEP_ASSET") {
            Ok(raw) => raw.parse::<Asset>().map_err(|e| {
                ConfigError::InvalidValue("CUSTODY_SWEEP_ASSET".to_string(), e.to_string())
            })?,
            Err(_) => network.default_sweep_asset(),
        };
        let sweep = SweepSettings {
            poll_interval_secs: env_or("CUSTODY_SWEEP_INTERVAL_SECS", defaults.poll_interval_secs)?,
            entries_per_cycle: env_or("CUSTODY_SWEEP_BATCH", defaults.entries_per_cycle)?,
            max_attempts: env_or("CUSTODY_SWEEP_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_delay_secs: env_or("CUSTODY_SWEEP_RETRY_DELAY_SECS", defaults.retry_delay_secs)?,
            expiry_secs: env_or("CUSTODY_SWEEP_EXPIRY_SECS", defaults.expiry_secs)?,
            min_sweep_amount: env_or("CUSTODY_MIN_SWEEP_AMOUNT", defaults.min_sweep_amount)?,
            min_reserve: env_or("CUSTODY_MIN_RESERVE", defaults.min_reserve)?,
            energy_per_sweep: env_or("CUSTODY_ENERGY_PER_SWEEP", defaults.energy_per_sweep)?,
            processing_lease_secs: env_or(
                "CUSTODY_SWEEP_LEASE_SECS",
                defaults.processing_lease_secs,
            )?,
            asset,
        };

        let defaults = ResourceSettings::default();
        let resources = ResourceSettings {
            refresh_interval_secs: env_or(
                "CUSTODY_RESOURCE_INTERVAL_SECS",
                defaults.refresh_interval_secs,
            )?,
            warning_pct: env_or("CUSTODY_WARNING_PCT", defaults.warning_pct)?,
            critical_pct: env_or("CUSTODY_CRITICAL_PCT", defaults.critical_pct)?,
            alert_dedup_secs: env_or("CUSTODY_ALERT_DEDUP_SECS", defaults.alert_dedup_secs)?,
            history_window_hours: env_or(
                "CUSTODY_HISTORY_WINDOW_HOURS",
                defaults.history_window_hours,
            )?,
        };
        if resources.critical_pct > resources.warning_pct {
            return Err(ConfigError::InvalidValue(
                "CUSTODY_CRITICAL_PCT".to_string(),
                "critical threshold cannot exceed warning threshold".to_string(),
            ));
        }

        let defaults = WithdrawalSettings::default();
        let withdrawals = WithdrawalSettings {
            batch_interval_secs: env_or("CUSTODY_BATCH_INTERVAL_SECS", defaults.batch_interval_secs)?,
            energy_per_transfer: env_or("CUSTODY_ENERGY_PER_TRANSFER", defaults.energy_per_transfer)?,
            velocity_window_secs: env_or(
                "CUSTODY_VELOCITY_WINDOW_SECS",
                defaults.velocity_window_secs,
            )?,
            age_bonus_cap: defaults.age_bonus_cap,
            processing_lease_secs: env_or(
                "CUSTODY_BATCH_LEASE_SECS",
                defaults.processing_lease_secs,
            )?,
        };

        let defaults = TimeoutSettings::default();
        let timeouts = TimeoutSettings {
            ledger_ms: env_or("CUSTODY_LEDGER_TIMEOUT_MS", defaults.ledger_ms)?,
            signing_ms: env_or("CUSTODY_SIGNING_TIMEOUT_MS", defaults.signing_ms)?,
        };
        check_lease("CUSTODY_SWEEP_LEASE_SECS", sweep.processing_lease_secs, &timeouts)?;
        check_lease("CUSTODY_BATCH_LEASE_SECS", withdrawals.processing_lease_secs, &timeouts)?;

        let log_level = env::var("CUSTODY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            network,
            ledger_api,
            ledger_api_key,
            installation_key,
            db_path,
            sweep,
            resources,
            withdrawals,
            timeouts,
            log_level,
        })
    }

    /// Decode the installation key into raw bytes
    pub fn installation_key_bytes(&self) -> Result<[u8; 32], ConfigError> {
        decode_key(&self.installation_key)
    }

    /// Validate configuration for production readiness
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        if self.network != Network::Mainnet {
            return Err(ConfigError::NetworkMismatch(
                "mainnet".to_string(),
                format!("{:?}", self.network),
            ));
        }

        if self.installation_key == dev_installation_key() {
            return Err(ConfigError::InvalidValue(
                "CUSTODY_INSTALLATION_KEY".to_string(),
                "development key not allowed on mainnet".to_string(),
            ));
        }

        if self.ledger_api_key.is_none() {
            return Err(ConfigError::MissingEnvVar(
                "CUSTODY_LEDGER_API_KEY".to_string(),
            ));
        }

        Ok(())
    }

    /// Print configuration summary (hiding sensitive values)
    pub fn print_summary(&self) {
        println!("=== Custody Configuration ===");
        println!("Network: {:?}", self.network);
        println!("Ledger API: {}", self.ledger_api);
        println!(
            "Ledger API key: {}",
            if self.ledger_api_key.is_some() { "set" } else { "unset" }
        );
        println!("Database: {}", self.db_path);
        println!("Sweep asset: {}", self.sweep.asset);
        println!(
            "Sweep: every {}s, {} attempts, min {} / reserve {}",
            self.sweep.poll_interval_secs,
            self.sweep.max_attempts,
            self.sweep.min_sweep_amount,
            self.sweep.min_reserve
        );
        println!(
            "Resources: warning {}% / critical {}%",
            self.resources.warning_pct, self.resources.critical_pct
        );
        println!("Log Level: {}", self.log_level);
        println!("=============================");
    }
}

impl Default for CustodyConfig {
    fn default() -> Self {
        Self {
            network: Network::Nile,
            ledger_api: Network::Nile.default_ledger_api().to_string(),
            ledger_api_key: None,
            installation_key: dev_installation_key(),
            db_path: "data/custody.db".to_string(),
            sweep: SweepSettings::default(),
            resources: ResourceSettings::default(),
            withdrawals: WithdrawalSettings::default(),
            timeouts: TimeoutSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

/// A lease shorter than one signing call would take work from a live worker
fn check_lease(var_name: &str, lease_secs: u64, timeouts: &TimeoutSettings) -> Result<(), ConfigError> {
    if lease_secs.saturating_mul(1_000) <= timeouts.signing_ms {
        return Err(ConfigError::InvalidValue(
            var_name.to_string(),
            format!("lease must exceed the {}ms signing timeout", timeouts.signing_ms),
        ));
    }
    Ok(())
}

/// Parse an optional env var, falling back to a default
fn env_or<T: FromStr>(var_name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var_name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            ConfigError::InvalidValue(var_name.to_string(), format!("cannot parse '{}'", raw))
        }),
        Err(_) => Ok(default),
    }
}

/// Development installation key (testnets only)
fn dev_installation_key() -> String {
    use sha2::{Digest, Sha256};
    let digest: [u8; 32] = Sha256::digest(b"tron-custody-dev-installation-key-v1").into();
    hex::encode(digest)
}

fn decode_key(hex_key: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|e| {
        ConfigError::InvalidValue("CUSTODY_INSTALLATION_KEY".to_string(), e.to_string())
    })?;
    bytes.try_into().map_err(|_| {
        ConfigError::InvalidValue(
            "CUSTODY_INSTALLATION_KEY".to_string(),
            "key must be 32 bytes".to_string(),
        )
    })
}

/// Load the installation key, deriving a development key on testnets
fn load_installation_key(network: Network) -> Result<String, ConfigError> {
    match env::var("CUSTODY_INSTALLATION_KEY") {
        Ok(key) => {
            decode_key(&key)?;
            Ok(key)
        }
        Err(_) if network.allows_dev_key() => {
            eprintln!("WARNING: Using derived development installation key - DO NOT USE WITH REAL FUNDS");
            Ok(dev_installation_key())
        }
        Err(_) => Err(ConfigError::MissingEnvVar(
            "CUSTODY_INSTALLATION_KEY".to_string(),
        )),
    }
}
