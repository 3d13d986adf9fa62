//! Custody Worker
//!
//! Runs the background loops of the custody core against the shared
//! database.
//!
//! Run modes:
//!   custody-worker worker      - Sweeps, batches and resource monitoring
//!   custody-worker sweeper     - Sweep scheduler only
//!   custody-worker batcher     - Withdrawal batch optimizer only
//!   custody-worker monitor     - Resource pool monitor only
//!   custody-worker migrate     - Create or upgrade the database and exit
//!   custody-worker selfcheck   - Verify ledger connectivity and exit

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};

use tron_custody::common::{init_from_config, CustodyConfig, Network};
use tron_custody::{CustodyCore, SqliteStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Worker,
    Sweeper,
    Batcher,
    Monitor,
}

impl Mode {
    fn sweeps(self) -> bool {
        matches!(self, Mode::Worker | Mode::Sweeper)
    }

    fn batches(self) -> bool {
        matches!(self, Mode::Worker | Mode::Batcher)
    }

    fn monitors(self) -> bool {
        matches!(self, Mode::Worker | Mode::Monitor)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return ExitCode::SUCCESS;
    }

    let mode = match args[1].as_str() {
        "worker" => Mode::Worker,
        "sweeper" => Mode::Sweeper,
        "batcher" => Mode::Batcher,
        "monitor" => Mode::Monitor,
        "migrate" => return run_migrate(),
        "selfcheck" => return run_selfcheck().await,
        _ => {
            print_usage();
            return ExitCode::SUCCESS;
        }
    };

    match run_workers(mode).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Worker exited: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    println!("TRON Custody Worker");
    println!();
    println!("Usage:");
    println!("  custody-worker worker      Run sweeps, batches and resource monitoring");
    println!("  custody-worker sweeper     Run the sweep scheduler");
    println!("  custody-worker batcher     Run the withdrawal batch optimizer");
    println!("  custody-worker monitor     Run the resource pool monitor");
    println!("  custody-worker migrate     Create or upgrade the database");
    println!("  custody-worker selfcheck   Check ledger connectivity");
    println!();
    println!("Environment Variables:");
    println!("  CUSTODY_NETWORK             mainnet | shasta | nile (default: nile)");
    println!("  CUSTODY_LEDGER_API          Ledger HTTP API base URL");
    println!("  CUSTODY_LEDGER_API_KEY      API key sent with ledger requests");
    println!("  CUSTODY_INSTALLATION_KEY    Hex key sealing master seeds (required on mainnet)");
    println!("  CUSTODY_DB_PATH             SQLite database path (default: data/custody.db)");
    println!("  CUSTODY_LOG_LEVEL           trace | debug | info | warn | error");
}

fn load_config() -> Result<CustodyConfig, String> {
    let config = CustodyConfig::from_env().map_err(|e| e.to_string())?;
    if config.network == Network::Mainnet {
        config.validate_for_production().map_err(|e| e.to_string())?;
    }
    if let Err(e) = init_from_config(&config) {
        eprintln!("Warning: {}", e);
    }
    Ok(config)
}

fn run_migrate() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match SqliteStore::new(&config.db_path) {
        Ok(_) => {
            info!(db_path = %config.db_path, "Database ready");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(db_path = %config.db_path, error = %e, "Migration failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_selfcheck() -> ExitCode {
    let result = async {
        let config = load_config()?;
        let core = CustodyCore::from_config(&config).map_err(|e| e.to_string())?;
        core.ledger_self_check().await.map_err(|e| e.to_string())
    }
    .await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Self-check failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_workers(mode: Mode) -> Result<(), String> {
    let config = load_config()?;
    config.print_summary();

    let core = Arc::new(CustodyCore::from_config(&config).map_err(|e| e.to_string())?);
    if let Err(e) = core.ledger_self_check().await {
        error!(error = %e, "Ledger self-check failed; workers will keep retrying");
    }

    let mut workers = JoinSet::new();
    if mode.monitors() {
        let monitor = core.resources().clone();
        workers.spawn(async move { monitor.run().await });
    }
    if mode.sweeps() {
        let scheduler = core.sweeps().clone();
        workers.spawn(async move { scheduler.run().await });
    }
    if mode.batches() {
        let optimizer = core.batches().clone();
        workers.spawn(async move { optimizer.run().await });
    }

    info!(mode = ?mode, "Workers started. Press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
        Some(joined) = workers.join_next() => {
            match joined {
                Ok(Ok(())) => info!("Worker finished"),
                Ok(Err(e)) => error!(error = %e, "Worker failed"),
                Err(e) => error!(error = %e, "Worker panicked"),
            }
        }
    }

    core.resources().stop().await;
    core.sweeps().stop().await;
    core.batches().stop().await;

    while let Some(joined) = workers.join_next().await {
        if let Ok(Err(e)) = joined {
            error!(error = %e, "Worker failed during shutdown");
        }
    }

    info!("All workers stopped");
    Ok(())
}
