use std::net::SocketAddr;
use std::sync::Arc;

use alloy::primitives::B256;
use bridge_relayer::api::{self, ApiState};
use bridge_relayer::config::{Config, StoreBackend};
use bridge_relayer::db::{self, MemoryRelayStore, PgRelayStore, SharedStore};
use bridge_relayer::manager::{self, RelayManager};
use bridge_relayer::ops;
use bridge_relayer::types::{Direction, EventId};
use clap::{Parser, Subcommand};
use eyre::{eyre, WrapErr};

#[derive(Parser)]
#[command(name = "bridge-relayer", version, about = "Two-chain lock/mint bridge relayer")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run both relay directions (default)
    Run,
    /// Show watermark vs. chain head per direction
    Lag {
        /// Print one JSON object per direction
        #[arg(long)]
        json: bool,
    },
    /// Send a Failed record back to Confirmed
    Replay {
        #[arg(long)]
        chain_id: u64,
        #[arg(long)]
        tx_hash: String,
        #[arg(long)]
        log_index: u64,
    },
    /// List Failed and reconciliation-flagged records
    Failed,
}

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> eyre::Result<()> {
    init_logging();

    let config = Config::load()?;
    tracing::info!(
        locker = %config.locker.name,
        locker_chain_id = config.locker.chain_id,
        minter = %config.minter.name,
        minter_chain_id = config.minter.chain_id,
        store = ?config.store.backend,
        "Configuration loaded"
    );

    let store = open_store(&config).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, store).await,
        Command::Lag { json } => lag(&config, &store, json).await,
        Command::Replay {
            chain_id,
            tx_hash,
            log_index,
        } => {
            let tx_hash: B256 = tx_hash
                .parse()
                .wrap_err_with(|| format!("Invalid transaction hash: {}", tx_hash))?;
            let record = ops::replay(&store, &EventId::new(chain_id, tx_hash, log_index)).await?;
            println!(
                "{} -> {} (correlation {})",
                record.id(),
                record.status,
                record.event.correlation_id
            );
            Ok(())
        }
        Command::Failed => {
            let records = ops::attention(&store).await?;
            if records.is_empty() {
                println!("no records need attention");
            }
            for record in records {
                println!(
                    "{} {} {} attempts={} reconcile={} error={}",
                    record.id(),
                    record.direction,
                    record.status,
                    record.attempts,
                    record.needs_reconciliation,
                    record.last_error.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }
    }
}

async fn run(config: Config, store: SharedStore) -> eyre::Result<()> {
    tracing::info!(instance_id = %config.relayer.instance_id, "Starting bridge relayer");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let manager = RelayManager::new(&config, store.clone())?;

    let api_addr: SocketAddr = format!("{}:{}", config.api.bind, config.api.port)
        .parse()
        .wrap_err("Invalid API_BIND/API_PORT")?;
    let api_state = ApiState::new(
        store,
        Direction::ALL
            .into_iter()
            .map(|d| (d, config.chain(d.source_role()).chain_id))
            .collect(),
    );
    let api_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_state, api_shutdown).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let result = manager.run(shutdown_rx).await;
    match &result {
        Ok(()) => tracing::info!("Bridge relayer stopped"),
        Err(e) => tracing::error!(error = ?e, "Bridge relayer halted"),
    }
    result
}

async fn lag(config: &Config, store: &SharedStore, json: bool) -> eyre::Result<()> {
    let retry = config.relayer.retry_config();
    for direction in Direction::ALL {
        let role = direction.source_role();
        let source = manager::connect(
            config.chain(role),
            config.signer_key(role),
            retry.clone(),
            config.relayer.max_block_range,
        )?;
        let lag = ops::lag(store, direction, source.as_ref()).await?;
        if json {
            println!("{}", serde_json::to_string(&lag)?);
            continue;
        }
        println!(
            "{:<12} {:<12} head={} watermark={} lag={}",
            lag.direction.as_str(),
            lag.chain,
            lag.head,
            lag.watermark
                .map(|w| w.to_string())
                .unwrap_or_else(|| "-".to_string()),
            lag.lag
        );
    }
    Ok(())
}

async fn open_store(config: &Config) -> eyre::Result<SharedStore> {
    match config.store.backend {
        StoreBackend::Postgres => {
            let url = config
                .store
                .database_url
                .as_deref()
                .ok_or_else(|| eyre!("DATABASE_URL is required when STORE=postgres"))?;
            let pool = db::create_pool(url).await?;
            tracing::info!("Database connected");
            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations complete");
            Ok(Arc::new(PgRelayStore::new(pool)))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; relay state is lost on exit");
            Ok(Arc::new(MemoryRelayStore::new()))
        }
    }
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bridge_relayer=debug"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .with(filter)
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
