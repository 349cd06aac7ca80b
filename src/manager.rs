//! Builds the chain connectors and both relay engines from configuration

use std::sync::Arc;

use eyre::{Result, WrapErr};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::{ChainConfig, Config};
use crate::connector::{ChainConnector, EvmConnector, ResilientConnector, RetryConfig};
use crate::db::SharedStore;
use crate::engine::{EngineSettings, RelayEngine};
use crate::types::{ChainRole, Direction};

/// Connect to one chain with retries and chunked log queries
pub fn connect(
    chain: &ChainConfig,
    signer_key: &str,
    retry: RetryConfig,
    max_block_range: u64,
) -> Result<Arc<dyn ChainConnector>> {
    let evm = EvmConnector::new(chain, signer_key)
        .wrap_err_with(|| format!("Failed to create {} connector", chain.role))?;
    Ok(Arc::new(ResilientConnector::new(
        Arc::new(evm),
        retry,
        max_block_range,
    )))
}

/// Owns the lock→mint and burn→unlock engines
pub struct RelayManager {
    locker: Arc<dyn ChainConnector>,
    minter: Arc<dyn ChainConnector>,
    engines: Vec<Arc<RelayEngine>>,
}

impl RelayManager {
    pub fn new(config: &Config, store: SharedStore) -> Result<Self> {
        let retry = config.relayer.retry_config();
        let max_block_range = config.relayer.max_block_range;

        let locker = connect(
            &config.locker,
            config.signer_key(ChainRole::Locker),
            retry.clone(),
            max_block_range,
        )?;
        let minter = connect(
            &config.minter,
            config.signer_key(ChainRole::Minter),
            retry,
            max_block_range,
        )?;

        let mut manager = Self {
            locker,
            minter,
            engines: Vec::new(),
        };
        for direction in Direction::ALL {
            let settings = EngineSettings::from_config(config, direction);
            info!(
                direction = %direction,
                source_confirmations = settings.source_confirmations,
                destination_confirmations = settings.destination_confirmations,
                start_block = settings.start_block,
                "Relay engine configured"
            );
            let engine = RelayEngine::new(
                direction,
                manager.connector(direction.source_role()),
                manager.connector(direction.destination_role()),
                store.clone(),
                config.token_map.clone(),
                &config.relayer.instance_id,
                settings,
            );
            manager.engines.push(Arc::new(engine));
        }
        Ok(manager)
    }

    pub fn connector(&self, role: ChainRole) -> Arc<dyn ChainConnector> {
        match role {
            ChainRole::Locker => self.locker.clone(),
            ChainRole::Minter => self.minter.clone(),
        }
    }

    /// Run both directions until shutdown. The first fatal error stops
    /// everything.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut join_set = JoinSet::new();
        for engine in &self.engines {
            let engine = engine.clone();
            let shutdown = shutdown.clone();
            join_set.spawn(async move {
                let direction = engine.direction();
                (direction, engine.run(shutdown).await)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((direction, Ok(()))) => {
                    info!(direction = %direction, "Relay engine stopped");
                }
                Ok((direction, Err(e))) => {
                    error!(direction = %direction, error = %e, "Relay engine stopped with error");
                    join_set.abort_all();
                    return Err(eyre::Report::new(e).wrap_err(format!("{} relay halted", direction)));
                }
                Err(e) => {
                    error!(error = %e, "Relay engine task panicked");
                    join_set.abort_all();
                    return Err(eyre::eyre!("relay engine task panicked: {}", e));
                }
            }
        }
        Ok(())
    }
}
