//! EVM connector - reads bridge events and submits destination calls
//!
//! Reads go through every configured RPC endpoint in order until one answers;
//! writes always use the primary endpoint with the relayer's signer.

use std::future::Future;
use std::str::FromStr;

use alloy::consensus::Transaction as _;
use alloy::eips::BlockNumberOrTag;
use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{BlockTransactionsKind, Filter, Log};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use tracing::{debug, info, warn};

use super::retry::classify_rpc_error;
use super::{ChainConnector, TxReceipt};
use crate::config::ChainConfig;
use crate::contracts::{Locker, Minter};
use crate::error::ConnectorError;
use crate::types::{Asset, BridgeEvent, ChainRole, CorrelationId, DestinationCall, EventId, EventKind};

/// Decoded payload of a bridge log, before block metadata is attached
#[derive(Debug, Clone, PartialEq, Eq)]
struct DecodedLog {
    kind: EventKind,
    asset: Asset,
    amount: U256,
    actor: Address,
    transfer_id: B256,
}

/// Connector for one EVM chain hosting either the locker or the minter
pub struct EvmConnector {
    name: String,
    role: ChainRole,
    chain_id: u64,
    contract_address: Address,
    rpc_url: String,
    providers: Vec<RootProvider<Http<Client>>>,
    signer: PrivateKeySigner,
}

impl EvmConnector {
    /// Create a new EVM connector
    pub fn new(config: &ChainConfig, signer_key: &str) -> Result<Self> {
        let contract_address = Address::from_str(&config.contract_address)
            .wrap_err_with(|| format!("Invalid {} contract address", config.role))?;

        let signer: PrivateKeySigner = signer_key.parse().wrap_err("Invalid private key")?;

        let rpc_url = config
            .rpc_urls
            .first()
            .cloned()
            .ok_or_else(|| eyre!("At least one RPC URL is required for {}", config.name))?;
        let providers = create_providers(&config.rpc_urls)?;

        info!(
            chain = %config.name,
            role = %config.role,
            chain_id = config.chain_id,
            contract = %contract_address,
            relayer_address = %signer.address(),
            rpc_endpoints = providers.len(),
            "EVM connector initialized"
        );

        Ok(Self {
            name: config.name.clone(),
            role: config.role,
            chain_id: config.chain_id,
            contract_address,
            rpc_url,
            providers,
            signer,
        })
    }

    /// Run a read against each endpoint until one succeeds or fails permanently
    async fn read<T, E, F, Fut>(&self, op_name: &str, op: F) -> Result<T, ConnectorError>
    where
        F: Fn(RootProvider<Http<Client>>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut last_error = None;
        for (index, provider) in self.providers.iter().enumerate() {
            match op(provider.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    let err = classify_rpc_error(&e.to_string());
                    if !err.is_transient() {
                        return Err(err);
                    }
                    warn!(
                        chain = %self.name,
                        op = %op_name,
                        endpoint = index,
                        error = %err,
                        "RPC endpoint failed, trying next"
                    );
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ConnectorError::TransientRpc(format!("no RPC endpoint available for {}", self.name))
        }))
    }

    /// Decode a raw log into a bridge event. Unknown or malformed logs are
    /// skipped with a warning.
    fn decode_log(&self, log: &Log) -> Option<BridgeEvent> {
        let (Some(block_number), Some(block_hash), Some(tx_hash), Some(log_index)) = (
            log.block_number,
            log.block_hash,
            log.transaction_hash,
            log.log_index,
        ) else {
            warn!(chain = %self.name, "Skipping log without block metadata");
            return None;
        };

        let topic0 = *log.inner.data.topics().first()?;
        let decoded = match self.role {
            ChainRole::Locker => decode_locker_log(topic0, log),
            ChainRole::Minter => decode_minter_log(topic0, log),
        };

        match decoded {
            Ok(Some(d)) => Some(BridgeEvent::new(
                EventId::new(self.chain_id, tx_hash, log_index),
                block_number,
                block_hash,
                d.kind,
                d.asset,
                d.amount,
                d.actor,
                d.transfer_id,
            )),
            Ok(None) => {
                debug!(chain = %self.name, topic = %topic0, "Ignoring unrelated log");
                None
            }
            Err(e) => {
                warn!(
                    chain = %self.name,
                    tx_hash = %tx_hash,
                    log_index,
                    error = %e,
                    "Skipping undecodable log"
                );
                None
            }
        }
    }

    /// Best-effort reason for a reverted receipt. Receipts carry no revert
    /// data, so a tx that used its whole gas limit is reported as out of gas.
    async fn revert_reason(&self, tx_hash: B256, gas_used: u128) -> String {
        let tx = self
            .read("get_transaction", |p| async move {
                p.get_transaction_by_hash(tx_hash).await
            })
            .await;
        match tx {
            Ok(Some(tx)) if gas_used >= u128::from(tx.gas_limit()) => {
                "out of gas: transaction used its entire gas limit".to_string()
            }
            _ => "execution reverted".to_string(),
        }
    }
}

fn decode_locker_log(topic0: B256, log: &Log) -> Result<Option<DecodedLog>, alloy::sol_types::Error> {
    let decoded = if topic0 == Locker::TokenLocked::SIGNATURE_HASH {
        let e = log.log_decode::<Locker::TokenLocked>()?.inner.data;
        DecodedLog {
            kind: EventKind::Lock,
            asset: Asset::Token(e.token),
            amount: e.amount,
            actor: e.sender,
            transfer_id: e.txId,
        }
    } else if topic0 == Locker::NativeCoinLocked::SIGNATURE_HASH {
        let e = log.log_decode::<Locker::NativeCoinLocked>()?.inner.data;
        DecodedLog {
            kind: EventKind::Lock,
            asset: Asset::Native,
            amount: e.amount,
            actor: e.sender,
            transfer_id: e.txId,
        }
    } else if topic0 == Locker::TokenUnlocked::SIGNATURE_HASH {
        let e = log.log_decode::<Locker::TokenUnlocked>()?.inner.data;
        DecodedLog {
            kind: EventKind::Unlock,
            asset: Asset::Token(e.token),
            amount: e.amount,
            actor: e.recipient,
            transfer_id: B256::ZERO,
        }
    } else if topic0 == Locker::NativeCoinUnlocked::SIGNATURE_HASH {
        let e = log.log_decode::<Locker::NativeCoinUnlocked>()?.inner.data;
        DecodedLog {
            kind: EventKind::Unlock,
            asset: Asset::Native,
            amount: e.amount,
            actor: e.recipient,
            transfer_id: B256::ZERO,
        }
    } else {
        return Ok(None);
    };
    Ok(Some(decoded))
}

fn decode_minter_log(topic0: B256, log: &Log) -> Result<Option<DecodedLog>, alloy::sol_types::Error> {
    let decoded = if topic0 == Minter::WrappedBurned::SIGNATURE_HASH {
        let e = log.log_decode::<Minter::WrappedBurned>()?.inner.data;
        DecodedLog {
            kind: EventKind::Burn,
            asset: Asset::Token(e.wrappedToken),
            amount: e.amount,
            actor: e.from,
            transfer_id: e.burnId,
        }
    } else if topic0 == Minter::NativeCoinWrappedBurned::SIGNATURE_HASH {
        let e = log.log_decode::<Minter::NativeCoinWrappedBurned>()?.inner.data;
        DecodedLog {
            kind: EventKind::Burn,
            asset: Asset::Native,
            amount: e.amount,
            actor: e.from,
            transfer_id: e.burnId,
        }
    } else if topic0 == Minter::TokenMinted::SIGNATURE_HASH {
        let e = log.log_decode::<Minter::TokenMinted>()?.inner.data;
        DecodedLog {
            kind: EventKind::Mint,
            asset: Asset::Token(e.wrappedToken),
            amount: e.amount,
            actor: e.to,
            transfer_id: e.srcTxId,
        }
    } else if topic0 == Minter::NativeCoinWrappedMinted::SIGNATURE_HASH {
        let e = log.log_decode::<Minter::NativeCoinWrappedMinted>()?.inner.data;
        DecodedLog {
            kind: EventKind::Mint,
            asset: Asset::Native,
            amount: e.amount,
            actor: e.to,
            transfer_id: e.srcTxId,
        }
    } else {
        return Ok(None);
    };
    Ok(Some(decoded))
}

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Create alloy HTTP providers for each RPC URL.
pub fn create_providers(urls: &[String]) -> Result<Vec<RootProvider<Http<Client>>>> {
    if urls.is_empty() {
        return Err(eyre!("At least one RPC URL is required"));
    }
    urls.iter()
        .map(|url| {
            let parsed = url
                .parse()
                .wrap_err_with(|| format!("Invalid RPC URL: {}", url))?;
            Ok(ProviderBuilder::new().on_http(parsed))
        })
        .collect()
}

#[async_trait]
impl ChainConnector for EvmConnector {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn head_block(&self) -> Result<u64, ConnectorError> {
        self.read("head_block", |p| async move { p.get_block_number().await })
            .await
    }

    async fn block_hash(&self, number: u64) -> Result<Option<B256>, ConnectorError> {
        let block = self
            .read("block_hash", |p| async move {
                p.get_block_by_number(
                    BlockNumberOrTag::Number(number),
                    BlockTransactionsKind::Hashes,
                )
                .await
            })
            .await?;
        Ok(block.map(|b| b.header.hash))
    }

    async fn fetch_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<BridgeEvent>, ConnectorError> {
        if from_block > to_block {
            return Err(ConnectorError::InvalidRange {
                from: from_block,
                to: to_block,
            });
        }

        let filter = Filter::new()
            .address(self.contract_address)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self
            .read("get_logs", |p| {
                let filter = filter.clone();
                async move { p.get_logs(&filter).await }
            })
            .await?;

        let mut events: Vec<BridgeEvent> =
            logs.iter().filter_map(|log| self.decode_log(log)).collect();
        events.sort_by_key(|e| e.position());

        debug!(
            chain = %self.name,
            from = from_block,
            to = to_block,
            logs = logs.len(),
            events = events.len(),
            "Fetched bridge events"
        );

        Ok(events)
    }

    async fn submit(&self, call: &DestinationCall) -> Result<B256, ConnectorError> {
        let url = self
            .rpc_url
            .parse()
            .map_err(|e| ConnectorError::Permanent(format!("Invalid RPC URL: {}", e)))?;
        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(url);

        debug!(
            chain = %self.name,
            call = call.name(),
            correlation_id = %call.correlation_id(),
            "Submitting destination call"
        );

        let sent = match (self.role, call) {
            (
                ChainRole::Minter,
                DestinationCall::Mint {
                    asset,
                    to,
                    amount,
                    correlation_id,
                },
            ) => {
                let minter = Minter::new(self.contract_address, &provider);
                match asset {
                    Asset::Token(token) => minter
                        .mintWrapped(*token, *to, *amount, correlation_id.0)
                        .send()
                        .await
                        .map(|pending| *pending.tx_hash()),
                    Asset::Native => minter
                        .mintNativeCoinWrapped(*to, *amount, correlation_id.0)
                        .send()
                        .await
                        .map(|pending| *pending.tx_hash()),
                }
            }
            (
                ChainRole::Locker,
                DestinationCall::Unlock {
                    asset,
                    to,
                    amount,
                    correlation_id,
                },
            ) => {
                let locker = Locker::new(self.contract_address, &provider);
                match asset {
                    Asset::Token(token) => locker
                        .unlockToken(*token, *to, *amount, correlation_id.0)
                        .send()
                        .await
                        .map(|pending| *pending.tx_hash()),
                    Asset::Native => locker
                        .unlockNativeCoin(*to, *amount, correlation_id.0)
                        .send()
                        .await
                        .map(|pending| *pending.tx_hash()),
                }
            }
            (role, call) => {
                return Err(ConnectorError::Permanent(format!(
                    "{} chain cannot execute {}",
                    role,
                    call.name()
                )))
            }
        };

        let tx_hash = sent.map_err(|e| classify_rpc_error(&e.to_string()))?;
        info!(
            chain = %self.name,
            call = call.name(),
            tx_hash = %tx_hash,
            "Transaction sent"
        );
        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ConnectorError> {
        let receipt = self
            .read("receipt", |p| async move {
                p.get_transaction_receipt(tx_hash).await
            })
            .await?;

        let Some(receipt) = receipt else {
            return Ok(None);
        };
        let Some(block_number) = receipt.block_number else {
            return Ok(None);
        };

        let success = receipt.status();
        let revert_reason = if success {
            None
        } else {
            Some(
                self.revert_reason(tx_hash, u128::from(receipt.gas_used))
                    .await,
            )
        };

        Ok(Some(TxReceipt {
            tx_hash,
            block_number,
            success,
            revert_reason,
        }))
    }

    async fn transaction_known(&self, tx_hash: B256) -> Result<bool, ConnectorError> {
        let tx = self
            .read("transaction_known", |p| async move {
                p.get_transaction_by_hash(tx_hash).await
            })
            .await?;
        Ok(tx.is_some())
    }

    async fn action_executed(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<bool, ConnectorError> {
        let id = correlation_id.0;
        let address = self.contract_address;
        match self.role {
            ChainRole::Locker => {
                self.read("processed_correlations", |p| async move {
                    Locker::new(address, p)
                        .processedCorrelations(id)
                        .call()
                        .await
                        .map(|r| r._0)
                })
                .await
            }
            ChainRole::Minter => {
                self.read("processed_correlations", |p| async move {
                    Minter::new(address, p)
                        .processedCorrelations(id)
                        .call()
                        .await
                        .map(|r| r._0)
                })
                .await
            }
        }
    }
}
