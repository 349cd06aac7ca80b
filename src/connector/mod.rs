//! Chain connectors
//!
//! A connector reads bridge events from one chain and submits destination
//! calls to it. `EvmConnector` talks to a node through alloy; the
//! `ResilientConnector` wrapper adds block-range chunking and retries so the
//! relay engine never sees a transient RPC failure from a read.

pub mod evm;
pub mod retry;

use std::sync::Arc;

use alloy::primitives::B256;
use async_trait::async_trait;
use tracing::debug;

use crate::error::ConnectorError;
use crate::types::{BridgeEvent, CorrelationId, DestinationCall};

pub use evm::EvmConnector;
pub use retry::RetryConfig;

/// Default number of blocks per log query
pub const DEFAULT_MAX_BLOCK_RANGE: u64 = 2_000;

/// Outcome of a mined destination transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub tx_hash: B256,
    pub block_number: u64,
    pub success: bool,
    /// Best-effort reason when `success` is false
    pub revert_reason: Option<String>,
}

/// Read/write access to one chain's bridge contract
#[async_trait]
pub trait ChainConnector: Send + Sync {
    /// EVM chain id
    fn chain_id(&self) -> u64;

    /// Label used in logs and metrics
    fn name(&self) -> &str;

    async fn head_block(&self) -> Result<u64, ConnectorError>;

    /// Canonical hash at `number`, `None` if the chain is shorter
    async fn block_hash(&self, number: u64) -> Result<Option<B256>, ConnectorError>;

    /// Bridge events in `[from_block, to_block]` ordered by (block, log index)
    async fn fetch_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<BridgeEvent>, ConnectorError>;

    /// Broadcast a destination call, returning its transaction hash
    async fn submit(&self, call: &DestinationCall) -> Result<B256, ConnectorError>;

    /// Receipt of a mined transaction, `None` while unmined
    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ConnectorError>;

    /// Whether the node still knows the transaction (mempool or chain)
    async fn transaction_known(&self, tx_hash: B256) -> Result<bool, ConnectorError>;

    /// Whether the contract's replay guard has seen `correlation_id`
    async fn action_executed(&self, correlation_id: &CorrelationId)
        -> Result<bool, ConnectorError>;
}

/// Wraps a raw connector with chunked log queries and retry policy.
///
/// Reads are retried until they succeed or fail permanently; `submit` is
/// attempted at most `RetryConfig::max_submit_attempts` times.
pub struct ResilientConnector {
    inner: Arc<dyn ChainConnector>,
    retry: RetryConfig,
    max_block_range: u64,
}

impl ResilientConnector {
    pub fn new(inner: Arc<dyn ChainConnector>, retry: RetryConfig, max_block_range: u64) -> Self {
        Self {
            inner,
            retry,
            max_block_range: max_block_range.max(1),
        }
    }

    /// Split `[from, to]` into inclusive chunks of at most `max_block_range`
    pub fn chunk_range(&self, from: u64, to: u64) -> Vec<(u64, u64)> {
        let mut chunks = Vec::new();
        let mut current_from = from;
        while current_from <= to {
            let current_to = std::cmp::min(
                current_from.saturating_add(self.max_block_range - 1),
                to,
            );
            chunks.push((current_from, current_to));
            if current_to == u64::MAX {
                break;
            }
            current_from = current_to + 1;
        }
        chunks
    }
}

#[async_trait]
impl ChainConnector for ResilientConnector {
    fn chain_id(&self) -> u64 {
        self.inner.chain_id()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn head_block(&self) -> Result<u64, ConnectorError> {
        retry::retry_read(&self.retry, self.name(), "head_block", || {
            self.inner.head_block()
        })
        .await
    }

    async fn block_hash(&self, number: u64) -> Result<Option<B256>, ConnectorError> {
        retry::retry_read(&self.retry, self.name(), "block_hash", || {
            self.inner.block_hash(number)
        })
        .await
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

        let mut events = Vec::new();
        for (chunk_from, chunk_to) in self.chunk_range(from_block, to_block) {
            let mut chunk = retry::retry_read(&self.retry, self.name(), "fetch_events", || {
                self.inner.fetch_events(chunk_from, chunk_to)
            })
            .await?;
            debug!(
                chain = %self.name(),
                from = chunk_from,
                to = chunk_to,
                count = chunk.len(),
                "Fetched event chunk"
            );
            events.append(&mut chunk);
        }
        events.sort_by_key(|e| e.position());
        Ok(events)
    }

    async fn submit(&self, call: &DestinationCall) -> Result<B256, ConnectorError> {
        retry::retry_submit(&self.retry, self.name(), || self.inner.submit(call)).await
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ConnectorError> {
        retry::retry_read(&self.retry, self.name(), "receipt", || {
            self.inner.receipt(tx_hash)
        })
        .await
    }

    async fn transaction_known(&self, tx_hash: B256) -> Result<bool, ConnectorError> {
        retry::retry_read(&self.retry, self.name(), "transaction_known", || {
            self.inner.transaction_known(tx_hash)
        })
        .await
    }

    async fn action_executed(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<bool, ConnectorError> {
        retry::retry_read(&self.retry, self.name(), "action_executed", || {
            self.inner.action_executed(correlation_id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use alloy::primitives::{Address, U256};

    use crate::types::{Asset, EventId, EventKind};

    /// Connector that fails the first `failures` calls of every operation
    struct FlakyChain {
        failures: u32,
        calls: AtomicU32,
        ranges: Mutex<Vec<(u64, u64)>>,
    }

    impl FlakyChain {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                ranges: Mutex::new(Vec::new()),
            }
        }

        fn maybe_fail(&self) -> Result<(), ConnectorError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                Err(ConnectorError::TransientRpc("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ChainConnector for FlakyChain {
        fn chain_id(&self) -> u64 {
            1
        }

        fn name(&self) -> &str {
            "flaky"
        }

        async fn head_block(&self) -> Result<u64, ConnectorError> {
            self.maybe_fail()?;
            Ok(100)
        }

        async fn block_hash(&self, _number: u64) -> Result<Option<B256>, ConnectorError> {
            self.maybe_fail()?;
            Ok(Some(B256::ZERO))
        }

        async fn fetch_events(
            &self,
            from_block: u64,
            to_block: u64,
        ) -> Result<Vec<BridgeEvent>, ConnectorError> {
            self.ranges.lock().unwrap().push((from_block, to_block));
            // one event at the end of each chunk, returned out of order below
            Ok(vec![BridgeEvent::new(
                EventId::new(1, B256::repeat_byte(to_block as u8), 0),
                to_block,
                B256::ZERO,
                EventKind::Lock,
                Asset::Native,
                U256::from(1u64),
                Address::ZERO,
                B256::ZERO,
            )])
        }

        async fn submit(&self, _call: &DestinationCall) -> Result<B256, ConnectorError> {
            self.maybe_fail()?;
            Ok(B256::repeat_byte(1))
        }

        async fn receipt(&self, _tx_hash: B256) -> Result<Option<TxReceipt>, ConnectorError> {
            Ok(None)
        }

        async fn transaction_known(&self, _tx_hash: B256) -> Result<bool, ConnectorError> {
            Ok(false)
        }

        async fn action_executed(
            &self,
            _correlation_id: &CorrelationId,
        ) -> Result<bool, ConnectorError> {
            Ok(false)
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            max_submit_attempts: 5,
        }
    }

    #[test]
    fn test_chunk_range() {
        let connector = ResilientConnector::new(Arc::new(FlakyChain::new(0)), fast_retry(), 2000);
        assert_eq!(connector.chunk_range(0, 1999), vec![(0, 1999)]);
        assert_eq!(
            connector.chunk_range(0, 4500),
            vec![(0, 1999), (2000, 3999), (4000, 4500)]
        );
        assert_eq!(connector.chunk_range(7, 7), vec![(7, 7)]);
    }

    #[tokio::test]
    async fn test_reads_retry_transient_errors() {
        let connector = ResilientConnector::new(Arc::new(FlakyChain::new(3)), fast_retry(), 10);
        assert_eq!(connector.head_block().await, Ok(100));
    }

    #[tokio::test]
    async fn test_submit_gives_up_after_max_attempts() {
        let connector = ResilientConnector::new(Arc::new(FlakyChain::new(10)), fast_retry(), 10);
        let call = DestinationCall::Mint {
            asset: Asset::Native,
            to: Address::ZERO,
            amount: U256::from(1u64),
            correlation_id: CorrelationId(B256::ZERO),
        };
        assert!(connector.submit(&call).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_fetch_events_chunks_and_orders() {
        let chain = Arc::new(FlakyChain::new(0));
        let connector = ResilientConnector::new(chain.clone(), fast_retry(), 10);

        let events = connector.fetch_events(0, 25).await.unwrap();
        assert_eq!(
            *chain.ranges.lock().unwrap(),
            vec![(0, 9), (10, 19), (20, 25)]
        );
        let blocks: Vec<u64> = events.iter().map(|e| e.block_number).collect();
        assert_eq!(blocks, vec![9, 19, 25]);
    }

    #[tokio::test]
    async fn test_fetch_events_rejects_inverted_range() {
        let connector = ResilientConnector::new(Arc::new(FlakyChain::new(0)), fast_retry(), 10);
        assert_eq!(
            connector.fetch_events(5, 4).await,
            Err(ConnectorError::InvalidRange { from: 5, to: 4 })
        );
    }
}
