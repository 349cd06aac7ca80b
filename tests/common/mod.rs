//! Scripted in-process chain used to drive the relay engine in tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use bridge_relayer::connector::{ChainConnector, RetryConfig, TxReceipt};
use bridge_relayer::db::{
    EventLogStore, MemoryRelayStore, ReservationStore, SharedStore, WatermarkStore,
};
use bridge_relayer::engine::{EngineSettings, RelayEngine};
use bridge_relayer::error::{ConnectorError, RelayError, RelayResult};
use bridge_relayer::types::{
    AppendOutcome, Asset, BridgeEvent, CorrelationId, DestinationCall, Direction, EventId,
    EventKind, RecordUpdate, RelayRecord, RelayStatus, Reservation, TokenMap,
};

pub const LOCKER_CHAIN: u64 = 43113;
pub const MINTER_CHAIN: u64 = 7887;

#[derive(Debug, Clone)]
struct MockEvent {
    tx_hash: B256,
    log_index: u64,
    block: u64,
    kind: EventKind,
    asset: Asset,
    amount: U256,
    actor: Address,
}

#[derive(Debug, Clone)]
struct MinedTx {
    block: u64,
    success: bool,
    reason: Option<String>,
}

#[derive(Default)]
struct State {
    head: u64,
    /// Reorg points: blocks at or above one hash differently
    reorgs: Vec<u64>,
    events: Vec<MockEvent>,
    /// Every successful broadcast, in order
    submissions: Vec<DestinationCall>,
    submit_calls: u32,
    submit_errors: VecDeque<ConnectorError>,
    reverts: VecDeque<String>,
    mined: HashMap<B256, MinedTx>,
    mempool: HashSet<B256>,
    executed: HashSet<CorrelationId>,
    failing_reads: u32,
    receipt_calls: u32,
}

pub struct MockChain {
    chain_id: u64,
    name: String,
    auto_mine: Mutex<bool>,
    state: Mutex<State>,
}

impl MockChain {
    pub fn new(chain_id: u64, name: &str, head: u64) -> Arc<Self> {
        Arc::new(Self {
            chain_id,
            name: name.to_string(),
            auto_mine: Mutex::new(true),
            state: Mutex::new(State {
                head,
                ..Default::default()
            }),
        })
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().head
    }

    /// Every block from `from_block` up gets a new hash
    pub fn reorg_from(&self, from_block: u64) {
        self.state.lock().unwrap().reorgs.push(from_block);
    }

    pub fn canonical_hash(&self, block: u64) -> B256 {
        let state = self.state.lock().unwrap();
        hash_for(&state, block)
    }

    /// Emit an event in `block`; returns its identity
    pub fn emit(
        &self,
        kind: EventKind,
        block: u64,
        tx_byte: u8,
        log_index: u64,
        asset: Asset,
        amount: u64,
    ) -> EventId {
        let tx_hash = B256::repeat_byte(tx_byte);
        self.state.lock().unwrap().events.push(MockEvent {
            tx_hash,
            log_index,
            block,
            kind,
            asset,
            amount: U256::from(amount),
            actor: Address::repeat_byte(0x22),
        });
        EventId::new(self.chain_id, tx_hash, log_index)
    }

    /// Re-mine a transaction's events in another block
    pub fn move_tx(&self, tx_byte: u8, block: u64) {
        let tx_hash = B256::repeat_byte(tx_byte);
        for event in self
            .state
            .lock()
            .unwrap()
            .events
            .iter_mut()
            .filter(|e| e.tx_hash == tx_hash)
        {
            event.block = block;
        }
    }

    pub fn drop_tx(&self, tx_byte: u8) {
        let tx_hash = B256::repeat_byte(tx_byte);
        self.state
            .lock()
            .unwrap()
            .events
            .retain(|e| e.tx_hash != tx_hash);
    }

    pub fn set_auto_mine(&self, enabled: bool) {
        *self.auto_mine.lock().unwrap() = enabled;
    }

    /// Fail the next `submit` calls with these errors, in order
    pub fn fail_submits(&self, errors: impl IntoIterator<Item = ConnectorError>) {
        self.state.lock().unwrap().submit_errors.extend(errors);
    }

    /// The next auto-mined broadcasts revert with these reasons, in order
    pub fn revert_next(&self, reasons: impl IntoIterator<Item = &'static str>) {
        self.state
            .lock()
            .unwrap()
            .reverts
            .extend(reasons.into_iter().map(String::from));
    }

    pub fn fail_reads(&self, count: u32) {
        self.state.lock().unwrap().failing_reads = count;
    }

    /// Mine everything in the mempool successfully at the current head
    pub fn mine_pending(&self) {
        let mut state = self.state.lock().unwrap();
        let head = state.head;
        let pending: Vec<B256> = state.mempool.drain().collect();
        for tx_hash in pending {
            let call = state.submissions.iter().find(|c| tx_hash_for(c) == tx_hash).cloned();
            if let Some(call) = call {
                state.executed.insert(call.correlation_id());
            }
            state.mined.insert(
                tx_hash,
                MinedTx {
                    block: head,
                    success: true,
                    reason: None,
                },
            );
        }
    }

    /// Forget everything in the mempool
    pub fn drop_pending(&self) {
        self.state.lock().unwrap().mempool.clear();
    }

    /// Pretend another party already executed this action
    pub fn mark_executed(&self, correlation_id: CorrelationId) {
        self.state.lock().unwrap().executed.insert(correlation_id);
    }

    pub fn submissions(&self) -> Vec<DestinationCall> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn submit_calls(&self) -> u32 {
        self.state.lock().unwrap().submit_calls
    }

    pub fn receipt_calls(&self) -> u32 {
        self.state.lock().unwrap().receipt_calls
    }

    fn check_read(&self) -> Result<(), ConnectorError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(ConnectorError::TransientRpc("connection reset by peer".into()));
        }
        Ok(())
    }
}

fn hash_for(state: &State, block: u64) -> B256 {
    let epoch = state.reorgs.iter().filter(|from| **from <= block).count() as u8;
    let mut bytes = [0u8; 32];
    bytes[0] = 0xb0 | (epoch & 0x0f);
    bytes[24..].copy_from_slice(&block.to_be_bytes());
    B256::from(bytes)
}

/// Deterministic hash of a broadcast: one per correlation id and nonce-free
fn tx_hash_for(call: &DestinationCall) -> B256 {
    let mut bytes = call.correlation_id().0 .0;
    bytes[0] ^= 0xff;
    B256::from(bytes)
}

#[async_trait]
impl ChainConnector for MockChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn head_block(&self) -> Result<u64, ConnectorError> {
        self.check_read()?;
        Ok(self.head())
    }

    async fn block_hash(&self, number: u64) -> Result<Option<B256>, ConnectorError> {
        self.check_read()?;
        let state = self.state.lock().unwrap();
        if number > state.head {
            return Ok(None);
        }
        Ok(Some(hash_for(&state, number)))
    }

    async fn fetch_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<BridgeEvent>, ConnectorError> {
        self.check_read()?;
        let state = self.state.lock().unwrap();
        let mut events: Vec<BridgeEvent> = state
            .events
            .iter()
            .filter(|e| e.block >= from_block && e.block <= to_block && e.block <= state.head)
            .map(|e| {
                BridgeEvent::new(
                    EventId::new(self.chain_id, e.tx_hash, e.log_index),
                    e.block,
                    hash_for(&state, e.block),
                    e.kind,
                    e.asset,
                    e.amount,
                    e.actor,
                    e.tx_hash,
                )
            })
            .collect();
        events.sort_by_key(|e| e.position());
        Ok(events)
    }

    async fn submit(&self, call: &DestinationCall) -> Result<B256, ConnectorError> {
        let auto_mine = *self.auto_mine.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        state.submit_calls += 1;
        if let Some(error) = state.submit_errors.pop_front() {
            return Err(error);
        }

        let tx_hash = tx_hash_for(call);
        state.submissions.push(call.clone());
        if auto_mine {
            let head = state.head;
            let mined = match state.reverts.pop_front() {
                Some(reason) => MinedTx {
                    block: head,
                    success: false,
                    reason: Some(reason),
                },
                None => {
                    state.executed.insert(call.correlation_id());
                    MinedTx {
                        block: head,
                        success: true,
                        reason: None,
                    }
                }
            };
            state.mined.insert(tx_hash, mined);
        } else {
            state.mempool.insert(tx_hash);
        }
        Ok(tx_hash)
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<TxReceipt>, ConnectorError> {
        self.check_read()?;
        let mut state = self.state.lock().unwrap();
        state.receipt_calls += 1;
        if let Some(mined) = state.mined.get(&tx_hash) {
            return Ok(Some(TxReceipt {
                tx_hash,
                block_number: mined.block,
                success: mined.success,
                revert_reason: mined.reason.clone(),
            }));
        }
        // source transactions carrying bridge events
        Ok(state
            .events
            .iter()
            .find(|e| e.tx_hash == tx_hash && e.block <= state.head)
            .map(|e| TxReceipt {
                tx_hash,
                block_number: e.block,
                success: true,
                revert_reason: None,
            }))
    }

    async fn transaction_known(&self, tx_hash: B256) -> Result<bool, ConnectorError> {
        self.check_read()?;
        let state = self.state.lock().unwrap();
        Ok(state.mempool.contains(&tx_hash) || state.mined.contains_key(&tx_hash))
    }

    async fn action_executed(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<bool, ConnectorError> {
        self.check_read()?;
        Ok(self.state.lock().unwrap().executed.contains(correlation_id))
    }
}

/// Settings with K=3, K'=1 and no waiting between attempts
pub fn test_settings() -> EngineSettings {
    EngineSettings {
        source_confirmations: 3,
        destination_confirmations: 1,
        start_block: 995,
        max_blocks_per_pass: 1_000,
        max_attempts: 3,
        submission_timeout: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
        retry: RetryConfig {
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 2.0,
            max_submit_attempts: 1,
        },
    }
}

pub struct Harness {
    pub locker: Arc<MockChain>,
    pub minter: Arc<MockChain>,
    pub memory: Arc<MemoryRelayStore>,
    pub store: SharedStore,
}

impl Harness {
    pub fn new(locker_head: u64) -> Self {
        let memory = Arc::new(MemoryRelayStore::new());
        Self {
            locker: MockChain::new(LOCKER_CHAIN, "locker", locker_head),
            minter: MockChain::new(MINTER_CHAIN, "minter", 5_000),
            store: memory.clone(),
            memory,
        }
    }

    pub fn lock_mint(&self, settings: EngineSettings) -> RelayEngine {
        self.engine(Direction::LockMint, settings, "relayer-a")
    }

    pub fn engine(&self, direction: Direction, settings: EngineSettings, instance: &str) -> RelayEngine {
        self.engine_on(self.store.clone(), direction, settings, instance)
    }

    /// Engine over the harness chains but a caller-supplied store
    pub fn engine_on(
        &self,
        store: SharedStore,
        direction: Direction,
        settings: EngineSettings,
        instance: &str,
    ) -> RelayEngine {
        let (source, destination): (Arc<dyn ChainConnector>, Arc<dyn ChainConnector>) =
            match direction {
                Direction::LockMint => (self.locker.clone(), self.minter.clone()),
                Direction::BurnUnlock => (self.minter.clone(), self.locker.clone()),
            };
        RelayEngine::new(
            direction,
            source,
            destination,
            store,
            TokenMap::default(),
            instance,
            settings,
        )
    }
}

/// Memory store whose watermark was moved ahead by another writer: every
/// advance the engine attempts is below the stored value
pub struct RewoundWatermarkStore {
    inner: Arc<MemoryRelayStore>,
}

impl RewoundWatermarkStore {
    pub fn new(inner: Arc<MemoryRelayStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl EventLogStore for RewoundWatermarkStore {
    async fn append(&self, event: &BridgeEvent, direction: Direction) -> RelayResult<AppendOutcome> {
        self.inner.append(event, direction).await
    }

    async fn get(&self, id: &EventId) -> RelayResult<Option<RelayRecord>> {
        self.inner.get(id).await
    }

    async fn list_by_status(
        &self,
        direction: Direction,
        status: RelayStatus,
    ) -> RelayResult<Vec<RelayRecord>> {
        self.inner.list_by_status(direction, status).await
    }

    async fn list_unsettled(&self, direction: Direction) -> RelayResult<Vec<RelayRecord>> {
        self.inner.list_unsettled(direction).await
    }

    async fn update_status(
        &self,
        id: &EventId,
        expected: RelayStatus,
        new_status: RelayStatus,
        update: &RecordUpdate,
    ) -> RelayResult<bool> {
        self.inner.update_status(id, expected, new_status, update).await
    }

    async fn begin_attempt(
        &self,
        id: &EventId,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> RelayResult<bool> {
        self.inner.begin_attempt(id, attempts, started_at).await
    }

    async fn withdraw_unsent(&self, id: &EventId, attempts: u32, reason: &str) -> RelayResult<bool> {
        self.inner.withdraw_unsent(id, attempts, reason).await
    }

    async fn relocate(&self, id: &EventId, block_number: u64, block_hash: B256) -> RelayResult<bool> {
        self.inner.relocate(id, block_number, block_hash).await
    }

    async fn flag_reconciliation(&self, id: &EventId, reason: &str) -> RelayResult<()> {
        self.inner.flag_reconciliation(id, reason).await
    }

    async fn count_by_status(&self, direction: Direction) -> RelayResult<Vec<(RelayStatus, u64)>> {
        self.inner.count_by_status(direction).await
    }

    async fn list_attention(&self) -> RelayResult<Vec<RelayRecord>> {
        self.inner.list_attention().await
    }
}

#[async_trait]
impl ReservationStore for RewoundWatermarkStore {
    async fn reserve(
        &self,
        correlation_id: &CorrelationId,
        id: &EventId,
        owner: &str,
    ) -> RelayResult<Reservation> {
        self.inner.reserve(correlation_id, id, owner).await
    }

    async fn release(&self, correlation_id: &CorrelationId) -> RelayResult<bool> {
        self.inner.release(correlation_id).await
    }
}

#[async_trait]
impl WatermarkStore for RewoundWatermarkStore {
    async fn watermark(&self, chain_id: u64, direction: Direction) -> RelayResult<Option<u64>> {
        self.inner.watermark(chain_id, direction).await
    }

    async fn advance_watermark(
        &self,
        chain_id: u64,
        direction: Direction,
        block: u64,
    ) -> RelayResult<()> {
        Err(RelayError::NonMonotonicWatermark {
            chain_id,
            direction,
            current: block.saturating_add(1),
            requested: block,
        })
    }
}
