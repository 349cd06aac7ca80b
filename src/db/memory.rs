//! In-memory backend for tests and `STORE=memory` dry runs
//!
//! A single mutex guards all three tables, so every operation is atomic in
//! the same way the PostgreSQL statements are. The lock is never held across
//! an await point outside this module.

use std::collections::HashMap;

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{EventLogStore, ReservationStore, WatermarkStore};
use crate::error::{RelayError, RelayResult};
use crate::types::{
    AppendOutcome, BridgeEvent, CorrelationId, Direction, EventId, RecordUpdate, RelayRecord,
    RelayStatus, Reservation,
};

#[derive(Default)]
struct Tables {
    records: HashMap<EventId, RelayRecord>,
    reservations: HashMap<CorrelationId, (EventId, String)>,
    watermarks: HashMap<(u64, Direction), u64>,
}

impl Tables {
    fn sorted(&self, filter: impl Fn(&RelayRecord) -> bool) -> Vec<RelayRecord> {
        let mut records: Vec<RelayRecord> =
            self.records.values().filter(|r| filter(r)).cloned().collect();
        records.sort_by_key(|r| (r.direction, r.position()));
        records
    }
}

#[derive(Default)]
pub struct MemoryRelayStore {
    tables: Mutex<Tables>,
}

impl MemoryRelayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Who holds the reservation for `correlation_id`, if anyone
    pub async fn reservation_owner(&self, correlation_id: &CorrelationId) -> Option<String> {
        self.tables
            .lock()
            .await
            .reservations
            .get(correlation_id)
            .map(|(_, owner)| owner.clone())
    }

    pub async fn len(&self) -> usize {
        self.tables.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventLogStore for MemoryRelayStore {
    async fn append(
        &self,
        event: &BridgeEvent,
        direction: Direction,
    ) -> RelayResult<AppendOutcome> {
        let mut tables = self.tables.lock().await;
        if tables.records.contains_key(&event.id) {
            return Ok(AppendOutcome::DuplicateEvent);
        }
        tables
            .records
            .insert(event.id, RelayRecord::new(event.clone(), direction));
        Ok(AppendOutcome::Appended)
    }

    async fn get(&self, id: &EventId) -> RelayResult<Option<RelayRecord>> {
        Ok(self.tables.lock().await.records.get(id).cloned())
    }

    async fn list_by_status(
        &self,
        direction: Direction,
        status: RelayStatus,
    ) -> RelayResult<Vec<RelayRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .sorted(|r| r.direction == direction && r.status == status))
    }

    async fn list_unsettled(&self, direction: Direction) -> RelayResult<Vec<RelayRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .sorted(|r| {
                r.direction == direction
                    && !r.status.is_terminal()
                    && !(r.status == RelayStatus::Pending && r.needs_reconciliation)
            }))
    }

    async fn update_status(
        &self,
        id: &EventId,
        expected: RelayStatus,
        new_status: RelayStatus,
        update: &RecordUpdate,
    ) -> RelayResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables.records.get_mut(id) {
            Some(record) if record.status == expected => {
                record.apply(new_status, update);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn begin_attempt(
        &self,
        id: &EventId,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> RelayResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables.records.get_mut(id) {
            Some(record)
                if record.status == RelayStatus::Submitting
                    && record.attempts == attempts
                    && record.destination_tx_hash.is_none() =>
            {
                record.attempts += 1;
                record.submitted_at = Some(started_at);
                record.retry_after = None;
                record.last_error = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn withdraw_unsent(&self, id: &EventId, attempts: u32, reason: &str) -> RelayResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables.records.get_mut(id) {
            Some(record)
                if record.status == RelayStatus::Submitting
                    && record.attempts == attempts
                    && record.destination_tx_hash.is_none() =>
            {
                record.status = RelayStatus::Pending;
                record.attempts = 0;
                record.submitted_at = None;
                record.retry_after = None;
                record.needs_reconciliation = false;
                record.last_error = Some(reason.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn relocate(
        &self,
        id: &EventId,
        block_number: u64,
        block_hash: B256,
    ) -> RelayResult<bool> {
        let mut tables = self.tables.lock().await;
        match tables.records.get_mut(id) {
            Some(record) if record.status == RelayStatus::Pending => {
                record.event.block_number = block_number;
                record.event.block_hash = block_hash;
                record.last_error = None;
                record.needs_reconciliation = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn flag_reconciliation(&self, id: &EventId, reason: &str) -> RelayResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(record) = tables.records.get_mut(id) {
            record.needs_reconciliation = true;
            record.last_error = Some(reason.to_string());
        }
        Ok(())
    }

    async fn count_by_status(&self, direction: Direction) -> RelayResult<Vec<(RelayStatus, u64)>> {
        let tables = self.tables.lock().await;
        let mut counts: HashMap<RelayStatus, u64> = HashMap::new();
        for record in tables.records.values().filter(|r| r.direction == direction) {
            *counts.entry(record.status).or_default() += 1;
        }
        Ok(RelayStatus::ALL
            .into_iter()
            .filter_map(|s| counts.get(&s).map(|c| (s, *c)))
            .collect())
    }

    async fn list_attention(&self) -> RelayResult<Vec<RelayRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .sorted(|r| r.status == RelayStatus::Failed || r.needs_reconciliation))
    }
}

#[async_trait]
impl ReservationStore for MemoryRelayStore {
    async fn reserve(
        &self,
        correlation_id: &CorrelationId,
        id: &EventId,
        owner: &str,
    ) -> RelayResult<Reservation> {
        let mut tables = self.tables.lock().await;
        if tables.reservations.contains_key(correlation_id) {
            return Ok(Reservation::AlreadyReserved);
        }
        match tables.records.get_mut(id) {
            Some(record) if record.status == RelayStatus::Confirmed => {
                record.status = RelayStatus::Submitting;
            }
            _ => return Ok(Reservation::Superseded),
        }
        tables
            .reservations
            .insert(*correlation_id, (*id, owner.to_string()));
        Ok(Reservation::Granted)
    }

    async fn release(&self, correlation_id: &CorrelationId) -> RelayResult<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .reservations
            .remove(correlation_id)
            .is_some())
    }
}

#[async_trait]
impl WatermarkStore for MemoryRelayStore {
    async fn watermark(&self, chain_id: u64, direction: Direction) -> RelayResult<Option<u64>> {
        Ok(self
            .tables
            .lock()
            .await
            .watermarks
            .get(&(chain_id, direction))
            .copied())
    }

    async fn advance_watermark(
        &self,
        chain_id: u64,
        direction: Direction,
        block: u64,
    ) -> RelayResult<()> {
        let mut tables = self.tables.lock().await;
        let entry = tables.watermarks.entry((chain_id, direction)).or_insert(block);
        if block < *entry {
            return Err(RelayError::NonMonotonicWatermark {
                chain_id,
                direction,
                current: *entry,
                requested: block,
            });
        }
        *entry = block;
        Ok(())
    }
}
