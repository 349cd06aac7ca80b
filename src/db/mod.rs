//! Durable relay state: event log, action reservations and watermarks
//!
//! Two backends implement the same traits: `PgRelayStore` (production) and
//! `MemoryRelayStore` (tests and dry runs).

use std::sync::Arc;

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::RelayResult;
use crate::types::{
    AppendOutcome, BridgeEvent, CorrelationId, Direction, EventId, RecordUpdate, RelayRecord,
    RelayStatus, Reservation,
};

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryRelayStore;
pub use postgres::PgRelayStore;

/// Append-only log of observed source events and their processing state
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Record a newly observed event as Pending. Re-appending a known
    /// identity writes nothing and reports `DuplicateEvent`.
    async fn append(&self, event: &BridgeEvent, direction: Direction)
        -> RelayResult<AppendOutcome>;

    async fn get(&self, id: &EventId) -> RelayResult<Option<RelayRecord>>;

    /// Records of one direction in `status`, ordered by (block, log index)
    async fn list_by_status(
        &self,
        direction: Direction,
        status: RelayStatus,
    ) -> RelayResult<Vec<RelayRecord>>;

    /// Pending, Confirmed, Submitting and Submitted records, ordered by
    /// (block, log index). Pending records flagged for reconciliation (orphans
    /// no longer re-checked) are left out.
    async fn list_unsettled(&self, direction: Direction) -> RelayResult<Vec<RelayRecord>>;

    /// Compare-and-set on status. Returns false, writing nothing, when the
    /// record is not currently in `expected`.
    async fn update_status(
        &self,
        id: &EventId,
        expected: RelayStatus,
        new_status: RelayStatus,
        update: &RecordUpdate,
    ) -> RelayResult<bool>;

    /// Count one more broadcast attempt on an unbroadcast Submitting record,
    /// provided its attempt count is still `attempts`. Stamps `submitted_at`
    /// with `started_at` and clears `retry_after` and `last_error`, so the
    /// record reads as in flight until the attempt resolves.
    async fn begin_attempt(
        &self,
        id: &EventId,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> RelayResult<bool>;

    /// Send an unbroadcast Submitting record back to Pending, provided its
    /// attempt count is still `attempts`. Resets the attempt budget and
    /// clears the reconciliation flag. The caller releases the reservation.
    async fn withdraw_unsent(&self, id: &EventId, attempts: u32, reason: &str)
        -> RelayResult<bool>;

    /// Move a still-Pending event to the block it was re-observed in and
    /// clear any reconciliation flag it carried as an orphan
    async fn relocate(&self, id: &EventId, block_number: u64, block_hash: B256)
        -> RelayResult<bool>;

    /// Mark a record as needing manual reconciliation
    async fn flag_reconciliation(&self, id: &EventId, reason: &str) -> RelayResult<()>;

    async fn count_by_status(&self, direction: Direction) -> RelayResult<Vec<(RelayStatus, u64)>>;

    /// Failed and reconciliation-flagged records across both directions
    async fn list_attention(&self) -> RelayResult<Vec<RelayRecord>>;
}

/// At-most-once ownership of destination actions
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Atomically reserve `correlation_id` for `id` and move the record
    /// Confirmed -> Submitting. Never read-then-write.
    async fn reserve(
        &self,
        correlation_id: &CorrelationId,
        id: &EventId,
        owner: &str,
    ) -> RelayResult<Reservation>;

    /// Drop a reservation so the action can be reserved again (operator
    /// replay, or an unbroadcast action withdrawn after a source reorg)
    async fn release(&self, correlation_id: &CorrelationId) -> RelayResult<bool>;
}

/// Per (chain, direction) scan progress
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn watermark(&self, chain_id: u64, direction: Direction) -> RelayResult<Option<u64>>;

    /// Set the watermark to `block`. Fails with `NonMonotonicWatermark` when
    /// `block` is below the stored value; an equal value is a no-op.
    async fn advance_watermark(
        &self,
        chain_id: u64,
        direction: Direction,
        block: u64,
    ) -> RelayResult<()>;
}

/// Everything the relay engine needs from storage
pub trait RelayStore: EventLogStore + ReservationStore + WatermarkStore {}

impl<T: EventLogStore + ReservationStore + WatermarkStore> RelayStore for T {}

pub type SharedStore = Arc<dyn RelayStore>;

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}
