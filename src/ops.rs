//! Operator commands: lag, replay and the attention list

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::connector::ChainConnector;
use crate::db::{EventLogStore, SharedStore, WatermarkStore};
use crate::dedup::Deduplicator;
use crate::error::{RelayError, RelayResult};
use crate::types::{Direction, EventId, RecordUpdate, RelayRecord, RelayStatus};

/// Scan progress of one direction against its source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectionLag {
    pub direction: Direction,
    pub chain: String,
    pub head: u64,
    pub watermark: Option<u64>,
    /// Blocks between the watermark and the head
    pub lag: u64,
}

pub async fn lag(
    store: &SharedStore,
    direction: Direction,
    source: &dyn ChainConnector,
) -> RelayResult<DirectionLag> {
    let head = source.head_block().await?;
    let watermark = store.watermark(source.chain_id(), direction).await?;
    Ok(DirectionLag {
        direction,
        chain: source.name().to_string(),
        head,
        watermark,
        lag: head.saturating_sub(watermark.unwrap_or(0)),
    })
}

/// Per-direction record counts and watermark
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectionStatus {
    pub direction: Direction,
    pub source_chain_id: u64,
    pub watermark: Option<u64>,
    pub records: BTreeMap<&'static str, u64>,
}

pub async fn status(
    store: &SharedStore,
    direction: Direction,
    source_chain_id: u64,
) -> RelayResult<DirectionStatus> {
    let counts = store.count_by_status(direction).await?;
    let records = RelayStatus::ALL
        .into_iter()
        .map(|status| {
            let count = counts
                .iter()
                .find(|(s, _)| *s == status)
                .map(|(_, c)| *c)
                .unwrap_or(0);
            (status.as_str(), count)
        })
        .collect();
    Ok(DirectionStatus {
        direction,
        source_chain_id,
        watermark: store.watermark(source_chain_id, direction).await?,
        records,
    })
}

/// Send a Failed record back to Confirmed with a fresh attempt budget.
///
/// The reservation is released first so the submitter can take it again;
/// the destination contract's replay guard still rejects a second execution.
pub async fn replay(store: &SharedStore, id: &EventId) -> RelayResult<RelayRecord> {
    let record = store
        .get(id)
        .await?
        .ok_or(RelayError::RecordNotFound(*id))?;
    if record.status != RelayStatus::Failed {
        return Err(RelayError::InvalidState {
            id: *id,
            expected: RelayStatus::Failed,
            found: record.status,
        });
    }

    Deduplicator::new(store.clone(), "operator")
        .release(&record.event.correlation_id)
        .await?;

    let reset = RecordUpdate::new()
        .attempts(0)
        .tx_hash(None)
        .clear_error()
        .retry_after(None)
        .submitted_at(None);
    if !store
        .update_status(id, RelayStatus::Failed, RelayStatus::Confirmed, &reset)
        .await?
    {
        let found = store
            .get(id)
            .await?
            .map(|r| r.status)
            .ok_or(RelayError::RecordNotFound(*id))?;
        return Err(RelayError::InvalidState {
            id: *id,
            expected: RelayStatus::Failed,
            found,
        });
    }

    warn!(
        event = %id,
        previous_error = ?record.last_error,
        attempts = record.attempts,
        "Failed record replayed by operator"
    );
    store.get(id).await?.ok_or(RelayError::RecordNotFound(*id))
}

/// Failed records and records flagged for reconciliation
pub async fn attention(store: &SharedStore) -> RelayResult<Vec<RelayRecord>> {
    store.list_attention().await
}
