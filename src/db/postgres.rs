//! PostgreSQL backend
//!
//! Every transition is a compare-and-set on `status`, so two relayer
//! processes sharing the database cannot overwrite each other's progress.

use alloy::primitives::B256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::error;

use super::models::{id_columns, NewRelayEvent, RelayRow, RELAY_COLUMNS};
use super::{EventLogStore, ReservationStore, WatermarkStore};
use crate::error::{RelayError, RelayResult};
use crate::hash::bytes_to_hex;
use crate::types::{
    AppendOutcome, BridgeEvent, CorrelationId, Direction, EventId, RecordUpdate, RelayRecord,
    RelayStatus, Reservation,
};

/// Relay store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgRelayStore {
    pool: PgPool,
}

impl PgRelayStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_records(
        &self,
        query: &str,
        direction: Option<Direction>,
        status: Option<RelayStatus>,
    ) -> RelayResult<Vec<RelayRecord>> {
        let mut q = sqlx::query_as::<_, RelayRow>(query);
        if let Some(direction) = direction {
            q = q.bind(direction.as_str());
        }
        if let Some(status) = status {
            q = q.bind(status.as_str());
        }
        let rows = q.fetch_all(&self.pool).await.map_err(|e| {
            error!("SQL error listing relay records: {:?}", e);
            RelayError::from(e)
        })?;
        rows.into_iter().map(RelayRecord::try_from).collect()
    }
}

#[async_trait]
impl EventLogStore for PgRelayStore {
    async fn append(
        &self,
        event: &BridgeEvent,
        direction: Direction,
    ) -> RelayResult<AppendOutcome> {
        let new = NewRelayEvent::from_event(event, direction.as_str());
        // amount is NUMERIC(78,0); cast the text value
        let row = sqlx::query(
            r#"
            INSERT INTO relay_events (chain_id, tx_hash, log_index, direction, block_number,
                block_hash, kind, asset, amount, actor, transfer_id, correlation_id, observed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::NUMERIC, $10, $11, $12, $13)
            ON CONFLICT (chain_id, tx_hash, log_index) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(new.chain_id)
        .bind(&new.tx_hash)
        .bind(new.log_index)
        .bind(&new.direction)
        .bind(new.block_number)
        .bind(&new.block_hash)
        .bind(&new.kind)
        .bind(&new.asset)
        .bind(&new.amount)
        .bind(&new.actor)
        .bind(&new.transfer_id)
        .bind(&new.correlation_id)
        .bind(new.observed_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(_) => AppendOutcome::Appended,
            None => AppendOutcome::DuplicateEvent,
        })
    }

    async fn get(&self, id: &EventId) -> RelayResult<Option<RelayRecord>> {
        let (chain_id, tx_hash, log_index) = id_columns(id);
        let query = format!(
            "SELECT {} FROM relay_events WHERE chain_id = $1 AND tx_hash = $2 AND log_index = $3",
            RELAY_COLUMNS
        );
        let row = sqlx::query_as::<_, RelayRow>(&query)
            .bind(chain_id)
            .bind(tx_hash)
            .bind(log_index)
            .fetch_optional(&self.pool)
            .await?;
        row.map(RelayRecord::try_from).transpose()
    }

    async fn list_by_status(
        &self,
        direction: Direction,
        status: RelayStatus,
    ) -> RelayResult<Vec<RelayRecord>> {
        let query = format!(
            "SELECT {} FROM relay_events WHERE direction = $1 AND status = $2
             ORDER BY block_number ASC, log_index ASC",
            RELAY_COLUMNS
        );
        self.fetch_records(&query, Some(direction), Some(status))
            .await
    }

    async fn list_unsettled(&self, direction: Direction) -> RelayResult<Vec<RelayRecord>> {
        let query = format!(
            "SELECT {} FROM relay_events
             WHERE direction = $1
               AND status IN ('pending', 'confirmed', 'submitting', 'submitted')
               AND NOT (status = 'pending' AND needs_reconciliation)
             ORDER BY block_number ASC, log_index ASC",
            RELAY_COLUMNS
        );
        self.fetch_records(&query, Some(direction), None).await
    }

    async fn update_status(
        &self,
        id: &EventId,
        expected: RelayStatus,
        new_status: RelayStatus,
        update: &RecordUpdate,
    ) -> RelayResult<bool> {
        let (chain_id, tx_hash, log_index) = id_columns(id);
        let destination_tx_hash = update
            .destination_tx_hash
            .flatten()
            .map(|h| bytes_to_hex(h.as_slice()));

        let result = sqlx::query(
            r#"
            UPDATE relay_events SET
                status = $5,
                destination_tx_hash = CASE WHEN $6 THEN $7 ELSE destination_tx_hash END,
                attempts = COALESCE($8, attempts),
                last_error = CASE WHEN $9 THEN $10 ELSE last_error END,
                retry_after = CASE WHEN $11 THEN $12 ELSE retry_after END,
                submitted_at = CASE WHEN $13 THEN $14 ELSE submitted_at END,
                finalized_at = CASE WHEN $5 = 'finalized' THEN COALESCE(finalized_at, NOW())
                                    ELSE finalized_at END,
                updated_at = NOW()
            WHERE chain_id = $1 AND tx_hash = $2 AND log_index = $3 AND status = $4
            "#,
        )
        .bind(chain_id)
        .bind(tx_hash)
        .bind(log_index)
        .bind(expected.as_str())
        .bind(new_status.as_str())
        .bind(update.destination_tx_hash.is_some())
        .bind(destination_tx_hash)
        .bind(update.attempts.map(|a| a as i32))
        .bind(update.last_error.is_some())
        .bind(update.last_error.clone().flatten())
        .bind(update.retry_after.is_some())
        .bind(update.retry_after.flatten())
        .bind(update.submitted_at.is_some())
        .bind(update.submitted_at.flatten())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn begin_attempt(
        &self,
        id: &EventId,
        attempts: u32,
        started_at: DateTime<Utc>,
    ) -> RelayResult<bool> {
        let (chain_id, tx_hash, log_index) = id_columns(id);
        let result = sqlx::query(
            r#"
            UPDATE relay_events SET
                attempts = attempts + 1,
                submitted_at = $5,
                retry_after = NULL,
                last_error = NULL,
                updated_at = NOW()
            WHERE chain_id = $1 AND tx_hash = $2 AND log_index = $3
              AND status = 'submitting' AND attempts = $4
              AND destination_tx_hash IS NULL
            "#,
        )
        .bind(chain_id)
        .bind(tx_hash)
        .bind(log_index)
        .bind(attempts as i32)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn withdraw_unsent(&self, id: &EventId, attempts: u32, reason: &str) -> RelayResult<bool> {
        let (chain_id, tx_hash, log_index) = id_columns(id);
        let result = sqlx::query(
            r#"
            UPDATE relay_events SET
                status = 'pending',
                attempts = 0,
                submitted_at = NULL,
                retry_after = NULL,
                needs_reconciliation = FALSE,
                last_error = $5,
                updated_at = NOW()
            WHERE chain_id = $1 AND tx_hash = $2 AND log_index = $3
              AND status = 'submitting' AND attempts = $4
              AND destination_tx_hash IS NULL
            "#,
        )
        .bind(chain_id)
        .bind(tx_hash)
        .bind(log_index)
        .bind(attempts as i32)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn relocate(
        &self,
        id: &EventId,
        block_number: u64,
        block_hash: B256,
    ) -> RelayResult<bool> {
        let (chain_id, tx_hash, log_index) = id_columns(id);
        let result = sqlx::query(
            r#"
            UPDATE relay_events
            SET block_number = $4, block_hash = $5, last_error = NULL,
                needs_reconciliation = FALSE, updated_at = NOW()
            WHERE chain_id = $1 AND tx_hash = $2 AND log_index = $3 AND status = 'pending'
            "#,
        )
        .bind(chain_id)
        .bind(tx_hash)
        .bind(log_index)
        .bind(block_number as i64)
        .bind(bytes_to_hex(block_hash.as_slice()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn flag_reconciliation(&self, id: &EventId, reason: &str) -> RelayResult<()> {
        let (chain_id, tx_hash, log_index) = id_columns(id);
        sqlx::query(
            r#"
            UPDATE relay_events
            SET needs_reconciliation = TRUE, last_error = $4, updated_at = NOW()
            WHERE chain_id = $1 AND tx_hash = $2 AND log_index = $3
            "#,
        )
        .bind(chain_id)
        .bind(tx_hash)
        .bind(log_index)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_by_status(&self, direction: Direction) -> RelayResult<Vec<(RelayStatus, u64)>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM relay_events WHERE direction = $1 GROUP BY status",
        )
        .bind(direction.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            let status = status
                .parse::<RelayStatus>()
                .map_err(RelayError::Corrupt)?;
            counts.push((status, count.max(0) as u64));
        }
        Ok(counts)
    }

    async fn list_attention(&self) -> RelayResult<Vec<RelayRecord>> {
        let query = format!(
            "SELECT {} FROM relay_events
             WHERE status = 'failed' OR needs_reconciliation
             ORDER BY direction, block_number ASC, log_index ASC",
            RELAY_COLUMNS
        );
        self.fetch_records(&query, None, None).await
    }
}

#[async_trait]
impl ReservationStore for PgRelayStore {
    async fn reserve(
        &self,
        correlation_id: &CorrelationId,
        id: &EventId,
        owner: &str,
    ) -> RelayResult<Reservation> {
        let (chain_id, tx_hash, log_index) = id_columns(id);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO action_reservations (correlation_id, chain_id, tx_hash, log_index, reserved_by)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
        )
        .bind(correlation_id.to_hex())
        .bind(chain_id)
        .bind(&tx_hash)
        .bind(log_index)
        .bind(owner)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(Reservation::AlreadyReserved);
        }

        let moved = sqlx::query(
            r#"
            UPDATE relay_events SET status = 'submitting', updated_at = NOW()
            WHERE chain_id = $1 AND tx_hash = $2 AND log_index = $3 AND status = 'confirmed'
            "#,
        )
        .bind(chain_id)
        .bind(&tx_hash)
        .bind(log_index)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if moved == 0 {
            tx.rollback().await?;
            return Ok(Reservation::Superseded);
        }

        tx.commit().await?;
        Ok(Reservation::Granted)
    }

    async fn release(&self, correlation_id: &CorrelationId) -> RelayResult<bool> {
        let result = sqlx::query("DELETE FROM action_reservations WHERE correlation_id = $1")
            .bind(correlation_id.to_hex())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl WatermarkStore for PgRelayStore {
    async fn watermark(&self, chain_id: u64, direction: Direction) -> RelayResult<Option<u64>> {
        let row = sqlx::query(
            "SELECT last_scanned_block FROM watermarks WHERE chain_id = $1 AND direction = $2",
        )
        .bind(chain_id as i64)
        .bind(direction.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<i64, _>("last_scanned_block").max(0) as u64))
    }

    async fn advance_watermark(
        &self,
        chain_id: u64,
        direction: Direction,
        block: u64,
    ) -> RelayResult<()> {
        // The conditional upsert never lowers the stored value
        let row = sqlx::query(
            r#"
            INSERT INTO watermarks (chain_id, direction, last_scanned_block)
            VALUES ($1, $2, $3)
            ON CONFLICT (chain_id, direction) DO UPDATE
                SET last_scanned_block = EXCLUDED.last_scanned_block, updated_at = NOW()
                WHERE watermarks.last_scanned_block <= EXCLUDED.last_scanned_block
            RETURNING last_scanned_block
            "#,
        )
        .bind(chain_id as i64)
        .bind(direction.as_str())
        .bind(block as i64)
        .fetch_optional(&self.pool)
        .await?;

        if row.is_some() {
            return Ok(());
        }

        let current = self.watermark(chain_id, direction).await?.unwrap_or(0);
        Err(RelayError::NonMonotonicWatermark {
            chain_id,
            direction,
            current,
            requested: block,
        })
    }
}
