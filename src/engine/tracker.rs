//! Confirmation tracker: broadcast transactions to destination finality

use chrono::Utc;
use tracing::{debug, info, warn};

use super::RelayEngine;
use crate::connector::retry::classify_error;
use crate::db::EventLogStore;
use crate::error::RelayResult;
use crate::metrics;
use crate::types::{RecordUpdate, RelayRecord, RelayStatus};

/// Outcome of one tracking pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TrackReport {
    /// Broadcasts that mined successfully this pass
    pub mined: usize,
    pub finalized: usize,
    pub failed: usize,
    /// Records sent back to the submitter for another broadcast
    pub requeued: usize,
}

impl RelayEngine {
    pub async fn track_once(&self) -> RelayResult<TrackReport> {
        let mut report = TrackReport::default();

        let in_flight: Vec<RelayRecord> = self
            .store
            .list_by_status(self.direction, RelayStatus::Submitting)
            .await?
            .into_iter()
            .filter(|r| r.destination_tx_hash.is_some())
            .collect();
        for record in &in_flight {
            self.track_in_flight(record, &mut report).await?;
        }

        let submitted = self
            .store
            .list_by_status(self.direction, RelayStatus::Submitted)
            .await?;
        if submitted.is_empty() {
            return Ok(report);
        }

        let head = self.destination.head_block().await?;
        metrics::set_chain_head(self.destination.name(), head);
        for record in &submitted {
            self.track_submitted(record, head, &mut report).await?;
        }
        Ok(report)
    }

    async fn track_in_flight(
        &self,
        record: &RelayRecord,
        report: &mut TrackReport,
    ) -> RelayResult<()> {
        let Some(tx_hash) = record.destination_tx_hash else {
            return Ok(());
        };
        let max_attempts = self.settings.max_attempts;

        match self.destination.receipt(tx_hash).await? {
            Some(receipt) if receipt.success => {
                let moved = self
                    .store
                    .update_status(
                        record.id(),
                        RelayStatus::Submitting,
                        RelayStatus::Submitted,
                        &RecordUpdate::new().clear_error(),
                    )
                    .await?;
                if moved {
                    report.mined += 1;
                    debug!(
                        event = %record.id(),
                        tx_hash = %tx_hash,
                        block = receipt.block_number,
                        "Destination transaction mined"
                    );
                }
            }
            Some(receipt) => {
                let reason = receipt
                    .revert_reason
                    .unwrap_or_else(|| "transaction reverted".to_string());

                if self
                    .destination
                    .action_executed(&record.event.correlation_id)
                    .await?
                {
                    self.mark_executed(record, RelayStatus::Submitting).await?;
                } else if classify_error(&reason).is_transient_revert()
                    && record.attempts < max_attempts
                {
                    let retry_after = self
                        .settings
                        .retry
                        .next_retry_after(record.attempts.saturating_sub(1));
                    self.requeue(record, &reason, Some(retry_after), report)
                        .await?;
                } else if self
                    .fail(record, RelayStatus::Submitting, format!("{} ({})", reason, tx_hash))
                    .await?
                {
                    report.failed += 1;
                }
            }
            None => {
                if !self.attempt_expired(record) {
                    return Ok(());
                }

                if self.destination.transaction_known(tx_hash).await? {
                    debug!(event = %record.id(), tx_hash = %tx_hash, "Broadcast still pending");
                    return Ok(());
                }

                if self
                    .destination
                    .action_executed(&record.event.correlation_id)
                    .await?
                {
                    self.mark_executed(record, RelayStatus::Submitting).await?;
                } else if record.attempts >= max_attempts {
                    if self
                        .fail(
                            record,
                            RelayStatus::Submitting,
                            format!("transaction {} dropped after {} attempts", tx_hash, record.attempts),
                        )
                        .await?
                    {
                        report.failed += 1;
                    }
                } else {
                    self.requeue(record, &format!("transaction {} dropped", tx_hash), None, report)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn track_submitted(
        &self,
        record: &RelayRecord,
        head: u64,
        report: &mut TrackReport,
    ) -> RelayResult<()> {
        let receipt = match record.destination_tx_hash {
            Some(tx_hash) => self.destination.receipt(tx_hash).await?,
            None => None,
        };

        match receipt {
            Some(receipt) if receipt.success => {
                let depth = head.saturating_sub(receipt.block_number);
                if depth >= self.settings.destination_confirmations
                    && self.finalize(record, RelayStatus::Submitted).await?
                {
                    report.finalized += 1;
                }
            }
            _ => {
                // Executed by a transaction we do not hold, or our own one left
                // the canonical chain
                if self
                    .destination
                    .action_executed(&record.event.correlation_id)
                    .await?
                {
                    if self.finalize(record, RelayStatus::Submitted).await? {
                        report.finalized += 1;
                    }
                    return Ok(());
                }

                let moved = self
                    .store
                    .update_status(
                        record.id(),
                        RelayStatus::Submitted,
                        RelayStatus::Submitting,
                        &RecordUpdate::new()
                            .submitted_at(Some(Utc::now()))
                            .error("destination transaction no longer canonical"),
                    )
                    .await?;
                if moved {
                    metrics::record_reorg(self.direction.as_str(), "destination");
                    warn!(
                        event = %record.id(),
                        tx_hash = ?record.destination_tx_hash,
                        "Destination transaction reorganized out, tracking again"
                    );
                }
            }
        }
        Ok(())
    }

    /// Clear the broadcast so the submitter sends the call again. A record
    /// whose source event left the chain is failed instead.
    async fn requeue(
        &self,
        record: &RelayRecord,
        reason: &str,
        retry_after: Option<chrono::DateTime<Utc>>,
        report: &mut TrackReport,
    ) -> RelayResult<()> {
        if record.needs_reconciliation {
            if self
                .fail(
                    record,
                    RelayStatus::Submitting,
                    format!("{}; source event reorganized, not resent", reason),
                )
                .await?
            {
                report.failed += 1;
            }
            return Ok(());
        }

        let moved = self
            .store
            .update_status(
                record.id(),
                RelayStatus::Submitting,
                RelayStatus::Submitting,
                &RecordUpdate::new()
                    .tx_hash(None)
                    .submitted_at(None)
                    .retry_after(retry_after)
                    .error(reason),
            )
            .await?;
        if moved {
            report.requeued += 1;
            info!(
                event = %record.id(),
                attempts = record.attempts,
                reason,
                "Broadcast will be retried"
            );
        }
        Ok(())
    }
}
