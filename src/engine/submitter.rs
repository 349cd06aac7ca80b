//! Submitter stage: reserve, then broadcast in source order

use chrono::Utc;
use tracing::{debug, info, warn};

use super::RelayEngine;
use crate::connector::retry::classify_error;
use crate::db::EventLogStore;
use crate::error::{ConnectorError, RelayResult};
use crate::metrics;
use crate::types::{DestinationCall, RecordUpdate, RelayRecord, RelayStatus, Reservation};

/// Outcome of one submit pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubmitReport {
    pub submitted: usize,
    /// Actions found already reserved or already executed on the destination
    pub already_done: usize,
    pub failed: usize,
    /// The pass stopped at a record that is backing off
    pub blocked: bool,
}

/// What happened to one record
enum Broadcast {
    Sent,
    AlreadyExecuted,
    Failed,
    /// Backing off; later records must wait
    Deferred,
    /// Another loop or process moved the record first
    Skipped,
}

/// Whether a failed broadcast may succeed on a later attempt
pub fn is_retryable(error: &ConnectorError) -> bool {
    match error {
        ConnectorError::TransientRpc(_) => true,
        ConnectorError::SubmissionReverted { reason } => {
            classify_error(reason).is_transient_revert()
        }
        ConnectorError::Permanent(_) | ConnectorError::InvalidRange { .. } => false,
    }
}

impl RelayEngine {
    /// Walk Confirmed records and unbroadcast Submitting records in
    /// `(block, log index)` order. A record in backoff or with an attempt in
    /// doubt blocks everything behind it. Records flagged for reconciliation
    /// are left to the operator.
    pub async fn submit_once(&self) -> RelayResult<SubmitReport> {
        let mut queue = self
            .store
            .list_by_status(self.direction, RelayStatus::Confirmed)
            .await?;
        queue.extend(
            self.store
                .list_by_status(self.direction, RelayStatus::Submitting)
                .await?
                .into_iter()
                .filter(|r| r.destination_tx_hash.is_none()),
        );
        queue.retain(|r| !r.needs_reconciliation);
        queue.sort_by_key(|r| r.position());

        let mut report = SubmitReport::default();
        for record in queue {
            if !self.settings.retry.is_ready_for_retry(record.retry_after) {
                debug!(
                    event = %record.id(),
                    retry_after = ?record.retry_after,
                    "Head of queue is backing off"
                );
                report.blocked = true;
                break;
            }

            if self.attempt_in_doubt(&record) {
                debug!(
                    event = %record.id(),
                    attempts = record.attempts,
                    "Earlier broadcast still in doubt"
                );
                report.blocked = true;
                break;
            }

            let record = match record.status {
                RelayStatus::Confirmed => match self.dedup.reserve(&record).await? {
                    Reservation::Granted => RelayRecord {
                        status: RelayStatus::Submitting,
                        ..record
                    },
                    Reservation::AlreadyReserved => {
                        if self.finalize(&record, RelayStatus::Confirmed).await? {
                            report.already_done += 1;
                        }
                        continue;
                    }
                    Reservation::Superseded => continue,
                },
                _ => record,
            };

            match self.broadcast(&record).await? {
                Broadcast::Sent => report.submitted += 1,
                Broadcast::AlreadyExecuted => report.already_done += 1,
                Broadcast::Failed => report.failed += 1,
                Broadcast::Deferred => {
                    report.blocked = true;
                    break;
                }
                Broadcast::Skipped => {}
            }
        }
        Ok(report)
    }

    async fn broadcast(&self, record: &RelayRecord) -> RelayResult<Broadcast> {
        let max_attempts = self.settings.max_attempts;

        // A previous attempt may have landed before the process stopped
        if record.attempts > 0
            && self
                .destination
                .action_executed(&record.event.correlation_id)
                .await?
        {
            self.mark_executed(record, RelayStatus::Submitting).await?;
            return Ok(Broadcast::AlreadyExecuted);
        }

        if record.attempts >= max_attempts {
            self.fail(
                record,
                RelayStatus::Submitting,
                format!("gave up after {} attempts", record.attempts),
            )
            .await?;
            return Ok(Broadcast::Failed);
        }

        // Persisted before the broadcast so a crash mid-call is visible on restart
        let attempt = record.attempts + 1;
        if !self
            .store
            .begin_attempt(record.id(), record.attempts, Utc::now())
            .await?
        {
            return Ok(Broadcast::Skipped);
        }

        let call = DestinationCall::for_event(&record.event, self.direction, &self.tokens);
        match self.destination.submit(&call).await {
            Ok(tx_hash) => {
                self.store
                    .update_status(
                        record.id(),
                        RelayStatus::Submitting,
                        RelayStatus::Submitting,
                        &RecordUpdate::new()
                            .tx_hash(Some(tx_hash))
                            .submitted_at(Some(Utc::now()))
                            .retry_after(None)
                            .clear_error(),
                    )
                    .await?;
                metrics::record_submission(self.direction.as_str(), true);
                info!(
                    event = %record.id(),
                    call = call.name(),
                    destination = %self.destination.name(),
                    tx_hash = %tx_hash,
                    attempt,
                    correlation_id = %call.correlation_id(),
                    "Destination call broadcast"
                );
                Ok(Broadcast::Sent)
            }
            Err(ConnectorError::TransientRpc(cause)) => {
                // The node may have accepted the transaction before the call
                // failed. `submitted_at` stays set, so the attempt is in doubt
                // until the submission timeout and the replay guard decides.
                metrics::record_submission(self.direction.as_str(), false);
                let retry_after = self.settings.retry.next_retry_after(attempt - 1);
                self.store
                    .update_status(
                        record.id(),
                        RelayStatus::Submitting,
                        RelayStatus::Submitting,
                        &RecordUpdate::new()
                            .error(format!("broadcast outcome unknown: {}", cause))
                            .retry_after(Some(retry_after)),
                    )
                    .await?;
                warn!(
                    event = %record.id(),
                    attempt,
                    max_attempts,
                    error = %cause,
                    "Broadcast outcome unknown, holding until the submission timeout"
                );
                Ok(Broadcast::Deferred)
            }
            Err(e) => {
                metrics::record_submission(self.direction.as_str(), false);
                let reason = e.to_string();

                // Rejected before it reached the mempool
                if is_retryable(&e) && attempt < max_attempts {
                    let retry_after = self.settings.retry.next_retry_after(attempt - 1);
                    self.store
                        .update_status(
                            record.id(),
                            RelayStatus::Submitting,
                            RelayStatus::Submitting,
                            &RecordUpdate::new()
                                .error(reason.clone())
                                .submitted_at(None)
                                .retry_after(Some(retry_after)),
                        )
                        .await?;
                    warn!(
                        event = %record.id(),
                        attempt,
                        max_attempts,
                        retry_after = %retry_after,
                        error = %reason,
                        "Broadcast failed, backing off"
                    );
                    return Ok(Broadcast::Deferred);
                }

                // A guard revert means the action is already done
                if matches!(
                    self.destination
                        .action_executed(&record.event.correlation_id)
                        .await,
                    Ok(true)
                ) {
                    self.mark_executed(record, RelayStatus::Submitting).await?;
                    return Ok(Broadcast::AlreadyExecuted);
                }

                self.fail(record, RelayStatus::Submitting, reason).await?;
                Ok(Broadcast::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable(&ConnectorError::TransientRpc("timeout".into())));
        assert!(is_retryable(&ConnectorError::SubmissionReverted {
            reason: "transaction underpriced".into()
        }));
        assert!(!is_retryable(&ConnectorError::Permanent("bad address".into())));
    }
}
