//! Scanner stage: source events in, confirmations and reorgs out

use std::collections::HashMap;

use alloy::primitives::B256;
use tracing::{debug, error, info, warn};

use super::RelayEngine;
use crate::db::EventLogStore;
use crate::error::{RelayError, RelayResult};
use crate::metrics;
use crate::types::{AppendOutcome, BridgeEvent, RecordUpdate, RelayRecord, RelayStatus};

const REORGED: &str = "source block reorganized";

/// Receipt lookups spent on an orphaned Pending event before it is handed
/// to the operator
pub const ORPHAN_RECHECKS: u32 = 6;

/// Backoff state for one orphaned Pending event. Re-checks are spaced K
/// blocks apart, doubling each time.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct OrphanWatch {
    checks: u32,
    next_head: u64,
}

/// Outcome of appending one fetched range
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub appended: usize,
    pub duplicates: usize,
    pub relocated: usize,
}

/// Outcome of one scan pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub head: u64,
    /// Source range fetched this pass, if any
    pub range: Option<(u64, u64)>,
    pub ingest: IngestReport,
    /// Watermark written this pass
    pub watermark: Option<u64>,
    pub confirmed: usize,
    /// Confirmed records sent back to Pending
    pub reverted: usize,
    /// Records flagged for reconciliation
    pub flagged: usize,
    /// Unbroadcast Submitting records sent back to Pending
    pub withdrawn: usize,
}

impl RelayEngine {
    /// Fetch the next source range, append what it holds, then confirm or
    /// revert unsettled records against the current head.
    pub async fn scan_once(&self) -> RelayResult<ScanReport> {
        let head = self.source.head_block().await?;
        metrics::set_chain_head(self.source.name(), head);

        let mut report = ScanReport {
            head,
            ..Default::default()
        };

        let from = self.watermark.resume_point().await?;
        if from <= head {
            let span = self.settings.max_blocks_per_pass.max(1);
            let to = head.min(from.saturating_add(span - 1));
            report.range = Some((from, to));
            report.ingest = self.ingest_range(from, to).await?;

            // The unconfirmed tail stays above the watermark and is rescanned
            if let Some(settled) = head.checked_sub(self.settings.source_confirmations) {
                let mark = to.min(settled);
                if mark >= from {
                    self.watermark.advance(mark).await?;
                    report.watermark = Some(mark);
                }
            }
        }

        self.review_unsettled(head, &mut report).await?;
        self.publish_status_counts().await?;
        metrics::record_successful_poll(self.direction.as_str());

        if report.ingest.appended > 0
            || report.confirmed > 0
            || report.reverted > 0
            || report.withdrawn > 0
        {
            info!(
                direction = %self.direction,
                head,
                range = ?report.range,
                appended = report.ingest.appended,
                confirmed = report.confirmed,
                reverted = report.reverted,
                withdrawn = report.withdrawn,
                "Scan pass complete"
            );
        }
        Ok(report)
    }

    /// Append every relayable event in `[from, to]`. Safe to call on any range
    /// any number of times; known identities are never written twice.
    pub async fn ingest_range(&self, from: u64, to: u64) -> RelayResult<IngestReport> {
        let kind = self.direction.source_kind();
        let events = self.source.fetch_events(from, to).await?;

        let mut report = IngestReport::default();
        for event in events.into_iter().filter(|e| e.kind == kind) {
            match self.store.append(&event, self.direction).await? {
                AppendOutcome::Appended => {
                    report.appended += 1;
                    metrics::record_event_observed(self.direction.as_str());
                    info!(
                        event = %event.id,
                        direction = %self.direction,
                        block = event.block_number,
                        asset = %event.asset,
                        amount = %event.amount,
                        actor = %event.actor,
                        correlation_id = %event.correlation_id,
                        "Source event recorded"
                    );
                }
                AppendOutcome::DuplicateEvent => {
                    report.duplicates += 1;
                    metrics::record_duplicate_event(self.direction.as_str());
                    if self.follow_moved_event(&event).await? {
                        report.relocated += 1;
                    }
                }
            }
        }

        debug!(
            direction = %self.direction,
            from,
            to,
            appended = report.appended,
            duplicates = report.duplicates,
            "Ingested source range"
        );
        Ok(report)
    }

    /// A re-observed Pending event whose block hash changed moved in a reorg
    async fn follow_moved_event(&self, event: &BridgeEvent) -> RelayResult<bool> {
        let Some(record) = self.store.get(&event.id).await? else {
            return Ok(false);
        };
        if record.status != RelayStatus::Pending || record.event.block_hash == event.block_hash {
            return Ok(false);
        }

        let moved = self
            .store
            .relocate(&event.id, event.block_number, event.block_hash)
            .await?;
        if moved {
            self.orphans.lock().await.remove(&event.id);
            info!(
                event = %event.id,
                from_block = record.event.block_number,
                to_block = event.block_number,
                "Pending event re-observed in a new block"
            );
        }
        Ok(moved)
    }

    async fn review_unsettled(&self, head: u64, report: &mut ScanReport) -> RelayResult<()> {
        let records = self.store.list_unsettled(self.direction).await?;
        let mut canonical: HashMap<u64, Option<B256>> = HashMap::new();

        for record in records {
            let block = record.event.block_number;
            let hash = match canonical.get(&block) {
                Some(hash) => *hash,
                None => {
                    let hash = self.source.block_hash(block).await?;
                    canonical.insert(block, hash);
                    hash
                }
            };
            let is_canonical = hash == Some(record.event.block_hash);

            match (record.status, is_canonical) {
                (RelayStatus::Pending, true) => {
                    if head.saturating_sub(block) >= self.settings.source_confirmations
                        && self.confirm(&record).await?
                    {
                        report.confirmed += 1;
                    }
                }
                (RelayStatus::Pending, false) => {
                    if self.recover_orphaned(&record, head).await? {
                        report.flagged += 1;
                    }
                }
                (RelayStatus::Confirmed, false) => {
                    if self.revert_to_pending(&record).await? {
                        report.reverted += 1;
                    }
                }
                (RelayStatus::Submitting, false)
                    if record.destination_tx_hash.is_none() && !record.needs_reconciliation =>
                {
                    self.withdraw_unsent(&record, report).await?;
                }
                (RelayStatus::Submitting | RelayStatus::Submitted, false) => {
                    if !record.needs_reconciliation {
                        self.flag_after_submission(&record).await?;
                        report.flagged += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn confirm(&self, record: &RelayRecord) -> RelayResult<bool> {
        let moved = self
            .store
            .update_status(
                record.id(),
                RelayStatus::Pending,
                RelayStatus::Confirmed,
                &RecordUpdate::new().clear_error(),
            )
            .await?;
        if moved {
            debug!(event = %record.id(), block = record.event.block_number, "Event confirmed");
        }
        Ok(moved)
    }

    /// Look for a Pending event whose block left the canonical chain. If its
    /// transaction was mined again the record follows it; otherwise it waits
    /// as Pending and never confirms. Lookups back off as the head advances
    /// and stop after `ORPHAN_RECHECKS`, when the record is flagged.
    /// Returns whether it was flagged.
    async fn recover_orphaned(&self, record: &RelayRecord, head: u64) -> RelayResult<bool> {
        if record.last_error.is_none() {
            metrics::record_reorg(self.direction.as_str(), "pending");
            self.store
                .update_status(
                    record.id(),
                    RelayStatus::Pending,
                    RelayStatus::Pending,
                    &RecordUpdate::new().error(REORGED),
                )
                .await?;
            warn!(
                event = %record.id(),
                block = record.event.block_number,
                "Pending event's source block is no longer canonical"
            );
        }

        let checks = {
            let mut orphans = self.orphans.lock().await;
            let watch = orphans.entry(*record.id()).or_default();
            if head < watch.next_head {
                return Ok(false);
            }
            let spacing = self
                .settings
                .source_confirmations
                .max(1)
                .saturating_mul(1u64 << watch.checks.min(32));
            watch.checks += 1;
            watch.next_head = head.saturating_add(spacing);
            watch.checks
        };

        let receipt = self.source.receipt(record.event.id.tx_hash).await?;
        if let Some(receipt) = receipt.filter(|r| r.success) {
            let events = self
                .source
                .fetch_events(receipt.block_number, receipt.block_number)
                .await?;
            if let Some(event) = events.iter().find(|e| e.id == record.event.id) {
                self.follow_moved_event(event).await?;
                return Ok(false);
            }
            // Re-mined at a different log index: a new identity
            for event in events
                .iter()
                .filter(|e| e.id.tx_hash == record.event.id.tx_hash && e.kind == record.event.kind)
            {
                if self.store.append(event, self.direction).await? == AppendOutcome::Appended {
                    metrics::record_event_observed(self.direction.as_str());
                    warn!(
                        orphaned = %record.id(),
                        replacement = %event.id,
                        "Reorganized event re-mined under a new identity"
                    );
                }
            }
        }

        if checks < ORPHAN_RECHECKS {
            debug!(event = %record.id(), checks, "Orphaned event not found again yet");
            return Ok(false);
        }

        self.orphans.lock().await.remove(record.id());
        let reason = format!("{}; transaction not found again after {} checks", REORGED, checks);
        self.store.flag_reconciliation(record.id(), &reason).await?;
        metrics::record_reorg(self.direction.as_str(), "orphaned");
        error!(
            event = %record.id(),
            direction = %self.direction,
            block = record.event.block_number,
            checks,
            "Orphaned event abandoned, reconciliation required"
        );
        Ok(true)
    }

    /// A reorged-out Submitting record that never got a transaction hash.
    /// If nothing can have reached the destination it goes back to Pending
    /// and gives up its reservation; otherwise it is flagged.
    async fn withdraw_unsent(&self, record: &RelayRecord, report: &mut ScanReport) -> RelayResult<()> {
        let may_have_landed = self.attempt_in_doubt(record)
            || self
                .destination
                .action_executed(&record.event.correlation_id)
                .await?;
        if may_have_landed {
            self.flag_after_submission(record).await?;
            report.flagged += 1;
            return Ok(());
        }

        // Lost to a concurrent attempt; the next pass sees its transaction
        if !self
            .store
            .withdraw_unsent(record.id(), record.attempts, REORGED)
            .await?
        {
            return Ok(());
        }
        self.dedup.release(&record.event.correlation_id).await?;
        report.withdrawn += 1;
        metrics::record_reorg(self.direction.as_str(), "withdrawn");
        warn!(
            event = %record.id(),
            block = record.event.block_number,
            attempts = record.attempts,
            "Unbroadcast action withdrawn after source reorg, back to Pending"
        );
        Ok(())
    }

    async fn revert_to_pending(&self, record: &RelayRecord) -> RelayResult<bool> {
        let moved = self
            .store
            .update_status(
                record.id(),
                RelayStatus::Confirmed,
                RelayStatus::Pending,
                &RecordUpdate::new().error(REORGED),
            )
            .await?;
        if moved {
            metrics::record_reorg(self.direction.as_str(), "reverted");
            warn!(
                event = %record.id(),
                block = record.event.block_number,
                "Confirmed event reorganized out, back to Pending"
            );
        }
        Ok(moved)
    }

    async fn flag_after_submission(&self, record: &RelayRecord) -> RelayResult<()> {
        let reorg = RelayError::DeepReorg {
            id: *record.id(),
            block_number: record.event.block_number,
            status: record.status,
        };
        self.store
            .flag_reconciliation(record.id(), &reorg.to_string())
            .await?;
        metrics::record_reorg(self.direction.as_str(), "reconciliation");
        error!(
            event = %record.id(),
            direction = %self.direction,
            status = %record.status,
            destination_tx = ?record.destination_tx_hash,
            error = %reorg,
            "Source event reorganized after its destination action was issued"
        );
        Ok(())
    }

    async fn publish_status_counts(&self) -> RelayResult<()> {
        let counts = self.store.count_by_status(self.direction).await?;
        for status in RelayStatus::ALL {
            let count = counts
                .iter()
                .find(|(s, _)| *s == status)
                .map(|(_, c)| *c)
                .unwrap_or(0);
            metrics::set_records_by_status(self.direction.as_str(), status.as_str(), count);
        }
        Ok(())
    }
}
