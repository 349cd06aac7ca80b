//! Relay engine
//!
//! One `RelayEngine` drives one direction (lock→mint or burn→unlock) through
//! three independent loops that share state only through the store:
//!
//! - **scanner**: fetches source events, appends them, checks block hashes,
//!   confirms at depth K and advances the watermark
//! - **submitter**: reserves confirmed records and broadcasts destination calls
//!   in `(block, log index)` order
//! - **tracker**: follows broadcast transactions to depth K' on the destination
//!   and resolves stalled or dropped ones
//!
//! Each stage is also exposed as a single pass (`scan_once`, `submit_once`,
//! `track_once`) so the state machine can be stepped deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::connector::{ChainConnector, RetryConfig};
use crate::db::{EventLogStore, SharedStore};
use crate::dedup::Deduplicator;
use crate::error::{RelayError, RelayResult};
use crate::metrics;
use crate::types::{Direction, EventId, RecordUpdate, RelayRecord, RelayStatus, TokenMap};
use crate::watermark::WatermarkTracker;

pub mod scanner;
pub mod submitter;
pub mod tracker;

pub use scanner::{IngestReport, ScanReport, ORPHAN_RECHECKS};
pub use submitter::SubmitReport;
pub use tracker::TrackReport;

/// Block ranges fetched per scan pass, in units of the connector's log range
const CHUNKS_PER_PASS: u64 = 5;

/// Tunables for one direction
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// K: source confirmations before a record is Confirmed
    pub source_confirmations: u64,
    /// K': destination confirmations before a record is Finalized
    pub destination_confirmations: u64,
    /// First source block scanned when no watermark exists
    pub start_block: u64,
    /// Upper bound on the source range covered by one scan pass
    pub max_blocks_per_pass: u64,
    /// Broadcast attempts before a record is Failed
    pub max_attempts: u32,
    /// How long a broadcast may stay unmined before it is re-queried
    pub submission_timeout: Duration,
    pub poll_interval: Duration,
    /// Backoff between attempts of the same record
    pub retry: RetryConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            source_confirmations: 12,
            destination_confirmations: 1,
            start_block: 0,
            max_blocks_per_pass: 10_000,
            max_attempts: 5,
            submission_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config, direction: Direction) -> Self {
        let source = config.chain(direction.source_role());
        let destination = config.chain(direction.destination_role());
        Self {
            source_confirmations: source.confirmations,
            destination_confirmations: destination.confirmations,
            start_block: source.start_block,
            max_blocks_per_pass: config
                .relayer
                .max_block_range
                .saturating_mul(CHUNKS_PER_PASS),
            max_attempts: config.relayer.max_submit_attempts,
            submission_timeout: config.relayer.submission_timeout(),
            poll_interval: config.relayer.poll_interval(),
            retry: config.relayer.retry_config(),
        }
    }
}

/// The three relay loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Scan,
    Submit,
    Track,
}

impl Stage {
    const ALL: [Stage; 3] = [Stage::Scan, Stage::Submit, Stage::Track];

    fn as_str(&self) -> &'static str {
        match self {
            Stage::Scan => "scanner",
            Stage::Submit => "submitter",
            Stage::Track => "tracker",
        }
    }
}

/// Relay pipeline for one direction
pub struct RelayEngine {
    direction: Direction,
    source: Arc<dyn ChainConnector>,
    destination: Arc<dyn ChainConnector>,
    store: SharedStore,
    watermark: WatermarkTracker,
    dedup: Deduplicator,
    tokens: TokenMap,
    settings: EngineSettings,
    /// Re-check schedule for Pending events whose block left the chain
    orphans: Mutex<HashMap<EventId, scanner::OrphanWatch>>,
}

impl RelayEngine {
    pub fn new(
        direction: Direction,
        source: Arc<dyn ChainConnector>,
        destination: Arc<dyn ChainConnector>,
        store: SharedStore,
        tokens: TokenMap,
        instance_id: &str,
        settings: EngineSettings,
    ) -> Self {
        let watermark = WatermarkTracker::new(
            store.clone(),
            source.chain_id(),
            source.name(),
            direction,
            settings.start_block,
        );
        let dedup = Deduplicator::new(store.clone(), instance_id);
        Self {
            direction,
            source,
            destination,
            store,
            watermark,
            dedup,
            tokens,
            settings,
            orphans: Mutex::new(HashMap::new()),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn watermark(&self) -> &WatermarkTracker {
        &self.watermark
    }

    /// One pass of every stage, in pipeline order
    pub async fn tick(&self) -> RelayResult<()> {
        self.scan_once().await?;
        self.submit_once().await?;
        self.track_once().await?;
        Ok(())
    }

    /// Run the three loops until `shutdown` flips to true.
    ///
    /// Returns the first fatal error; other errors are logged and the failing
    /// loop backs off before its next pass.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> RelayResult<()> {
        let mut tasks = JoinSet::new();
        for stage in Stage::ALL {
            let engine = self.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move { engine.run_stage(stage, shutdown).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    error!(direction = %self.direction, error = %e, "Relay task panicked");
                    tasks.abort_all();
                    return Err(RelayError::Task(e.to_string()));
                }
            }
        }
        Ok(())
    }

    async fn run_stage(&self, stage: Stage, mut shutdown: watch::Receiver<bool>) -> RelayResult<()> {
        info!(
            direction = %self.direction,
            stage = stage.as_str(),
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Relay loop starting"
        );

        let mut consecutive_failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let result = match stage {
                Stage::Scan => self.scan_once().await.map(|_| ()),
                Stage::Submit => self.submit_once().await.map(|_| ()),
                Stage::Track => self.track_once().await.map(|_| ()),
            };

            let delay = match result {
                Ok(()) => {
                    consecutive_failures = 0;
                    self.settings.poll_interval
                }
                Err(e) if e.is_fatal() => {
                    metrics::record_error(self.direction.as_str(), "fatal");
                    error!(
                        direction = %self.direction,
                        stage = stage.as_str(),
                        error = %e,
                        "Invariant violated, stopping relay"
                    );
                    return Err(e);
                }
                Err(e) => {
                    metrics::record_error(self.direction.as_str(), stage.as_str());
                    let backoff = self.settings.retry.backoff_for_attempt(consecutive_failures);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(
                        direction = %self.direction,
                        stage = stage.as_str(),
                        consecutive_failures,
                        ?backoff,
                        error = %e,
                        "Relay pass failed"
                    );
                    backoff.max(self.settings.poll_interval)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(direction = %self.direction, stage = stage.as_str(), "Relay loop stopped");
        Ok(())
    }

    /// Whether the latest attempt has outlived the submission timeout
    fn attempt_expired(&self, record: &RelayRecord) -> bool {
        match record.submitted_at {
            Some(at) => (Utc::now() - at)
                .to_std()
                .map(|elapsed| elapsed >= self.settings.submission_timeout)
                .unwrap_or(false),
            None => true,
        }
    }

    /// An attempt was started and may have reached the destination, but no
    /// transaction hash came back and the submission timeout has not run out
    fn attempt_in_doubt(&self, record: &RelayRecord) -> bool {
        record.status == RelayStatus::Submitting
            && record.destination_tx_hash.is_none()
            && record.attempts > 0
            && record.submitted_at.is_some()
            && !self.attempt_expired(record)
    }

    /// CAS `from` -> Finalized and record end-to-end latency
    async fn finalize(&self, record: &RelayRecord, from: RelayStatus) -> RelayResult<bool> {
        let moved = self
            .store
            .update_status(
                record.id(),
                from,
                RelayStatus::Finalized,
                &RecordUpdate::new().clear_error().retry_after(None),
            )
            .await?;
        if moved {
            let latency = (Utc::now() - record.event.observed_at).num_milliseconds() as f64 / 1000.0;
            metrics::record_finalized(self.direction.as_str(), latency);
            info!(
                event = %record.id(),
                direction = %self.direction,
                tx_hash = ?record.destination_tx_hash,
                latency_secs = latency,
                "Relay finalized"
            );
        }
        Ok(moved)
    }

    /// CAS `from` -> Failed. Failed records wait for an operator replay.
    async fn fail(
        &self,
        record: &RelayRecord,
        from: RelayStatus,
        reason: impl Into<String>,
    ) -> RelayResult<bool> {
        let reason = reason.into();
        let moved = self
            .store
            .update_status(
                record.id(),
                from,
                RelayStatus::Failed,
                &RecordUpdate::new().error(reason.clone()).retry_after(None),
            )
            .await?;
        if moved {
            metrics::record_failed(self.direction.as_str());
            error!(
                event = %record.id(),
                direction = %self.direction,
                correlation_id = %record.event.correlation_id,
                attempts = record.attempts,
                reason = %reason,
                "Relay failed, operator replay required"
            );
        }
        Ok(moved)
    }

    /// CAS `from` -> Submitted when the destination already executed the action
    async fn mark_executed(&self, record: &RelayRecord, from: RelayStatus) -> RelayResult<bool> {
        let moved = self
            .store
            .update_status(
                record.id(),
                from,
                RelayStatus::Submitted,
                &RecordUpdate::new().clear_error().retry_after(None),
            )
            .await?;
        if moved {
            info!(
                event = %record.id(),
                correlation_id = %record.event.correlation_id,
                "Destination replay guard already holds this action"
            );
        }
        Ok(moved)
    }
}
