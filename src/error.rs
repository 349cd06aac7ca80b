//! Error taxonomy for chain I/O and relay processing
//!
//! Duplicate events and already-held reservations are expected outcomes, not
//! errors; they are modelled by `AppendOutcome` and `Reservation`.

use thiserror::Error;

use crate::types::{Direction, EventId, RelayStatus};

/// Failures talking to a chain
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    /// Timeouts, connection resets, rate limits. Retried with backoff.
    #[error("transient RPC error: {0}")]
    TransientRpc(String),

    /// The node rejected or reverted the call
    #[error("submission reverted: {reason}")]
    SubmissionReverted { reason: String },

    /// Malformed input or configuration, never retried
    #[error("permanent chain error: {0}")]
    Permanent(String),

    #[error("invalid block range: from {from} > to {to}")]
    InvalidRange { from: u64, to: u64 },
}

impl ConnectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::TransientRpc(_))
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorError::TransientRpc(_) => "transient",
            ConnectorError::SubmissionReverted { .. } => "reverted",
            ConnectorError::Permanent(_) => "permanent",
            ConnectorError::InvalidRange { .. } => "invalid_range",
        }
    }
}

/// Errors raised by the relay engine and its stores
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(
        "watermark for chain {chain_id} ({direction}) cannot move from {current} back to {requested}"
    )]
    NonMonotonicWatermark {
        chain_id: u64,
        direction: Direction,
        current: u64,
        requested: u64,
    },

    #[error("deep reorg: {id} at block {block_number} is no longer canonical (status {status})")]
    DeepReorg {
        id: EventId,
        block_number: u64,
        status: RelayStatus,
    },

    #[error("relay record not found: {0}")]
    RecordNotFound(EventId),

    #[error("relay record {id} is {found}, expected {expected}")]
    InvalidState {
        id: EventId,
        expected: RelayStatus,
        found: RelayStatus,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt relay record: {0}")]
    Corrupt(String),

    /// A relay loop panicked or was cancelled
    #[error("relay task stopped: {0}")]
    Task(String),
}

impl RelayError {
    /// Invariant violations that must stop the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::NonMonotonicWatermark { .. } | RelayError::Corrupt(_) | RelayError::Task(_)
        )
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        RelayError::Storage(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
