use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::error::RelayError;
use crate::hash::bytes_to_hex;
use crate::types::{Asset, BridgeEvent, CorrelationId, EventId, RelayRecord};

// Note: We use String for amount fields. The database stores amounts as NUMERIC(78,0);
// inserts cast text to NUMERIC in the SQL query ($1::NUMERIC) and reads select
// amount::TEXT. Hashes and addresses are stored as lowercase 0x-prefixed hex.

/// Columns selected for every relay record query
pub const RELAY_COLUMNS: &str = r#"chain_id, tx_hash, log_index, direction, block_number, block_hash,
    kind, asset, amount::TEXT AS amount, actor, transfer_id, correlation_id, observed_at,
    status, destination_tx_hash, attempts, last_error, retry_after, submitted_at,
    needs_reconciliation, finalized_at"#;

/// A row of `relay_events`
#[derive(Debug, Clone, FromRow)]
pub struct RelayRow {
    pub chain_id: i64,
    pub tx_hash: String,
    pub log_index: i64,
    pub direction: String,
    pub block_number: i64,
    pub block_hash: String,
    pub kind: String,
    /// NULL for the native coin
    pub asset: Option<String>,
    pub amount: String,
    pub actor: String,
    pub transfer_id: String,
    pub correlation_id: String,
    pub observed_at: DateTime<Utc>,
    pub status: String,
    pub destination_tx_hash: Option<String>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub needs_reconciliation: bool,
    pub finalized_at: Option<DateTime<Utc>>,
}

/// For inserting newly observed events
#[derive(Debug, Clone)]
pub struct NewRelayEvent {
    pub chain_id: i64,
    pub tx_hash: String,
    pub log_index: i64,
    pub direction: String,
    pub block_number: i64,
    pub block_hash: String,
    pub kind: String,
    pub asset: Option<String>,
    pub amount: String,
    pub actor: String,
    pub transfer_id: String,
    pub correlation_id: String,
    pub observed_at: DateTime<Utc>,
}

impl NewRelayEvent {
    pub fn from_event(event: &BridgeEvent, direction: &str) -> Self {
        Self {
            chain_id: event.id.chain_id as i64,
            tx_hash: bytes_to_hex(event.id.tx_hash.as_slice()),
            log_index: event.id.log_index as i64,
            direction: direction.to_string(),
            block_number: event.block_number as i64,
            block_hash: bytes_to_hex(event.block_hash.as_slice()),
            kind: event.kind.as_str().to_string(),
            asset: event.asset.to_db(),
            amount: event.amount.to_string(),
            actor: bytes_to_hex(event.actor.as_slice()),
            transfer_id: bytes_to_hex(event.transfer_id.as_slice()),
            correlation_id: event.correlation_id.to_hex(),
            observed_at: event.observed_at,
        }
    }
}

/// Key columns of an event identity, as bound in queries
pub fn id_columns(id: &EventId) -> (i64, String, i64) {
    (
        id.chain_id as i64,
        bytes_to_hex(id.tx_hash.as_slice()),
        id.log_index as i64,
    )
}

fn corrupt(field: &str, value: &str, e: impl std::fmt::Display) -> RelayError {
    RelayError::Corrupt(format!("{} {:?}: {}", field, value, e))
}

fn parse_b256(field: &str, value: &str) -> Result<B256, RelayError> {
    value.parse::<B256>().map_err(|e| corrupt(field, value, e))
}

fn non_negative(field: &str, value: i64) -> Result<u64, RelayError> {
    u64::try_from(value).map_err(|e| corrupt(field, &value.to_string(), e))
}

impl TryFrom<RelayRow> for RelayRecord {
    type Error = RelayError;

    fn try_from(row: RelayRow) -> Result<Self, Self::Error> {
        let id = EventId::new(
            non_negative("chain_id", row.chain_id)?,
            parse_b256("tx_hash", &row.tx_hash)?,
            non_negative("log_index", row.log_index)?,
        );

        let correlation_id = CorrelationId(parse_b256("correlation_id", &row.correlation_id)?);
        if correlation_id != id.correlation_id() {
            return Err(RelayError::Corrupt(format!(
                "correlation id {} does not match identity {}",
                correlation_id, id
            )));
        }

        let event = BridgeEvent {
            id,
            block_number: non_negative("block_number", row.block_number)?,
            block_hash: parse_b256("block_hash", &row.block_hash)?,
            kind: row.kind.parse().map_err(|e: String| corrupt("kind", &row.kind, e))?,
            asset: Asset::from_db(row.asset.as_deref())
                .map_err(|e| corrupt("asset", row.asset.as_deref().unwrap_or(""), e))?,
            amount: U256::from_str_radix(&row.amount, 10)
                .map_err(|e| corrupt("amount", &row.amount, e))?,
            actor: row
                .actor
                .parse::<Address>()
                .map_err(|e| corrupt("actor", &row.actor, e))?,
            transfer_id: parse_b256("transfer_id", &row.transfer_id)?,
            correlation_id,
            observed_at: row.observed_at,
        };

        Ok(RelayRecord {
            event,
            direction: row
                .direction
                .parse()
                .map_err(|e: String| corrupt("direction", &row.direction, e))?,
            status: row
                .status
                .parse()
                .map_err(|e: String| corrupt("status", &row.status, e))?,
            destination_tx_hash: row
                .destination_tx_hash
                .as_deref()
                .map(|h| parse_b256("destination_tx_hash", h))
                .transpose()?,
            attempts: u32::try_from(row.attempts)
                .map_err(|e| corrupt("attempts", &row.attempts.to_string(), e))?,
            last_error: row.last_error,
            retry_after: row.retry_after,
            submitted_at: row.submitted_at,
            needs_reconciliation: row.needs_reconciliation,
            finalized_at: row.finalized_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, EventKind, RelayStatus};

    fn sample_event() -> BridgeEvent {
        BridgeEvent::new(
            EventId::new(43113, B256::repeat_byte(0xab), 4),
            1000,
            B256::repeat_byte(0x01),
            EventKind::Burn,
            Asset::Token(Address::repeat_byte(0x11)),
            U256::from(10u64).pow(U256::from(30u64)),
            Address::repeat_byte(0x22),
            B256::repeat_byte(0x33),
        )
    }

    fn row_for(event: &BridgeEvent) -> RelayRow {
        let new = NewRelayEvent::from_event(event, "burn_unlock");
        RelayRow {
            chain_id: new.chain_id,
            tx_hash: new.tx_hash,
            log_index: new.log_index,
            direction: new.direction,
            block_number: new.block_number,
            block_hash: new.block_hash,
            kind: new.kind,
            asset: new.asset,
            amount: new.amount,
            actor: new.actor,
            transfer_id: new.transfer_id,
            correlation_id: new.correlation_id,
            observed_at: new.observed_at,
            status: "submitted".to_string(),
            destination_tx_hash: Some(bytes_to_hex(&[0x44; 32])),
            attempts: 2,
            last_error: None,
            retry_after: None,
            submitted_at: None,
            needs_reconciliation: false,
            finalized_at: None,
        }
    }

    #[test]
    fn test_row_to_record() {
        let event = sample_event();
        let record = RelayRecord::try_from(row_for(&event)).unwrap();
        assert_eq!(record.event, event);
        assert_eq!(record.direction, Direction::BurnUnlock);
        assert_eq!(record.status, RelayStatus::Submitted);
        assert_eq!(record.destination_tx_hash, Some(B256::repeat_byte(0x44)));
        assert_eq!(record.attempts, 2);
    }

    #[test]
    fn test_amount_kept_exact() {
        let new = NewRelayEvent::from_event(&sample_event(), "burn_unlock");
        assert_eq!(new.amount, format!("1{}", "0".repeat(30)));
    }

    #[test]
    fn test_rejects_mismatched_correlation_id() {
        let mut row = row_for(&sample_event());
        row.correlation_id = bytes_to_hex(&[0u8; 32]);
        assert!(matches!(
            RelayRecord::try_from(row),
            Err(RelayError::Corrupt(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_status() {
        let mut row = row_for(&sample_event());
        row.status = "reorged".to_string();
        assert!(RelayRecord::try_from(row).is_err());
    }
}
