//! Domain types shared by the connectors, the store and the relay engine
//!
//! Amounts are `U256` end to end. They are only rendered as decimal strings
//! at the storage boundary (NUMERIC(78,0)), never as floats.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::{bytes_to_hex, compute_correlation_id};

// ============================================================================
// Chains and directions
// ============================================================================

/// Role a chain plays in the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainRole {
    /// Hosts the locker contract (emits Lock, executes unlock)
    Locker,
    /// Hosts the wrapped-asset minter (emits Burn, executes mint)
    Minter,
}

impl ChainRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainRole::Locker => "locker",
            ChainRole::Minter => "minter",
        }
    }
}

impl fmt::Display for ChainRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One of the two mirror pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Lock on the locker chain, mint on the minter chain
    LockMint,
    /// Burn on the minter chain, unlock on the locker chain
    BurnUnlock,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::LockMint, Direction::BurnUnlock];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::LockMint => "lock_mint",
            Direction::BurnUnlock => "burn_unlock",
        }
    }

    /// Chain whose events feed this direction
    pub fn source_role(&self) -> ChainRole {
        match self {
            Direction::LockMint => ChainRole::Locker,
            Direction::BurnUnlock => ChainRole::Minter,
        }
    }

    /// Chain that receives the resulting call
    pub fn destination_role(&self) -> ChainRole {
        match self {
            Direction::LockMint => ChainRole::Minter,
            Direction::BurnUnlock => ChainRole::Locker,
        }
    }

    /// Event kind that is relayed in this direction
    pub fn source_kind(&self) -> EventKind {
        match self {
            Direction::LockMint => EventKind::Lock,
            Direction::BurnUnlock => EventKind::Burn,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lock_mint" => Ok(Direction::LockMint),
            "burn_unlock" => Ok(Direction::BurnUnlock),
            other => Err(format!("unknown direction: {}", other)),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Kind of bridge event emitted by either contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Lock,
    Burn,
    Unlock,
    Mint,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Lock => "lock",
            EventKind::Burn => "burn",
            EventKind::Unlock => "unlock",
            EventKind::Mint => "mint",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lock" => Ok(EventKind::Lock),
            "burn" => Ok(EventKind::Burn),
            "unlock" => Ok(EventKind::Unlock),
            "mint" => Ok(EventKind::Mint),
            other => Err(format!("unknown event kind: {}", other)),
        }
    }
}

/// Bridged asset: an ERC20 token or the chain's native coin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    Native,
    Token(Address),
}

impl Asset {
    /// Storage form: NULL for the native coin, lowercase hex otherwise
    pub fn to_db(&self) -> Option<String> {
        match self {
            Asset::Native => None,
            Asset::Token(address) => Some(bytes_to_hex(address.as_slice())),
        }
    }

    pub fn from_db(value: Option<&str>) -> Result<Self, String> {
        match value {
            None => Ok(Asset::Native),
            Some(s) => s
                .parse::<Address>()
                .map(Asset::Token)
                .map_err(|e| format!("invalid asset address {}: {}", s, e)),
        }
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Native => write!(f, "native"),
            Asset::Token(address) => write!(f, "{}", bytes_to_hex(address.as_slice())),
        }
    }
}

/// Unique identity of a source event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId {
    pub chain_id: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl EventId {
    pub fn new(chain_id: u64, tx_hash: B256, log_index: u64) -> Self {
        Self {
            chain_id,
            tx_hash,
            log_index,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        CorrelationId(B256::from(compute_correlation_id(
            self.chain_id,
            &self.tx_hash,
            self.log_index,
        )))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.chain_id,
            bytes_to_hex(self.tx_hash.as_slice()),
            self.log_index
        )
    }
}

/// Idempotency key passed to the destination contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub B256);

impl CorrelationId {
    pub fn to_hex(&self) -> String {
        bytes_to_hex(self.0.as_slice())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// An observed source-chain event. Immutable once recorded, apart from the
/// block position of a still-pending event that moved in a reorg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEvent {
    pub id: EventId,
    pub block_number: u64,
    pub block_hash: B256,
    pub kind: EventKind,
    pub asset: Asset,
    pub amount: U256,
    /// Sender on the source chain and recipient on the destination chain
    pub actor: Address,
    /// Contract-emitted txId / burnId
    pub transfer_id: B256,
    pub correlation_id: CorrelationId,
    pub observed_at: DateTime<Utc>,
}

impl BridgeEvent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: EventId,
        block_number: u64,
        block_hash: B256,
        kind: EventKind,
        asset: Asset,
        amount: U256,
        actor: Address,
        transfer_id: B256,
    ) -> Self {
        Self {
            correlation_id: id.correlation_id(),
            id,
            block_number,
            block_hash,
            kind,
            asset,
            amount,
            actor,
            transfer_id,
            observed_at: Utc::now(),
        }
    }

    /// Ordering key within one chain
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.id.log_index)
    }
}

// ============================================================================
// Relay records
// ============================================================================

/// Processing status of a relay record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayStatus {
    Pending,
    Confirmed,
    Submitting,
    Submitted,
    Finalized,
    Failed,
}

impl RelayStatus {
    pub const ALL: [RelayStatus; 6] = [
        RelayStatus::Pending,
        RelayStatus::Confirmed,
        RelayStatus::Submitting,
        RelayStatus::Submitted,
        RelayStatus::Finalized,
        RelayStatus::Failed,
    ];

    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayStatus::Pending => "pending",
            RelayStatus::Confirmed => "confirmed",
            RelayStatus::Submitting => "submitting",
            RelayStatus::Submitted => "submitted",
            RelayStatus::Finalized => "finalized",
            RelayStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RelayStatus::Finalized | RelayStatus::Failed)
    }
}

impl fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RelayStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RelayStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown relay status: {}", s))
    }
}

/// Mutable processing state attached 1:1 to an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRecord {
    pub event: BridgeEvent,
    pub direction: Direction,
    pub status: RelayStatus,
    pub destination_tx_hash: Option<B256>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub retry_after: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub needs_reconciliation: bool,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl RelayRecord {
    /// Fresh record for a newly observed event
    pub fn new(event: BridgeEvent, direction: Direction) -> Self {
        Self {
            event,
            direction,
            status: RelayStatus::Pending,
            destination_tx_hash: None,
            attempts: 0,
            last_error: None,
            retry_after: None,
            submitted_at: None,
            needs_reconciliation: false,
            finalized_at: None,
        }
    }

    pub fn id(&self) -> &EventId {
        &self.event.id
    }

    pub fn position(&self) -> (u64, u64) {
        self.event.position()
    }

    /// Apply a status transition and its metadata
    pub fn apply(&mut self, status: RelayStatus, update: &RecordUpdate) {
        self.status = status;
        if let Some(hash) = update.destination_tx_hash {
            self.destination_tx_hash = hash;
        }
        if let Some(attempts) = update.attempts {
            self.attempts = attempts;
        }
        if let Some(error) = &update.last_error {
            self.last_error = error.clone();
        }
        if let Some(retry_after) = update.retry_after {
            self.retry_after = retry_after;
        }
        if let Some(submitted_at) = update.submitted_at {
            self.submitted_at = submitted_at;
        }
        if status == RelayStatus::Finalized && self.finalized_at.is_none() {
            self.finalized_at = Some(Utc::now());
        }
    }
}

/// Metadata written alongside a status transition.
///
/// Outer `None` leaves the column untouched, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub destination_tx_hash: Option<Option<B256>>,
    pub attempts: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub retry_after: Option<Option<DateTime<Utc>>>,
    pub submitted_at: Option<Option<DateTime<Utc>>>,
}

impl RecordUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tx_hash(mut self, hash: Option<B256>) -> Self {
        self.destination_tx_hash = Some(hash);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    pub fn retry_after(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.retry_after = Some(at);
        self
    }

    pub fn submitted_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.submitted_at = Some(at);
        self
    }
}

/// Result of appending an event to the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Identity already recorded; nothing was written
    DuplicateEvent,
}

/// Result of reserving a correlation id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Caller owns the action; the record is now Submitting
    Granted,
    /// Another run already owns (or owned) this action
    AlreadyReserved,
    /// The record left Confirmed before the reservation could be taken
    Superseded,
}

impl Reservation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reservation::Granted => "granted",
            Reservation::AlreadyReserved => "already_reserved",
            Reservation::Superseded => "superseded",
        }
    }
}

// ============================================================================
// Destination calls
// ============================================================================

/// Maps wrapped tokens on the minter chain back to their originals on the
/// locker chain. Unmapped tokens map to themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenMap {
    wrapped_to_original: HashMap<Address, Address>,
}

impl TokenMap {
    pub fn new(pairs: impl IntoIterator<Item = (Address, Address)>) -> Self {
        Self {
            wrapped_to_original: pairs.into_iter().collect(),
        }
    }

    pub fn original_for(&self, wrapped: Address) -> Address {
        self.wrapped_to_original
            .get(&wrapped)
            .copied()
            .unwrap_or(wrapped)
    }

    pub fn len(&self) -> usize {
        self.wrapped_to_original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wrapped_to_original.is_empty()
    }
}

/// Call issued on the destination chain for a confirmed source event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationCall {
    Mint {
        asset: Asset,
        to: Address,
        amount: U256,
        correlation_id: CorrelationId,
    },
    Unlock {
        asset: Asset,
        to: Address,
        amount: U256,
        correlation_id: CorrelationId,
    },
}

impl DestinationCall {
    /// Build the destination call for an event relayed in `direction`
    pub fn for_event(event: &BridgeEvent, direction: Direction, tokens: &TokenMap) -> Self {
        match direction {
            Direction::LockMint => DestinationCall::Mint {
                asset: event.asset,
                to: event.actor,
                amount: event.amount,
                correlation_id: event.correlation_id,
            },
            Direction::BurnUnlock => {
                let asset = match event.asset {
                    Asset::Native => Asset::Native,
                    Asset::Token(wrapped) => Asset::Token(tokens.original_for(wrapped)),
                };
                DestinationCall::Unlock {
                    asset,
                    to: event.actor,
                    amount: event.amount,
                    correlation_id: event.correlation_id,
                }
            }
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        match self {
            DestinationCall::Mint { correlation_id, .. }
            | DestinationCall::Unlock { correlation_id, .. } => *correlation_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DestinationCall::Mint { .. } => "mint",
            DestinationCall::Unlock { .. } => "unlock",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(asset: Asset) -> BridgeEvent {
        BridgeEvent::new(
            EventId::new(43113, B256::repeat_byte(0xab), 0),
            1000,
            B256::repeat_byte(0x01),
            EventKind::Lock,
            asset,
            U256::from(100u64),
            Address::repeat_byte(0x22),
            B256::repeat_byte(0x33),
        )
    }

    #[test]
    fn test_status_as_str() {
        assert_eq!(RelayStatus::Pending.as_str(), "pending");
        assert_eq!(RelayStatus::Confirmed.as_str(), "confirmed");
        assert_eq!(RelayStatus::Submitting.as_str(), "submitting");
        assert_eq!(RelayStatus::Submitted.as_str(), "submitted");
        assert_eq!(RelayStatus::Finalized.as_str(), "finalized");
        assert_eq!(RelayStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn test_status_from_str() {
        for status in RelayStatus::ALL {
            assert_eq!(status.as_str().parse::<RelayStatus>().unwrap(), status);
        }
        assert!("reorged".parse::<RelayStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RelayStatus::Finalized.is_terminal());
        assert!(RelayStatus::Failed.is_terminal());
        assert!(!RelayStatus::Submitted.is_terminal());
    }

    #[test]
    fn test_direction_roles() {
        assert_eq!(Direction::LockMint.source_role(), ChainRole::Locker);
        assert_eq!(Direction::LockMint.destination_role(), ChainRole::Minter);
        assert_eq!(Direction::BurnUnlock.source_kind(), EventKind::Burn);
        assert_eq!(
            "burn_unlock".parse::<Direction>().unwrap(),
            Direction::BurnUnlock
        );
    }

    #[test]
    fn test_asset_db_form() {
        assert_eq!(Asset::Native.to_db(), None);
        assert_eq!(Asset::from_db(None).unwrap(), Asset::Native);

        let token = Asset::Token(Address::repeat_byte(0xde));
        let stored = token.to_db().unwrap();
        assert_eq!(stored, format!("0x{}", "de".repeat(20)));
        assert_eq!(Asset::from_db(Some(&stored)).unwrap(), token);
        assert!(Asset::from_db(Some("0x1234")).is_err());
    }

    #[test]
    fn test_event_correlation_matches_identity() {
        let event = sample_event(Asset::Native);
        assert_eq!(event.correlation_id, event.id.correlation_id());
        assert_eq!(event.position(), (1000, 0));
    }

    #[test]
    fn test_mint_call_for_lock() {
        let token = Address::repeat_byte(0x44);
        let event = sample_event(Asset::Token(token));
        let call = DestinationCall::for_event(&event, Direction::LockMint, &TokenMap::default());
        assert_eq!(
            call,
            DestinationCall::Mint {
                asset: Asset::Token(token),
                to: Address::repeat_byte(0x22),
                amount: U256::from(100u64),
                correlation_id: event.correlation_id,
            }
        );
        assert_eq!(call.name(), "mint");
    }

    #[test]
    fn test_unlock_call_maps_wrapped_token() {
        let wrapped = Address::repeat_byte(0x55);
        let original = Address::repeat_byte(0x66);
        let tokens = TokenMap::new([(wrapped, original)]);

        let event = sample_event(Asset::Token(wrapped));
        match DestinationCall::for_event(&event, Direction::BurnUnlock, &tokens) {
            DestinationCall::Unlock { asset, .. } => assert_eq!(asset, Asset::Token(original)),
            other => panic!("unexpected call {:?}", other),
        }

        let unmapped = sample_event(Asset::Token(original));
        match DestinationCall::for_event(&unmapped, Direction::BurnUnlock, &tokens) {
            DestinationCall::Unlock { asset, .. } => assert_eq!(asset, Asset::Token(original)),
            other => panic!("unexpected call {:?}", other),
        }
    }

    #[test]
    fn test_record_apply_update() {
        let mut record = RelayRecord::new(sample_event(Asset::Native), Direction::LockMint);
        let hash = B256::repeat_byte(0x77);

        record.apply(
            RelayStatus::Submitting,
            &RecordUpdate::new().attempts(1).tx_hash(Some(hash)).error("boom"),
        );
        assert_eq!(record.attempts, 1);
        assert_eq!(record.destination_tx_hash, Some(hash));
        assert_eq!(record.last_error.as_deref(), Some("boom"));

        record.apply(RelayStatus::Finalized, &RecordUpdate::new().clear_error());
        assert_eq!(record.last_error, None);
        assert_eq!(record.destination_tx_hash, Some(hash));
        assert!(record.finalized_at.is_some());
    }
}
