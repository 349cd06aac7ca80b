//! Action deduplicator
//!
//! Maps a source event identity to at most one destination action. The
//! reservation itself lives in the store; this wrapper names the owning
//! instance and reports outcomes.

use tracing::{debug, info, warn};

use crate::db::{ReservationStore, SharedStore};
use crate::error::RelayResult;
use crate::metrics;
use crate::types::{CorrelationId, RelayRecord, Reservation};

#[derive(Clone)]
pub struct Deduplicator {
    store: SharedStore,
    instance_id: String,
}

impl Deduplicator {
    pub fn new(store: SharedStore, instance_id: impl Into<String>) -> Self {
        Self {
            store,
            instance_id: instance_id.into(),
        }
    }

    /// Reserve the destination action for a Confirmed record. `Granted`
    /// moves the record to Submitting in the same atomic step.
    pub async fn reserve(&self, record: &RelayRecord) -> RelayResult<Reservation> {
        let outcome = self
            .store
            .reserve(&record.event.correlation_id, record.id(), &self.instance_id)
            .await?;

        metrics::record_reservation(record.direction.as_str(), outcome.as_str());
        match outcome {
            Reservation::Granted => debug!(
                event = %record.id(),
                correlation_id = %record.event.correlation_id,
                "Reservation granted"
            ),
            Reservation::AlreadyReserved => info!(
                event = %record.id(),
                correlation_id = %record.event.correlation_id,
                "Action already reserved by an earlier run"
            ),
            Reservation::Superseded => debug!(
                event = %record.id(),
                "Record left Confirmed before it could be reserved"
            ),
        }
        Ok(outcome)
    }

    /// Drop a reservation so a replayed or withdrawn record can be reserved again
    pub async fn release(&self, correlation_id: &CorrelationId) -> RelayResult<bool> {
        let released = self.store.release(correlation_id).await?;
        if released {
            warn!(correlation_id = %correlation_id, "Reservation released");
        }
        Ok(released)
    }
}
