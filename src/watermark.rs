//! Watermark tracker
//!
//! Per (chain, direction) height up to which every event has been durably
//! appended. Restart resumes scanning at `watermark + 1`.

use tracing::debug;

use crate::db::{SharedStore, WatermarkStore};
use crate::error::RelayResult;
use crate::metrics;
use crate::types::Direction;

#[derive(Clone)]
pub struct WatermarkTracker {
    store: SharedStore,
    chain_id: u64,
    chain_name: String,
    direction: Direction,
    start_block: u64,
}

impl WatermarkTracker {
    pub fn new(
        store: SharedStore,
        chain_id: u64,
        chain_name: impl Into<String>,
        direction: Direction,
        start_block: u64,
    ) -> Self {
        Self {
            store,
            chain_id,
            chain_name: chain_name.into(),
            direction,
            start_block,
        }
    }

    pub async fn current(&self) -> RelayResult<Option<u64>> {
        self.store.watermark(self.chain_id, self.direction).await
    }

    /// First block the next scan pass covers
    pub async fn resume_point(&self) -> RelayResult<u64> {
        Ok(match self.current().await? {
            Some(block) => block.saturating_add(1).max(self.start_block),
            None => self.start_block,
        })
    }

    /// Advance to `block`. A lower value is an invariant violation and is
    /// returned as `NonMonotonicWatermark`.
    pub async fn advance(&self, block: u64) -> RelayResult<()> {
        self.store
            .advance_watermark(self.chain_id, self.direction, block)
            .await?;
        metrics::set_watermark(&self.chain_name, self.direction.as_str(), block);
        debug!(
            chain = %self.chain_name,
            direction = %self.direction,
            block,
            "Watermark advanced"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::db::MemoryRelayStore;
    use crate::error::RelayError;

    fn tracker(start_block: u64) -> WatermarkTracker {
        WatermarkTracker::new(
            Arc::new(MemoryRelayStore::new()),
            43113,
            "fuji",
            Direction::LockMint,
            start_block,
        )
    }

    #[tokio::test]
    async fn test_resume_from_start_block() {
        let tracker = tracker(500);
        assert_eq!(tracker.resume_point().await.unwrap(), 500);
        tracker.advance(700).await.unwrap();
        assert_eq!(tracker.resume_point().await.unwrap(), 701);
    }

    #[tokio::test]
    async fn test_rejects_lower_value() {
        let tracker = tracker(0);
        tracker.advance(10).await.unwrap();
        tracker.advance(10).await.unwrap();
        let err = tracker.advance(9).await.unwrap_err();
        assert!(matches!(err, RelayError::NonMonotonicWatermark { .. }));
        assert!(err.is_fatal());
        assert_eq!(tracker.current().await.unwrap(), Some(10));
    }
}
