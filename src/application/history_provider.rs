// Port for fetching historical samples
use crate::domain::error::FetchError;
use crate::domain::telemetry::Sample;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Samples for `entity_id` in `[start, end]`, ascending by timestamp.
    ///
    /// When `expect_incremental` is false the caller holds no history yet, and
    /// providers should also return the last sample before `start` so the
    /// graph has a left edge.
    async fn fetch_history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        expect_incremental: bool,
    ) -> Result<Vec<Sample>, FetchError>;
}
