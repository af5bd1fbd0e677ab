//! Completed-cycle markers.
//!
//! A push scheduler may deliver the same cycle more than once, and two
//! instances may both receive it. A marker written after a successful run
//! lets later deliveries of that cycle be skipped.

use std::time::Duration;

use tideway_cache::{CorruptionGuard, ExpectedShape, SharedStore, Validated};
use tideway_core::{KeyBuilder, Result, unix_millis};
use time::OffsetDateTime;

const CYCLE_RESOURCE: &str = "job-cycle";
pub const CYCLE_MARKER_TTL: Duration = Duration::from_secs(48 * 3600);

#[derive(Clone)]
pub struct CycleGuard {
    guard: CorruptionGuard,
    keys: KeyBuilder,
}

impl CycleGuard {
    pub fn new(store: SharedStore, keys: KeyBuilder) -> Self {
        Self {
            guard: CorruptionGuard::new(store),
            keys,
        }
    }

    /// Whether `cycle` of `job_id` already completed somewhere.
    pub async fn is_complete(&self, job_id: &str, cycle: OffsetDateTime) -> Result<bool> {
        let key = self.marker_key(job_id, cycle)?;
        let read = self.guard.load(&key, ExpectedShape::Scalar).await?;
        Ok(matches!(read.value, Validated::Valid(_)))
    }

    /// Record completion. Returns `false` if another run got there first.
    pub async fn mark_complete(
        &self,
        job_id: &str,
        cycle: OffsetDateTime,
        finished_at: OffsetDateTime,
    ) -> Result<bool> {
        let key = self.marker_key(job_id, cycle)?;
        self.guard
            .store()
            .set_if_absent(
                &key,
                &unix_millis(finished_at).to_string(),
                Some(CYCLE_MARKER_TTL),
            )
            .await
    }

    fn marker_key(&self, job_id: &str, cycle: OffsetDateTime) -> Result<String> {
        let cycle_millis = unix_millis(cycle).to_string();
        let key = self
            .keys
            .build_composite(CYCLE_RESOURCE, &[job_id, &cycle_millis])?;
        Ok(key.as_str().to_string())
    }
}
