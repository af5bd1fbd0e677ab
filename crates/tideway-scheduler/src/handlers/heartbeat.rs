use std::time::Duration;

use async_trait::async_trait;
use tideway_cache::{CorruptionGuard, ExpectedShape, SharedStore, Validated};
use tideway_core::{CacheKey, KeyBuilder, Result, from_unix_millis};
use time::OffsetDateTime;
use tracing::debug;

use crate::handler::{HandlerError, JobContext, JobHandler};

const HEARTBEAT_RESOURCE: &str = "heartbeat";
const HEARTBEAT_TTL: Duration = Duration::from_secs(24 * 3600);

fn heartbeat_key(keys: &KeyBuilder) -> Result<CacheKey> {
    keys.build(HEARTBEAT_RESOURCE, "primary")
}

/// Records that the primary backend is alive.
pub struct HeartbeatHandler {
    store: SharedStore,
    keys: KeyBuilder,
}

impl HeartbeatHandler {
    pub fn new(store: SharedStore, keys: KeyBuilder) -> Self {
        Self { store, keys }
    }
}

#[async_trait]
impl JobHandler for HeartbeatHandler {
    async fn run(&self, ctx: &JobContext) -> std::result::Result<(), HandlerError> {
        let key = heartbeat_key(&self.keys).map_err(|e| HandlerError::Permanent(e.to_string()))?;
        self.store
            .set(
                key.as_str(),
                &ctx.cycle_millis().to_string(),
                Some(HEARTBEAT_TTL),
            )
            .await
            .map_err(|e| HandlerError::Transient(e.to_string()))?;
        debug!(key = %key, cycle = ctx.cycle_millis(), "heartbeat recorded");
        Ok(())
    }
}

/// Reads back the last recorded heartbeat.
#[derive(Clone)]
pub struct HeartbeatReader {
    guard: CorruptionGuard,
    keys: KeyBuilder,
}

impl HeartbeatReader {
    pub fn new(store: SharedStore, keys: KeyBuilder) -> Self {
        Self {
            guard: CorruptionGuard::new(store),
            keys,
        }
    }

    /// Cycle time of the last heartbeat, `None` if none (or a corrupted one)
    /// is stored.
    pub async fn last(&self) -> Result<Option<OffsetDateTime>> {
        let key = heartbeat_key(&self.keys)?;
        let read = self.guard.load(key.as_str(), ExpectedShape::Scalar).await?;
        let Validated::Valid(value) = read.value else {
            return Ok(None);
        };
        let millis = value
            .as_i64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()));
        Ok(millis.map(from_unix_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tideway_cache::{MemoryStore, RawValue};
    use tideway_core::Environment;
    use time::macros::datetime;

    fn ctx(cycle: OffsetDateTime) -> JobContext {
        JobContext {
            job_id: "heartbeat".into(),
            cycle,
            attempt: 1,
            target: None,
        }
    }

    #[tokio::test]
    async fn writes_and_reads_back_cycle() {
        let store = MemoryStore::new();
        let keys = KeyBuilder::new(Environment::Staging);
        let handler = HeartbeatHandler::new(Arc::new(store.clone()), keys);
        let reader = HeartbeatReader::new(Arc::new(store.clone()), keys);
        let cycle = datetime!(2025-08-10 10:30:00 UTC);

        assert_eq!(reader.last().await.unwrap(), None);
        handler.run(&ctx(cycle)).await.unwrap();
        assert_eq!(
            store.get_text("heartbeat:staging:primary").as_deref(),
            Some("1754821800000")
        );
        assert_eq!(reader.last().await.unwrap(), Some(cycle));
    }

    #[tokio::test]
    async fn store_outage_is_transient() {
        let store = MemoryStore::new();
        store.set_unreachable(true);
        let handler = HeartbeatHandler::new(Arc::new(store), KeyBuilder::new(Environment::Dev));
        let err = handler
            .run(&ctx(datetime!(2025-08-10 10:30:00 UTC)))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn corrupted_heartbeat_reads_as_none() {
        let store = MemoryStore::new();
        store.insert_raw("heartbeat:dev:primary", RawValue::Text("[1,2,3]".into()));
        let reader = HeartbeatReader::new(Arc::new(store.clone()), KeyBuilder::new(Environment::Dev));
        assert_eq!(reader.last().await.unwrap(), None);
        assert!(!store.contains_key("heartbeat:dev:primary"));
    }
}
