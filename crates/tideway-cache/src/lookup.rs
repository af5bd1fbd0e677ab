//! JSON-object lookup cache with self-healing reads.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tideway_core::{CacheKey, Error};
use tracing::warn;

use crate::codec;
use crate::guard::{CorruptionGuard, ExpectedShape, Validated};
use crate::store::SharedStore;

/// Caches serializable records as JSON objects.
///
/// Reads never fail: a missing, malformed or unreachable entry is a miss.
#[derive(Clone)]
pub struct LookupCache {
    guard: CorruptionGuard,
}

impl LookupCache {
    pub fn new(store: SharedStore) -> Self {
        Self {
            guard: CorruptionGuard::new(store),
        }
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
        required: &'static [&'static str],
    ) -> Option<T> {
        let shape = ExpectedShape::Object { required };
        let read = match self.guard.load(key.as_str(), shape).await {
            Ok(read) => read,
            Err(err) => {
                warn!(key = %key, error = %err, "lookup cache unavailable, treating as miss");
                return None;
            }
        };
        let Validated::Valid(value) = read.value else {
            return None;
        };
        match serde_json::from_value(value) {
            Ok(record) => Some(record),
            Err(e) => {
                let err = Error::corrupted(key.as_str(), shape.describe(), e.to_string());
                self.guard.reset(key.as_str(), shape, &err).await;
                None
            }
        }
    }

    /// Store a record. Returns whether the write reached the store.
    pub async fn put<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> bool {
        let encoded = match codec::encode(value) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(key = %key, error = %err, "failed to encode lookup cache entry");
                return false;
            }
        };
        match self.guard.store().set(key.as_str(), &encoded, Some(ttl)).await {
            Ok(()) => true,
            Err(err) => {
                warn!(key = %key, error = %err, "lookup cache write failed");
                false
            }
        }
    }

    pub async fn invalidate(&self, key: &CacheKey) {
        if let Err(err) = self.guard.store().delete(key.as_str()).await {
            warn!(key = %key, error = %err, "lookup cache invalidation failed");
        }
    }
}
