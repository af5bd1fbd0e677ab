//! The remote store seam.
//!
//! The store is the only shared mutable resource between process instances,
//! so every coordination primitive the layer needs is expressed here rather
//! than through local locks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tideway_core::Result;

use crate::codec::RawValue;

/// Key/value operations the resilience layer consumes.
///
/// Implementations apply their own bounded timeout to every call and report
/// timeouts and connection failures as `Error::BackendUnreachable`.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short backend name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<RawValue>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Store `value` only if `key` is absent. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically replace the value of `key` if its current (normalized) text
    /// equals `expected`; `None` means the key must be absent. Returns whether
    /// the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Lightweight liveness check.
    async fn ping(&self) -> Result<()>;
}

pub type SharedStore = Arc<dyn RemoteStore>;
