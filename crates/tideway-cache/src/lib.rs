//! Resilient cache layer.
//!
//! Everything here talks to a [`RemoteStore`]: Redis in production, the
//! in-process [`MemoryStore`] for single-instance deployments and tests.
//! Reads go through the codec and the corruption guard, so a malformed
//! entry costs a cache miss and never an error.

pub mod codec;
pub mod guard;
pub mod lookup;
pub mod memory;
pub mod policy;
pub mod rate_limit;
pub mod redis_store;
pub mod store;

pub use codec::{CachedValue, RawValue};
pub use guard::{CorruptionGuard, ExpectedShape, GuardedRead, Validated};
pub use lookup::LookupCache;
pub use memory::MemoryStore;
pub use policy::{
    PolicyDecision, RateLimitPolicy, RateLimitScope, RequestIdentity, ScopeOutcome, ScopeSubject,
    default_booking_scopes,
};
pub use rate_limit::{LimiterSettings, RateLimitDecision, SlidingWindowLimiter};
pub use redis_store::RedisStore;
pub use store::{RemoteStore, SharedStore};
