//! In-process store backed by DashMap.
//!
//! Used for single-instance deployments (`redis.url = "memory://"`) and in
//! tests. It can hold pre-decoded and unsupported values so the codec and
//! corruption paths can be exercised without a real backend, and it can be
//! switched into an unreachable state to exercise the fail-open paths.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tideway_core::{Error, Result};

use crate::codec::{RawValue, canonical_string};
use crate::store::RemoteStore;

/// A stored entry with optional TTL.
#[derive(Clone, Debug)]
struct MemoryEntry {
    value: RawValue,
    stored_at: Instant,
    ttl: Option<Duration>,
}

impl MemoryEntry {
    fn new(value: RawValue, ttl: Option<Duration>) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.ttl
            .map(|ttl| self.stored_at.elapsed() >= ttl)
            .unwrap_or(false)
    }

    /// Text the entry would compare as in a compare-and-swap.
    fn comparable_text(&self) -> Option<String> {
        match &self.value {
            RawValue::Text(text) => Some(text.clone()),
            RawValue::Structured(value) => Some(canonical_string(value)),
            RawValue::Nil | RawValue::Unsupported(_) => None,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, MemoryEntry>>,
    unreachable: Arc<AtomicBool>,
    calls: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value exactly as a backend would return it.
    pub fn insert_raw(&self, key: &str, value: RawValue) {
        self.entries
            .insert(key.to_string(), MemoryEntry::new(value, None));
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false)
    }

    /// Stored text of a live key, structured values rendered canonically.
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .and_then(|entry| entry.comparable_text())
    }

    /// Remaining TTL of a live key, if it has one.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let entry = self.entries.get(key)?;
        let ttl = entry.ttl?;
        ttl.checked_sub(entry.stored_at.elapsed())
    }

    /// Simulate a network partition.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Number of operations attempted against this store.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn guard(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::unreachable("memory", "simulated outage"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<RawValue> {
        self.guard()?;
        let value = self
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone());
        match value {
            Some(value) => Ok(value),
            None => {
                // Drop an expired entry lazily.
                self.entries.remove_if(key, |_, entry| entry.is_expired());
                Ok(RawValue::Nil)
            }
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.guard()?;
        self.entries.insert(
            key.to_string(),
            MemoryEntry::new(RawValue::Text(value.to_string()), ttl),
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.guard()?;
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(MemoryEntry::new(RawValue::Text(value.to_string()), ttl));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(MemoryEntry::new(RawValue::Text(value.to_string()), ttl));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.guard()?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        self.guard()?;
        let replacement = MemoryEntry::new(RawValue::Text(value.to_string()), Some(ttl));
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = if occupied.get().is_expired() {
                    None
                } else {
                    Some(occupied.get().comparable_text())
                };
                let matches = match (current, expected) {
                    (None, None) => true,
                    (Some(Some(current)), Some(expected)) => current == expected,
                    _ => false,
                };
                if matches {
                    occupied.insert(replacement);
                }
                Ok(matches)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(replacement);
                Ok(true)
            }
        }
    }

    async fn ping(&self) -> Result<()> {
        self.guard()
    }
}
