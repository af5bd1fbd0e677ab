//! Recent scheduler events surfaced through diagnostics.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

const DEFAULT_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A firing used up its retries.
    RetryExhausted,
    /// A firing failed with a non-retryable error.
    PermanentFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerEvent {
    pub job_id: String,
    pub kind: EventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub attempts: u32,
    pub message: String,
}

/// Bounded in-memory ring of events, newest last.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<VecDeque<SchedulerEvent>>>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, event: SchedulerEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Events no older than `within` relative to `now`.
    pub fn recent(&self, now: OffsetDateTime, within: Duration) -> Vec<SchedulerEvent> {
        let cutoff = now - within;
        self.events
            .lock()
            .iter()
            .filter(|event| event.at >= cutoff)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
