//! Last-run bookkeeping, local and shared.
//!
//! Every instance keeps its own view and mirrors it into the shared cache
//! under `job-status:{env}:{job}` so any instance can answer diagnostics
//! for a job another instance ran.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tideway_cache::{LookupCache, SharedStore};
use tideway_core::KeyBuilder;
use tracing::warn;

use crate::types::RunStatus;

const STATUS_RESOURCE: &str = "job-status";
const STATUS_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const STATUS_FIELDS: &[&str] = &["job_id", "status"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub job_id: String,
    pub status: RunStatus,
    pub attempts: u32,
    pub cycle_millis: i64,
    pub finished_at_millis: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatusRecord {
    pub fn unknown(job_id: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            status: RunStatus::Unknown,
            attempts: 0,
            cycle_millis: 0,
            finished_at_millis: 0,
            error: None,
        }
    }
}

#[derive(Clone)]
pub struct JobStatusStore {
    local: Arc<RwLock<HashMap<String, JobStatusRecord>>>,
    shared: LookupCache,
    keys: KeyBuilder,
}

impl JobStatusStore {
    pub fn new(store: SharedStore, keys: KeyBuilder) -> Self {
        Self {
            local: Arc::new(RwLock::new(HashMap::new())),
            shared: LookupCache::new(store),
            keys,
        }
    }

    pub async fn record(&self, record: JobStatusRecord) {
        self.local
            .write()
            .insert(record.job_id.clone(), record.clone());

        match self.keys.build(STATUS_RESOURCE, &record.job_id) {
            Ok(key) => {
                self.shared.put(&key, &record, STATUS_TTL).await;
            }
            Err(e) => warn!(job_id = %record.job_id, error = %e, "cannot build job status key"),
        }
    }

    /// Most recent record for `job_id`: this instance's view first, then the
    /// shared cache, else `unknown`.
    pub async fn last(&self, job_id: &str) -> JobStatusRecord {
        if let Some(record) = self.local.read().get(job_id).cloned() {
            return record;
        }
        let Ok(key) = self.keys.build(STATUS_RESOURCE, job_id) else {
            return JobStatusRecord::unknown(job_id);
        };
        self.shared
            .get::<JobStatusRecord>(&key, STATUS_FIELDS)
            .await
            .unwrap_or_else(|| JobStatusRecord::unknown(job_id))
    }

    pub fn local_snapshot(&self) -> Vec<JobStatusRecord> {
        let mut records: Vec<_> = self.local.read().values().cloned().collect();
        records.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        records
    }
}
