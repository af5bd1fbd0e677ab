//! Builds the long-lived collaborators from configuration.

use std::sync::Arc;

use thiserror::Error;
use tideway_cache::{MemoryStore, RedisStore, SharedStore};
use tideway_core::{Clock, KeyBuilder, SystemClock};
use tideway_notifications::{LogNotifier, NotificationError, Notifier, WebhookNotifier};
use tideway_scheduler::{
    HandlerDeps, HandlerError, HttpPushScheduler, JobBackend, JobCatalog, JobRunner,
    PushScheduler, SchedulerError, builtin_registry,
};
use tracing::{info, warn};

use crate::config::{AppConfig, MEMORY_STORE_URL, RedisConfig};

/// Digest recipient used when no notification collaborator is configured.
const LOG_ONLY_RECIPIENT: &str = "operations";

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Core(#[from] tideway_core::Error),

    #[error("scheduler: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("job handlers: {0}")]
    Handlers(#[from] HandlerError),

    #[error("notifications: {0}")]
    Notifications(#[from] NotificationError),
}

/// Everything request handlers and background tasks share.
pub struct Services {
    pub config: Arc<AppConfig>,
    pub store: SharedStore,
    pub keys: KeyBuilder,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn Notifier>,
    /// Absent when `scheduler.secondary` is not configured.
    pub push: Option<Arc<dyn PushScheduler>>,
    pub catalog: Arc<JobCatalog>,
    pub runner: Arc<JobRunner>,
}

impl Services {
    pub fn from_config(config: AppConfig) -> Result<Self, StartupError> {
        let store = connect_store(&config.redis)?;
        let notifier = build_notifier(&config)?;
        let push = build_push_scheduler(&config)?;
        Self::assemble(config, store, Arc::new(SystemClock), notifier, push)
    }

    /// Wire the scheduler around already constructed collaborators.
    pub fn assemble(
        config: AppConfig,
        store: SharedStore,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        push: Option<Arc<dyn PushScheduler>>,
    ) -> Result<Self, StartupError> {
        let keys = KeyBuilder::new(config.environment);
        let catalog = Arc::new(build_catalog(&config)?);

        let (digest_recipient, digest_locale) = match &config.notifications {
            Some(n) => (n.digest_recipient.clone(), n.locale.clone()),
            None => (LOG_ONLY_RECIPIENT.to_string(), "en".to_string()),
        };
        let handlers = builtin_registry(
            &catalog,
            HandlerDeps {
                store: store.clone(),
                keys,
                notifier: notifier.clone(),
                digest_recipient,
                digest_locale,
                task_base_url: config.scheduler.task_base_url.clone(),
                task_timeout: config.scheduler.task_timeout(),
            },
        )?;
        let runner = Arc::new(JobRunner::new(
            catalog.clone(),
            handlers,
            store.clone(),
            keys,
            config.scheduler.retry.clone(),
            clock.clone(),
        )?);

        if push.is_none() {
            let idle: Vec<&str> = catalog
                .on_backend(JobBackend::Secondary)
                .map(|job| job.id())
                .collect();
            if !idle.is_empty() {
                warn!(
                    jobs = %idle.join(", "),
                    "scheduler.secondary not configured; these jobs will not fire"
                );
            }
        }

        info!(
            environment = %config.environment,
            store = store.name(),
            notifier = notifier.name(),
            jobs = catalog.jobs().len(),
            "services assembled"
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            keys,
            clock,
            notifier,
            push,
            catalog,
            runner,
        })
    }
}

/// `memory://` selects the in-process store, anything else is Redis.
pub fn connect_store(config: &RedisConfig) -> Result<SharedStore, StartupError> {
    let url = config.url.as_deref().unwrap_or(MEMORY_STORE_URL).trim();
    if url == MEMORY_STORE_URL {
        warn!("using in-process store; rate limits and job bookkeeping are not shared between instances");
        return Ok(Arc::new(MemoryStore::new()));
    }
    info!(pool_size = config.pool_size, timeout_ms = config.timeout_ms, "Connecting to Redis");
    let store = RedisStore::connect(url, config.pool_size, config.timeout())?;
    Ok(Arc::new(store))
}

/// The configured job table, or the built-in one.
pub fn build_catalog(config: &AppConfig) -> Result<JobCatalog, SchedulerError> {
    match &config.scheduler.jobs {
        Some(definitions) => JobCatalog::new(definitions.clone()),
        None => JobCatalog::builtin(),
    }
}

fn build_notifier(config: &AppConfig) -> Result<Arc<dyn Notifier>, NotificationError> {
    match &config.notifications {
        Some(notifications) => Ok(Arc::new(WebhookNotifier::new(notifications.webhook.clone())?)),
        None => {
            warn!("notifications not configured; notifications will only be logged");
            Ok(Arc::new(LogNotifier))
        }
    }
}

fn build_push_scheduler(config: &AppConfig) -> Result<Option<Arc<dyn PushScheduler>>, SchedulerError> {
    match &config.scheduler.secondary {
        Some(secondary) => Ok(Some(Arc::new(HttpPushScheduler::new(secondary)?))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tideway_scheduler::{HEARTBEAT_JOB, JobAction, JobDefinition, JobPriority};

    fn memory_config() -> AppConfig {
        AppConfig {
            redis: RedisConfig {
                url: Some(MEMORY_STORE_URL.into()),
                ..RedisConfig::default()
            },
            ..AppConfig::default()
        }
    }

    #[test]
    fn memory_url_builds_everything() {
        let services = Services::from_config(memory_config()).unwrap();
        assert_eq!(services.store.name(), "memory");
        assert_eq!(services.notifier.name(), "log");
        assert!(services.push.is_none());
        assert_eq!(services.catalog.critical().id(), HEARTBEAT_JOB);
    }

    #[test]
    fn configured_jobs_replace_builtins() {
        let mut config = memory_config();
        config.scheduler.jobs = Some(vec![JobDefinition::new(
            HEARTBEAT_JOB,
            "* * * * *",
            JobPriority::Critical,
            JobBackend::Primary,
            JobAction::Heartbeat,
        )]);
        let catalog = build_catalog(&config).unwrap();
        assert_eq!(catalog.jobs().len(), 1);
    }

    #[test]
    fn catalog_without_heartbeat_is_rejected() {
        let mut config = memory_config();
        config.scheduler.jobs = Some(vec![JobDefinition::new(
            "calendar-sync",
            "*/30 * * * *",
            JobPriority::Medium,
            JobBackend::Secondary,
            JobAction::HttpTask,
        )]);
        assert!(matches!(
            Services::from_config(config),
            Err(StartupError::Scheduler(_))
        ));
    }
}
