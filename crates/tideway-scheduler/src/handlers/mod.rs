//! Built-in job handlers.

pub mod digest;
pub mod heartbeat;
pub mod http_task;

use std::sync::Arc;

use tideway_cache::SharedStore;
use tideway_core::KeyBuilder;
use tideway_notifications::Notifier;

use crate::catalog::JobCatalog;
use crate::handler::{HandlerError, HandlerRegistry, JobHandler};
use crate::types::JobAction;

pub use digest::NotificationDigestHandler;
pub use heartbeat::{HeartbeatHandler, HeartbeatReader};
pub use http_task::{HttpTaskHandler, IDEMPOTENCY_HEADER};

/// What the built-in handlers need from the outside.
pub struct HandlerDeps {
    pub store: SharedStore,
    pub keys: KeyBuilder,
    pub notifier: Arc<dyn Notifier>,
    pub digest_recipient: String,
    pub digest_locale: String,
    pub task_base_url: Option<String>,
    pub task_timeout: std::time::Duration,
}

/// Register the handler matching each catalog job's action.
pub fn builtin_registry(catalog: &JobCatalog, deps: HandlerDeps) -> Result<HandlerRegistry, HandlerError> {
    let heartbeat: Arc<dyn JobHandler> = Arc::new(HeartbeatHandler::new(deps.store.clone(), deps.keys));
    let digest: Arc<dyn JobHandler> = Arc::new(NotificationDigestHandler::new(
        deps.notifier.clone(),
        deps.digest_recipient.clone(),
        deps.digest_locale.clone(),
    ));
    let http: Arc<dyn JobHandler> = Arc::new(HttpTaskHandler::new(
        deps.task_base_url.clone(),
        deps.task_timeout,
    )?);

    let mut registry = HandlerRegistry::new();
    for job in catalog.jobs() {
        let handler = match job.definition.action {
            JobAction::Heartbeat => heartbeat.clone(),
            JobAction::NotificationDigest => digest.clone(),
            JobAction::HttpTask => http.clone(),
        };
        registry.register(job.id(), handler);
    }
    Ok(registry)
}
