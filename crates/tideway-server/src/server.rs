use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tideway_cache::{RateLimitPolicy, SlidingWindowLimiter};
use tideway_scheduler::{HeartbeatReader, PrimaryScheduler};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::diagnostics::{
    CacheProbe, DiagnosticsAggregator, JobsProbe, NotificationsProbe, PrimarySchedulerProbe,
    PrimarySlot, SecondarySchedulerProbe,
};
use crate::services::{Services, StartupError};
use crate::{config::AppConfig, handlers, middleware as app_middleware};

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub policy: RateLimitPolicy,
    pub diagnostics: Arc<DiagnosticsAggregator>,
    pub primary: PrimarySlot,
}

impl AppState {
    pub fn new(services: Arc<Services>) -> Result<Self, StartupError> {
        let config = services.config.clone();
        let limiter = SlidingWindowLimiter::with_clock(
            services.store.clone(),
            services.clock.clone(),
            config.limiter_settings(),
        );
        let policy = RateLimitPolicy::new(limiter, services.keys, config.rate_limit.scopes.clone())?;

        let primary = PrimarySlot::default();
        let diagnostics = DiagnosticsAggregator::new(&config.diagnostics, services.clock.clone())
            .with(Arc::new(CacheProbe::new(services.store.clone())))
            .with(Arc::new(PrimarySchedulerProbe::new(
                HeartbeatReader::new(services.store.clone(), services.keys),
                services.catalog.critical().cadence.clone(),
                services.clock.clone(),
                primary.clone(),
            )))
            .with(Arc::new(SecondarySchedulerProbe::new(services.push.clone())))
            .with(Arc::new(JobsProbe::new(
                services.runner.clone(),
                config.diagnostics.job_failure_window(),
            )))
            .with(Arc::new(NotificationsProbe::new(services.notifier.clone())));

        Ok(Self {
            services,
            policy,
            diagnostics: Arc::new(diagnostics),
            primary,
        })
    }
}

pub fn build_app(state: AppState) -> Router {
    let body_limit = state.services.config.server.body_limit_bytes;

    let bookings = Router::new()
        .route("/api/bookings", post(handlers::create_booking))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::booking_rate_limit,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/api/diagnostics", get(handlers::diagnostics))
        .route("/api/jobs/{id}", post(handlers::job_callback))
        .merge(bookings)
        .with_state(state)
        // Middleware stack, innermost first: metrics -> cors -> trace -> request id -> body limit.
        // The request id wraps the trace layer so the span can carry it.
        .layer(middleware::from_fn(app_middleware::http_metrics))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let req_id = span_request_id(req);
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = tracing::field::Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

/// Request id for the trace span: the one `request_id` stored, else the raw header.
fn span_request_id<B>(req: &axum::http::Request<B>) -> String {
    req.extensions()
        .get::<axum::http::HeaderValue>()
        .or_else(|| req.headers().get(app_middleware::REQUEST_ID_HEADER))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    services: Option<Services>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            services: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Use pre-built services instead of building them from the config.
    pub fn with_services(mut self, services: Services) -> Self {
        self.addr = services.config.addr();
        self.services = Some(services);
        self
    }

    pub fn build(self) -> Result<TidewayServer, StartupError> {
        let services = match self.services {
            Some(services) => services,
            None => Services::from_config(self.config)?,
        };
        let state = AppState::new(Arc::new(services))?;
        Ok(TidewayServer {
            addr: self.addr,
            app: build_app(state.clone()),
            state,
        })
    }
}

pub struct TidewayServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
}

impl TidewayServer {
    pub fn router(&self) -> Router {
        self.app.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Start the primary scheduler loop. Idempotent.
    pub fn start_primary(&self) {
        let mut slot = self.state.primary.lock();
        if slot.is_some() {
            return;
        }
        let scheduler = PrimaryScheduler::new(
            self.state.services.runner.clone(),
            self.state.services.config.scheduler.primary_check_interval(),
        );
        *slot = Some(scheduler.start());
    }

    pub async fn stop_primary(&self) {
        let handle = self.state.primary.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        self.start_primary();

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(
            listener,
            self.app
                .clone()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        self.stop_primary().await;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};

    #[test]
    fn span_uses_the_stored_request_id() {
        let mut req = Request::builder()
            .uri("/healthz")
            .header("x-request-id", "from-client")
            .body(Body::empty())
            .unwrap();
        assert_eq!(span_request_id(&req), "from-client");

        req.extensions_mut().insert(HeaderValue::from_static("generated-1"));
        assert_eq!(span_request_id(&req), "generated-1");

        let bare = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        assert_eq!(span_request_id(&bare), "");
    }
}
