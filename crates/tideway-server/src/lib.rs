pub mod config;
pub mod diagnostics;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;
pub mod services;

pub use config::{
    AppConfig, CacheConfig, ConfigError, DiagnosticsConfig, NotificationsConfig, RedisConfig,
    SchedulerConfig, ServerConfig,
};
pub use diagnostics::{
    ComponentStatus, DiagnosticsAggregator, DiagnosticsReport, HealthReport, OverallStatus, Probe,
    ProbeReport,
};
pub use observability::init_tracing;
pub use server::{AppState, ServerBuilder, TidewayServer, build_app};
pub use services::{Services, StartupError};
