use serde::Deserialize;
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use thiserror::Error;
use tideway_cache::{LimiterSettings, RateLimitScope, default_booking_scopes};
use tideway_core::Environment;
use tideway_notifications::WebhookConfig;
use tideway_scheduler::{JobDefinition, RetryConfig, SecondaryConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(String),

    #[error("config deserialize error: {0}")]
    Deserialize(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    /// Namespace for every shared cache key
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Notification collaborator; absent means notifications are only logged
    #[serde(default)]
    pub notifications: Option<NotificationsConfig>,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        // Redis validations
        match self.redis.url.as_deref().map(str::trim) {
            None | Some("") => return Err("redis.url is required".into()),
            Some(url) if url != MEMORY_STORE_URL && !url.starts_with("redis") => {
                return Err(format!(
                    "redis.url must be a redis:// or rediss:// URL or '{MEMORY_STORE_URL}'"
                ));
            }
            Some(_) => {}
        }
        if self.redis.pool_size == 0 {
            return Err("redis.pool_size must be > 0".into());
        }
        if self.redis.timeout_ms == 0 {
            return Err("redis.timeout_ms must be > 0".into());
        }
        if self.cache.max_swap_attempts == 0 {
            return Err("cache.max_swap_attempts must be > 0".into());
        }
        // Rate limit validations
        for scope in &self.rate_limit.scopes {
            if scope.window_secs == 0 {
                return Err(format!(
                    "rate_limit scope '{}' must have window_secs > 0",
                    scope.name
                ));
            }
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Scheduler validations
        if self.scheduler.primary_check_interval_ms == 0 {
            return Err("scheduler.primary_check_interval_ms must be > 0".into());
        }
        if self.scheduler.retry.attempt_timeout_ms == 0 {
            return Err("scheduler.retry.attempt_timeout_ms must be > 0".into());
        }
        if self.scheduler.retry.base_backoff_ms > self.scheduler.retry.max_backoff_ms {
            return Err("scheduler.retry.base_backoff_ms must be <= max_backoff_ms".into());
        }
        if let Some(secondary) = &self.scheduler.secondary {
            secondary.validate()?;
        }
        // Notifications validation
        if let Some(notifications) = &self.notifications {
            if notifications.webhook.url.trim().is_empty() {
                return Err("notifications.webhook.url must not be empty".into());
            }
            if notifications.digest_recipient.trim().is_empty() {
                return Err("notifications.digest_recipient must not be empty".into());
            }
        }
        // Diagnostics validation
        if self.diagnostics.probe_timeout_ms == 0 {
            return Err("diagnostics.probe_timeout_ms must be > 0".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let ip = self
            .server
            .host
            .parse()
            .unwrap_or(std::net::IpAddr::from([0, 0, 0, 0]));
        SocketAddr::new(ip, self.server.port)
    }

    pub fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            fail_open: self.cache.fail_open,
            max_swap_attempts: self.cache.max_swap_attempts,
        }
    }
}

/// `redis.url` value selecting the non-shared in-process store.
pub const MEMORY_STORE_URL: &str = "memory://";

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_body_limit() -> usize {
    64 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Required. `memory://` runs without a shared store.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Bound for every store call, and for pool wait/create/recycle
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: default_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Allow rate-limited requests through while the store is unreachable
    #[serde(default = "default_true")]
    pub fail_open: bool,
    #[serde(default = "default_max_swap_attempts")]
    pub max_swap_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fail_open: true,
            max_swap_attempts: default_max_swap_attempts(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_swap_attempts() -> u32 {
    LimiterSettings::default().max_swap_attempts
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Scopes checked in order for every booking request
    #[serde(default = "default_booking_scopes")]
    pub scopes: Vec<RateLimitScope>,
    /// Peers allowed to assert `X-User-Id` and `X-Forwarded-For`. Requests
    /// from anyone else are identified by their peer address only.
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl RateLimitConfig {
    pub fn trusts(&self, peer: IpAddr) -> bool {
        self.trusted_proxies.contains(&peer)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            scopes: default_booking_scopes(),
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// How often the primary loop looks for due jobs
    #[serde(default = "default_check_interval_ms")]
    pub primary_check_interval_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Replaces the built-in job table when set
    #[serde(default)]
    pub jobs: Option<Vec<JobDefinition>>,
    /// Push scheduler for business jobs; absent means they never fire
    #[serde(default)]
    pub secondary: Option<SecondaryConfig>,
    /// Base URL for `http_task` jobs without their own target
    #[serde(default)]
    pub task_base_url: Option<String>,
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            primary_check_interval_ms: default_check_interval_ms(),
            retry: RetryConfig::default(),
            jobs: None,
            secondary: None,
            task_base_url: None,
            task_timeout_ms: default_task_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn primary_check_interval(&self) -> Duration {
        Duration::from_millis(self.primary_check_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

fn default_check_interval_ms() -> u64 {
    1_000
}

fn default_task_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    pub webhook: WebhookConfig,
    /// Who receives the scheduled digest
    pub digest_recipient: String,
    #[serde(default = "default_locale")]
    pub locale: String,
}

fn default_locale() -> String {
    "en".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Probes slower than this report degraded
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
    /// Components whose unreachability makes the system unhealthy
    #[serde(default = "default_critical_components")]
    pub critical: Vec<String>,
    /// How far back the jobs probe looks for failed firings
    #[serde(default = "default_failure_window_secs")]
    pub job_failure_window_secs: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            slow_threshold_ms: default_slow_threshold_ms(),
            critical: default_critical_components(),
            job_failure_window_secs: default_failure_window_secs(),
        }
    }
}

impl DiagnosticsConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }

    pub fn job_failure_window(&self) -> Duration {
        Duration::from_secs(self.job_failure_window_secs)
    }
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_slow_threshold_ms() -> u64 {
    1_000
}

fn default_critical_components() -> Vec<String> {
    vec!["cache".to_string(), "primary-scheduler".to_string()]
}

fn default_failure_window_secs() -> u64 {
    3_600
}

pub mod loader {
    use super::{AppConfig, ConfigError};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    /// Default configuration file, relative to the working directory.
    pub const DEFAULT_CONFIG_PATH: &str = "tideway.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., TIDEWAY__REDIS__URL=redis://cache:6379
        builder = builder.add_source(
            Environment::with_prefix("TIDEWAY")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| ConfigError::Build(e.to_string()))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        merged.validate().map_err(ConfigError::Invalid)?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        AppConfig {
            redis: RedisConfig {
                url: Some(MEMORY_STORE_URL.to_string()),
                ..RedisConfig::default()
            },
            ..AppConfig::default()
        }
    }

    #[test]
    fn defaults_need_a_store_url() {
        let err = AppConfig::default().validate().unwrap_err();
        assert!(err.contains("redis.url"));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_unknown_url_schemes() {
        let mut cfg = valid();
        cfg.redis.url = Some("http://cache:6379".into());
        assert!(cfg.validate().is_err());
        cfg.redis.url = Some("rediss://cache:6380/0".into());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn default_critical_set() {
        assert_eq!(
            DiagnosticsConfig::default().critical,
            ["cache", "primary-scheduler"]
        );
    }

    #[test]
    fn incomplete_secondary_is_rejected() {
        let mut cfg = valid();
        cfg.scheduler.secondary = Some(SecondaryConfig {
            base_url: "https://push.example.com".into(),
            token: "".into(),
            callback_base_url: "https://api.example.com".into(),
            signing_key: "k".into(),
            timeout_ms: 5_000,
        });
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("token"));
    }

    #[test]
    fn no_proxy_is_trusted_by_default() {
        let mut cfg = RateLimitConfig::default();
        let loopback = IpAddr::from([127, 0, 0, 1]);
        assert!(!cfg.trusts(loopback));
        cfg.trusted_proxies.push(loopback);
        assert!(cfg.trusts(loopback));
    }

    #[test]
    fn limiter_settings_follow_cache_section() {
        let mut cfg = valid();
        cfg.cache.fail_open = false;
        let settings = cfg.limiter_settings();
        assert!(!settings.fail_open);
        assert_eq!(settings.max_swap_attempts, 16);
    }
}
