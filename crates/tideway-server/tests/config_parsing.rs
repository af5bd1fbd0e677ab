use std::{env, fs};

use tideway_core::Environment;
use tideway_server::ConfigError;
use tideway_server::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("tideway.toml");

    let toml_content = r#"
environment = "staging"

[server]
host = "127.0.0.1"
port = 8081

[redis]
url = "redis://127.0.0.1:6379/0"
pool_size = 4
timeout_ms = 250

[cache]
fail_open = false

[logging]
level = "debug"

[rate_limit]
trusted_proxies = ["10.0.0.2"]

[[rate_limit.scopes]]
name = "booking-user"
subject = "user"
window_secs = 60
max_events = 5

[scheduler]
primary_check_interval_ms = 500
task_base_url = "https://tasks.internal"

[scheduler.retry]
base_backoff_ms = 200

[[scheduler.jobs]]
id = "heartbeat"
endpoint = "/api/jobs/heartbeat"
cron = "* * * * *"
priority = "critical"
backend = "primary"
action = "heartbeat"

[[scheduler.jobs]]
id = "calendar-sync"
endpoint = "/api/jobs/calendar-sync"
cron = "*/30 * * * *"
priority = "medium"
backend = "secondary"
action = "http_task"
retries = 5

[scheduler.secondary]
base_url = "https://push.example.com"
token = "t0ken"
callback_base_url = "https://api.example.com"
signing_key = "s3cret"

[notifications]
digest_recipient = "ops@example.com"

[notifications.webhook]
url = "https://hooks.example.com/notify"
secret = "hook-secret"

[diagnostics]
probe_timeout_ms = 1500
critical = ["cache"]
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.environment, Environment::Staging);
    assert_eq!(cfg.server.port, 8081);
    assert_eq!(cfg.redis.pool_size, 4);
    assert!(!cfg.cache.fail_open);
    assert_eq!(cfg.cache.max_swap_attempts, 16);
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.rate_limit.scopes.len(), 1);
    assert!(cfg.rate_limit.trusts("10.0.0.2".parse().unwrap()));
    assert_eq!(cfg.scheduler.retry.base_backoff_ms, 200);
    assert_eq!(cfg.scheduler.retry.max_backoff_ms, 60_000);
    let jobs = cfg.scheduler.jobs.as_ref().expect("jobs table");
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[1].retries, 5);
    assert_eq!(jobs[0].retries, 3);
    let secondary = cfg.scheduler.secondary.as_ref().expect("secondary");
    assert_eq!(secondary.timeout_ms, 5_000);
    let notifications = cfg.notifications.as_ref().expect("notifications");
    assert_eq!(notifications.locale, "en");
    assert_eq!(cfg.diagnostics.critical, ["cache"]);
    assert_eq!(cfg.diagnostics.slow_threshold_ms, 1_000);

    // 2) Env override should win over file
    unsafe {
        env::set_var("TIDEWAY__CACHE__MAX_SWAP_ATTEMPTS", "32");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.cache.max_swap_attempts, 32);
    unsafe {
        env::remove_var("TIDEWAY__CACHE__MAX_SWAP_ATTEMPTS");
    }

    // 3) Missing redis.url fails startup
    let missing_path = dir.path().join("missing.toml");
    fs::write(&missing_path, "[server]\nport = 9000\n").expect("write toml");
    let err = load_config(missing_path.to_str()).expect_err("expected validation error");
    assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("redis.url")));

    // 4) Partial secondary credentials fail startup
    let partial_path = dir.path().join("partial.toml");
    let partial_toml = r#"
[redis]
url = "memory://"

[scheduler.secondary]
base_url = "https://push.example.com"
token = ""
callback_base_url = "https://api.example.com"
signing_key = "s3cret"
"#;
    fs::write(&partial_path, partial_toml).expect("write toml");
    let err = load_config(partial_path.to_str()).expect_err("expected validation error");
    assert!(err.to_string().contains("scheduler.secondary.token"));

    // 5) A secondary section missing a key does not deserialize
    let broken_path = dir.path().join("broken.toml");
    let broken_toml = r#"
[redis]
url = "memory://"

[scheduler.secondary]
base_url = "https://push.example.com"
"#;
    fs::write(&broken_path, broken_toml).expect("write toml");
    let err = load_config(broken_path.to_str()).expect_err("expected deserialize error");
    assert!(matches!(err, ConfigError::Deserialize(_)));

    // 6) Unknown environment names are rejected
    let env_path = dir.path().join("env.toml");
    fs::write(&env_path, "environment = \"qa\"\n[redis]\nurl = \"memory://\"\n").expect("write toml");
    assert!(load_config(env_path.to_str()).is_err());
}
