use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tideway_cache::{MemoryStore, RemoteStore};
use tideway_core::{Environment, ManualClock};
use tideway_notifications::{Notifier, WebhookConfig, WebhookNotifier};
use tideway_scheduler::{MemoryPushScheduler, PrimaryScheduler};
use tideway_server::config::MEMORY_STORE_URL;
use tideway_server::{
    AppConfig, ComponentStatus, DiagnosticsAggregator, DiagnosticsConfig, OverallStatus, Probe,
    ProbeReport, RedisConfig, ServerBuilder, Services, TidewayServer,
};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NOW_MS: i64 = 1_754_820_000_000;

struct Fixture {
    server: TidewayServer,
    store: MemoryStore,
    push: MemoryPushScheduler,
    clock: ManualClock,
}

async fn fixture(notifier: Arc<dyn Notifier>) -> Fixture {
    let store = MemoryStore::new();
    let push = MemoryPushScheduler::new();
    let clock = ManualClock::starting_at_millis(NOW_MS);
    let cfg = AppConfig {
        environment: Environment::Test,
        redis: RedisConfig {
            url: Some(MEMORY_STORE_URL.into()),
            ..RedisConfig::default()
        },
        ..AppConfig::default()
    };
    let services = Services::assemble(
        cfg,
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        notifier,
        Some(Arc::new(push.clone())),
    )
    .expect("assemble services");
    let server = ServerBuilder::new()
        .with_services(services)
        .build()
        .expect("build server");

    // A heartbeat from one minute ago
    store
        .set("heartbeat:test:primary", &(NOW_MS - 60_000).to_string(), None)
        .await
        .unwrap();

    Fixture {
        server,
        store,
        push,
        clock,
    }
}

async fn webhook_notifier(mock: &MockServer) -> Arc<dyn Notifier> {
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(mock)
        .await;
    let notifier = WebhookNotifier::new(WebhookConfig {
        url: format!("{}/notify", mock.uri()),
        secret: None,
        headers: HashMap::new(),
        health_url: Some(format!("{}/health", mock.uri())),
        timeout_ms: 1_000,
    })
    .unwrap();
    Arc::new(notifier)
}

async fn get_json(server: &TidewayServer, uri: &str) -> (StatusCode, Value) {
    let resp = server
        .router()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

fn component<'a>(body: &'a Value, name: &str) -> &'a Value {
    body["components"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["component"] == name)
        .unwrap_or_else(|| panic!("component {name} missing from {body}"))
}

#[tokio::test]
async fn push_scheduler_outage_degrades_but_stays_up() {
    let mock = MockServer::start().await;
    let fixture = fixture(webhook_notifier(&mock).await).await;
    fixture.push.set_unreachable(true);

    let (status, body) = get_json(&fixture.server, "/api/diagnostics").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");

    let names: Vec<&str> = body["components"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["component"].as_str().unwrap())
        .collect();
    assert_eq!(
        names,
        ["cache", "primary-scheduler", "secondary-scheduler", "jobs", "notifications"]
    );

    let secondary = component(&body, "secondary-scheduler");
    assert_eq!(secondary["status"], "unreachable");
    assert_eq!(secondary["critical"], false);
    assert!(secondary.get("detail").is_none());

    for healthy in ["cache", "primary-scheduler", "jobs", "notifications"] {
        assert_eq!(component(&body, healthy)["status"], "healthy", "{healthy}");
    }
    assert_eq!(component(&body, "cache")["critical"], true);
    assert_eq!(component(&body, "primary-scheduler")["critical"], true);
}

#[tokio::test]
async fn details_are_opt_in() {
    let mock = MockServer::start().await;
    let fixture = fixture(webhook_notifier(&mock).await).await;

    let (_, body) = get_json(&fixture.server, "/api/diagnostics?details=true").await;
    let primary = component(&body, "primary-scheduler");
    assert_eq!(primary["detail"], "last heartbeat 60s ago");
    assert!(body["timestamp"].as_str().unwrap().starts_with("2025-08-10T"));
}

#[tokio::test]
async fn single_component_and_unknown_component() {
    let mock = MockServer::start().await;
    let fixture = fixture(webhook_notifier(&mock).await).await;

    let (status, body) = get_json(&fixture.server, "/api/diagnostics?component=cache").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["components"].as_array().unwrap().len(), 1);
    assert_eq!(body["status"], "healthy");

    let (status, body) = get_json(&fixture.server, "/api/diagnostics?component=all").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["components"].as_array().unwrap().len(), 5);

    let (status, body) = get_json(&fixture.server, "/api/diagnostics?component=billing").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown_component");
}

#[tokio::test]
async fn cache_outage_is_unhealthy() {
    let mock = MockServer::start().await;
    let fixture = fixture(webhook_notifier(&mock).await).await;
    fixture.store.set_unreachable(true);

    let (status, body) = get_json(&fixture.server, "/api/diagnostics").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(component(&body, "cache")["status"], "unreachable");
}

#[tokio::test]
async fn heartbeat_is_fresh_after_the_primary_loop_catches_up() {
    let mock = MockServer::start().await;
    let fixture = fixture(webhook_notifier(&mock).await).await;
    let mut primary = PrimaryScheduler::new(
        fixture.server.state().services.runner.clone(),
        Duration::from_secs(1),
    );

    // Stalled from 10:00 to 10:47:30; the five-minute heartbeat missed nine cycles
    fixture.clock.advance(Duration::from_secs(47 * 60 + 30));
    let outcomes = primary.run_due().await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].cycle_millis, NOW_MS + 45 * 60_000);

    let (status, body) = get_json(
        &fixture.server,
        "/api/diagnostics?component=primary-scheduler&details=true",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let primary = component(&body, "primary-scheduler");
    assert_eq!(primary["status"], "healthy");
    assert_eq!(primary["detail"], "last heartbeat 150s ago");
}

struct SleepyProbe {
    name: &'static str,
    delay: Duration,
}

#[async_trait]
impl Probe for SleepyProbe {
    fn component(&self) -> &'static str {
        self.name
    }

    async fn check(&self) -> ProbeReport {
        tokio::time::sleep(self.delay).await;
        ProbeReport::healthy()
    }
}

#[tokio::test]
async fn slow_and_hung_probes() {
    let config = DiagnosticsConfig {
        probe_timeout_ms: 300,
        slow_threshold_ms: 50,
        critical: vec!["ledger".into()],
        ..DiagnosticsConfig::default()
    };
    let aggregator = DiagnosticsAggregator::new(&config, Arc::new(ManualClock::starting_at_millis(NOW_MS)))
        .with(Arc::new(SleepyProbe {
            name: "fast",
            delay: Duration::ZERO,
        }))
        .with(Arc::new(SleepyProbe {
            name: "slow",
            delay: Duration::from_millis(120),
        }))
        .with(Arc::new(SleepyProbe {
            name: "ledger",
            delay: Duration::from_secs(5),
        }));

    let report = aggregator.report(None).await.unwrap();
    let statuses: Vec<ComponentStatus> = report.components.iter().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        [
            ComponentStatus::Healthy,
            ComponentStatus::Degraded,
            ComponentStatus::Unreachable
        ]
    );
    assert!(report.components[2].detail.as_deref().unwrap().contains("timed out"));
    assert_eq!(report.status, OverallStatus::Unhealthy);

    // Non-critical probes alone never make the system unhealthy
    let report = aggregator.report(Some("slow")).await.unwrap();
    assert_eq!(report.status, OverallStatus::Degraded);
}
