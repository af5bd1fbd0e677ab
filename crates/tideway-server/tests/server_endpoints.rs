use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tideway_cache::MemoryStore;
use tideway_core::{Environment, ManualClock};
use tideway_notifications::LogNotifier;
use tideway_scheduler::secondary::{SCHEDULED_AT_HEADER, SIGNATURE_HEADER};
use tideway_scheduler::{
    HEARTBEAT_JOB, JobAction, JobBackend, JobDefinition, JobPriority, MemoryPushScheduler,
    RunStatus, SecondaryConfig, sign_callback,
};
use tideway_server::config::MEMORY_STORE_URL;
use tideway_server::{AppConfig, RedisConfig, ServerBuilder, Services, TidewayServer};
use tokio::task::JoinHandle;

const NOW_MS: i64 = 1_754_820_000_000;
const SIGNING_KEY: &str = "callback-s3cret";
const DIGEST_JOB: &str = "appointment-reminders";

fn config(with_secondary: bool) -> AppConfig {
    let mut cfg = AppConfig {
        environment: Environment::Test,
        redis: RedisConfig {
            url: Some(MEMORY_STORE_URL.into()),
            ..RedisConfig::default()
        },
        ..AppConfig::default()
    };
    // The test client connects over loopback and stands in for the gateway
    cfg.rate_limit.trusted_proxies = vec![Ipv4Addr::LOCALHOST.into()];
    cfg.scheduler.jobs = Some(vec![
        JobDefinition::new(
            HEARTBEAT_JOB,
            "* * * * *",
            JobPriority::Critical,
            JobBackend::Primary,
            JobAction::Heartbeat,
        ),
        JobDefinition::new(
            DIGEST_JOB,
            "0 * * * *",
            JobPriority::High,
            JobBackend::Secondary,
            JobAction::NotificationDigest,
        ),
    ]);
    if with_secondary {
        cfg.scheduler.secondary = Some(SecondaryConfig {
            base_url: "https://push.example.com".into(),
            token: "t0ken".into(),
            callback_base_url: "https://api.example.com".into(),
            signing_key: SIGNING_KEY.into(),
            timeout_ms: 1_000,
        });
    }
    cfg
}

struct Harness {
    base: String,
    store: MemoryStore,
    clock: ManualClock,
    server: TidewayServer,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Harness {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}

async fn start_server(with_secondary: bool) -> Harness {
    start_with(config(with_secondary)).await
}

async fn start_with(mut cfg: AppConfig) -> Harness {
    let store = MemoryStore::new();
    let clock = ManualClock::starting_at_millis(NOW_MS);
    cfg.scheduler.primary_check_interval_ms = 20;
    let push: Option<Arc<dyn tideway_scheduler::PushScheduler>> = if cfg.scheduler.secondary.is_some() {
        Some(Arc::new(MemoryPushScheduler::new()))
    } else {
        None
    };
    let services = Services::assemble(
        cfg,
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        Arc::new(LogNotifier),
        push,
    )
    .expect("assemble services");
    let server = ServerBuilder::new()
        .with_services(services)
        .build()
        .expect("build server");
    let app = server.router();

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = rx.await;
        })
        .await;
    });

    Harness {
        base: format!("http://{addr}"),
        store,
        clock,
        server,
        shutdown: tx,
        handle,
    }
}

#[tokio::test]
async fn liveness_endpoints_work() {
    tideway_server::metrics::init_metrics();
    let harness = start_server(false).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/", harness.base)).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["service"], "Tideway");

    let resp = client
        .get(format!("{}/healthz", harness.base))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client
        .get(format!("{}/metrics", harness.base))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    harness.stop().await;
}

#[tokio::test]
async fn bookings_are_rate_limited_per_user() {
    let harness = start_server(false).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/bookings", harness.base);
    let booking = json!({ "clinic": "c-1", "slot": "2025-08-12T09:30:00Z" });

    for expected_remaining in (0..5).rev() {
        let resp = client
            .post(&url)
            .header("x-user-id", "patient-7")
            .json(&booking)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
        assert_eq!(
            resp.headers()["x-ratelimit-remaining"].to_str().unwrap(),
            expected_remaining.to_string()
        );
    }

    let denied = client
        .post(&url)
        .header("x-user-id", "patient-7")
        .json(&booking)
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.headers()["retry-after"].to_str().unwrap(), "60");
    let body: Value = denied.json().await.unwrap();
    assert_eq!(body["error"], "too_many_requests");
    assert!(body.get("scope").is_none());

    // Another user is unaffected
    let other = client
        .post(&url)
        .header("x-user-id", "patient-8")
        .json(&booking)
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), reqwest::StatusCode::ACCEPTED);

    harness.stop().await;
}

#[tokio::test]
async fn rotating_identity_headers_from_one_client_is_still_limited() {
    let mut cfg = config(false);
    cfg.rate_limit.trusted_proxies.clear();
    let harness = start_with(cfg).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/bookings", harness.base);

    let mut accepted = 0;
    let mut denied = None;
    for i in 0..30 {
        let resp = client
            .post(&url)
            .header("x-user-id", format!("patient-{i}"))
            .header("x-forwarded-for", format!("198.51.100.{i}"))
            .json(&json!({ "clinic": "c-1" }))
            .send()
            .await
            .unwrap();
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            denied = Some(i);
            break;
        }
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
        accepted += 1;
    }

    // booking-ip allows 20 per minute for the one real peer
    assert_eq!(accepted, 20);
    assert_eq!(denied, Some(20));
    harness.stop().await;
}

#[tokio::test]
async fn bookings_fail_open_when_cache_is_down() {
    let harness = start_server(false).await;
    harness.store.set_unreachable(true);
    let client = reqwest::Client::new();

    for _ in 0..8 {
        let resp = client
            .post(format!("{}/api/bookings", harness.base))
            .header("x-user-id", "patient-7")
            .json(&json!({ "clinic": "c-1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    }

    harness.stop().await;
}

#[tokio::test]
async fn malformed_booking_body_is_rejected() {
    let harness = start_server(false).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/bookings", harness.base))
        .header("x-user-id", "patient-7")
        .json(&json!(["not", "an", "object"]))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    harness.stop().await;
}

#[tokio::test]
async fn signed_callback_fires_the_job() {
    let harness = start_server(true).await;
    let client = reqwest::Client::new();
    let body = br#"{"job":"appointment-reminders"}"#.to_vec();
    let signature = sign_callback(&body, SIGNING_KEY).unwrap();
    let cycle_ms = NOW_MS - 60_000;

    let resp = client
        .post(format!("{}/api/jobs/{DIGEST_JOB}", harness.base))
        .header(SIGNATURE_HEADER, &signature)
        .header(SCHEDULED_AT_HEADER, cycle_ms.to_string())
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["cycle_millis"], cycle_ms);

    let statuses = harness.server.state().services.runner.statuses().clone();
    let mut record = statuses.last(DIGEST_JOB).await;
    for _ in 0..50 {
        if record.status != RunStatus::Unknown {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        record = statuses.last(DIGEST_JOB).await;
    }
    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.cycle_millis, cycle_ms);

    // Redelivery of the same cycle is skipped
    let resp = client
        .post(format!("{}/api/jobs/{DIGEST_JOB}", harness.base))
        .header(SIGNATURE_HEADER, &signature)
        .header(SCHEDULED_AT_HEADER, cycle_ms.to_string())
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);
    for _ in 0..50 {
        record = statuses.last(DIGEST_JOB).await;
        if record.status == RunStatus::Skipped {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(record.status, RunStatus::Skipped);

    harness.stop().await;
}

#[tokio::test]
async fn callbacks_are_checked_before_firing() {
    let harness = start_server(true).await;
    let client = reqwest::Client::new();
    let body = b"{}".to_vec();
    let signature = sign_callback(&body, SIGNING_KEY).unwrap();

    let unsigned = client
        .post(format!("{}/api/jobs/{DIGEST_JOB}", harness.base))
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(unsigned.status(), reqwest::StatusCode::UNAUTHORIZED);

    let forged = client
        .post(format!("{}/api/jobs/{DIGEST_JOB}", harness.base))
        .header(SIGNATURE_HEADER, sign_callback(&body, "wrong-key").unwrap())
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(forged.status(), reqwest::StatusCode::UNAUTHORIZED);

    let unknown = client
        .post(format!("{}/api/jobs/billing-export", harness.base))
        .header(SIGNATURE_HEADER, &signature)
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);

    let primary = client
        .post(format!("{}/api/jobs/{HEARTBEAT_JOB}", harness.base))
        .header(SIGNATURE_HEADER, &signature)
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(primary.status(), reqwest::StatusCode::CONFLICT);

    // Nothing ran
    assert!(harness.server.state().services.runner.statuses().local_snapshot().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn callbacks_need_push_scheduling_configured() {
    let harness = start_server(false).await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/jobs/{DIGEST_JOB}", harness.base))
        .body("{}")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    harness.stop().await;
}

#[tokio::test]
async fn primary_loop_writes_heartbeat() {
    let harness = start_server(false).await;
    let key = "heartbeat:test:primary";
    harness.server.start_primary();
    assert!(harness.store.get_text(key).is_none());

    // NOW_MS sits on a minute boundary, so the next cycle is one minute out.
    harness.clock.advance(Duration::from_secs(61));
    let mut written = None;
    for _ in 0..100 {
        written = harness.store.get_text(key);
        if written.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(written, Some((NOW_MS + 60_000).to_string()));

    harness.server.stop_primary().await;
    assert!(harness.server.state().primary.lock().is_none());
    harness.stop().await;
}
