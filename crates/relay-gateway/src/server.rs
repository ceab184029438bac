//! The HTTP ingest facade.
//!
//! A thin synchronous surface over the application root: validation happens
//! here, everything else is delegated. All responses share the
//! `{success, message, data?}` envelope.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use relay_core::{
    current_unix_timestamp, current_unix_timestamp_ms, envelope, MessageEnvelope, MessagePriority,
    MessageRecord, NodeTelemetry,
};
use relay_queue::{DloRetryOutcome, EnqueueOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::app::RelayApp;

const MAX_SMS_ID_CHARS: usize = 128;
const MAX_BODY_CHARS: usize = 4_096;
// A 4096-char plaintext grows to ~5.5k chars of prefixed base64 token; this
// bound rejects oversized ciphertext without decrypting at the boundary.
const MAX_TOKEN_CHARS: usize = 5_632;
const DEFAULT_INCIDENT_LIMIT: usize = 20;

#[derive(Debug, Clone, Serialize)]
/// Response envelope shared by every endpoint.
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn respond(status: StatusCode, success: bool, message: impl Into<String>, data: Option<Value>) -> Response {
    let payload = ApiResponse {
        success,
        message: message.into(),
        data,
    };
    (status, Json(payload)).into_response()
}

fn ok(message: impl Into<String>, data: Value) -> Response {
    respond(StatusCode::OK, true, message, Some(data))
}

fn bad_request(message: impl Into<String>) -> Response {
    respond(StatusCode::BAD_REQUEST, false, message, None)
}

#[derive(Debug, Deserialize)]
struct InboundSmsRequest {
    #[serde(default)]
    sms_id: String,
    sender: String,
    body: String,
    #[serde(default)]
    timestamp: u64,
    #[serde(default)]
    node_id: String,
    #[serde(default)]
    encrypted: bool,
    #[serde(default)]
    priority: String,
}

#[derive(Debug, Deserialize)]
struct IncidentQuery {
    limit: Option<usize>,
}

/// Build the axum router over the application root.
pub fn router(app: Arc<RelayApp>) -> Router {
    Router::new()
        .route("/", get(service_banner))
        .route("/api/sms/inbound", post(inbound_sms))
        .route("/api/telemetry", post(inbound_telemetry))
        .route("/api/health", get(health_report))
        .route("/api/metrics", get(metrics_report))
        .route("/api/dlo", get(list_dead_letters).delete(purge_dead_letters))
        .route("/api/dlo/:sms_id/retry", post(retry_dead_letter))
        .route("/api/incidents", get(list_incidents))
        .with_state(app)
}

/// Bind and serve until interrupted, then drain the application.
pub async fn serve(app: Arc<RelayApp>, bind: &str) -> Result<()> {
    app.start();
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind http listener on {bind}"))?;
    tracing::info!(bind, "http listener bound");
    axum::serve(listener, router(Arc::clone(&app)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;
    app.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

async fn service_banner() -> Response {
    ok(
        "otp-relay",
        json!({
            "service": "otp-relay",
            "version": env!("CARGO_PKG_VERSION"),
            "health": "/api/health",
            "metrics": "/api/metrics",
        }),
    )
}

async fn inbound_sms(
    State(app): State<Arc<RelayApp>>,
    Json(request): Json<InboundSmsRequest>,
) -> Response {
    let record = match validate_inbound(request) {
        Ok(record) => record,
        Err(reason) => return bad_request(reason),
    };
    let sms_id = record.sms_id.clone();

    match app.queue.enqueue(record) {
        EnqueueOutcome::Accepted => ok(
            format!("sms {sms_id} enqueued for delivery"),
            json!({
                "sms_id": sms_id,
                "queue_depth": app.queue.depth(),
            }),
        ),
        EnqueueOutcome::QueueFull => respond(
            StatusCode::SERVICE_UNAVAILABLE,
            false,
            "queue full: backpressure active",
            None,
        ),
        EnqueueOutcome::Duplicate => respond(
            StatusCode::CONFLICT,
            false,
            format!("sms {sms_id} is already queued or in flight"),
            None,
        ),
    }
}

fn validate_inbound(request: InboundSmsRequest) -> Result<MessageRecord, String> {
    let sms_id = if request.sms_id.trim().is_empty() {
        format!("api-{}", current_unix_timestamp_ms())
    } else {
        request.sms_id.trim().to_string()
    };
    if sms_id.chars().count() > MAX_SMS_ID_CHARS {
        return Err(format!("sms_id exceeds {MAX_SMS_ID_CHARS} characters"));
    }
    if request.sender.trim().is_empty() {
        return Err("sender must not be empty".to_string());
    }
    if request.body.is_empty() {
        return Err("body must not be empty".to_string());
    }

    if request.encrypted && request.body.starts_with(envelope::TOKEN_PREFIX) {
        if !MessageEnvelope::is_token(&request.body) {
            return Err("body is not a valid encrypted token".to_string());
        }
        if request.body.chars().count() > MAX_TOKEN_CHARS {
            return Err("encrypted body exceeds the size limit".to_string());
        }
    } else if request.body.chars().count() > MAX_BODY_CHARS {
        return Err(format!("body exceeds {MAX_BODY_CHARS} characters"));
    }

    Ok(MessageRecord {
        sms_id,
        sender: request.sender.trim().to_string(),
        body: request.body,
        timestamp: if request.timestamp == 0 {
            current_unix_timestamp()
        } else {
            request.timestamp
        },
        node_id: request.node_id.trim().to_string(),
        priority: MessagePriority::parse_lenient(&request.priority),
        encrypted: request.encrypted,
        retry_count: 0,
        last_error: None,
        created_at: 0,
    })
}

async fn inbound_telemetry(
    State(app): State<Arc<RelayApp>>,
    Json(sample): Json<NodeTelemetry>,
) -> Response {
    if sample.node_id.trim().is_empty() {
        return bad_request("node_id must not be empty");
    }
    app.monitor.ingest(sample);
    // Evaluation runs on every ingest so threshold breaches alert without
    // waiting for the timer tick.
    app.refresh_health();
    ok("telemetry recorded", json!({}))
}

async fn health_report(State(app): State<Arc<RelayApp>>) -> Response {
    app.monitor
        .set_queue_gauge(app.queue.depth(), app.queue.capacity());
    app.monitor.set_dlo_gauge(app.dlo.len());
    let snapshot = app.monitor.snapshot();
    let queue_metrics = app.queue.metrics();
    ok(
        format!("status: {}", snapshot.status),
        json!({
            "status": snapshot.status,
            "timestamp": snapshot.timestamp,
            "issues": snapshot.issues,
            "components": {
                "queue": {
                    "depth": queue_metrics.current_depth,
                    "capacity": queue_metrics.capacity,
                    "in_flight": queue_metrics.in_flight,
                    "running": queue_metrics.running,
                    "utilization_percent": snapshot.queue_utilization_percent,
                },
                "telegram": app.telegram.counters(),
                "nodes": snapshot.nodes,
            },
        }),
    )
}

async fn metrics_report(State(app): State<Arc<RelayApp>>) -> Response {
    ok(
        "metrics",
        json!({
            "timestamp": current_unix_timestamp(),
            "queue": app.queue.metrics(),
            "telegram": app.telegram.counters(),
            "email": app.email.counters(),
            "dlo": app.dlo.metrics(),
            "cto_agent": app.agent.metrics(),
        }),
    )
}

async fn list_dead_letters(State(app): State<Arc<RelayApp>>) -> Response {
    let dead_letters = app.dlo.list();
    ok(
        format!("{} dead-lettered messages", dead_letters.len()),
        json!({
            "count": dead_letters.len(),
            "dead_letters": dead_letters,
        }),
    )
}

async fn retry_dead_letter(
    State(app): State<Arc<RelayApp>>,
    Path(sms_id): Path<String>,
) -> Response {
    match app.dlo.retry(&sms_id, &app.queue) {
        DloRetryOutcome::Requeued => ok(format!("sms {sms_id} re-enqueued"), json!({})),
        DloRetryOutcome::NotFound => respond(
            StatusCode::NOT_FOUND,
            false,
            format!("sms {sms_id} not found in the dead letter office"),
            None,
        ),
        DloRetryOutcome::QueueRefused => respond(
            StatusCode::SERVICE_UNAVAILABLE,
            false,
            "queue refused the retry; the dead letter was kept",
            None,
        ),
    }
}

async fn purge_dead_letters(State(app): State<Arc<RelayApp>>) -> Response {
    let purged = app.dlo.purge();
    ok(
        format!("purged {purged} dead letters"),
        json!({ "purged": purged }),
    )
}

async fn list_incidents(
    State(app): State<Arc<RelayApp>>,
    Query(query): Query<IncidentQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_INCIDENT_LIMIT);
    let incidents = app.agent.incidents(limit);
    ok(
        format!("{} incidents", incidents.len()),
        json!({
            "count": incidents.len(),
            "incidents": incidents,
        }),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::Method::POST;
    use httpmock::MockServer;
    use relay_core::RelayConfig;
    use tokio::time::Instant;

    use super::*;

    fn test_config(telegram_base: &str, webhook_url: &str) -> RelayConfig {
        RelayConfig {
            telegram_bot_token: "test-token".to_string(),
            telegram_chat_id: "42".to_string(),
            telegram_api_base: telegram_base.to_string(),
            encryption_key: String::new(),
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_user: String::new(),
            smtp_pass: String::new(),
            smtp_from: String::new(),
            smtp_to: String::new(),
            webhook_url: webhook_url.to_string(),
            webhook_secret: "shared-secret".to_string(),
            queue_capacity: 100,
            worker_count: 2,
            max_retries: 1,
            dlo_ttl_sec: 3_600,
            dlo_max: 100,
            cto_cooldown_sec: 300,
            heartbeat_timeout_sec: 120,
            battery_low_mv: 3_300,
            wifi_weak_dbm: -100,
            dlo_growth_threshold: 50,
            queue_drain_grace_sec: 2,
            http_bind: "127.0.0.1:0".to_string(),
        }
    }

    async fn spawn_app(config: RelayConfig) -> (Arc<RelayApp>, String) {
        let app = RelayApp::build(config).expect("app");
        app.start();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        let service = router(Arc::clone(&app));
        tokio::spawn(async move {
            let _ = axum::serve(listener, service).await;
        });
        (app, format!("http://{address}"))
    }

    fn inbound_payload(sms_id: &str) -> Value {
        json!({
            "sms_id": sms_id,
            "sender": "+919876500001",
            "body": "123456 is your code",
            "timestamp": 1_700_000_000u64,
            "node_id": "edge-01",
            "priority": "high",
            "encrypted": false,
        })
    }

    async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn integration_inbound_sms_delivers_through_stubbed_telegram() {
        let telegram = MockServer::start_async().await;
        telegram
            .mock_async(|when, then| {
                when.method(POST).path("/bottest-token/sendMessage");
                then.status(200).json_body(json!({"ok": true}));
            })
            .await;

        let (app, base) = spawn_app(test_config(&telegram.base_url(), "")).await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/api/sms/inbound"))
            .json(&inbound_payload("sms-00001"))
            .send()
            .await
            .expect("response");
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.expect("json");
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["sms_id"], "sms-00001");

        assert!(
            wait_until(
                || app.queue.metrics().total_delivered == 1,
                Duration::from_secs(2)
            )
            .await
        );
        assert!(app.dlo.is_empty());
        app.shutdown().await;
    }

    #[tokio::test]
    async fn functional_validation_rejects_bad_requests() {
        let (app, base) = spawn_app(test_config("http://127.0.0.1:9", "")).await;
        let client = reqwest::Client::new();

        let mut no_sender = inbound_payload("sms-x");
        no_sender["sender"] = json!("");
        let response = client
            .post(format!("{base}/api/sms/inbound"))
            .json(&no_sender)
            .send()
            .await
            .expect("response");
        assert_eq!(response.status(), 400);

        let long_id = inbound_payload(&"x".repeat(200));
        let response = client
            .post(format!("{base}/api/sms/inbound"))
            .json(&long_id)
            .send()
            .await
            .expect("response");
        assert_eq!(response.status(), 400);

        let mut oversize = inbound_payload("sms-y");
        oversize["body"] = json!("a".repeat(5_000));
        let response = client
            .post(format!("{base}/api/sms/inbound"))
            .json(&oversize)
            .send()
            .await
            .expect("response");
        assert_eq!(response.status(), 400);

        let mut bad_token = inbound_payload("sms-z");
        bad_token["encrypted"] = json!(true);
        bad_token["body"] = json!("otp1:!!not-base64!!");
        let response = client
            .post(format!("{base}/api/sms/inbound"))
            .json(&bad_token)
            .send()
            .await
            .expect("response");
        assert_eq!(response.status(), 400);

        assert_eq!(app.queue.metrics().total_enqueued, 0);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn integration_duplicate_inbound_returns_conflict() {
        let telegram = MockServer::start_async().await;
        telegram
            .mock_async(|when, then| {
                when.method(POST).path("/bottest-token/sendMessage");
                then.status(200)
                    .delay(Duration::from_millis(500))
                    .json_body(json!({"ok": true}));
            })
            .await;

        let (app, base) = spawn_app(test_config(&telegram.base_url(), "")).await;
        let client = reqwest::Client::new();
        let first = client
            .post(format!("{base}/api/sms/inbound"))
            .json(&inbound_payload("sms-dup"))
            .send()
            .await
            .expect("response");
        assert_eq!(first.status(), 200);
        let second = client
            .post(format!("{base}/api/sms/inbound"))
            .json(&inbound_payload("sms-dup"))
            .send()
            .await
            .expect("response");
        assert_eq!(second.status(), 409);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn integration_backpressure_returns_503() {
        let telegram = MockServer::start_async().await;
        telegram
            .mock_async(|when, then| {
                when.method(POST).path("/bottest-token/sendMessage");
                then.status(200)
                    .delay(Duration::from_secs(5))
                    .json_body(json!({"ok": true}));
            })
            .await;

        let mut config = test_config(&telegram.base_url(), "");
        config.queue_capacity = 2;
        config.worker_count = 1;
        let (app, base) = spawn_app(config).await;
        let client = reqwest::Client::new();

        for index in 0..2 {
            let response = client
                .post(format!("{base}/api/sms/inbound"))
                .json(&inbound_payload(&format!("sms-{index}")))
                .send()
                .await
                .expect("response");
            assert_eq!(response.status(), 200);
        }
        let overflow = client
            .post(format!("{base}/api/sms/inbound"))
            .json(&inbound_payload("sms-overflow"))
            .send()
            .await
            .expect("response");
        assert_eq!(overflow.status(), 503);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn integration_low_battery_telemetry_raises_one_webhook_then_suppresses() {
        let automation = MockServer::start_async().await;
        let hook = automation
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(200);
            })
            .await;

        let (app, base) = spawn_app(test_config(
            "http://127.0.0.1:9",
            &automation.url("/hook"),
        ))
        .await;
        let client = reqwest::Client::new();
        let telemetry = json!({
            "node_id": "edge-01",
            "battery_mv": 3_000,
            "wifi_rssi": -60,
            "wifi_state": 4,
            "uptime_sec": 600,
            "heap_free": 150_000,
        });

        for _ in 0..2 {
            let response = client
                .post(format!("{base}/api/telemetry"))
                .json(&telemetry)
                .send()
                .await
                .expect("response");
            assert_eq!(response.status(), 200);
        }

        assert!(
            wait_until(|| app.agent.metrics().total_alerts >= 2, Duration::from_secs(2)).await
        );
        assert!(
            wait_until(
                || app.agent.metrics().total_suppressed >= 1,
                Duration::from_secs(2)
            )
            .await
        );
        assert_eq!(hook.hits_async().await, 1);

        let response = client
            .get(format!("{base}/api/incidents?limit=10"))
            .send()
            .await
            .expect("response");
        let body: Value = response.json().await.expect("json");
        let incidents = body["data"]["incidents"].as_array().expect("incidents");
        assert!(incidents.len() >= 2);
        assert_eq!(incidents[0]["webhook_status"], "suppressed");
        app.shutdown().await;
    }

    #[tokio::test]
    async fn integration_dead_letter_lifecycle_over_http() {
        let telegram = MockServer::start_async().await;
        let mut failing = telegram
            .mock_async(|when, then| {
                when.method(POST).path("/bottest-token/sendMessage");
                then.status(500);
            })
            .await;

        // max_retries 1: the first failed pass dead-letters immediately.
        let (app, base) = spawn_app(test_config(&telegram.base_url(), "")).await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{base}/api/sms/inbound"))
            .json(&inbound_payload("sms-doomed"))
            .send()
            .await
            .expect("response");
        assert_eq!(response.status(), 200);

        assert!(
            wait_until(|| !app.dlo.is_empty(), Duration::from_secs(3)).await
        );

        let listed: Value = client
            .get(format!("{base}/api/dlo"))
            .send()
            .await
            .expect("response")
            .json()
            .await
            .expect("json");
        assert_eq!(listed["data"]["count"], 1);
        assert_eq!(listed["data"]["dead_letters"][0]["sms_id"], "sms-doomed");
        assert_eq!(listed["data"]["dead_letters"][0]["body"], "[ENCRYPTED]");

        let missing = client
            .post(format!("{base}/api/dlo/sms-unknown/retry"))
            .send()
            .await
            .expect("response");
        assert_eq!(missing.status(), 404);

        // Flip the stub to success and retry the dead letter.
        failing.delete_async().await;
        telegram
            .mock_async(|when, then| {
                when.method(POST).path("/bottest-token/sendMessage");
                then.status(200).json_body(json!({"ok": true}));
            })
            .await;
        let retried = client
            .post(format!("{base}/api/dlo/sms-doomed/retry"))
            .send()
            .await
            .expect("response");
        assert_eq!(retried.status(), 200);
        assert!(
            wait_until(
                || app.queue.metrics().total_delivered == 1,
                Duration::from_secs(3)
            )
            .await
        );
        assert!(app.dlo.is_empty());

        let purged: Value = client
            .delete(format!("{base}/api/dlo"))
            .send()
            .await
            .expect("response")
            .json()
            .await
            .expect("json");
        assert_eq!(purged["data"]["purged"], 0);
        app.shutdown().await;
    }

    #[tokio::test]
    async fn integration_health_and_metrics_report_component_shapes() {
        let (app, base) = spawn_app(test_config("http://127.0.0.1:9", "")).await;
        let client = reqwest::Client::new();

        let health: Value = client
            .get(format!("{base}/api/health"))
            .send()
            .await
            .expect("response")
            .json()
            .await
            .expect("json");
        assert_eq!(health["data"]["status"], "unknown");
        assert!(health["data"]["components"]["queue"]["capacity"].is_number());
        assert!(health["data"]["components"]["telegram"]["connected"].is_boolean());
        assert!(health["data"]["components"]["nodes"].is_array());

        let metrics: Value = client
            .get(format!("{base}/api/metrics"))
            .send()
            .await
            .expect("response")
            .json()
            .await
            .expect("json");
        for component in ["queue", "telegram", "email", "dlo", "cto_agent"] {
            assert!(
                metrics["data"][component].is_object(),
                "missing component {component}"
            );
        }
        assert_eq!(metrics["data"]["queue"]["running"], true);
        app.shutdown().await;
    }
}
