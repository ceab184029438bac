//! The CTO-Agent: alerts in, signed webhooks out.
//!
//! Every alert produces an immutable incident. A per-kind cooldown suppresses
//! repeats without a network call; everything else is serialized canonically,
//! HMAC-signed, and POSTed to the automation endpoint. The cooldown stamp is
//! only advanced on delivered or HTTP-4xx outcomes, so a transport failure
//! leaves the door open for an immediate retry.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use relay_core::{
    current_unix_timestamp, Alert, AlertKind, CorrectiveAction, Incident, WebhookStatus,
};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;

const DEFAULT_COOLDOWN: Duration = Duration::from_secs(300);
const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_INCIDENT_CAPACITY: usize = 200;

#[derive(Debug, Clone)]
/// Public struct `CtoAgentConfig` used across relay components.
pub struct CtoAgentConfig {
    pub webhook_url: String,
    pub webhook_secret: String,
    pub cooldown: Duration,
    pub http_timeout: Duration,
    pub incident_capacity: usize,
}

impl Default for CtoAgentConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            webhook_secret: String::new(),
            cooldown: DEFAULT_COOLDOWN,
            http_timeout: DEFAULT_WEBHOOK_TIMEOUT,
            incident_capacity: DEFAULT_INCIDENT_CAPACITY,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
/// Counter snapshot exposed through `/api/metrics`.
pub struct AgentMetrics {
    pub total_alerts: u64,
    pub total_suppressed: u64,
    pub total_webhooks_sent: u64,
    pub total_webhook_errors: u64,
    pub incidents_recorded: usize,
}

/// Public struct `CtoAgent` used across relay components.
pub struct CtoAgent {
    config: CtoAgentConfig,
    client: reqwest::Client,
    // Unix second of the last cooldown-engaging dispatch per alert kind.
    cooldowns: Mutex<HashMap<AlertKind, u64>>,
    incidents: Mutex<VecDeque<Incident>>,
    day_sequence: Mutex<(String, u32)>,
    total_alerts: AtomicU64,
    total_suppressed: AtomicU64,
    total_webhooks_sent: AtomicU64,
    total_webhook_errors: AtomicU64,
}

impl CtoAgent {
    pub fn new(config: CtoAgentConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            config,
            client,
            cooldowns: Mutex::new(HashMap::new()),
            incidents: Mutex::new(VecDeque::new()),
            day_sequence: Mutex::new((String::new(), 0)),
            total_alerts: AtomicU64::new(0),
            total_suppressed: AtomicU64::new(0),
            total_webhooks_sent: AtomicU64::new(0),
            total_webhook_errors: AtomicU64::new(0),
        })
    }

    /// Process one alert into an incident, posting the webhook unless the
    /// kind is cooling down.
    pub async fn handle(&self, alert: Alert) -> Incident {
        self.total_alerts.fetch_add(1, Ordering::Relaxed);
        let now = current_unix_timestamp();

        if self.is_cooling_down(alert.kind, now) {
            self.total_suppressed.fetch_add(1, Ordering::Relaxed);
            tracing::info!(kind = alert.kind.as_str(), "alert suppressed by cooldown");
            let incident = self.build_incident(&alert, now, WebhookStatus::Suppressed);
            self.record(incident.clone());
            return incident;
        }

        let mut incident = self.build_incident(&alert, now, WebhookStatus::Pending);
        let dispatch = self.post_webhook(&incident).await;
        incident.webhook_status = dispatch.status();

        // Delivered and HTTP-4xx outcomes engage the cooldown; a transport
        // failure leaves it idle so the next alert of this kind retries.
        if dispatch.engages_cooldown() {
            self.stamp_cooldown(alert.kind, now);
        }

        tracing::warn!(
            incident_id = %incident.id,
            kind = incident.alert_type.as_str(),
            severity = incident.severity.as_str(),
            action = incident.action.as_str(),
            webhook_status = incident.webhook_status.as_str(),
            "incident recorded"
        );
        self.record(incident.clone());
        incident
    }

    /// Most recent incidents, newest first.
    pub fn incidents(&self, limit: usize) -> Vec<Incident> {
        let incidents = match self.incidents.lock() {
            Ok(incidents) => incidents,
            Err(poisoned) => poisoned.into_inner(),
        };
        incidents.iter().rev().take(limit).cloned().collect()
    }

    pub fn metrics(&self) -> AgentMetrics {
        let recorded = match self.incidents.lock() {
            Ok(incidents) => incidents.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        AgentMetrics {
            total_alerts: self.total_alerts.load(Ordering::Relaxed),
            total_suppressed: self.total_suppressed.load(Ordering::Relaxed),
            total_webhooks_sent: self.total_webhooks_sent.load(Ordering::Relaxed),
            total_webhook_errors: self.total_webhook_errors.load(Ordering::Relaxed),
            incidents_recorded: recorded,
        }
    }

    fn is_cooling_down(&self, kind: AlertKind, now: u64) -> bool {
        let cooldowns = match self.cooldowns.lock() {
            Ok(cooldowns) => cooldowns,
            Err(poisoned) => poisoned.into_inner(),
        };
        cooldowns
            .get(&kind)
            .is_some_and(|last| now.saturating_sub(*last) < self.config.cooldown.as_secs())
    }

    fn stamp_cooldown(&self, kind: AlertKind, now: u64) {
        let mut cooldowns = match self.cooldowns.lock() {
            Ok(cooldowns) => cooldowns,
            Err(poisoned) => poisoned.into_inner(),
        };
        cooldowns.insert(kind, now);
    }

    fn build_incident(&self, alert: &Alert, now: u64, status: WebhookStatus) -> Incident {
        Incident {
            id: self.next_incident_id(),
            alert_type: alert.kind,
            severity: alert.severity,
            issues: alert.issues.clone(),
            subject_node_id: alert.subject_node_id.clone(),
            action: action_for(alert.kind),
            timestamp: now,
            webhook_status: status,
        }
    }

    fn next_incident_id(&self) -> String {
        let today = Utc::now().format("%Y%m%d").to_string();
        let mut day_sequence = match self.day_sequence.lock() {
            Ok(day_sequence) => day_sequence,
            Err(poisoned) => poisoned.into_inner(),
        };
        if day_sequence.0 != today {
            *day_sequence = (today.clone(), 0);
        }
        day_sequence.1 += 1;
        format!("inc-{today}-{:03}", day_sequence.1)
    }

    async fn post_webhook(&self, incident: &Incident) -> WebhookDispatch {
        if self.config.webhook_url.is_empty() {
            tracing::warn!(
                incident_id = %incident.id,
                "no webhook url configured; incident recorded locally only"
            );
            return WebhookDispatch::NotConfigured;
        }

        let body = canonical_incident_payload(incident);
        let signature = sign_webhook_payload(&self.config.webhook_secret, &body);

        let response = self
            .client
            .post(&self.config.webhook_url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("X-Signature", format!("sha256={signature}"))
            .header("X-Incident-Id", incident.id.clone())
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                self.total_webhooks_sent.fetch_add(1, Ordering::Relaxed);
                tracing::info!(incident_id = %incident.id, "webhook delivered");
                WebhookDispatch::Delivered
            }
            Ok(response) => {
                self.total_webhook_errors.fetch_add(1, Ordering::Relaxed);
                let status = response.status();
                tracing::error!(
                    incident_id = %incident.id,
                    http_status = status.as_u16(),
                    "webhook rejected"
                );
                if status.is_client_error() {
                    WebhookDispatch::ClientError
                } else {
                    WebhookDispatch::ServerError
                }
            }
            Err(error) => {
                self.total_webhook_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(incident_id = %incident.id, %error, "webhook transport failed");
                WebhookDispatch::TransportError
            }
        }
    }

    fn record(&self, incident: Incident) {
        let mut incidents = match self.incidents.lock() {
            Ok(incidents) => incidents,
            Err(poisoned) => poisoned.into_inner(),
        };
        if incidents.len() >= self.config.incident_capacity {
            incidents.pop_front();
        }
        incidents.push_back(incident);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WebhookDispatch {
    Delivered,
    ClientError,
    ServerError,
    TransportError,
    NotConfigured,
}

impl WebhookDispatch {
    fn status(self) -> WebhookStatus {
        match self {
            Self::Delivered => WebhookStatus::Delivered,
            Self::ClientError | Self::ServerError | Self::TransportError | Self::NotConfigured => {
                WebhookStatus::Failed
            }
        }
    }

    fn engages_cooldown(self) -> bool {
        matches!(self, Self::Delivered | Self::ClientError)
    }
}

/// Corrective action routing per alert kind.
pub fn action_for(kind: AlertKind) -> CorrectiveAction {
    match kind {
        AlertKind::HeartbeatTimeout | AlertKind::WeakSignal => {
            CorrectiveAction::RestartNetworkSwitch
        }
        AlertKind::LowBattery | AlertKind::DloGrowth => CorrectiveAction::NotifyOperator,
        AlertKind::WdtStorm => CorrectiveAction::RestartGatewayNode,
        AlertKind::QueueNearFull => CorrectiveAction::EmergencyQueueDrain,
    }
}

/// Canonical webhook body: sorted keys, UTF-8, no whitespace. The signature
/// is computed over exactly these bytes.
pub fn canonical_incident_payload(incident: &Incident) -> String {
    let mut fields: BTreeMap<&str, Value> = BTreeMap::new();
    fields.insert("action", Value::String(incident.action.as_str().to_string()));
    fields.insert(
        "alert_type",
        Value::String(incident.alert_type.as_str().to_string()),
    );
    fields.insert("id", Value::String(incident.id.clone()));
    fields.insert(
        "issues",
        Value::Array(
            incident
                .issues
                .iter()
                .map(|issue| Value::String(issue.clone()))
                .collect(),
        ),
    );
    fields.insert(
        "severity",
        Value::String(incident.severity.as_str().to_string()),
    );
    fields.insert(
        "subject_node_id",
        incident
            .subject_node_id
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    fields.insert("timestamp", Value::from(incident.timestamp));
    serde_json::to_string(&fields).unwrap_or_default()
}

/// Hex-encoded `HMAC-SHA256(secret, body)`.
pub fn sign_webhook_payload(secret: &str, body: &str) -> String {
    let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body.as_bytes());
    mac.finalize()
        .into_bytes()
        .iter()
        .fold(String::with_capacity(64), |mut hex, byte| {
            use std::fmt::Write as _;
            let _ = write!(hex, "{byte:02x}");
            hex
        })
}

#[cfg(test)]
mod tests {
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use relay_core::AlertSeverity;

    use super::*;

    fn battery_alert() -> Alert {
        Alert {
            kind: AlertKind::LowBattery,
            severity: AlertSeverity::Warning,
            issues: vec!["node edge-01: battery low (3000 mV, 0%)".to_string()],
            subject_node_id: Some("edge-01".to_string()),
        }
    }

    fn agent_for(url: &str, cooldown: Duration) -> CtoAgent {
        CtoAgent::new(CtoAgentConfig {
            webhook_url: url.to_string(),
            webhook_secret: "shared-secret".to_string(),
            cooldown,
            http_timeout: Duration::from_secs(2),
            incident_capacity: 10,
        })
        .expect("agent")
    }

    #[tokio::test]
    async fn integration_second_alert_within_cooldown_is_suppressed() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(200);
            })
            .await;

        let agent = agent_for(&server.url("/hook"), Duration::from_secs(60));
        let first = agent.handle(battery_alert()).await;
        let second = agent.handle(battery_alert()).await;

        assert_eq!(first.webhook_status, WebhookStatus::Delivered);
        assert_eq!(second.webhook_status, WebhookStatus::Suppressed);
        assert_eq!(mock.hits_async().await, 1);
        let metrics = agent.metrics();
        assert_eq!(metrics.total_alerts, 2);
        assert_eq!(metrics.total_suppressed, 1);
        assert_eq!(metrics.total_webhooks_sent, 1);
    }

    #[tokio::test]
    async fn integration_signature_verifies_against_the_posted_body() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/hook").matches(|request| {
                    let body = request
                        .body
                        .as_deref()
                        .map(|raw| String::from_utf8_lossy(raw).to_string())
                        .unwrap_or_default();
                    let header = request
                        .headers
                        .as_ref()
                        .and_then(|headers| {
                            headers
                                .iter()
                                .find(|(name, _)| name.eq_ignore_ascii_case("x-signature"))
                                .map(|(_, value)| value.clone())
                        })
                        .unwrap_or_default();
                    let Some(signature) = header.strip_prefix("sha256=") else {
                        return false;
                    };
                    signature == sign_webhook_payload("shared-secret", &body)
                });
                then.status(200);
            })
            .await;

        let agent = agent_for(&server.url("/hook"), Duration::from_secs(60));
        let incident = agent.handle(battery_alert()).await;
        assert_eq!(incident.webhook_status, WebhookStatus::Delivered);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn integration_client_rejection_still_engages_the_cooldown() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(400);
            })
            .await;

        let agent = agent_for(&server.url("/hook"), Duration::from_secs(60));
        let first = agent.handle(battery_alert()).await;
        let second = agent.handle(battery_alert()).await;

        assert_eq!(first.webhook_status, WebhookStatus::Failed);
        assert_eq!(second.webhook_status, WebhookStatus::Suppressed);
        assert_eq!(mock.hits_async().await, 1);
    }

    #[tokio::test]
    async fn integration_transport_failure_leaves_the_cooldown_idle() {
        // Nothing listens here; every POST is a transport error.
        let agent = agent_for("http://127.0.0.1:9/hook", Duration::from_secs(60));
        let first = agent.handle(battery_alert()).await;
        let second = agent.handle(battery_alert()).await;

        assert_eq!(first.webhook_status, WebhookStatus::Failed);
        assert_eq!(second.webhook_status, WebhookStatus::Failed);
        let metrics = agent.metrics();
        assert_eq!(metrics.total_suppressed, 0);
        assert_eq!(metrics.total_webhook_errors, 2);
    }

    #[tokio::test]
    async fn functional_unconfigured_webhook_records_locally() {
        let agent = agent_for("", Duration::from_secs(60));
        let incident = agent.handle(battery_alert()).await;
        assert_eq!(incident.webhook_status, WebhookStatus::Failed);
        // No attempt was made, so the cooldown stays idle.
        let second = agent.handle(battery_alert()).await;
        assert_eq!(second.webhook_status, WebhookStatus::Failed);
        assert_eq!(agent.metrics().total_webhook_errors, 0);
    }

    #[tokio::test]
    async fn functional_incident_ring_is_bounded_and_newest_first() {
        let agent = CtoAgent::new(CtoAgentConfig {
            webhook_url: String::new(),
            cooldown: Duration::ZERO,
            incident_capacity: 3,
            ..CtoAgentConfig::default()
        })
        .expect("agent");
        for _ in 0..5 {
            agent.handle(battery_alert()).await;
        }
        let listed = agent.incidents(10);
        assert_eq!(listed.len(), 3);
        assert!(listed[0].id > listed[1].id);
        assert_eq!(agent.metrics().incidents_recorded, 3);
    }

    #[test]
    fn unit_action_routing_matches_the_alert_kind() {
        assert_eq!(
            action_for(AlertKind::HeartbeatTimeout),
            CorrectiveAction::RestartNetworkSwitch
        );
        assert_eq!(
            action_for(AlertKind::WeakSignal),
            CorrectiveAction::RestartNetworkSwitch
        );
        assert_eq!(
            action_for(AlertKind::LowBattery),
            CorrectiveAction::NotifyOperator
        );
        assert_eq!(
            action_for(AlertKind::DloGrowth),
            CorrectiveAction::NotifyOperator
        );
        assert_eq!(
            action_for(AlertKind::WdtStorm),
            CorrectiveAction::RestartGatewayNode
        );
        assert_eq!(
            action_for(AlertKind::QueueNearFull),
            CorrectiveAction::EmergencyQueueDrain
        );
    }

    #[test]
    fn unit_canonical_payload_is_sorted_and_compact() {
        let incident = Incident {
            id: "inc-20240101-001".to_string(),
            alert_type: AlertKind::LowBattery,
            severity: AlertSeverity::Warning,
            issues: vec!["node edge-01: battery low".to_string()],
            subject_node_id: Some("edge-01".to_string()),
            action: CorrectiveAction::NotifyOperator,
            timestamp: 1_704_067_200,
            webhook_status: WebhookStatus::Pending,
        };
        let payload = canonical_incident_payload(&incident);
        assert_eq!(
            payload,
            "{\"action\":\"notify_operator\",\"alert_type\":\"low_battery\",\
             \"id\":\"inc-20240101-001\",\"issues\":[\"node edge-01: battery low\"],\
             \"severity\":\"warning\",\"subject_node_id\":\"edge-01\",\
             \"timestamp\":1704067200}"
        );
    }

    #[test]
    fn unit_signature_is_stable_hex() {
        let signature = sign_webhook_payload("secret", "{\"a\":1}");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_eq!(signature, sign_webhook_payload("secret", "{\"a\":1}"));
        assert_ne!(signature, sign_webhook_payload("other", "{\"a\":1}"));
    }

    #[tokio::test]
    async fn unit_incident_ids_are_daily_monotonic() {
        let agent = agent_for("", Duration::ZERO);
        let first = agent.handle(battery_alert()).await;
        let second = agent.handle(battery_alert()).await;
        let today = Utc::now().format("%Y%m%d").to_string();
        assert_eq!(first.id, format!("inc-{today}-001"));
        assert_eq!(second.id, format!("inc-{today}-002"));
    }
}
