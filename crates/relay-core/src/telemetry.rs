//! Node telemetry, alert, and incident data model.
//!
//! Telemetry samples arrive from edge nodes; the health monitor folds them
//! into per-node state and emits alerts. The CTO-Agent turns alerts into
//! immutable incident records.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Public struct `NodeTelemetry` used across relay components.
pub struct NodeTelemetry {
    pub node_id: String,
    #[serde(default)]
    pub battery_mv: i64,
    #[serde(default = "default_rssi")]
    pub wifi_rssi: i64,
    #[serde(default)]
    pub wifi_state: u8,
    #[serde(default)]
    pub reconnects: u64,
    #[serde(default)]
    pub wdt_resets: u64,
    #[serde(default)]
    pub uptime_sec: u64,
    #[serde(default)]
    pub heap_free: u64,
    #[serde(default)]
    pub received_at: u64,
}

fn default_rssi() -> i64 {
    -127
}

impl NodeTelemetry {
    /// Linear 3000–4200 mV ramp; the alert threshold works on raw millivolts,
    /// this estimate only feeds operator reports.
    pub fn battery_percent(&self) -> u8 {
        if self.battery_mv <= 3_000 {
            return 0;
        }
        if self.battery_mv >= 4_200 {
            return 100;
        }
        ((self.battery_mv - 3_000) / 12) as u8
    }
}

#[derive(Debug, Clone, Serialize)]
/// Latest telemetry for a node plus the derived liveness timestamp.
pub struct NodeState {
    #[serde(flatten)]
    pub telemetry: NodeTelemetry,
    pub last_seen: u64,
}

impl NodeState {
    pub fn is_stale(&self, now: u64, heartbeat_timeout_sec: u64) -> bool {
        now.saturating_sub(self.last_seen) > heartbeat_timeout_sec
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `AlertKind` values.
pub enum AlertKind {
    HeartbeatTimeout,
    LowBattery,
    WeakSignal,
    QueueNearFull,
    WdtStorm,
    DloGrowth,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::LowBattery => "low_battery",
            Self::WeakSignal => "weak_signal",
            Self::QueueNearFull => "queue_near_full",
            Self::WdtStorm => "wdt_storm",
            Self::DloGrowth => "dlo_growth",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Enumerates supported `AlertSeverity` values.
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
    Emergency,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Emergency => "emergency",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
/// Public struct `Alert` used across relay components.
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub issues: Vec<String>,
    pub subject_node_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `CorrectiveAction` values.
pub enum CorrectiveAction {
    NotifyOperator,
    RestartNetworkSwitch,
    RestartGatewayNode,
    EmergencyQueueDrain,
    LogOnly,
}

impl CorrectiveAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotifyOperator => "notify_operator",
            Self::RestartNetworkSwitch => "restart_network_switch",
            Self::RestartGatewayNode => "restart_gateway_node",
            Self::EmergencyQueueDrain => "emergency_queue_drain",
            Self::LogOnly => "log_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Enumerates supported `WebhookStatus` values.
pub enum WebhookStatus {
    Pending,
    Delivered,
    Failed,
    Suppressed,
}

impl WebhookStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Suppressed => "suppressed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
/// Immutable record of one alert evaluation, including the webhook outcome.
pub struct Incident {
    pub id: String,
    pub alert_type: AlertKind,
    pub severity: AlertSeverity,
    pub issues: Vec<String>,
    pub subject_node_id: Option<String>,
    pub action: CorrectiveAction,
    pub timestamp: u64,
    pub webhook_status: WebhookStatus,
}
