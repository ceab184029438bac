//! Per-node health state and alert evaluation.
//!
//! The monitor owns the telemetry map and two external gauges (queue load,
//! DLO size) pushed in by the owning components. `evaluate` is a pure
//! function of current state; it performs no I/O and publishes nothing —
//! the caller forwards the returned alerts to the CTO-Agent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use relay_core::{
    current_unix_timestamp, Alert, AlertKind, AlertSeverity, NodeState, NodeTelemetry,
};
use serde::Serialize;

const QUEUE_NEAR_FULL_RATIO: f64 = 0.9;
const WDT_STORM_DELTA: u64 = 5;
const WDT_WINDOW_SEC: u64 = 3_600;

#[derive(Debug, Clone)]
/// Public struct `HealthThresholds` used across relay components.
pub struct HealthThresholds {
    pub heartbeat_timeout_sec: u64,
    pub battery_low_mv: i64,
    pub wifi_weak_dbm: i64,
    pub dlo_growth_threshold: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            heartbeat_timeout_sec: 120,
            battery_low_mv: 3_300,
            wifi_weak_dbm: -100,
            dlo_growth_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
/// Per-node entry of the health report.
pub struct NodeReport {
    pub node_id: String,
    pub battery_mv: i64,
    pub battery_percent: u8,
    pub wifi_rssi: i64,
    pub wifi_state: u8,
    pub reconnects: u64,
    pub wdt_resets: u64,
    pub uptime_sec: u64,
    pub heap_free: u64,
    pub last_seen: u64,
    pub last_seen_ago_sec: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
/// Public struct `HealthSnapshot` used across relay components.
pub struct HealthSnapshot {
    pub status: &'static str,
    pub timestamp: u64,
    pub issues: Vec<String>,
    pub nodes: Vec<NodeReport>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub queue_utilization_percent: f64,
    pub dlo_size: usize,
}

struct WdtBaseline {
    resets_at_window_start: u64,
    window_started: u64,
}

#[derive(Default)]
struct MonitorState {
    nodes: HashMap<String, NodeState>,
    wdt: HashMap<String, WdtBaseline>,
}

/// Public struct `HealthMonitor` used across relay components.
pub struct HealthMonitor {
    thresholds: HealthThresholds,
    state: RwLock<MonitorState>,
    queue_depth: AtomicUsize,
    queue_capacity: AtomicUsize,
    dlo_size: AtomicUsize,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthThresholds) -> Self {
        Self {
            thresholds,
            state: RwLock::new(MonitorState::default()),
            queue_depth: AtomicUsize::new(0),
            queue_capacity: AtomicUsize::new(0),
            dlo_size: AtomicUsize::new(0),
        }
    }

    /// Fold a telemetry sample into the node map.
    pub fn ingest(&self, mut sample: NodeTelemetry) {
        let now = current_unix_timestamp();
        sample.received_at = now;
        let node_id = sample.node_id.clone();
        let wdt_resets = sample.wdt_resets;

        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !state.nodes.contains_key(&node_id) {
            tracing::info!(node_id, "new edge node registered");
        }
        state.nodes.insert(
            node_id.clone(),
            NodeState {
                telemetry: sample,
                last_seen: now,
            },
        );

        // Roll the watchdog window forward when it ages out, so storms are
        // measured against a recent baseline rather than boot-time counts.
        let baseline = state.wdt.entry(node_id).or_insert(WdtBaseline {
            resets_at_window_start: wdt_resets,
            window_started: now,
        });
        if now.saturating_sub(baseline.window_started) > WDT_WINDOW_SEC {
            baseline.resets_at_window_start = wdt_resets;
            baseline.window_started = now;
        }
    }

    /// Gauges owned by other components, pushed in for evaluation.
    pub fn set_queue_gauge(&self, depth: usize, capacity: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
        self.queue_capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn set_dlo_gauge(&self, size: usize) {
        self.dlo_size.store(size, Ordering::Relaxed);
    }

    /// Evaluate every rule against current state.
    pub fn evaluate(&self) -> Vec<Alert> {
        let now = current_unix_timestamp();
        let mut alerts = Vec::new();

        {
            let state = match self.state.read() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            for (node_id, node) in &state.nodes {
                if node.is_stale(now, self.thresholds.heartbeat_timeout_sec) {
                    alerts.push(Alert {
                        kind: AlertKind::HeartbeatTimeout,
                        severity: AlertSeverity::Critical,
                        issues: vec![format!(
                            "node {node_id}: heartbeat timeout ({}s ago)",
                            now.saturating_sub(node.last_seen)
                        )],
                        subject_node_id: Some(node_id.clone()),
                    });
                    // A silent node's last telemetry is stale by definition;
                    // skip the per-sample rules until it reports again.
                    continue;
                }
                if node.telemetry.battery_mv < self.thresholds.battery_low_mv {
                    alerts.push(Alert {
                        kind: AlertKind::LowBattery,
                        severity: AlertSeverity::Warning,
                        issues: vec![format!(
                            "node {node_id}: battery low ({} mV, {}%)",
                            node.telemetry.battery_mv,
                            node.telemetry.battery_percent()
                        )],
                        subject_node_id: Some(node_id.clone()),
                    });
                }
                if node.telemetry.wifi_rssi < self.thresholds.wifi_weak_dbm
                    && node.telemetry.wifi_rssi > -127
                {
                    alerts.push(Alert {
                        kind: AlertKind::WeakSignal,
                        severity: AlertSeverity::Warning,
                        issues: vec![format!(
                            "node {node_id}: signal weak ({} dBm)",
                            node.telemetry.wifi_rssi
                        )],
                        subject_node_id: Some(node_id.clone()),
                    });
                }
                if let Some(baseline) = state.wdt.get(node_id) {
                    let delta = node
                        .telemetry
                        .wdt_resets
                        .saturating_sub(baseline.resets_at_window_start);
                    if delta > WDT_STORM_DELTA {
                        alerts.push(Alert {
                            kind: AlertKind::WdtStorm,
                            severity: AlertSeverity::Warning,
                            issues: vec![format!(
                                "node {node_id}: {delta} watchdog resets within the last hour"
                            )],
                            subject_node_id: Some(node_id.clone()),
                        });
                    }
                }
            }
        }

        let depth = self.queue_depth.load(Ordering::Relaxed);
        let capacity = self.queue_capacity.load(Ordering::Relaxed);
        if capacity > 0 && depth as f64 > QUEUE_NEAR_FULL_RATIO * capacity as f64 {
            alerts.push(Alert {
                kind: AlertKind::QueueNearFull,
                severity: AlertSeverity::Emergency,
                issues: vec![format!("queue near capacity ({depth}/{capacity})")],
                subject_node_id: None,
            });
        }

        let dlo_size = self.dlo_size.load(Ordering::Relaxed);
        if self.thresholds.dlo_growth_threshold > 0 && dlo_size >= self.thresholds.dlo_growth_threshold
        {
            alerts.push(Alert {
                kind: AlertKind::DloGrowth,
                severity: AlertSeverity::Warning,
                issues: vec![format!("dead letter office holds {dlo_size} records")],
                subject_node_id: None,
            });
        }

        alerts
    }

    /// Operator-facing report for `/api/health`.
    pub fn snapshot(&self) -> HealthSnapshot {
        let now = current_unix_timestamp();
        let alerts = self.evaluate();

        let nodes: Vec<NodeReport> = {
            let state = match self.state.read() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut nodes: Vec<NodeReport> = state
                .nodes
                .values()
                .map(|node| NodeReport {
                    node_id: node.telemetry.node_id.clone(),
                    battery_mv: node.telemetry.battery_mv,
                    battery_percent: node.telemetry.battery_percent(),
                    wifi_rssi: node.telemetry.wifi_rssi,
                    wifi_state: node.telemetry.wifi_state,
                    reconnects: node.telemetry.reconnects,
                    wdt_resets: node.telemetry.wdt_resets,
                    uptime_sec: node.telemetry.uptime_sec,
                    heap_free: node.telemetry.heap_free,
                    last_seen: node.last_seen,
                    last_seen_ago_sec: now.saturating_sub(node.last_seen),
                    stale: node.is_stale(now, self.thresholds.heartbeat_timeout_sec),
                })
                .collect();
            nodes.sort_by(|left, right| left.node_id.cmp(&right.node_id));
            nodes
        };

        let status = if nodes.is_empty() {
            "unknown"
        } else if alerts
            .iter()
            .any(|alert| alert.severity >= AlertSeverity::Critical)
        {
            "critical"
        } else if !alerts.is_empty() {
            "degraded"
        } else {
            "healthy"
        };

        let depth = self.queue_depth.load(Ordering::Relaxed);
        let capacity = self.queue_capacity.load(Ordering::Relaxed);
        let utilization = if capacity > 0 {
            (depth as f64 / capacity as f64 * 1_000.0).round() / 10.0
        } else {
            0.0
        };

        HealthSnapshot {
            status,
            timestamp: now,
            issues: alerts.into_iter().flat_map(|alert| alert.issues).collect(),
            nodes,
            queue_depth: depth,
            queue_capacity: capacity,
            queue_utilization_percent: utilization,
            dlo_size: self.dlo_size.load(Ordering::Relaxed),
        }
    }
}
