//! Operational self-protection for the relay: the health monitor aggregates
//! edge-node telemetry and external gauges into alerts, and the CTO-Agent
//! turns alerts into signed webhook calls with per-kind cooldowns.

pub mod agent;
pub mod health;

pub use agent::{sign_webhook_payload, AgentMetrics, CtoAgent, CtoAgentConfig};
pub use health::{HealthMonitor, HealthSnapshot, HealthThresholds, NodeReport};
