//! Shared foundations for the OTP relay: the message data model, environment
//! configuration, time helpers, and the payload encryption envelope used to
//! keep plaintext OTPs out of every serialized structure.

pub mod config;
pub mod envelope;
pub mod record;
pub mod telemetry;
pub mod time_utils;

pub use config::RelayConfig;
pub use envelope::MessageEnvelope;
pub use record::{DeadLetter, DeadLetterSnapshot, MessagePriority, MessageRecord, REDACTED_BODY};
pub use telemetry::{
    Alert, AlertKind, AlertSeverity, CorrectiveAction, Incident, NodeState, NodeTelemetry,
    WebhookStatus,
};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_expired_unix};
