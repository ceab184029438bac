//! Message record and dead-letter data model.
//!
//! A `MessageRecord` is the unit of work flowing through the pipeline; its
//! `sms_id` identifies it for the whole lifetime including the Dead Letter
//! Office. Dead letters serialize with the body replaced by a sentinel so no
//! ciphertext or plaintext ever reaches an operator surface.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

/// Sentinel substituted for the body in every serialized dead letter.
pub const REDACTED_BODY: &str = "[ENCRYPTED]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Enumerates supported `MessagePriority` values.
pub enum MessagePriority {
    High,
    Normal,
    Low,
}

impl MessagePriority {
    /// Bucket index used by the queue: high drains first.
    pub fn bucket(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    /// Lenient parse used at the ingest boundary; unknown labels fall back to
    /// normal priority.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Self::High,
            "low" => Self::Low,
            _ => Self::Normal,
        }
    }
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Public struct `MessageRecord` used across relay components.
pub struct MessageRecord {
    pub sms_id: String,
    pub sender: String,
    pub body: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub created_at: u64,
}

#[derive(Debug, Clone)]
/// A record that exhausted its retry budget, retained for manual recovery.
///
/// The in-memory copy keeps the (still encrypted) body so a manual retry can
/// re-deliver; serialization always goes through the redacted snapshot.
pub struct DeadLetter {
    pub record: MessageRecord,
    pub dead_lettered_at: u64,
    pub expires_at: u64,
}

impl DeadLetter {
    pub fn sms_id(&self) -> &str {
        &self.record.sms_id
    }

    /// Operator-facing view with the body redacted.
    pub fn snapshot(&self) -> DeadLetterSnapshot {
        DeadLetterSnapshot {
            sms_id: self.record.sms_id.clone(),
            sender: self.record.sender.clone(),
            body: REDACTED_BODY.to_string(),
            timestamp: self.record.timestamp,
            node_id: self.record.node_id.clone(),
            retry_count: self.record.retry_count,
            last_error: self.record.last_error.clone(),
            dead_lettered_at: self.dead_lettered_at,
            expires_at: self.expires_at,
        }
    }
}

// Serializing a dead letter directly must never expose the stored body, so
// the impl delegates to the redacted snapshot.
impl Serialize for DeadLetter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let view = self.snapshot();
        let mut state = serializer.serialize_struct("DeadLetter", 9)?;
        state.serialize_field("sms_id", &view.sms_id)?;
        state.serialize_field("sender", &view.sender)?;
        state.serialize_field("body", &view.body)?;
        state.serialize_field("timestamp", &view.timestamp)?;
        state.serialize_field("node_id", &view.node_id)?;
        state.serialize_field("retry_count", &view.retry_count)?;
        state.serialize_field("last_error", &view.last_error)?;
        state.serialize_field("dead_lettered_at", &view.dead_lettered_at)?;
        state.serialize_field("expires_at", &view.expires_at)?;
        state.end()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
/// Public struct `DeadLetterSnapshot` used across relay components.
pub struct DeadLetterSnapshot {
    pub sms_id: String,
    pub sender: String,
    pub body: String,
    pub timestamp: u64,
    pub node_id: String,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub dead_lettered_at: u64,
    pub expires_at: u64,
}
