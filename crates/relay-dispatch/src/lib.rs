//! Delivery channels for the relay pipeline.
//!
//! Both dispatchers classify failures into the outcome classes the queue
//! branches on: rate limits are honored with the downstream-provided delay,
//! transient errors are retried against the fallback, terminal errors skip
//! straight to it. Plaintext exists only on the call stack of a send.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use relay_core::{envelope, MessageEnvelope, MessageRecord};

pub mod email;
pub mod telegram;

pub use email::{EmailDispatcher, EmailDispatcherConfig};
pub use telegram::{TelegramDispatcher, TelegramDispatcherConfig};

/// Failure reason recorded when a body cannot be decrypted; the queue moves
/// such records straight to the Dead Letter Office.
pub const INVALID_TOKEN_REASON: &str = "invalid_token";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Enumerates supported `DispatchOutcome` values.
pub enum DispatchOutcome {
    Delivered,
    RateLimited(Duration),
    Transient(String),
    Terminal(String),
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// Failure reason, if this outcome carries one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Delivered | Self::RateLimited(_) => None,
            Self::Transient(reason) | Self::Terminal(reason) => Some(reason),
        }
    }
}

#[async_trait]
/// Trait contract for `Dispatcher` behavior.
pub trait Dispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, record: &MessageRecord) -> DispatchOutcome;
}

/// Resolve the plaintext body of a record just before a network send.
///
/// Tokens require a configured envelope and must authenticate; an
/// `encrypted=true` body without the token prefix is the known edge-firmware
/// base64 quirk and passes through as plaintext with a one-time warning.
pub fn resolve_plaintext(
    record: &MessageRecord,
    message_envelope: Option<&MessageEnvelope>,
) -> Result<String> {
    if !record.encrypted {
        return Ok(record.body.clone());
    }
    if !record.body.starts_with(envelope::TOKEN_PREFIX) {
        envelope::note_plaintext_fallback(&record.node_id);
        return Ok(record.body.clone());
    }
    let Some(message_envelope) = message_envelope else {
        bail!("invalid token: no encryption key configured");
    };
    message_envelope.decrypt(&record.body)
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine as _;
    use relay_core::MessagePriority;

    use super::*;

    fn record_with_body(body: &str, encrypted: bool) -> MessageRecord {
        MessageRecord {
            sms_id: "sms-00001".to_string(),
            sender: "+919876500001".to_string(),
            body: body.to_string(),
            timestamp: 1_700_000_000,
            node_id: "edge-01".to_string(),
            priority: MessagePriority::Normal,
            encrypted,
            retry_count: 0,
            last_error: None,
            created_at: 1_700_000_000,
        }
    }

    fn test_envelope() -> MessageEnvelope {
        MessageEnvelope::new(&BASE64_STANDARD.encode([3u8; 32])).expect("envelope")
    }

    #[test]
    fn unit_plain_body_passes_through() {
        let record = record_with_body("123456", false);
        let plaintext = resolve_plaintext(&record, None).expect("plaintext");
        assert_eq!(plaintext, "123456");
    }

    #[test]
    fn unit_token_decrypts_with_envelope() {
        let envelope = test_envelope();
        let token = envelope.encrypt("123456").expect("encrypt");
        let record = record_with_body(&token, true);
        let plaintext = resolve_plaintext(&record, Some(&envelope)).expect("plaintext");
        assert_eq!(plaintext, "123456");
    }

    #[test]
    fn unit_token_without_envelope_fails() {
        let envelope = test_envelope();
        let token = envelope.encrypt("123456").expect("encrypt");
        let record = record_with_body(&token, true);
        let error = resolve_plaintext(&record, None).expect_err("must fail");
        assert!(error.to_string().contains("invalid token"));
    }

    #[test]
    fn unit_encrypted_flag_without_prefix_falls_back_to_plaintext() {
        let record = record_with_body("aGVsbG8=", true);
        let plaintext = resolve_plaintext(&record, Some(&test_envelope())).expect("plaintext");
        assert_eq!(plaintext, "aGVsbG8=");
    }

    #[test]
    fn unit_outcome_reason_accessor() {
        assert_eq!(DispatchOutcome::Delivered.reason(), None);
        assert_eq!(
            DispatchOutcome::Transient("telegram: HTTP 500".to_string()).reason(),
            Some("telegram: HTTP 500")
        );
        assert!(DispatchOutcome::Terminal("telegram: HTTP 403".to_string()).is_terminal());
    }
}
