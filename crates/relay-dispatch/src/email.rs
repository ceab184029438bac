//! SMTP email dispatcher, the fallback delivery channel.
//!
//! Opens one SMTP session per call; fallback traffic is light enough that
//! pooling buys nothing. Permanent SMTP rejections (auth failures, 5xx) are
//! terminal; 4xx responses and connection problems are transient.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use relay_core::{MessageEnvelope, MessageRecord};
use serde::Serialize;

use crate::{Dispatcher, DispatchOutcome, INVALID_TOKEN_REASON};

const DEFAULT_SMTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
/// Public struct `EmailDispatcherConfig` used across relay components.
pub struct EmailDispatcherConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    pub from: String,
    pub to: String,
    pub timeout: Duration,
}

impl Default for EmailDispatcherConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 587,
            user: String::new(),
            pass: String::new(),
            from: String::new(),
            to: String::new(),
            timeout: DEFAULT_SMTP_TIMEOUT,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
/// Counter snapshot exposed through `/api/metrics`.
pub struct EmailCounters {
    pub total_sent: u64,
    pub total_errors: u64,
}

/// Public struct `EmailDispatcher` used across relay components.
pub struct EmailDispatcher {
    config: EmailDispatcherConfig,
    envelope: Option<Arc<MessageEnvelope>>,
    total_sent: AtomicU64,
    total_errors: AtomicU64,
}

impl EmailDispatcher {
    pub fn new(config: EmailDispatcherConfig, envelope: Option<Arc<MessageEnvelope>>) -> Self {
        Self {
            config,
            envelope,
            total_sent: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
        }
    }

    pub fn counters(&self) -> EmailCounters {
        EmailCounters {
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
        }
    }

    fn is_configured(&self) -> bool {
        !self.config.host.is_empty() && !self.config.from.is_empty() && !self.config.to.is_empty()
    }

    fn render_subject(record: &MessageRecord) -> String {
        format!("OTP from {}", record.sender)
    }

    fn render_body(record: &MessageRecord, plaintext: &str) -> String {
        format!(
            "From: {}\nTime: {}\nNode: {}\n\n{}\n\nSMS ID: {}\n",
            record.sender, record.timestamp, record.node_id, plaintext, record.sms_id
        )
    }

    fn build_message(&self, record: &MessageRecord, plaintext: &str) -> Result<Message, String> {
        let from = self
            .config
            .from
            .parse::<Mailbox>()
            .map_err(|_| "email: invalid from address".to_string())?;
        let to = self
            .config
            .to
            .parse::<Mailbox>()
            .map_err(|_| "email: invalid recipient address".to_string())?;
        Message::builder()
            .from(from)
            .to(to)
            .subject(Self::render_subject(record))
            .body(Self::render_body(record, plaintext))
            .map_err(|_| "email: message build failed".to_string())
    }

    fn build_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, String> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
            .map_err(|_| "email: invalid SMTP host".to_string())?
            .port(self.config.port)
            .timeout(Some(self.config.timeout));
        if !self.config.user.is_empty() {
            builder = builder.credentials(Credentials::new(
                self.config.user.clone(),
                self.config.pass.clone(),
            ));
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl Dispatcher for EmailDispatcher {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, record: &MessageRecord) -> DispatchOutcome {
        if !self.is_configured() {
            return DispatchOutcome::Terminal("email: not configured".to_string());
        }

        let plaintext = match crate::resolve_plaintext(record, self.envelope.as_deref()) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                tracing::warn!(sms_id = %record.sms_id, %error, "body decryption failed");
                return DispatchOutcome::Terminal(INVALID_TOKEN_REASON.to_string());
            }
        };

        let message = match self.build_message(record, &plaintext) {
            Ok(message) => message,
            Err(reason) => {
                self.total_errors.fetch_add(1, Ordering::Relaxed);
                return DispatchOutcome::Terminal(reason);
            }
        };
        let transport = match self.build_transport() {
            Ok(transport) => transport,
            Err(reason) => {
                self.total_errors.fetch_add(1, Ordering::Relaxed);
                return DispatchOutcome::Terminal(reason);
            }
        };

        match transport.send(message).await {
            Ok(_) => {
                self.total_sent.fetch_add(1, Ordering::Relaxed);
                tracing::info!(sms_id = %record.sms_id, "email delivered");
                DispatchOutcome::Delivered
            }
            Err(error) => {
                self.total_errors.fetch_add(1, Ordering::Relaxed);
                let reason = format!("email: smtp {}", smtp_error_label(&error));
                tracing::warn!(sms_id = %record.sms_id, reason, "email send failed");
                if error.is_permanent() {
                    DispatchOutcome::Terminal(reason)
                } else {
                    DispatchOutcome::Transient(reason)
                }
            }
        }
    }
}

fn smtp_error_label(error: &lettre::transport::smtp::Error) -> &'static str {
    if error.is_permanent() {
        "permanent rejection"
    } else if error.is_transient() {
        "transient rejection"
    } else if error.is_timeout() {
        "timeout"
    } else {
        "connection error"
    }
}

#[cfg(test)]
mod tests {
    use relay_core::MessagePriority;

    use super::*;

    fn sample_record() -> MessageRecord {
        MessageRecord {
            sms_id: "sms-00002".to_string(),
            sender: "+919876500002".to_string(),
            body: "654321".to_string(),
            timestamp: 1_700_000_000,
            node_id: "edge-02".to_string(),
            priority: MessagePriority::Normal,
            encrypted: false,
            retry_count: 0,
            last_error: None,
            created_at: 1_700_000_000,
        }
    }

    fn configured() -> EmailDispatcherConfig {
        EmailDispatcherConfig {
            host: "smtp.example.com".to_string(),
            from: "relay@example.com".to_string(),
            to: "ops@example.com".to_string(),
            ..EmailDispatcherConfig::default()
        }
    }

    #[tokio::test]
    async fn functional_unconfigured_dispatcher_is_terminal() {
        let dispatcher = EmailDispatcher::new(EmailDispatcherConfig::default(), None);
        let outcome = dispatcher.send(&sample_record()).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Terminal("email: not configured".to_string())
        );
    }

    #[tokio::test]
    async fn functional_malformed_recipient_is_terminal() {
        let mut config = configured();
        config.to = "not an address".to_string();
        let dispatcher = EmailDispatcher::new(config, None);
        let outcome = dispatcher.send(&sample_record()).await;
        assert_eq!(
            outcome,
            DispatchOutcome::Terminal("email: invalid recipient address".to_string())
        );
        assert_eq!(dispatcher.counters().total_errors, 1);
    }

    #[test]
    fn unit_subject_and_body_rendering() {
        let record = sample_record();
        assert_eq!(
            EmailDispatcher::render_subject(&record),
            "OTP from +919876500002"
        );
        let body = EmailDispatcher::render_body(&record, "654321");
        assert!(body.contains("654321"));
        assert!(body.contains("SMS ID: sms-00002"));
        assert!(body.contains("Node: edge-02"));
    }

    #[test]
    fn unit_message_builds_with_valid_addresses() {
        let dispatcher = EmailDispatcher::new(configured(), None);
        let record = sample_record();
        let message = dispatcher.build_message(&record, "654321");
        assert!(message.is_ok());
    }
}
