//! Telegram Bot API dispatcher, the primary delivery channel.
//!
//! Applies a process-wide send-permit semaphore sized to the Bot API per-chat
//! budget, decrypts the body immediately before the POST, and classifies the
//! response into the queue's outcome classes. 429 responses carry the
//! server-provided `retry_after` when present; otherwise the dispatcher falls
//! back to its own exponential schedule.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::{MessageEnvelope, MessageRecord};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::{Dispatcher, DispatchOutcome, INVALID_TOKEN_REASON};

const DEFAULT_SEND_PERMITS: usize = 30;
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const RATE_LIMIT_BACKOFF_BASE_SECS: u64 = 1;
const RATE_LIMIT_BACKOFF_CAP_SECS: u64 = 60;

#[derive(Debug, Clone)]
/// Public struct `TelegramDispatcherConfig` used across relay components.
pub struct TelegramDispatcherConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub api_base: String,
    pub http_timeout: Duration,
    pub send_permits: usize,
}

impl Default for TelegramDispatcherConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            api_base: "https://api.telegram.org".to_string(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            send_permits: DEFAULT_SEND_PERMITS,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
/// Counter snapshot exposed through `/api/metrics`.
pub struct TelegramCounters {
    pub total_sent: u64,
    pub total_rate_limited: u64,
    pub total_errors: u64,
    pub connected: bool,
    pub rate_limited: bool,
}

/// Public struct `TelegramDispatcher` used across relay components.
pub struct TelegramDispatcher {
    config: TelegramDispatcherConfig,
    client: reqwest::Client,
    envelope: Option<Arc<MessageEnvelope>>,
    permits: Semaphore,
    total_sent: AtomicU64,
    total_rate_limited: AtomicU64,
    total_errors: AtomicU64,
    connected: AtomicBool,
    rate_limited: AtomicBool,
    consecutive_rate_limits: AtomicU32,
}

impl TelegramDispatcher {
    pub fn new(
        config: TelegramDispatcherConfig,
        envelope: Option<Arc<MessageEnvelope>>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        let permits = Semaphore::new(config.send_permits.max(1));
        Ok(Self {
            config,
            client,
            envelope,
            permits,
            total_sent: AtomicU64::new(0),
            total_rate_limited: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            connected: AtomicBool::new(true),
            rate_limited: AtomicBool::new(false),
            consecutive_rate_limits: AtomicU32::new(0),
        })
    }

    pub fn counters(&self) -> TelegramCounters {
        TelegramCounters {
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_rate_limited: self.total_rate_limited.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            connected: self.connected.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }

    fn send_endpoint(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token
        )
    }

    fn render_text(record: &MessageRecord, plaintext: &str) -> String {
        format!(
            "*From:* `{}`\n*Time:* {}\n*Node:* {}\n\n{}\n\n_ID: {}_",
            record.sender, record.timestamp, record.node_id, plaintext, record.sms_id
        )
    }

    /// Delay for a 429 without a server-provided hint: 1s, 2s, 4s, ... 60s.
    fn fallback_rate_limit_delay(&self) -> Duration {
        let streak = self.consecutive_rate_limits.load(Ordering::Relaxed);
        let exponent = streak.saturating_sub(1).min(10);
        let secs = RATE_LIMIT_BACKOFF_BASE_SECS
            .saturating_mul(1u64 << exponent)
            .min(RATE_LIMIT_BACKOFF_CAP_SECS);
        Duration::from_secs(secs)
    }

    fn classify_rate_limit(&self, body: &Value, retry_after_header: Option<u64>) -> Duration {
        self.total_rate_limited.fetch_add(1, Ordering::Relaxed);
        self.rate_limited.store(true, Ordering::Relaxed);
        self.consecutive_rate_limits.fetch_add(1, Ordering::Relaxed);

        let from_body = body
            .pointer("/parameters/retry_after")
            .and_then(Value::as_u64);
        match from_body.or(retry_after_header) {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.fallback_rate_limit_delay(),
        }
    }

    fn note_success(&self) {
        self.total_sent.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.rate_limited.store(false, Ordering::Relaxed);
        self.consecutive_rate_limits.store(0, Ordering::Relaxed);
    }

    fn note_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl Dispatcher for TelegramDispatcher {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, record: &MessageRecord) -> DispatchOutcome {
        if self.config.bot_token.is_empty() || self.config.chat_id.is_empty() {
            return DispatchOutcome::Terminal("telegram: not configured".to_string());
        }

        let plaintext = match crate::resolve_plaintext(record, self.envelope.as_deref()) {
            Ok(plaintext) => plaintext,
            Err(error) => {
                tracing::warn!(sms_id = %record.sms_id, %error, "body decryption failed");
                return DispatchOutcome::Terminal(INVALID_TOKEN_REASON.to_string());
            }
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return DispatchOutcome::Transient("telegram: send permits closed".to_string())
            }
        };

        let payload = json!({
            "chat_id": self.config.chat_id,
            "text": Self::render_text(record, &plaintext),
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });
        let response = match self.client.post(self.send_endpoint()).json(&payload).send().await {
            Ok(response) => response,
            Err(error) => {
                self.note_error();
                let reason = if error.is_timeout() {
                    "telegram: request timeout".to_string()
                } else {
                    "telegram: transport error".to_string()
                };
                tracing::warn!(sms_id = %record.sms_id, reason, "telegram send failed");
                return DispatchOutcome::Transient(reason);
            }
        };

        let status = response.status();
        if status.is_success() {
            self.note_success();
            tracing::info!(sms_id = %record.sms_id, "telegram delivered");
            return DispatchOutcome::Delivered;
        }

        if status.as_u16() == 429 {
            let retry_after_header = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok());
            let body = response.json::<Value>().await.unwrap_or(Value::Null);
            let delay = self.classify_rate_limit(&body, retry_after_header);
            tracing::warn!(
                sms_id = %record.sms_id,
                delay_secs = delay.as_secs(),
                "telegram rate limited"
            );
            return DispatchOutcome::RateLimited(delay);
        }

        self.note_error();
        let reason = format!("telegram: HTTP {}", status.as_u16());
        tracing::warn!(sms_id = %record.sms_id, reason, "telegram send rejected");
        if status.is_client_error() {
            DispatchOutcome::Terminal(reason)
        } else {
            DispatchOutcome::Transient(reason)
        }
    }
}
