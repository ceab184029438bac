//! Environment-driven configuration.
//!
//! Every tunable comes from the process environment; malformed values are
//! configuration errors surfaced at startup, never silently defaulted.

use anyhow::{bail, Context, Result};

const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";

#[derive(Debug, Clone)]
/// Public struct `RelayConfig` used across relay components.
pub struct RelayConfig {
    pub telegram_bot_token: String,
    pub telegram_chat_id: String,
    pub telegram_api_base: String,
    pub encryption_key: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_pass: String,
    pub smtp_from: String,
    pub smtp_to: String,
    pub webhook_url: String,
    pub webhook_secret: String,
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub max_retries: u32,
    pub dlo_ttl_sec: u64,
    pub dlo_max: usize,
    pub cto_cooldown_sec: u64,
    pub heartbeat_timeout_sec: u64,
    pub battery_low_mv: i64,
    pub wifi_weak_dbm: i64,
    pub dlo_growth_threshold: usize,
    pub queue_drain_grace_sec: u64,
    pub http_bind: String,
}

impl RelayConfig {
    /// Load the full configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            telegram_bot_token: env_string("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_string("TELEGRAM_CHAT_ID"),
            telegram_api_base: env_string_or("TELEGRAM_API_BASE", DEFAULT_TELEGRAM_API_BASE),
            encryption_key: env_string("FERNET_ENCRYPTION_KEY"),
            smtp_host: env_string("SMTP_HOST"),
            smtp_port: env_parse("SMTP_PORT", 587)?,
            smtp_user: env_string("SMTP_USER"),
            smtp_pass: env_string("SMTP_PASS"),
            smtp_from: env_string("SMTP_FROM"),
            smtp_to: env_string("SMTP_TO"),
            webhook_url: env_string("N8N_WEBHOOK_URL"),
            webhook_secret: env_string("N8N_WEBHOOK_SECRET"),
            queue_capacity: env_parse("QUEUE_CAPACITY", 10_000)?,
            worker_count: env_parse("WORKER_COUNT", 3)?,
            max_retries: env_parse("MAX_RETRIES", 5)?,
            dlo_ttl_sec: env_parse("DLO_TTL_SEC", 72 * 3_600)?,
            dlo_max: env_parse("DLO_MAX", 1_000)?,
            cto_cooldown_sec: env_parse("CTO_COOLDOWN_SEC", 300)?,
            heartbeat_timeout_sec: env_parse("HEARTBEAT_TIMEOUT_SEC", 120)?,
            battery_low_mv: env_parse("BATTERY_LOW_MV", 3_300)?,
            wifi_weak_dbm: env_parse("WIFI_WEAK_DBM", -100)?,
            dlo_growth_threshold: env_parse("DLO_GROWTH_THRESHOLD", 10)?,
            queue_drain_grace_sec: env_parse("QUEUE_DRAIN_GRACE_SEC", 10)?,
            http_bind: env_string_or("HTTP_BIND", DEFAULT_HTTP_BIND),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than 0");
        }
        if self.worker_count == 0 {
            bail!("WORKER_COUNT must be greater than 0");
        }
        if self.dlo_max == 0 {
            bail!("DLO_MAX must be greater than 0");
        }
        Ok(())
    }
}

fn env_string(name: &str) -> String {
    std::env::var(name).unwrap_or_default().trim().to_string()
}

fn env_string_or(name: &str, default: &str) -> String {
    let value = env_string(name);
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("environment variable {name} has an invalid value")),
        _ => Ok(default),
    }
}
