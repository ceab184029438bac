//! Application root: builds every component, connects the event channels
//! that break the queue/DLO/agent cycles, and drives the maintenance timers.
//!
//! Ownership is explicit: this registry hands references to the HTTP facade;
//! there are no process-wide singletons.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use relay_core::{Alert, MessageEnvelope, RelayConfig};
use relay_dispatch::{
    Dispatcher, EmailDispatcher, EmailDispatcherConfig, TelegramDispatcher,
    TelegramDispatcherConfig,
};
use relay_monitor::{CtoAgent, CtoAgentConfig, HealthMonitor, HealthThresholds};
use relay_queue::{DeadLetterOffice, DloConfig, MessageQueue, QueueConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const DLO_PRUNE_INTERVAL: Duration = Duration::from_secs(60);
const HEALTH_EVAL_INTERVAL: Duration = Duration::from_secs(15);

/// Public struct `RelayApp` used across relay components.
pub struct RelayApp {
    pub config: RelayConfig,
    pub queue: Arc<MessageQueue>,
    pub dlo: Arc<DeadLetterOffice>,
    pub monitor: Arc<HealthMonitor>,
    pub agent: Arc<CtoAgent>,
    pub telegram: Arc<TelegramDispatcher>,
    pub email: Arc<EmailDispatcher>,
    alert_tx: mpsc::UnboundedSender<Alert>,
    alert_rx: Mutex<Option<mpsc::UnboundedReceiver<Alert>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayApp {
    /// Build the component registry from configuration. Nothing is spawned
    /// until [`start`](Self::start).
    pub fn build(config: RelayConfig) -> Result<Arc<Self>> {
        let envelope = if config.encryption_key.is_empty() {
            tracing::warn!("no encryption key configured; bodies are handled as plaintext");
            None
        } else {
            Some(Arc::new(
                MessageEnvelope::new(&config.encryption_key)
                    .context("FERNET_ENCRYPTION_KEY is not a valid base64 256-bit key")?,
            ))
        };

        let telegram = Arc::new(
            TelegramDispatcher::new(
                TelegramDispatcherConfig {
                    bot_token: config.telegram_bot_token.clone(),
                    chat_id: config.telegram_chat_id.clone(),
                    api_base: config.telegram_api_base.clone(),
                    ..TelegramDispatcherConfig::default()
                },
                envelope.clone(),
            )
            .context("failed to build telegram dispatcher")?,
        );
        let email = Arc::new(EmailDispatcher::new(
            EmailDispatcherConfig {
                host: config.smtp_host.clone(),
                port: config.smtp_port,
                user: config.smtp_user.clone(),
                pass: config.smtp_pass.clone(),
                from: config.smtp_from.clone(),
                to: config.smtp_to.clone(),
                ..EmailDispatcherConfig::default()
            },
            envelope,
        ));

        let dlo = Arc::new(DeadLetterOffice::new(DloConfig {
            ttl_sec: config.dlo_ttl_sec,
            max_entries: config.dlo_max,
        }));
        let queue = MessageQueue::new(
            QueueConfig {
                capacity: config.queue_capacity,
                max_retries: config.max_retries,
                drain_grace: Duration::from_secs(config.queue_drain_grace_sec),
                ..QueueConfig::default()
            },
            Arc::clone(&telegram) as Arc<dyn Dispatcher>,
            Arc::clone(&email) as Arc<dyn Dispatcher>,
            Arc::clone(&dlo),
        );

        let monitor = Arc::new(HealthMonitor::new(HealthThresholds {
            heartbeat_timeout_sec: config.heartbeat_timeout_sec,
            battery_low_mv: config.battery_low_mv,
            wifi_weak_dbm: config.wifi_weak_dbm,
            dlo_growth_threshold: config.dlo_growth_threshold,
        }));
        let agent = Arc::new(
            CtoAgent::new(CtoAgentConfig {
                webhook_url: config.webhook_url.clone(),
                webhook_secret: config.webhook_secret.clone(),
                cooldown: Duration::from_secs(config.cto_cooldown_sec),
                ..CtoAgentConfig::default()
            })
            .context("failed to build cto-agent")?,
        );

        let (alert_tx, alert_rx) = mpsc::unbounded_channel();

        // DLO growth notifies the agent without a direct dependency: capture
        // updates the gauge, then whatever alerts now hold are published.
        {
            let monitor = Arc::clone(&monitor);
            let alert_tx = alert_tx.clone();
            dlo.set_on_capture(Box::new(move |size| {
                monitor.set_dlo_gauge(size);
                for alert in monitor.evaluate() {
                    let _ = alert_tx.send(alert);
                }
            }));
        }

        Ok(Arc::new(Self {
            config,
            queue,
            dlo,
            monitor,
            agent,
            telegram,
            email,
            alert_tx,
            alert_rx: Mutex::new(Some(alert_rx)),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn workers, the alert pump, and the maintenance timer.
    pub fn start(self: &Arc<Self>) {
        self.queue.start(self.config.worker_count);

        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };

        let alert_rx = match self.alert_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut alert_rx) = alert_rx {
            let agent = Arc::clone(&self.agent);
            tasks.push(tokio::spawn(async move {
                while let Some(alert) = alert_rx.recv().await {
                    agent.handle(alert).await;
                }
            }));
        }

        let app = Arc::clone(self);
        tasks.push(tokio::spawn(async move {
            app.maintenance_loop().await;
        }));
        tracing::info!("relay application started");
    }

    /// Publish an alert to the agent pump.
    pub fn publish_alert(&self, alert: Alert) {
        let _ = self.alert_tx.send(alert);
    }

    /// Push current queue/DLO gauges into the monitor and publish whatever
    /// alerts the rules now produce.
    pub fn refresh_health(&self) {
        self.monitor
            .set_queue_gauge(self.queue.depth(), self.queue.capacity());
        self.monitor.set_dlo_gauge(self.dlo.len());
        for alert in self.monitor.evaluate() {
            self.publish_alert(alert);
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut prune_tick = tokio::time::interval(DLO_PRUNE_INTERVAL);
        let mut health_tick = tokio::time::interval(HEALTH_EVAL_INTERVAL);
        // The first tick of an interval fires immediately; consume both so
        // the loop starts on the steady cadence.
        prune_tick.tick().await;
        health_tick.tick().await;
        loop {
            tokio::select! {
                _ = prune_tick.tick() => {
                    self.dlo.prune_expired();
                }
                _ = health_tick.tick() => {
                    self.refresh_health();
                }
            }
        }
    }

    /// Drain the queue and stop the background tasks.
    pub async fn shutdown(&self) {
        self.queue.stop().await;
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = match self.tasks.lock() {
                Ok(tasks) => tasks,
                Err(poisoned) => poisoned.into_inner(),
            };
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        tracing::info!("relay application stopped");
    }
}
