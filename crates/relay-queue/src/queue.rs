//! Bounded priority message queue with concurrent delivery workers.
//!
//! Three FIFO buckets scanned high-to-low give priority draining without a
//! heap. Capacity covers queued plus in-flight records, so the bounded-depth
//! invariant holds across re-insertions. Backoff and rate-limit waits run in
//! spawned timer tasks; a worker is never parked on a sleeping record.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use relay_core::{current_unix_timestamp, MessageRecord};
use relay_dispatch::{Dispatcher, DispatchOutcome};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::dlo::DeadLetterOffice;

const PRIORITY_BUCKETS: usize = 3;
const WORKER_IDLE_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
/// Public struct `QueueConfig` used across relay components.
pub struct QueueConfig {
    pub capacity: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub backoff_jitter: Duration,
    pub drain_grace: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            max_retries: 5,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(60),
            backoff_jitter: Duration::from_secs(1),
            drain_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `EnqueueOutcome` values.
pub enum EnqueueOutcome {
    Accepted,
    QueueFull,
    Duplicate,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
/// Counter snapshot exposed through `/api/metrics`.
pub struct QueueMetrics {
    pub total_enqueued: u64,
    pub total_delivered: u64,
    pub total_fallback_delivered: u64,
    pub total_failed: u64,
    pub current_depth: usize,
    pub in_flight: usize,
    pub capacity: usize,
    pub running: bool,
    pub consumers: usize,
}

#[derive(Default)]
struct QueueState {
    buckets: [VecDeque<MessageRecord>; PRIORITY_BUCKETS],
    queued_ids: HashSet<String>,
    in_flight_ids: HashSet<String>,
}

impl QueueState {
    fn depth(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    fn load(&self) -> usize {
        self.depth() + self.in_flight_ids.len()
    }

    fn contains(&self, sms_id: &str) -> bool {
        self.queued_ids.contains(sms_id) || self.in_flight_ids.contains(sms_id)
    }
}

/// Public struct `MessageQueue` used across relay components.
pub struct MessageQueue {
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    running: AtomicBool,
    primary: Arc<dyn Dispatcher>,
    fallback: Arc<dyn Dispatcher>,
    dlo: Arc<DeadLetterOffice>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    consumers: AtomicUsize,
    total_enqueued: AtomicU64,
    total_delivered: AtomicU64,
    total_fallback_delivered: AtomicU64,
    total_failed: AtomicU64,
}

impl MessageQueue {
    pub fn new(
        config: QueueConfig,
        primary: Arc<dyn Dispatcher>,
        fallback: Arc<dyn Dispatcher>,
        dlo: Arc<DeadLetterOffice>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            running: AtomicBool::new(false),
            primary,
            fallback,
            dlo,
            workers: Mutex::new(Vec::new()),
            consumers: AtomicUsize::new(0),
            total_enqueued: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            total_fallback_delivered: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
        })
    }

    /// Accept a record for delivery. Never blocks: a full queue is reported
    /// immediately so the caller can shed or buffer externally.
    pub fn enqueue(&self, mut record: MessageRecord) -> EnqueueOutcome {
        if !self.is_running() {
            return EnqueueOutcome::QueueFull;
        }

        let outcome = {
            let mut state = self.lock_state();
            if state.contains(&record.sms_id) {
                EnqueueOutcome::Duplicate
            } else if state.load() >= self.config.capacity {
                EnqueueOutcome::QueueFull
            } else {
                record.created_at = current_unix_timestamp();
                let bucket = record.priority.bucket();
                state.queued_ids.insert(record.sms_id.clone());
                tracing::info!(
                    sms_id = %record.sms_id,
                    sender = %record.sender,
                    priority = record.priority.as_str(),
                    depth = state.depth() + 1,
                    "record enqueued"
                );
                state.buckets[bucket].push_back(record);
                EnqueueOutcome::Accepted
            }
        };

        match outcome {
            EnqueueOutcome::Accepted => {
                self.total_enqueued.fetch_add(1, Ordering::Relaxed);
                self.notify.notify_one();
            }
            EnqueueOutcome::QueueFull => {
                tracing::warn!("enqueue refused: queue at capacity");
            }
            EnqueueOutcome::Duplicate => {}
        }
        outcome
    }

    /// Spawn the delivery workers.
    pub fn start(self: &Arc<Self>, n_workers: usize) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("queue already running");
            return;
        }
        let n_workers = n_workers.max(1);
        let mut workers = match self.workers.lock() {
            Ok(workers) => workers,
            Err(poisoned) => poisoned.into_inner(),
        };
        for worker_id in 0..n_workers {
            let queue = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                queue.worker_loop(worker_id).await;
            }));
        }
        self.consumers.store(n_workers, Ordering::Relaxed);
        tracing::info!(
            workers = n_workers,
            capacity = self.config.capacity,
            "message queue started"
        );
    }

    /// Stop accepting work and let workers finish their in-flight records.
    /// Returns once all workers have exited or the grace deadline elapses.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = match self.workers.lock() {
                Ok(workers) => workers,
                Err(poisoned) => poisoned.into_inner(),
            };
            workers.drain(..).collect()
        };

        let deadline = Instant::now() + self.config.drain_grace;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut handle).await.is_err() {
                handle.abort();
                tracing::warn!("worker did not drain within the grace deadline");
            }
        }
        self.consumers.store(0, Ordering::Relaxed);
        tracing::info!(remaining_depth = self.depth(), "message queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn depth(&self) -> usize {
        self.lock_state().depth()
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn metrics(&self) -> QueueMetrics {
        let (depth, in_flight) = {
            let state = self.lock_state();
            (state.depth(), state.in_flight_ids.len())
        };
        QueueMetrics {
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_fallback_delivered: self.total_fallback_delivered.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            current_depth: depth,
            in_flight,
            capacity: self.config.capacity,
            running: self.is_running(),
            consumers: self.consumers.load(Ordering::Relaxed),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Highest-priority record, FIFO within a bucket. Moves the id into the
    /// in-flight set.
    fn pull(&self) -> Option<MessageRecord> {
        let mut state = self.lock_state();
        for bucket in 0..PRIORITY_BUCKETS {
            if let Some(record) = state.buckets[bucket].pop_front() {
                state.queued_ids.remove(&record.sms_id);
                state.in_flight_ids.insert(record.sms_id.clone());
                return Some(record);
            }
        }
        None
    }

    /// Put a sleeping record back into its bucket. Internal re-insertions
    /// bypass the capacity check: the record already holds a capacity slot
    /// through the in-flight set.
    fn reinsert(&self, record: MessageRecord, front: bool) {
        {
            let mut state = self.lock_state();
            state.in_flight_ids.remove(&record.sms_id);
            state.queued_ids.insert(record.sms_id.clone());
            let bucket = record.priority.bucket();
            if front {
                state.buckets[bucket].push_front(record);
            } else {
                state.buckets[bucket].push_back(record);
            }
        }
        self.notify.notify_one();
    }

    fn resolve_in_flight(&self, sms_id: &str) {
        let mut state = self.lock_state();
        state.in_flight_ids.remove(sms_id);
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        tracing::debug!(worker_id, "worker started");
        loop {
            if !self.is_running() {
                break;
            }
            match self.pull() {
                Some(record) => self.process(record, worker_id).await,
                None => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(WORKER_IDLE_POLL) => {}
                    }
                }
            }
        }
        tracing::debug!(worker_id, "worker exited");
    }

    async fn process(self: &Arc<Self>, record: MessageRecord, worker_id: usize) {
        let primary_outcome = self.primary.send(&record).await;
        match primary_outcome {
            DispatchOutcome::Delivered => {
                self.complete_delivered(&record, false, worker_id);
            }
            DispatchOutcome::RateLimited(delay) => {
                // Never attempted downstream: back to the head of its bucket
                // without touching the retry budget.
                let delay = apply_rate_limit_jitter(delay);
                tracing::warn!(
                    worker_id,
                    sms_id = %record.sms_id,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited; scheduling head re-insert"
                );
                self.schedule_reinsert(record, delay, true);
            }
            ref primary_failure => {
                let primary_terminal = primary_failure.is_terminal();
                let primary_reason = primary_failure
                    .reason()
                    .unwrap_or("primary dispatch failed")
                    .to_string();
                let fallback_outcome = self.fallback.send(&record).await;
                match fallback_outcome {
                    DispatchOutcome::Delivered => {
                        self.complete_delivered(&record, true, worker_id);
                    }
                    fallback_failure => {
                        let reason = fallback_failure
                            .reason()
                            .map(str::to_string)
                            .unwrap_or(primary_reason);
                        if primary_terminal && fallback_failure.is_terminal() {
                            // Both channels rejected outright; retrying cannot
                            // help, capture immediately.
                            self.capture_dead_letter(record, reason, worker_id);
                        } else {
                            self.retry_or_dead_letter(record, reason, worker_id);
                        }
                    }
                }
            }
        }
    }

    fn complete_delivered(&self, record: &MessageRecord, via_fallback: bool, worker_id: usize) {
        self.resolve_in_flight(&record.sms_id);
        self.total_delivered.fetch_add(1, Ordering::Relaxed);
        if via_fallback {
            self.total_fallback_delivered.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!(
            worker_id,
            sms_id = %record.sms_id,
            channel = if via_fallback { "fallback" } else { "primary" },
            "record delivered"
        );
    }

    fn retry_or_dead_letter(self: &Arc<Self>, mut record: MessageRecord, reason: String, worker_id: usize) {
        record.retry_count += 1;
        record.last_error = Some(reason.clone());
        if record.retry_count < self.config.max_retries {
            let delay = self.retry_backoff(record.retry_count);
            tracing::warn!(
                worker_id,
                sms_id = %record.sms_id,
                retry = record.retry_count,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                reason,
                "delivery failed; scheduling tail re-insert"
            );
            self.schedule_reinsert(record, delay, false);
        } else {
            self.capture_dead_letter(record, reason, worker_id);
        }
    }

    fn capture_dead_letter(&self, record: MessageRecord, reason: String, worker_id: usize) {
        self.resolve_in_flight(&record.sms_id);
        self.total_failed.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            worker_id,
            sms_id = %record.sms_id,
            retries = record.retry_count,
            reason,
            "retries exhausted; handing off to dead letter office"
        );
        self.dlo.capture(record, Some(reason));
    }

    /// `min(base * 2^(retry-1) + U(0, jitter), cap)`; non-decreasing across
    /// the retry ladder ignoring jitter.
    fn retry_backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        let base_ms = self.config.backoff_base.as_millis() as u64;
        let scaled = base_ms.saturating_mul(1u64 << exponent);
        let jitter_ms = self.config.backoff_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        let cap_ms = self.config.backoff_cap.as_millis() as u64;
        Duration::from_millis(scaled.saturating_add(jitter).min(cap_ms))
    }

    /// The sleeping record keeps its capacity slot (it stays in the in-flight
    /// set); the worker returns to the pool immediately.
    fn schedule_reinsert(self: &Arc<Self>, record: MessageRecord, delay: Duration, front: bool) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.reinsert(record, front);
        });
    }
}

fn apply_rate_limit_jitter(delay: Duration) -> Duration {
    let base_ms = delay.as_millis() as u64;
    if base_ms == 0 {
        return delay;
    }
    // +/- 10% so a burst of limited workers does not stampede back together.
    let spread = (base_ms / 10).max(1);
    let low = base_ms.saturating_sub(spread);
    let high = base_ms.saturating_add(spread);
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}
