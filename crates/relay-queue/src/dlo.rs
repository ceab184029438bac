//! Dead Letter Office: bounded retention for records that exhausted their
//! delivery attempts.
//!
//! Letters keep the encrypted body in memory so a manual retry can re-deliver,
//! but every listed or serialized view is redacted. Capacity overflow evicts
//! the oldest letter; expiry is driven by the maintenance timer and by `list`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use relay_core::{current_unix_timestamp, DeadLetter, DeadLetterSnapshot, MessageRecord};
use serde::Serialize;

use crate::queue::{EnqueueOutcome, MessageQueue};

/// Observer invoked after each capture with the post-capture DLO size.
pub type CaptureObserver = Box<dyn Fn(usize) + Send + Sync>;

#[derive(Debug, Clone)]
/// Public struct `DloConfig` used across relay components.
pub struct DloConfig {
    pub ttl_sec: u64,
    pub max_entries: usize,
}

impl Default for DloConfig {
    fn default() -> Self {
        Self {
            ttl_sec: 72 * 3_600,
            max_entries: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported `DloRetryOutcome` values.
pub enum DloRetryOutcome {
    Requeued,
    NotFound,
    QueueRefused,
}

#[derive(Debug, Default, Clone, Serialize, PartialEq, Eq)]
/// Counter snapshot exposed through `/api/metrics`.
pub struct DloMetrics {
    pub total_captured: u64,
    pub total_retried: u64,
    pub total_purged: u64,
    pub total_overflow: u64,
    pub current_count: usize,
}

/// Public struct `DeadLetterOffice` used across relay components.
pub struct DeadLetterOffice {
    config: DloConfig,
    // Newest letters at the front; eviction pops from the back.
    letters: Mutex<VecDeque<DeadLetter>>,
    on_capture: Mutex<Option<CaptureObserver>>,
    total_captured: AtomicU64,
    total_retried: AtomicU64,
    total_purged: AtomicU64,
    total_overflow: AtomicU64,
}

impl DeadLetterOffice {
    pub fn new(config: DloConfig) -> Self {
        Self {
            config,
            letters: Mutex::new(VecDeque::new()),
            on_capture: Mutex::new(None),
            total_captured: AtomicU64::new(0),
            total_retried: AtomicU64::new(0),
            total_purged: AtomicU64::new(0),
            total_overflow: AtomicU64::new(0),
        }
    }

    /// Register the capture observer; called once at wiring time.
    pub fn set_on_capture(&self, observer: CaptureObserver) {
        if let Ok(mut slot) = self.on_capture.lock() {
            *slot = Some(observer);
        }
    }

    /// Retain a record that exhausted its retries.
    ///
    /// A letter with the same `sms_id` is replaced rather than duplicated so
    /// the id stays unique across the pipeline lifetime.
    pub fn capture(&self, mut record: MessageRecord, last_error: Option<String>) {
        if last_error.is_some() {
            record.last_error = last_error;
        }
        let now = current_unix_timestamp();
        let sms_id = record.sms_id.clone();
        let retry_count = record.retry_count;
        let letter = DeadLetter {
            record,
            dead_lettered_at: now,
            expires_at: now.saturating_add(self.config.ttl_sec),
        };

        let size = {
            let mut letters = match self.letters.lock() {
                Ok(letters) => letters,
                Err(poisoned) => poisoned.into_inner(),
            };
            letters.retain(|existing| existing.sms_id() != sms_id);
            if letters.len() >= self.config.max_entries {
                letters.pop_back();
                self.total_overflow.fetch_add(1, Ordering::Relaxed);
            }
            letters.push_front(letter);
            letters.len()
        };

        self.total_captured.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(sms_id, retry_count, dlo_size = size, "record dead-lettered");

        if let Ok(observer) = self.on_capture.lock() {
            if let Some(observer) = observer.as_ref() {
                observer(size);
            }
        }
    }

    /// Redacted snapshots, newest first. Expired letters are pruned first so
    /// a listing never shows anything past its TTL.
    pub fn list(&self) -> Vec<DeadLetterSnapshot> {
        self.prune_expired();
        let letters = match self.letters.lock() {
            Ok(letters) => letters,
            Err(poisoned) => poisoned.into_inner(),
        };
        letters.iter().map(DeadLetter::snapshot).collect()
    }

    /// Re-enqueue a dead letter with a fresh retry budget.
    pub fn retry(&self, sms_id: &str, queue: &Arc<MessageQueue>) -> DloRetryOutcome {
        let letter = {
            let mut letters = match self.letters.lock() {
                Ok(letters) => letters,
                Err(poisoned) => poisoned.into_inner(),
            };
            let position = letters.iter().position(|letter| letter.sms_id() == sms_id);
            match position {
                Some(index) => letters.remove(index),
                None => None,
            }
        };
        let Some(letter) = letter else {
            return DloRetryOutcome::NotFound;
        };

        let mut record = letter.record.clone();
        record.retry_count = 0;
        match queue.enqueue(record) {
            EnqueueOutcome::Accepted => {
                self.total_retried.fetch_add(1, Ordering::Relaxed);
                tracing::info!(sms_id, "dead letter re-enqueued");
                DloRetryOutcome::Requeued
            }
            refused => {
                // The queue would drop the record; keep the letter instead.
                let mut letters = match self.letters.lock() {
                    Ok(letters) => letters,
                    Err(poisoned) => poisoned.into_inner(),
                };
                letters.push_front(letter);
                tracing::warn!(sms_id, ?refused, "dead letter retry refused by queue");
                DloRetryOutcome::QueueRefused
            }
        }
    }

    /// Drop every letter. Returns the number removed.
    pub fn purge(&self) -> usize {
        let removed = {
            let mut letters = match self.letters.lock() {
                Ok(letters) => letters,
                Err(poisoned) => poisoned.into_inner(),
            };
            let removed = letters.len();
            letters.clear();
            removed
        };
        self.total_purged
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop letters past their TTL. Returns the number removed.
    pub fn prune_expired(&self) -> usize {
        let now = current_unix_timestamp();
        let removed = {
            let mut letters = match self.letters.lock() {
                Ok(letters) => letters,
                Err(poisoned) => poisoned.into_inner(),
            };
            let before = letters.len();
            letters.retain(|letter| letter.expires_at > now);
            before - letters.len()
        };
        if removed > 0 {
            self.total_purged
                .fetch_add(removed as u64, Ordering::Relaxed);
            tracing::info!(removed, "expired dead letters pruned");
        }
        removed
    }

    pub fn len(&self) -> usize {
        match self.letters.lock() {
            Ok(letters) => letters.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> DloMetrics {
        DloMetrics {
            total_captured: self.total_captured.load(Ordering::Relaxed),
            total_retried: self.total_retried.load(Ordering::Relaxed),
            total_purged: self.total_purged.load(Ordering::Relaxed),
            total_overflow: self.total_overflow.load(Ordering::Relaxed),
            current_count: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use relay_core::{MessagePriority, REDACTED_BODY};

    use super::*;

    fn record(sms_id: &str) -> MessageRecord {
        MessageRecord {
            sms_id: sms_id.to_string(),
            sender: "+919876500001".to_string(),
            body: "otp1:Y2lwaGVydGV4dA==".to_string(),
            timestamp: 1_700_000_000,
            node_id: "edge-01".to_string(),
            priority: MessagePriority::Normal,
            encrypted: true,
            retry_count: 5,
            last_error: None,
            created_at: 1_700_000_000,
        }
    }

    #[test]
    fn unit_capture_and_list_redacts_newest_first() {
        let dlo = DeadLetterOffice::new(DloConfig::default());
        dlo.capture(record("sms-a"), Some("telegram: HTTP 500".to_string()));
        dlo.capture(record("sms-b"), Some("email: not configured".to_string()));

        let listed = dlo.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].sms_id, "sms-b");
        assert_eq!(listed[1].sms_id, "sms-a");
        assert!(listed.iter().all(|letter| letter.body == REDACTED_BODY));
        assert_eq!(
            listed[1].last_error.as_deref(),
            Some("telegram: HTTP 500")
        );
    }

    #[test]
    fn unit_capture_replaces_same_id() {
        let dlo = DeadLetterOffice::new(DloConfig::default());
        dlo.capture(record("sms-a"), Some("first".to_string()));
        dlo.capture(record("sms-a"), Some("second".to_string()));
        let listed = dlo.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].last_error.as_deref(), Some("second"));
    }

    #[test]
    fn unit_overflow_evicts_oldest() {
        let dlo = DeadLetterOffice::new(DloConfig {
            ttl_sec: 3_600,
            max_entries: 2,
        });
        dlo.capture(record("sms-a"), None);
        dlo.capture(record("sms-b"), None);
        dlo.capture(record("sms-c"), None);

        let listed = dlo.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].sms_id, "sms-c");
        assert_eq!(listed[1].sms_id, "sms-b");
        assert_eq!(dlo.metrics().total_overflow, 1);
    }

    #[test]
    fn unit_prune_removes_expired_letters() {
        let dlo = DeadLetterOffice::new(DloConfig {
            ttl_sec: 0,
            max_entries: 10,
        });
        dlo.capture(record("sms-a"), None);
        // ttl 0 expires immediately
        assert_eq!(dlo.prune_expired(), 1);
        assert!(dlo.is_empty());
        assert_eq!(dlo.metrics().total_purged, 1);
    }

    #[test]
    fn unit_purge_clears_everything() {
        let dlo = DeadLetterOffice::new(DloConfig::default());
        dlo.capture(record("sms-a"), None);
        dlo.capture(record("sms-b"), None);
        assert_eq!(dlo.purge(), 2);
        assert!(dlo.is_empty());
    }

    #[test]
    fn unit_capture_observer_sees_running_size() {
        let dlo = DeadLetterOffice::new(DloConfig::default());
        let seen = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&seen);
        dlo.set_on_capture(Box::new(move |size| {
            sink.store(size, Ordering::SeqCst);
        }));
        dlo.capture(record("sms-a"), None);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        dlo.capture(record("sms-b"), None);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }
}
