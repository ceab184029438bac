//! Producer/consumer pipeline for the relay: a bounded priority queue with a
//! worker pool in front of the dispatchers, and the Dead Letter Office that
//! retains records whose delivery attempts are exhausted.

pub mod dlo;
pub mod queue;

pub use dlo::{DeadLetterOffice, DloConfig, DloMetrics, DloRetryOutcome};
pub use queue::{EnqueueOutcome, MessageQueue, QueueConfig, QueueMetrics};
