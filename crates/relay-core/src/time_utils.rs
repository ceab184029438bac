//! Wall-clock helpers shared across relay crates.
//!
//! All pipeline timestamps are unix seconds; milliseconds are used only where
//! generated identifiers need extra resolution.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in whole seconds.
pub fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Current unix time in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Whether a unix-second deadline has passed. `None` never expires.
pub fn is_expired_unix(deadline: Option<u64>, now: u64) -> bool {
    match deadline {
        Some(deadline) => deadline <= now,
        None => false,
    }
}
