//! ID generation utilities
//!
//! Job ids are assigned at enqueue time, before anything is persisted, so the
//! caller can register tracker listeners ahead of submission.

use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Generate a unique job ID based on timestamp with sub-second precision.
///
/// Format: seconds + microseconds + atomic counter (e.g. "17378028001234560001").
/// The counter keeps ids unique even when many jobs are created in the same
/// microsecond (chains do exactly that).
pub fn generate_job_id() -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards");

    let secs = duration.as_secs();
    let micros = duration.subsec_micros();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);

    format!("{}{:06}{:04}", secs, micros, counter % 10000)
}
