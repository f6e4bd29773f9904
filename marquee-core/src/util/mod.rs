mod id;

pub use id::*;

/// The current wall-clock time in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
