use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_millis() -> u64 {
    system_time_millis(SystemTime::now())
}

/// Milliseconds since the unix epoch, clamped to 0 for pre-epoch times.
///
/// File timestamps are compared at millisecond resolution everywhere in keel;
/// the timestamp ambiguity check depends on every layer truncating the same way.
pub fn system_time_millis(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(err) => {
            static REPORTED: OnceLock<()> = OnceLock::new();
            if REPORTED.set(()).is_ok() {
                tracing::debug!(
                    target = "keel.core",
                    error = %err,
                    "timestamp is before unix epoch; using 0"
                );
            }
            0
        }
    }
}
