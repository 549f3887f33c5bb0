use std::time::Instant;

lazy_static::lazy_static! {
    static ref PROCESS_EPOCH: Instant = Instant::now();
}

/// Milliseconds elapsed on this process's monotonic clock
pub fn monotonic_millis() -> u64 {
    PROCESS_EPOCH.elapsed().as_millis() as u64
}

/// Unix milliseconds, for values compared across processes
pub fn wall_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
