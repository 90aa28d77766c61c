//! Timestamp-derived file names

use chrono::{Local, TimeZone};

/// Millisecond wall-clock stamps that never repeat or go backwards
#[derive(Debug, Default)]
pub struct MonotonicStamp {
    last_ms: i64,
}

impl MonotonicStamp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time in milliseconds, bumped past the previous stamp if needed
    pub fn next(&mut self) -> i64 {
        self.next_from(Local::now().timestamp_millis())
    }

    fn next_from(&mut self, now_ms: i64) -> i64 {
        let stamp = now_ms.max(self.last_ms + 1);
        self.last_ms = stamp;
        stamp
    }
}

/// `2024-05-01_13-45-10-123.<ext>` in local time
pub fn stamp_file_name(stamp_ms: i64, ext: &str) -> String {
    let name = match Local.timestamp_millis_opt(stamp_ms).single() {
        Some(time) => time.format("%Y-%m-%d_%H-%M-%S-%3f").to_string(),
        None => stamp_ms.to_string(),
    };
    format!("{}.{}", name, ext)
}
