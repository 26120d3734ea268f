//! Helpers for converting between wall-clock representations.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Interpret a count of milliseconds since the Unix epoch as a [SystemTime].
pub fn from_epoch_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}

/// Extension trait converting [SystemTime] into epoch offsets.
pub trait SystemTimeExt {
    /// Milliseconds elapsed since the Unix epoch.
    fn epoch_millis(&self) -> u128;
}

impl SystemTimeExt for SystemTime {
    fn epoch_millis(&self) -> u128 {
        self.duration_since(UNIX_EPOCH)
            .expect("time before epoch")
            .as_millis()
    }
}
