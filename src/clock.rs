//! Millisecond uptime clock used to timestamp log entries

use once_cell::sync::Lazy;
use std::time::Instant;

static BOOT: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since the clock was first touched, wrapping at `u32::MAX`
pub fn uptime_ms() -> u32 {
    BOOT.elapsed().as_millis() as u32
}

/// Anchor the clock to now; later calls to [`uptime_ms`] count from here
pub fn mark_boot() {
    Lazy::force(&BOOT);
}
