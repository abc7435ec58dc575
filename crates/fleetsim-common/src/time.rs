//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Clock and time-window helpers."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Wall-clock timestamp attached to history samples and log entries.
pub fn wall_clock() -> DateTime<Utc> {
    Utc::now()
}

/// Time left in a window that opened `elapsed` ago, saturating at zero.
pub fn remaining_in_window(window: Duration, elapsed: Duration) -> Duration {
    window.saturating_sub(elapsed)
}

/// Convert a duration into whole milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
