//! ---
//! vsub_section: "01-core-functionality"
//! vsub_subsection: "module"
//! vsub_type: "source"
//! vsub_scope: "code"
//! vsub_description: "Shared primitives and utilities for the coordinator runtime."
//! vsub_version: "v0.1.0"
//! vsub_owner: "tbd"
//! ---
use std::time::Duration;

/// Convert a duration into whole milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Sum a set of durations without overflowing.
pub fn saturating_sum<I>(durations: I) -> Duration
where
    I: IntoIterator<Item = Duration>,
{
    durations
        .into_iter()
        .fold(Duration::ZERO, |acc, next| acc.saturating_add(next))
}
