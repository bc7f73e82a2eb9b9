//! Monotonic span clock.
//!
//! Span timestamps are monotonic nanosecond ticks measured from a process-wide
//! anchor. The anchor pairs an [`Instant`] with the wall clock at the same
//! moment, so ticks convert to absolute unix nanoseconds at serialization time
//! without being affected by later wall-clock adjustments.

use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

struct Anchor {
    instant: Instant,
    unix_nanos: u64,
}

static ANCHOR: OnceLock<Anchor> = OnceLock::new();

fn anchor() -> &'static Anchor {
    ANCHOR.get_or_init(|| Anchor {
        instant: Instant::now(),
        unix_nanos: unix_nanos_now(),
    })
}

/// Current monotonic time in nanosecond ticks.
#[inline]
pub fn now() -> u64 {
    anchor().instant.elapsed().as_nanos() as u64
}

/// Converts an [`Instant`] into ticks. Instants before the anchor saturate at 0.
pub fn ticks_from_instant(instant: Instant) -> u64 {
    instant
        .checked_duration_since(anchor().instant)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Converts ticks into absolute unix nanoseconds.
#[inline]
pub fn to_unix_nanos(ticks: u64) -> u64 {
    anchor().unix_nanos.saturating_add(ticks)
}

/// Wall-clock unix nanoseconds.
pub fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

/// Wall-clock unix milliseconds.
pub fn unix_millis_now() -> i64 {
    (unix_nanos_now() / 1_000_000) as i64
}
