//! Lightweight metrics helpers.

use std::time::Duration;

/// Observed delivery rate in bytes per second, sampled over one round trip.
///
/// Computed at nanosecond precision; a zero elapsed time is treated as one
/// nanosecond so the result stays finite.
pub fn receive_rate_bps(size: u64, elapsed: Duration) -> u64 {
    let nanos = elapsed.as_nanos().max(1);
    (size as u128 * 1_000_000_000 / nanos) as u64
}

pub fn rate_per_sec(count: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        Some(count as f64 / secs)
    } else {
        None
    }
}

/// Blocks still to process before reaching the best known peer height.
pub fn height_lag(max_peer_height: i64, height: i64) -> i64 {
    (max_peer_height - height + 1).max(0)
}
