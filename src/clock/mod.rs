//! Time sources used by the harness.
//!
//! Latency deltas come from a process-wide monotonic clock expressed as
//! nanoseconds since the first call. Every client in a run lives in the same
//! process, so a timestamp taken by one client can be compared with a reading
//! taken by another. Record timestamps use the local wall clock.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::Local;

static ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since the clock was first read.
pub fn now_nanos() -> u64 {
    let anchor = ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_nanos() as u64
}

/// Signed distance from `from` to `to` in fractional milliseconds.
pub fn delta_ms(from: u64, to: u64) -> f64 {
    (to as i128 - from as i128) as f64 / 1_000_000.0
}

pub fn duration_ms(duration: Duration) -> f64 {
    duration.as_nanos() as f64 / 1_000_000.0
}

/// Local time, ISO-8601 without zone suffix, millisecond precision.
pub fn local_timestamp() -> String {
    Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_readings_never_go_backwards() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn delta_is_signed() {
        assert_eq!(delta_ms(1_000_000, 3_500_000), 2.5);
        assert_eq!(delta_ms(3_000_000, 1_000_000), -2.0);
    }

    #[test]
    fn local_timestamp_has_millisecond_precision_and_no_suffix() {
        let ts = local_timestamp();
        // 2024-01-02T03:04:05.678
        assert_eq!(ts.len(), 23);
        assert_eq!(&ts[10..11], "T");
        assert_eq!(&ts[19..20], ".");
        assert!(!ts.ends_with('Z'));
    }
}
