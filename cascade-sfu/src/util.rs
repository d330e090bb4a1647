//! Clock and wrap-aware arithmetic helpers shared across the pipeline.

use std::sync::OnceLock;
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};

/// Seconds between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
const UNIX_TO_NTP_EPOCH: u64 = 2_208_988_800;

static CLOCK_BASE: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since process start.
///
/// Every suppression window (NACK, PLI, layer cooldowns) and every timestamp
/// offset computation uses this clock; wall-clock time only appears at the
/// NTP boundary.
pub fn monotonic_ns() -> u64 {
    let base = CLOCK_BASE.get_or_init(Instant::now);
    base.elapsed().as_nanos() as u64
}

/// Monotonic milliseconds since process start.
pub fn monotonic_ms() -> u64 {
    monotonic_ns() / 1_000_000
}

/// Convert a wall-clock instant to a 64-bit NTP timestamp.
///
/// Upper 32 bits are seconds since 1900-01-01 UTC, lower 32 bits are
/// fractional seconds. The fractional word is rounded to nearest.
pub fn to_ntp_time(t: DateTime<Utc>) -> u64 {
    let secs = t.timestamp() as u64 + UNIX_TO_NTP_EPOCH;
    let nanos = u64::from(t.timestamp_subsec_nanos());
    let mut frac = (nanos << 32) / 1_000_000_000;
    if (nanos << 32) % 1_000_000_000 >= 500_000_000 {
        frac += 1;
    }
    (secs << 32) | frac
}

/// Inverse of [`to_ntp_time`], precise to nanoseconds.
pub fn from_ntp_time(ntp: u64) -> DateTime<Utc> {
    let secs = (ntp >> 32).saturating_sub(UNIX_TO_NTP_EPOCH);
    let frac = ntp & 0xFFFF_FFFF;
    let nanos = ((frac * 1_000_000_000) + (1 << 31)) >> 32;
    Utc.timestamp_opt(secs as i64, nanos as u32)
        .single()
        .unwrap_or_default()
}

/// True when sequence number `a` is newer than `b`, accounting for u16 wrap.
pub fn seq_newer(a: u16, b: u16) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000
}

/// True when RTP timestamp `a` is newer than `b`, accounting for u32 wrap.
pub fn ts_newer(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) < 0x8000_0000
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn ntp_round_trip_within_a_millisecond() {
        let times = [
            Utc.with_ymd_and_hms(2023, 6, 15, 12, 30, 45).unwrap() + Duration::milliseconds(123),
            Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap(),
            Utc.with_ymd_and_hms(2038, 1, 19, 3, 14, 7).unwrap() + Duration::microseconds(250_999),
        ];
        for t in times {
            let rt = from_ntp_time(to_ntp_time(t));
            let delta = (rt - t).num_milliseconds().abs();
            assert!(delta <= 1, "round trip drifted {delta} ms for {t}");
        }
    }

    #[test]
    fn ntp_epoch_offset() {
        let t = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(to_ntp_time(t) >> 32, UNIX_TO_NTP_EPOCH);
    }

    #[test]
    fn seq_newer_handles_wrap() {
        assert!(seq_newer(0, 65535));
        assert!(seq_newer(10, 5));
        assert!(!seq_newer(65535, 0));
        assert!(!seq_newer(5, 5));
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }
}
