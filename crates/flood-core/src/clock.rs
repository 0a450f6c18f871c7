//! Monotonic nanosecond timestamps.
//!
//! All window arithmetic, LRU ordering and block expiries run on this clock.
//! On Linux, timestamps use `CLOCK_MONOTONIC_RAW` (immune to NTP slew and
//! wall-clock steps). On other platforms, an `Instant`-based fallback is used.

/// Nanosecond timestamp via `CLOCK_MONOTONIC_RAW` (Linux) or `Instant` (other platforms).
///
/// Non-decreasing across all callers; the epoch is arbitrary.
#[inline(always)]
pub fn now_ns() -> u64 {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts);
        }
        (ts.tv_sec as u64) * 1_000_000_000 + (ts.tv_nsec as u64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        use std::time::Instant;
        static EPOCH: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let epoch = EPOCH.get_or_init(Instant::now);
        epoch.elapsed().as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ns_monotonic() {
        let a = now_ns();
        let b = now_ns();
        let c = now_ns();
        assert!(b >= a);
        assert!(c >= b);
    }

    #[test]
    fn test_now_ns_nonzero() {
        // An arbitrary epoch, but never the zero sentinel used for
        // "no expiry recorded".
        assert!(now_ns() > 0);
    }
}
