//! Scheduler time source
//!
//! Tests and scenarios drive a virtual clock explicitly; the threaded
//! runtime reads a monotonic wall clock instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::types::Nanos;

#[derive(Debug)]
pub enum Clock {
    /// Advanced only by [`Clock::set`]
    Virtual(AtomicU64),
    /// Nanoseconds elapsed since the base instant
    Monotonic(Instant),
}

impl Clock {
    pub fn new_virtual() -> Self {
        Clock::Virtual(AtomicU64::new(0))
    }

    pub fn new_monotonic() -> Self {
        Clock::Monotonic(Instant::now())
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Clock::Virtual(_))
    }

    /// Current time in nanoseconds
    pub fn now(&self) -> Nanos {
        match self {
            Clock::Virtual(ns) => ns.load(Ordering::Acquire),
            Clock::Monotonic(base) => duration_to_ns(base.elapsed()),
        }
    }

    /// Move a virtual clock forward to `ns`. Never moves time backwards and
    /// has no effect on a monotonic clock.
    pub fn set(&self, ns: Nanos) {
        if let Clock::Virtual(now) = self {
            now.fetch_max(ns, Ordering::AcqRel);
        }
    }
}

/// Saturating conversion for timeouts supplied as [`Duration`]
pub fn duration_to_ns(d: Duration) -> Nanos {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_clock_monotonic() {
        let clock = Clock::new_virtual();
        assert_eq!(clock.now(), 0);
        clock.set(500);
        clock.set(200);
        assert_eq!(clock.now(), 500);
    }

    #[test]
    fn test_duration_saturates() {
        assert_eq!(duration_to_ns(Duration::from_micros(3)), 3_000);
        assert_eq!(duration_to_ns(Duration::MAX), u64::MAX);
    }
}
