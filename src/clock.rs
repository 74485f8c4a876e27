//! Monotonic Clock
//!
//! Every component that arms a deadline takes a `MonotonicClock` capability instead of
//! reading system time directly. Deadlines are absolute `Nanos` values computed at arm time.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Nanoseconds on a monotonic timeline. The origin is clock-specific.
pub type Nanos = i64;

/// Conversion constants
pub const NANOS_PER_MICRO: i64 = 1_000;
pub const NANOS_PER_MILLI: i64 = 1_000_000;
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Milliseconds to nanoseconds, saturating.
#[inline]
pub fn millis(ms: u64) -> Nanos {
    i64::try_from(ms)
        .unwrap_or(i64::MAX)
        .saturating_mul(NANOS_PER_MILLI)
}

/// Seconds to nanoseconds, saturating.
#[inline]
pub fn secs(s: u64) -> Nanos {
    i64::try_from(s).unwrap_or(i64::MAX).saturating_mul(NANOS_PER_SEC)
}

/// Convert a non-negative nanosecond span into a `Duration`.
#[inline]
pub fn to_duration(span: Nanos) -> Duration {
    Duration::from_nanos(span.max(0) as u64)
}

/// Source of monotonic time.
pub trait MonotonicClock: Send + Sync {
    fn now(&self) -> Nanos;
}

/// Wall-independent clock backed by `Instant`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    #[inline]
    fn now(&self) -> Nanos {
        self.origin.elapsed().as_nanos().min(i64::MAX as u128) as Nanos
    }
}

/// Manually advanced clock for tests and replay.
///
/// `advance_to()` only moves forward. Shared by reference, so advancing is interior.
#[derive(Debug, Default)]
pub struct SimClock {
    current: AtomicI64,
}

impl SimClock {
    /// Create a new clock starting at the given time.
    pub fn new(start_time: Nanos) -> Self {
        Self {
            current: AtomicI64::new(start_time),
        }
    }

    /// Advance clock to a new time. Moving backward is ignored.
    pub fn advance_to(&self, new_time: Nanos) {
        self.current.fetch_max(new_time, Ordering::SeqCst);
    }

    /// Advance clock by a delta.
    pub fn advance_by(&self, delta: Nanos) {
        debug_assert!(delta >= 0, "SimClock: delta must be non-negative");
        self.current.fetch_add(delta.max(0), Ordering::SeqCst);
    }

    /// Advance clock by a number of milliseconds.
    pub fn advance_millis(&self, ms: u64) {
        self.advance_by(millis(ms));
    }
}

impl MonotonicClock for SimClock {
    #[inline]
    fn now(&self) -> Nanos {
        self.current.load(Ordering::SeqCst)
    }
}

impl fmt::Display for SimClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let now = self.now();
        write!(f, "{}.{:09}s", now / NANOS_PER_SEC, now % NANOS_PER_SEC)
    }
}
