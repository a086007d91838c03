//! Time sources for the conductor.
//!
//! The conductor needs two clocks: a monotonic nanosecond clock for
//! deadlines and liveness arithmetic, and a wall-clock millisecond clock
//! for timestamps that must agree with what clients see (keepalive epoch
//! stamps, counter metadata). Both have a cached variant so the hot
//! `do_work` loop can read a cheap snapshot instead of a syscall every
//! tick (see [`CachedEpochClock`]).

use std::time::{SystemTime, UNIX_EPOCH};

/// A source of monotonic nanosecond timestamps.
pub trait NanoClock: Send + Sync + 'static {
    /// Returns a monotonically non-decreasing timestamp in nanoseconds.
    /// The origin is unspecified; only differences are meaningful.
    fn now_ns(&self) -> u64;
}

/// A source of wall-clock millisecond timestamps (epoch millis).
pub trait EpochClock: Send + Sync + 'static {
    /// Returns milliseconds since the UNIX epoch.
    fn now_ms(&self) -> u64;
}

/// TSC-backed monotonic clock via `quanta`, anchored to `SystemTime` once
/// at construction so `now_ns` stays comparable across processes without
/// paying a syscall on every call.
#[derive(Debug, Clone)]
pub struct QuantaNanoClock {
    clock: quanta::Clock,
    start_wall_ns: u64,
    start_instant: quanta::Instant,
}

impl Default for QuantaNanoClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        let start_wall_ns = wall_clock_ns();
        Self {
            clock,
            start_wall_ns,
            start_instant,
        }
    }
}

impl QuantaNanoClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NanoClock for QuantaNanoClock {
    fn now_ns(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ns + delta.as_nanos() as u64
    }
}

/// `SystemTime`-backed epoch clock. Slower than the TSC path but never
/// drifts from wall-clock adjustments, which is what clients observe too.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEpochClock;

impl EpochClock for SystemEpochClock {
    fn now_ms(&self) -> u64 {
        wall_clock_ns() / 1_000_000
    }
}

fn wall_clock_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX epoch")
        .as_nanos() as u64
}

/// Holds the last-read value of a nano clock, refreshed every tick.
///
/// Spec §4.1 step 1: the nano clock is cheap enough (a TSC read) to
/// refresh unconditionally every `do_work` round.
pub struct CachedNanoClock<C: NanoClock> {
    source: C,
    cached_ns: u64,
}

impl<C: NanoClock> CachedNanoClock<C> {
    pub fn new(source: C) -> Self {
        let cached_ns = source.now_ns();
        Self { source, cached_ns }
    }

    /// Re-reads the underlying clock and caches the result. Called once
    /// per `do_work` tick.
    pub fn refresh(&mut self) -> u64 {
        self.cached_ns = self.source.now_ns();
        self.cached_ns
    }

    pub fn cached_ns(&self) -> u64 {
        self.cached_ns
    }
}

/// Holds the last-read value of an epoch clock, refreshed only once the
/// cache is older than [`EPOCH_REFRESH_THRESHOLD_NS`] (spec §4.1 step 1).
pub struct CachedEpochClock<C: EpochClock> {
    source: C,
    cached_ms: u64,
    last_refresh_ns: u64,
}

/// The nano-clock age, in nanoseconds, beyond which the cached epoch
/// snapshot is considered stale and must be re-read.
pub const EPOCH_REFRESH_THRESHOLD_NS: u64 = 1_000_000; // 1 ms

impl<C: EpochClock> CachedEpochClock<C> {
    pub fn new(source: C, now_ns: u64) -> Self {
        let cached_ms = source.now_ms();
        Self {
            source,
            cached_ms,
            last_refresh_ns: now_ns,
        }
    }

    /// Refreshes the cached epoch-millis snapshot if `now_ns` is more than
    /// [`EPOCH_REFRESH_THRESHOLD_NS`] past the last refresh. Returns the
    /// (possibly unchanged) cached value.
    pub fn maybe_refresh(&mut self, now_ns: u64) -> u64 {
        if now_ns.saturating_sub(self.last_refresh_ns) > EPOCH_REFRESH_THRESHOLD_NS {
            self.cached_ms = self.source.now_ms();
            self.last_refresh_ns = now_ns;
        }
        self.cached_ms
    }

    pub fn cached_ms(&self) -> u64 {
        self.cached_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeNanoClock(AtomicU64);
    impl NanoClock for FakeNanoClock {
        fn now_ns(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    struct FakeEpochClock(AtomicU64);
    impl EpochClock for FakeEpochClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::Relaxed)
        }
    }

    #[test]
    fn nano_cache_refreshes_every_call() {
        let clock = FakeNanoClock(AtomicU64::new(10));
        let mut cached = CachedNanoClock::new(clock);
        assert_eq!(cached.cached_ns(), 10);
        cached.source.0.store(20, Ordering::Relaxed);
        assert_eq!(cached.refresh(), 20);
        assert_eq!(cached.cached_ns(), 20);
    }

    #[test]
    fn epoch_cache_holds_until_threshold_elapsed() {
        let clock = FakeEpochClock(AtomicU64::new(1_000));
        let mut cached = CachedEpochClock::new(clock, 0);
        assert_eq!(cached.cached_ms(), 1_000);

        cached.source.0.store(2_000, Ordering::Relaxed);
        // Below the threshold: stays stale.
        assert_eq!(cached.maybe_refresh(EPOCH_REFRESH_THRESHOLD_NS), 1_000);

        // Past the threshold: refreshes.
        assert_eq!(cached.maybe_refresh(EPOCH_REFRESH_THRESHOLD_NS + 1), 2_000);
    }
}
