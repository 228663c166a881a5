//! Injectable session clock.
//!
//! The frame loop's notion of "seconds since session start" comes from a
//! [`SessionClock`] passed into the scheduler, never from a hidden global.
//! Production uses [`MonotonicClock`]; tests use [`ManualClock`] and advance
//! frame time by hand, so tick behavior is reproducible without real time.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of frame time for a session.
pub trait SessionClock: Send {
    /// Time elapsed since session start.
    fn elapsed(&self) -> Duration;

    /// Elapsed time as fractional seconds, the unit events are stamped with.
    fn frame_time(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}

/// Wall-clock monotonic time from session start.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    started: Instant,
}

impl MonotonicClock {
    /// Starts the clock now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionClock for MonotonicClock {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// A hand-driven clock for deterministic tests.
///
/// Clones share the same underlying time, so a test can hold one handle and
/// advance it while the scheduler reads another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advances the clock.
    pub fn advance(&self, by: Duration) {
        let micros = u64::try_from(by.as_micros()).unwrap_or(u64::MAX);
        self.micros.fetch_add(micros, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute elapsed time.
    pub fn set(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.micros.store(micros, Ordering::SeqCst);
    }
}

impl SessionClock for ManualClock {
    fn elapsed(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        assert!((clock.frame_time() - 0.0).abs() < 1e-12);

        clock.advance(Duration::from_millis(16));
        clock.advance(Duration::from_millis(17));
        assert!((clock.frame_time() - 0.033).abs() < 1e-9);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let reader = clock.clone();

        clock.set(Duration::from_secs(2));
        assert!((reader.frame_time() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_monotonic_clock_moves_forward() {
        let clock = MonotonicClock::new();
        let a = clock.elapsed();
        let b = clock.elapsed();
        assert!(b >= a);
    }
}
