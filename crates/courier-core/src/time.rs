//! Time abstractions for testable scheduling.
//!
//! The scheduler records run and alert timestamps and sleeps between passes.
//! Both go through [`Clock`] so tests can pin wall-clock time.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, TimeZone, Utc};

/// Clock abstraction for time operations.
///
/// Production code uses [`RealClock`]; tests inject [`TestClock`].
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    ///
    /// In production this maps to `tokio::time::sleep`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real clock backed by the system and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Manually driven clock for deterministic tests.
///
/// Wall-clock time only moves through [`TestClock::advance`] or
/// [`Clock::sleep`]. Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct TestClock {
    offset_ms: Arc<AtomicI64>,
    start: DateTime<Utc>,
    base_instant: Instant,
}

impl TestClock {
    /// Creates a test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self { offset_ms: Arc::new(AtomicI64::new(0)), start, base_instant: Instant::now() }
    }

    /// Creates a test clock pinned to a unix timestamp in seconds.
    pub fn at_unix_seconds(seconds: i64) -> Self {
        let start = Utc.timestamp_opt(seconds, 0).single().unwrap_or_else(Utc::now);
        Self::with_start_time(start)
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.offset_ms.fetch_add(ms, Ordering::AcqRel);
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        let ms = self.offset_ms.load(Ordering::Acquire).max(0);
        Duration::from_millis(u64::try_from(ms).unwrap_or(0))
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::milliseconds(self.offset_ms.load(Ordering::Acquire))
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_wall_time() {
        let clock = TestClock::at_unix_seconds(1_700_000_000);
        let start = clock.now_utc();

        clock.advance(Duration::from_secs(90));

        assert_eq!(clock.now_utc() - start, chrono::Duration::seconds(90));
        assert_eq!(clock.elapsed(), Duration::from_secs(90));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let other = clock.clone();

        clock.advance(Duration::from_secs(5));

        assert_eq!(other.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn sleep_advances_without_waiting() {
        let clock = TestClock::new();
        let before = clock.now();

        clock.sleep(Duration::from_secs(3600)).await;

        assert_eq!(clock.now().duration_since(before), Duration::from_secs(3600));
    }
}
