//! Sliding-window event counters.
//!
//! A [`RateCounter`] tracks how many events were recorded in the last second,
//! the last minute, and the last hour, plus a lifetime total. Expiry of old
//! buckets is driven by the wall clock of whoever calls in, so no background
//! timer is needed.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

const RING_SIZE: usize = 60;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    /// Epoch second (or epoch minute) this bucket last counted for.
    stamp: u64,
    count: u64,
}

#[derive(Debug)]
struct Windows {
    /// One bucket per second over the last minute. The head bucket (current
    /// second) doubles as the last-second view.
    seconds: [Bucket; RING_SIZE],
    /// One bucket per minute over the last hour.
    minutes: [Bucket; RING_SIZE],
    total: u64,
}

/// A named counter safe for concurrent increments and reads.
pub struct RateCounter {
    name: String,
    windows: Mutex<Windows>,
}

impl RateCounter {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            windows: Mutex::new(Windows {
                seconds: [Bucket::default(); RING_SIZE],
                minutes: [Bucket::default(); RING_SIZE],
                total: 0,
            }),
        }
    }

    /// Record `n` events now. Recording zero events is a no-op.
    pub fn increment_by(&self, n: u64) {
        self.increment_at(n, now_secs());
    }

    /// Events recorded within the current second.
    #[must_use]
    pub fn last_second(&self) -> u64 {
        self.counts_at(now_secs()).0
    }

    /// Events recorded within the last 60 seconds.
    #[must_use]
    pub fn last_minute(&self) -> u64 {
        self.counts_at(now_secs()).1
    }

    /// Events recorded within the last 60 minutes.
    #[must_use]
    pub fn last_hour(&self) -> u64 {
        self.counts_at(now_secs()).2
    }

    /// Lifetime total. Wraps on u64 overflow.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.counts_at(now_secs()).3
    }

    /// One-line human-readable snapshot of all four windows.
    #[must_use]
    pub fn summary(&self) -> String {
        let (second, minute, hour, total) = self.counts_at(now_secs());
        format!(
            "{}: {second}/s {minute}/min {hour}/h {total} total",
            self.name
        )
    }

    fn increment_at(&self, n: u64, now: u64) {
        if n == 0 {
            return;
        }
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        let second_bucket = &mut windows.seconds[(now % RING_SIZE as u64) as usize];
        if second_bucket.stamp != now {
            second_bucket.stamp = now;
            second_bucket.count = 0;
        }
        second_bucket.count += n;

        let minute = now / 60;
        let minute_bucket = &mut windows.minutes[(minute % RING_SIZE as u64) as usize];
        if minute_bucket.stamp != minute {
            minute_bucket.stamp = minute;
            minute_bucket.count = 0;
        }
        minute_bucket.count += n;

        windows.total = windows.total.wrapping_add(n);
    }

    /// Returns (last_second, last_minute, last_hour, total) as of `now`.
    fn counts_at(&self, now: u64) -> (u64, u64, u64, u64) {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        let head = windows.seconds[(now % RING_SIZE as u64) as usize];
        let second = if head.stamp == now { head.count } else { 0 };

        let minute = windows
            .seconds
            .iter()
            .filter(|b| b.stamp <= now && now - b.stamp < RING_SIZE as u64)
            .map(|b| b.count)
            .sum();

        let now_minute = now / 60;
        let hour = windows
            .minutes
            .iter()
            .filter(|b| b.stamp <= now_minute && now_minute - b.stamp < RING_SIZE as u64)
            .map(|b| b.count)
            .sum();

        (second, minute, hour, windows.total)
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Large enough that the zero-initialized bucket stamps are long expired.
    const T: u64 = 1_000_000_000;

    #[test]
    fn increment_is_visible_in_all_windows() {
        let counter = RateCounter::new("test");
        counter.increment_at(5, T);
        assert_eq!(counter.counts_at(T), (5, 5, 5, 5));
    }

    #[test]
    fn windows_expire_with_the_clock() {
        let counter = RateCounter::new("test");
        counter.increment_at(5, T);

        let (second, minute, hour, total) = counter.counts_at(T + 1);
        assert_eq!((second, minute, hour, total), (0, 5, 5, 5));

        let (second, minute, hour, total) = counter.counts_at(T + 90);
        assert_eq!((second, minute), (0, 0));
        assert_eq!((hour, total), (5, 5));

        let (second, minute, hour, total) = counter.counts_at(T + 3600 + 60);
        assert_eq!((second, minute, hour), (0, 0, 0));
        assert_eq!(total, 5);
    }

    #[test]
    fn windows_are_monotonically_ordered() {
        let counter = RateCounter::new("test");
        counter.increment_at(3, T - 3000);
        counter.increment_at(2, T - 30);
        counter.increment_at(1, T);

        let (second, minute, hour, total) = counter.counts_at(T);
        assert_eq!((second, minute, hour, total), (1, 3, 6, 6));
        assert!(second <= minute && minute <= hour && hour <= total);
    }

    #[test]
    fn zero_increment_is_a_noop() {
        let counter = RateCounter::new("test");
        counter.increment_at(0, T);
        assert_eq!(counter.counts_at(T), (0, 0, 0, 0));
    }

    #[test]
    fn same_bucket_accumulates() {
        let counter = RateCounter::new("test");
        counter.increment_at(1, T);
        counter.increment_at(2, T);
        assert_eq!(counter.counts_at(T), (3, 3, 3, 3));
    }

    #[test]
    fn stale_ring_slot_is_reused() {
        let counter = RateCounter::new("test");
        counter.increment_at(7, T);
        // Same ring slot, one full revolution later.
        counter.increment_at(2, T + 60);
        let (second, minute, _, total) = counter.counts_at(T + 60);
        assert_eq!((second, minute, total), (2, 2, 9));
    }

    #[test]
    fn summary_names_the_counter() {
        let counter = RateCounter::new("acceptRate");
        counter.increment_by(4);
        let summary = counter.summary();
        assert!(summary.starts_with("acceptRate:"), "summary: {summary}");
        assert!(summary.contains("4 total"), "summary: {summary}");
    }

    #[test]
    fn concurrent_increments_all_land() {
        let counter = std::sync::Arc::new(RateCounter::new("test"));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = std::sync::Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    counter.increment_by(1);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.total(), 8000);
    }
}
