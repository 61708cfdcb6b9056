//! Sliding-window packet/byte counters
//!
//! A fixed ring of per-second buckets covering a trailing window. Recording
//! is O(1) amortized; querying sums at most `window` buckets. Counts are
//! reset only by time advancing past the window boundary. The caller passes
//! `now` explicitly so tests control the clock.

use std::time::Instant;

/// Default trailing window covered by a [`RateWindow`], in seconds
pub const DEFAULT_WINDOW_SECS: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    packets: u64,
    bytes: u64,
}

/// Per-second ring of packet/byte counters
#[derive(Debug)]
pub struct RateWindow {
    buckets: Vec<Bucket>,
    head: usize,
    head_second: u64,
    origin: Instant,
}

impl RateWindow {
    /// Create a window covering the default trailing period
    #[must_use]
    pub fn new(origin: Instant) -> Self {
        Self::with_window(origin, DEFAULT_WINDOW_SECS)
    }

    /// Create a window covering `window_secs` seconds (minimum 1)
    #[must_use]
    pub fn with_window(origin: Instant, window_secs: usize) -> Self {
        Self {
            buckets: vec![Bucket::default(); window_secs.max(1)],
            head: 0,
            head_second: 0,
            origin,
        }
    }

    /// Window length in seconds
    #[must_use]
    pub fn window_secs(&self) -> usize {
        self.buckets.len()
    }

    fn second_of(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_secs()
    }

    /// Rotate the ring so the head bucket covers the current second,
    /// zeroing any buckets skipped over
    fn advance(&mut self, second: u64) {
        if second <= self.head_second {
            return;
        }
        let steps = (second - self.head_second).min(self.buckets.len() as u64);
        for _ in 0..steps {
            self.head = (self.head + 1) % self.buckets.len();
            self.buckets[self.head] = Bucket::default();
        }
        self.head_second = second;
    }

    /// Record one packet of `bytes` length arriving at `now`
    pub fn record(&mut self, now: Instant, bytes: usize) {
        let second = self.second_of(now);
        self.advance(second);
        let bucket = &mut self.buckets[self.head];
        bucket.packets += 1;
        bucket.bytes += bytes as u64;
    }

    /// Total `(packets, bytes)` over the trailing window as of `now`
    pub fn totals(&mut self, now: Instant) -> (u64, u64) {
        let second = self.second_of(now);
        self.advance(second);
        self.buckets
            .iter()
            .fold((0, 0), |(p, b), bucket| (p + bucket.packets, b + bucket.bytes))
    }

    /// `(packets, bytes)` counted in the most recently completed second
    ///
    /// This is what the flood monitor compares against per-second thresholds:
    /// the bucket for the second immediately before `now`'s, fully elapsed.
    pub fn last_second(&mut self, now: Instant) -> (u64, u64) {
        let second = self.second_of(now);
        self.advance(second);
        if second == 0 {
            return (0, 0);
        }
        let idx = (self.head + self.buckets.len() - 1) % self.buckets.len();
        let bucket = self.buckets[idx];
        (bucket.packets, bucket.bytes)
    }
}
