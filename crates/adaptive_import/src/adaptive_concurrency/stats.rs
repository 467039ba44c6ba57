use std::fmt;

use tokio::time::Instant;

/// Fraction of requests in a window that were throttled, kept as an exact fraction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ThrottleRatio {
    throttled: u64,
    requests: u64,
}

impl ThrottleRatio {
    pub fn new(throttled: u64, requests: u64) -> Self {
        Self {
            throttled: throttled.min(requests),
            requests,
        }
    }

    pub fn throttled(&self) -> u64 {
        self.throttled
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn is_zero(&self) -> bool {
        self.throttled == 0
    }

    /// `true` when the ratio is strictly below `percent`/100. An empty window has ratio 0.
    pub fn is_below_percent(&self, percent: u32) -> bool {
        if self.requests == 0 {
            return percent > 0;
        }
        u128::from(self.throttled) * 100 < u128::from(percent) * u128::from(self.requests)
    }

    pub fn as_f64(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.throttled as f64 / self.requests as f64
        }
    }
}

impl fmt::Display for ThrottleRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}%", self.as_f64() * 100.0)
    }
}

/// Requests and throttles observed during one whole second of the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SecondBucket {
    second: u64,
    requests: u64,
    throttles: u64,
}

impl SecondBucket {
    fn new(second: u64) -> Self {
        Self {
            second,
            requests: 0,
            throttles: 0,
        }
    }

    /// Whole seconds elapsed since the run started.
    pub fn second(&self) -> u64 {
        self.second
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn throttles(&self) -> u64 {
        self.throttles
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Rate {
    pub requests_per_sec: f64,
    pub cost_per_sec: f64,
}

/// Per-second request/throttle counters and cumulative cost for one run.
///
/// Buckets are appended lazily, at most one per elapsed second, and never removed; a run is
/// bounded by the size of its input.
#[derive(Clone, Debug)]
pub struct ImportStats {
    run_start: Instant,
    buckets: Vec<SecondBucket>,
    total_requests: u64,
    total_throttles: u64,
    total_failures: u64,
    total_cost: f64,
    tick_start: Instant,
    tick_requests: u64,
    tick_throttles: u64,
    tick_failures: u64,
    tick_cost: f64,
}

impl ImportStats {
    pub fn new(run_start: Instant) -> Self {
        Self {
            run_start,
            buckets: Vec::new(),
            total_requests: 0,
            total_throttles: 0,
            total_failures: 0,
            total_cost: 0.0,
            tick_start: run_start,
            tick_requests: 0,
            tick_throttles: 0,
            tick_failures: 0,
            tick_cost: 0.0,
        }
    }

    fn second_index(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.run_start).as_secs()
    }

    fn bucket_mut(&mut self, now: Instant) -> &mut SecondBucket {
        let second = self.second_index(now);
        let append = self.buckets.last().is_none_or(|last| last.second < second);
        if append {
            self.buckets.push(SecondBucket::new(second));
        }
        let last = self.buckets.len() - 1;
        &mut self.buckets[last]
    }

    pub fn record_success(&mut self, now: Instant, cost: f64) {
        self.bucket_mut(now).requests += 1;
        self.total_requests += 1;
        self.total_cost += cost;
        self.tick_requests += 1;
        self.tick_cost += cost;
    }

    pub fn record_throttle(&mut self, now: Instant) {
        let bucket = self.bucket_mut(now);
        bucket.requests += 1;
        bucket.throttles += 1;
        self.total_requests += 1;
        self.total_throttles += 1;
        self.tick_requests += 1;
        self.tick_throttles += 1;
    }

    /// A failure that was not throttling. It shows up in the totals and the request rate
    /// but never in a bucket, so the throttle ratio does not see it.
    pub fn record_failure(&mut self) {
        self.total_failures += 1;
        self.tick_requests += 1;
        self.tick_failures += 1;
    }

    /// Throttle ratio over the buckets of the last `window_secs` whole seconds, the current
    /// one included.
    pub fn throttle_ratio(&self, now: Instant, window_secs: u64) -> ThrottleRatio {
        let current = self.second_index(now);
        let (throttled, requests) = self
            .buckets
            .iter()
            .rev()
            .take_while(|bucket| bucket.second + window_secs > current)
            .fold((0, 0), |(throttled, requests), bucket| {
                (throttled + bucket.throttles, requests + bucket.requests)
            });
        ThrottleRatio::new(throttled, requests)
    }

    /// Requests and cost per second since the last [`reset_rate`](Self::reset_rate).
    /// `None` when no time has passed.
    pub fn instantaneous_rate(&self, now: Instant) -> Option<Rate> {
        let elapsed = now.saturating_duration_since(self.tick_start).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(Rate {
            requests_per_sec: self.tick_requests as f64 / elapsed,
            cost_per_sec: self.tick_cost / elapsed,
        })
    }

    /// Throttle ratio of everything recorded since the last [`reset_rate`](Self::reset_rate).
    /// Like the windowed ratio, it ignores failures that were not throttling.
    pub fn throttle_ratio_since_reset(&self) -> ThrottleRatio {
        ThrottleRatio::new(
            self.tick_throttles,
            self.tick_requests - self.tick_failures,
        )
    }

    pub fn reset_rate(&mut self, now: Instant) {
        self.tick_start = now;
        self.tick_requests = 0;
        self.tick_throttles = 0;
        self.tick_failures = 0;
        self.tick_cost = 0.0;
    }

    pub fn buckets(&self) -> &[SecondBucket] {
        &self.buckets
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    pub fn total_throttles(&self) -> u64 {
        self.total_throttles
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn at(start: Instant, millis: u64) -> Instant {
        start + Duration::from_millis(millis)
    }

    #[test]
    fn empty_window_has_zero_ratio() {
        let start = Instant::now();
        let stats = ImportStats::new(start);
        let ratio = stats.throttle_ratio(at(start, 3_000), 1);
        assert_eq!(ratio, ThrottleRatio::new(0, 0));
        assert_eq!(ratio.as_f64(), 0.0);
        assert!(ratio.is_zero());
        assert!(ratio.is_below_percent(10));
        assert!(!ratio.is_below_percent(0));
    }

    #[test]
    fn ratio_counts_throttles_over_requests() {
        let start = Instant::now();
        let mut stats = ImportStats::new(start);
        stats.record_success(at(start, 100), 5.0);
        stats.record_throttle(at(start, 200));
        stats.record_throttle(at(start, 300));
        stats.record_success(at(start, 400), 5.0);

        let ratio = stats.throttle_ratio(at(start, 500), 1);
        assert_eq!(ratio.throttled(), 2);
        assert_eq!(ratio.requests(), 4);
        assert_eq!(ratio.as_f64(), 0.5);
        assert_eq!(ratio.to_string(), "50.00%");
    }

    #[test]
    fn ratio_stays_within_unit_interval() {
        let start = Instant::now();
        let mut stats = ImportStats::new(start);
        for n in 0..50 {
            stats.record_throttle(at(start, n * 37));
            let ratio = stats.throttle_ratio(at(start, n * 37), 2).as_f64();
            assert!((0.0..=1.0).contains(&ratio));
        }
        assert_eq!(stats.throttle_ratio(at(start, 1_850), 1).as_f64(), 1.0);
        assert_eq!(ThrottleRatio::new(7, 3).as_f64(), 1.0);
    }

    #[test]
    fn window_covers_whole_trailing_seconds() {
        let start = Instant::now();
        let mut stats = ImportStats::new(start);
        stats.record_throttle(at(start, 900));
        stats.record_success(at(start, 1_100), 1.0);

        // One-second window at t=1.5s only sees second 1.
        assert!(stats.throttle_ratio(at(start, 1_500), 1).is_zero());
        // Two-second window sees seconds 0 and 1.
        assert_eq!(
            stats.throttle_ratio(at(start, 1_500), 2),
            ThrottleRatio::new(1, 2)
        );
        // Everything has aged out by t=3s with a two-second window.
        assert_eq!(
            stats.throttle_ratio(at(start, 3_000), 2),
            ThrottleRatio::new(0, 0)
        );
    }

    #[test]
    fn gate_comparison_is_exact() {
        assert!(!ThrottleRatio::new(1, 10).is_below_percent(10));
        assert!(ThrottleRatio::new(1, 11).is_below_percent(10));
        assert!(!ThrottleRatio::new(3, 3).is_below_percent(100));
        assert!(ThrottleRatio::new(0, 3).is_below_percent(1));
    }

    #[test]
    fn buckets_are_lazy_and_append_only() {
        let start = Instant::now();
        let mut stats = ImportStats::new(start);
        stats.record_success(at(start, 10), 1.0);
        stats.record_success(at(start, 20), 1.0);
        stats.record_throttle(at(start, 4_200));

        let seconds: Vec<_> = stats.buckets().iter().map(SecondBucket::second).collect();
        assert_eq!(seconds, [0, 4]);
        assert_eq!(stats.buckets()[0].requests(), 2);
        assert_eq!(stats.buckets()[1].throttles(), 1);
    }

    #[test]
    fn other_failures_are_invisible_to_the_ratio() {
        let start = Instant::now();
        let mut stats = ImportStats::new(start);
        stats.record_failure();
        stats.record_failure();
        assert!(stats.buckets().is_empty());
        assert!(stats.throttle_ratio(at(start, 100), 1).is_zero());
        assert_eq!(stats.total_failures(), 2);
        assert_eq!(stats.total_requests(), 0);
    }

    #[test]
    fn cumulative_cost_and_totals() {
        let start = Instant::now();
        let mut stats = ImportStats::new(start);
        for n in 0..4 {
            stats.record_success(at(start, n * 400), 2.5);
        }
        stats.record_throttle(at(start, 2_000));
        assert_eq!(stats.total_cost(), 10.0);
        assert_eq!(stats.total_requests(), 5);
        assert_eq!(stats.total_throttles(), 1);
    }

    #[test]
    fn rate_reports_no_data_for_empty_interval() {
        let start = Instant::now();
        let mut stats = ImportStats::new(start);
        assert_eq!(stats.instantaneous_rate(start), None);

        stats.record_success(at(start, 500), 4.0);
        stats.record_success(at(start, 1_500), 6.0);
        stats.record_failure();
        let rate = stats.instantaneous_rate(at(start, 2_000)).unwrap();
        assert_eq!(rate.requests_per_sec, 1.5);
        assert_eq!(rate.cost_per_sec, 5.0);

        stats.reset_rate(at(start, 2_000));
        assert_eq!(stats.instantaneous_rate(at(start, 2_000)), None);
        assert_eq!(
            stats.instantaneous_rate(at(start, 3_000)),
            Some(Rate {
                requests_per_sec: 0.0,
                cost_per_sec: 0.0
            })
        );
        // Cumulative totals survive the reset.
        assert_eq!(stats.total_cost(), 10.0);
    }

    #[test]
    fn ratio_since_reset_spans_the_whole_interval() {
        let start = Instant::now();
        let mut stats = ImportStats::new(start);
        stats.record_throttle(at(start, 300));
        stats.record_success(at(start, 800), 1.0);
        stats.record_failure();
        stats.record_throttle(at(start, 1_200));

        // The one-second window at t=2s is empty, the interval since the reset is not.
        assert!(stats.throttle_ratio(at(start, 2_000), 1).is_zero());
        assert_eq!(stats.throttle_ratio_since_reset(), ThrottleRatio::new(2, 3));

        stats.reset_rate(at(start, 2_000));
        assert_eq!(stats.throttle_ratio_since_reset(), ThrottleRatio::default());
    }
}
