use std::time::Duration;

use bon::Builder;

/// How failed writes are retried.
///
/// The default retries every failed document immediately and without limit: a throttled
/// write goes straight back to the front of the dispatch order and the admission gate is
/// what keeps load off the store. A document that fails permanently then retries forever
/// and the run never finishes; set `max_attempts` to bound that and collect such
/// documents as dead letters instead.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use adaptive_import::{ExponentialBackoff, JitterMode, RetryPolicy};
///
/// let policy = RetryPolicy::builder()
///     .max_attempts(10)
///     .backoff(ExponentialBackoff::doubling(100).max_delay(Duration::from_secs(5)))
///     .jitter(JitterMode::Full)
///     .build();
/// assert!(policy.allows_retry(9));
/// assert!(!policy.allows_retry(10));
/// ```
#[derive(Clone, Debug, Default, Builder)]
pub struct RetryPolicy {
    /// Total number of write attempts per document, the first one included.
    /// `None` retries forever.
    max_attempts: Option<usize>,

    /// Delay before a retried write is issued. `None` retries immediately.
    backoff: Option<ExponentialBackoff>,

    #[builder(default)]
    jitter: JitterMode,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> Option<usize> {
        self.max_attempts
    }

    pub fn backoff(&self) -> Option<&ExponentialBackoff> {
        self.backoff.as_ref()
    }

    /// Whether a document that has failed `attempts` times may be written again.
    pub fn allows_retry(&self, attempts: usize) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }

    /// Delay before the write that follows the `attempts`-th failure.
    pub fn delay_for(&self, attempts: usize) -> Duration {
        let Some(backoff) = &self.backoff else {
            return Duration::ZERO;
        };
        let base = backoff
            .clone()
            .nth(attempts.saturating_sub(1))
            .unwrap_or_default();
        self.jitter.apply(base)
    }
}

/// The jitter mode to use for retry backoff behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterMode {
    /// No jitter.
    None,

    /// Full jitter.
    ///
    /// The random delay is anywhere from 0 up to the maximum current delay calculated by the backoff
    /// strategy.
    ///
    /// Incorporating full jitter into your backoff strategy can greatly reduce the likelihood
    /// of creating accidental denial of service (DoS) conditions against your own systems when
    /// many clients are recovering from a failure state.
    #[default]
    Full,
}

impl JitterMode {
    pub fn apply(&self, base: Duration) -> Duration {
        match self {
            JitterMode::None => base,
            JitterMode::Full => {
                if base.is_zero() {
                    return Duration::ZERO;
                }
                let random_millis = (rand::random::<f64>() * base.as_millis() as f64) as u64;
                Duration::from_millis(random_millis)
            }
        }
    }
}

// `tokio-retry` crate
// MIT License
// Copyright (c) 2017 Sam Rijs
//
/// A retry strategy driven by exponential back-off.
///
/// The power corresponds to the number of past attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    start: u64,
    current: u64,
    base: u64,
    factor: u64,
    max_delay: Option<Duration>,
}

impl ExponentialBackoff {
    /// Constructs a new exponential back-off strategy,
    /// given a base duration in milliseconds.
    ///
    /// The resulting duration is calculated by taking the base to the `n`-th power,
    /// where `n` denotes the number of past attempts.
    pub const fn from_millis(base: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            start: base,
            current: base,
            base,
            factor: 1u64,
            max_delay: None,
        }
    }

    /// Starts at `initial_ms` and doubles on every attempt.
    pub const fn doubling(initial_ms: u64) -> ExponentialBackoff {
        ExponentialBackoff {
            start: 1,
            current: 1,
            base: 2,
            factor: initial_ms,
            max_delay: None,
        }
    }

    /// Apply a maximum delay. No retry delay will be longer than this `Duration`.
    pub const fn max_delay(mut self, duration: Duration) -> ExponentialBackoff {
        self.max_delay = Some(duration);
        self
    }

    /// Resets the exponential back-off strategy to its initial state.
    pub fn reset(&mut self) {
        self.current = self.start;
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        // set delay duration by applying factor
        let duration = if let Some(duration) = self.current.checked_mul(self.factor) {
            Duration::from_millis(duration)
        } else {
            Duration::from_millis(u64::MAX)
        };

        // check if we reached max delay
        if let Some(ref max_delay) = self.max_delay {
            if duration > *max_delay {
                return Some(*max_delay);
            }
        }

        if let Some(next) = self.current.checked_mul(self.base) {
            self.current = next;
        } else {
            self.current = u64::MAX;
        }

        Some(duration)
    }
}
