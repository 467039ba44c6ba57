//! Decide how many writes are outstanding, from the store's own throttling signal.

pub mod controller;
mod retry_queue;
pub mod retries;
pub mod stats;

use std::time::Duration;

use bon::Builder;
use snafu::{Snafu, ensure};

use self::retries::RetryPolicy;

fn instant_now() -> tokio::time::Instant {
    tokio::time::Instant::now()
}

/// Configuration of the admission-control loop.
///
/// The defaults reproduce the reference behavior of the importer and rarely need to change.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `gate_window_secs` | 1 | Trailing window (whole seconds) of the throttle ratio that gates replacement writes |
/// | `throttle_gate_percent` | 10 | A completion is replaced only while the gate ratio stays below this, or when nothing is in flight |
/// | `boost_window_secs` | 1 | Trailing window that must be free of throttling for a boost |
/// | `boost_warmup` | 5s | No boost before the run is this old |
/// | `boost_interval` | 2s | Minimum time between two boosts |
/// | `tick_interval` | 1s | Progress snapshot and rate counter cadence |
/// | `retry` | unbounded, no backoff | See [`RetryPolicy`] |
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use adaptive_import::ImportSettings;
///
/// let settings = ImportSettings::builder()
///     .gate_window_secs(2)
///     .throttle_gate_percent(5)
///     .boost_interval(Duration::from_secs(3))
///     .build();
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Clone, Debug, Builder)]
pub struct ImportSettings {
    /// Trailing window, in whole seconds, of the throttle ratio consulted before replacing a
    /// completed write.
    #[builder(default = 1)]
    pub(crate) gate_window_secs: u64,

    /// Gate threshold in percent. The ratio is compared exactly, without rounding.
    #[builder(default = 10)]
    pub(crate) throttle_gate_percent: u32,

    /// Trailing window, in whole seconds, that must hold no throttled write for a boost.
    #[builder(default = 1)]
    pub(crate) boost_window_secs: u64,

    /// The run must be strictly older than this before the first boost.
    #[builder(default = Duration::from_secs(5))]
    pub(crate) boost_warmup: Duration,

    /// The previous boost must be strictly older than this.
    #[builder(default = Duration::from_secs(2))]
    pub(crate) boost_interval: Duration,

    #[builder(default = Duration::from_secs(1))]
    pub(crate) tick_interval: Duration,

    #[builder(default)]
    pub(crate) retry: RetryPolicy,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ImportSettings {
    pub fn gate_window_secs(&self) -> u64 {
        self.gate_window_secs
    }

    pub fn throttle_gate_percent(&self) -> u32 {
        self.throttle_gate_percent
    }

    pub fn boost_window_secs(&self) -> u64 {
        self.boost_window_secs
    }

    pub fn boost_warmup(&self) -> Duration {
        self.boost_warmup
    }

    pub fn boost_interval(&self) -> Duration {
        self.boost_interval
    }

    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        ensure!(
            self.gate_window_secs > 0,
            ZeroWindowSnafu { name: "gate_window_secs" }
        );
        ensure!(
            self.boost_window_secs > 0,
            ZeroWindowSnafu { name: "boost_window_secs" }
        );
        ensure!(
            self.throttle_gate_percent <= 100,
            GateOutOfRangeSnafu {
                percent: self.throttle_gate_percent
            }
        );
        ensure!(!self.tick_interval.is_zero(), ZeroTickIntervalSnafu);
        ensure!(self.retry.max_attempts() != Some(0), ZeroMaxAttemptsSnafu);
        Ok(())
    }
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum SettingsError {
    #[snafu(display("{name} must be at least one second"))]
    ZeroWindow { name: &'static str },

    #[snafu(display("Throttle gate must be between 0 and 100 percent, got {percent}"))]
    GateOutOfRange { percent: u32 },

    #[snafu(display("Tick interval must be greater than zero"))]
    ZeroTickInterval,

    #[snafu(display("Retry policy must allow at least one attempt"))]
    ZeroMaxAttempts,
}
