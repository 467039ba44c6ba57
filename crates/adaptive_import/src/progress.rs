//! What the controller exposes to whoever renders progress.
use std::time::Duration;

use serde::Serialize;

use crate::adaptive_concurrency::{
    controller::Phase,
    stats::{Rate, ThrottleRatio},
};

/// Point-in-time view of a run, taken on every tick.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub total: u64,
    pub completed: u64,
    pub in_flight: usize,
    pub queued_retries: usize,
    pub dead_letters: usize,
    /// Share of writes throttled since the previous tick.
    pub throttle_ratio: ThrottleRatio,
    /// Requests and cost per second since the previous tick; `None` without elapsed time.
    pub rate: Option<Rate>,
    pub elapsed: Duration,
    pub total_cost: f64,
}

impl ProgressSnapshot {
    /// Share of documents already written, in `[0, 1]`. An empty import is complete.
    pub fn fraction_complete(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            (self.completed as f64 / self.total as f64).min(1.0)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every announced document was written or dead-lettered.
    Completed,
    /// The source ended before delivering as many documents as it announced.
    SourceExhausted,
    /// The run was stopped; in-flight writes were abandoned.
    Cancelled,
}

/// A document given up on after the retry policy's attempt cap.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub sequence: u64,
    pub id: Option<String>,
    pub attempts: usize,
    pub last_error: String,
}

/// Final account of a run. Serializes to a flat record for machine-readable reports.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ImportSummary {
    pub outcome: RunOutcome,
    pub total: u64,
    pub completed: u64,
    /// Write attempts issued, retries included.
    pub dispatches: u64,
    pub throttles: u64,
    /// Failed writes that were not throttled.
    pub failures: u64,
    pub boosts: u64,
    pub total_cost: f64,
    #[serde(serialize_with = "as_secs_f64")]
    pub elapsed: Duration,
    /// Writes still outstanding when the run ended. Non-zero only for cancelled runs.
    pub abandoned_in_flight: usize,
    pub dead_letters: Vec<DeadLetter>,
}

fn as_secs_f64<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Consumer of periodic progress snapshots.
pub trait ProgressReporter {
    fn on_tick(&mut self, snapshot: &ProgressSnapshot);

    fn on_finish(&mut self, _summary: &ImportSummary) {}
}

impl ProgressReporter for () {
    fn on_tick(&mut self, _snapshot: &ProgressSnapshot) {}
}

impl<R: ProgressReporter + ?Sized> ProgressReporter for &mut R {
    fn on_tick(&mut self, snapshot: &ProgressSnapshot) {
        (**self).on_tick(snapshot)
    }

    fn on_finish(&mut self, summary: &ImportSummary) {
        (**self).on_finish(summary)
    }
}

impl<R: ProgressReporter + ?Sized> ProgressReporter for Box<R> {
    fn on_tick(&mut self, snapshot: &ProgressSnapshot) {
        (**self).on_tick(snapshot)
    }

    fn on_finish(&mut self, summary: &ImportSummary) {
        (**self).on_finish(summary)
    }
}
