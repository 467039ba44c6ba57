//! Metrics and logs emitted by the controller.
//!
//! Each event records through the `metrics` facade and logs through `tracing`. Without an
//! installed recorder the metrics calls are no-ops.
use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::{
    document::Document,
    progress::{DeadLetter, ProgressSnapshot},
    store::FailureKind,
};

pub trait InternalEvent: Sized {
    fn emit(self);
}

#[derive(Clone, Copy, Debug)]
pub struct WriteCompleted {
    pub cost: f64,
}

impl InternalEvent for WriteCompleted {
    fn emit(self) {
        trace!(target: "adaptive_import::stats", cost = self.cost, "Write completed.");
        counter!("bulk_import_writes_total", "outcome" => "success").increment(1);
        // Histogram, as the charge varies per document and the spread is useful for sizing.
        histogram!("bulk_import_request_charge").record(self.cost);
    }
}

#[derive(Debug)]
pub struct WriteFailed<'a> {
    pub document: &'a Document,
    pub kind: FailureKind,
    pub attempts: usize,
    pub error: &'a str,
}

impl InternalEvent for WriteFailed<'_> {
    fn emit(self) {
        match self.kind {
            FailureKind::Throttled => debug!(
                target: "adaptive_import::controller",
                document = %self.document,
                attempts = self.attempts,
                error = %self.error,
                "Write throttled; requeueing."
            ),
            FailureKind::Other => warn!(
                target: "adaptive_import::controller",
                document = %self.document,
                attempts = self.attempts,
                error = %self.error,
                "Write failed; requeueing."
            ),
        }
        counter!("bulk_import_writes_total", "outcome" => self.kind.as_str()).increment(1);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ConcurrencyBoosted {
    pub in_flight: usize,
    pub elapsed: Duration,
}

impl InternalEvent for ConcurrencyBoosted {
    fn emit(self) {
        info!(
            target: "adaptive_import::controller",
            in_flight = self.in_flight,
            elapsed_secs = self.elapsed.as_secs_f64(),
            "No throttling observed; raised concurrency."
        );
        counter!("bulk_import_concurrency_boosts_total").increment(1);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct InFlightChanged {
    pub in_flight: usize,
}

impl InternalEvent for InFlightChanged {
    fn emit(self) {
        gauge!("bulk_import_in_flight").set(self.in_flight as f64);
    }
}

#[derive(Debug)]
pub struct ProgressTicked<'a> {
    pub snapshot: &'a ProgressSnapshot,
}

impl InternalEvent for ProgressTicked<'_> {
    fn emit(self) {
        let snapshot = self.snapshot;
        debug!(
            target: "adaptive_import::stats",
            completed = snapshot.completed,
            total = snapshot.total,
            in_flight = snapshot.in_flight,
            queued_retries = snapshot.queued_retries,
            throttle_ratio = %snapshot.throttle_ratio,
            requests_per_sec = snapshot.rate.map(|rate| rate.requests_per_sec),
            cost_per_sec = snapshot.rate.map(|rate| rate.cost_per_sec),
            "Progress."
        );
        gauge!("bulk_import_throttle_ratio").set(snapshot.throttle_ratio.as_f64());
        gauge!("bulk_import_completed_documents").set(snapshot.completed as f64);
    }
}

#[derive(Debug)]
pub struct DocumentDeadLettered<'a> {
    pub dead_letter: &'a DeadLetter,
}

impl InternalEvent for DocumentDeadLettered<'_> {
    fn emit(self) {
        error!(
            target: "adaptive_import::controller",
            sequence = self.dead_letter.sequence,
            id = ?self.dead_letter.id,
            attempts = self.dead_letter.attempts,
            last_error = %self.dead_letter.last_error,
            "Retries exhausted; dropping the document."
        );
        counter!("bulk_import_dead_letters_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    use super::*;

    #[test]
    fn write_outcomes_are_counted_by_label() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let document = Document::new(0, Some("a".into()), "{}");

        metrics::with_local_recorder(&recorder, || {
            WriteCompleted { cost: 5.0 }.emit();
            WriteCompleted { cost: 7.0 }.emit();
            WriteFailed {
                document: &document,
                kind: FailureKind::Throttled,
                attempts: 1,
                error: "Write throttled by the store (retry after None)",
            }
            .emit();
            ConcurrencyBoosted {
                in_flight: 2,
                elapsed: Duration::from_secs(6),
            }
            .emit();
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let counter_value = |name: &str, outcome: Option<&str>| {
            snapshot.iter().find_map(|(key, _, _, value)| {
                let key = key.key();
                let label_matches = outcome.is_none_or(|outcome| {
                    key.labels()
                        .any(|label| label.key() == "outcome" && label.value() == outcome)
                });
                match value {
                    DebugValue::Counter(count) if key.name() == name && label_matches => {
                        Some(*count)
                    }
                    _ => None,
                }
            })
        };
        assert_eq!(
            counter_value("bulk_import_writes_total", Some("success")),
            Some(2)
        );
        assert_eq!(
            counter_value("bulk_import_writes_total", Some("throttled")),
            Some(1)
        );
        assert_eq!(
            counter_value("bulk_import_concurrency_boosts_total", None),
            Some(1)
        );
    }
}
