//! The serial decision loop.
//!
//! An [`Importer`] owns every piece of mutable run state: counters, stats, the retry queue
//! and the document source. Writes run as spawned tasks that only ever post a completion
//! event back into the loop's channel, so the loop handles one event at a time and needs no
//! locking.
//!
//! ```text
//!                ┌──────────────┐  Completed / Tick   ┌─────────────┐
//!  retry queue ─▶│   Importer   │◀────────────────────│ write tasks │
//!  source ──────▶│ (event loop) │─────dispatch───────▶│   ticker    │
//!                └──────────────┘                     └─────────────┘
//! ```
use std::{future::Future, time::Duration};

use snafu::{ResultExt, Snafu};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tower::{Service, ServiceExt};

use super::{
    ImportSettings, SettingsError, instant_now,
    retry_queue::{PendingWrite, RetryQueue},
    stats::ImportStats,
};
use crate::{
    Error as CrateError,
    document::Document,
    internal_event::{
        ConcurrencyBoosted, DocumentDeadLettered, InFlightChanged, InternalEvent,
        ProgressTicked, WriteCompleted, WriteFailed,
    },
    progress::{DeadLetter, ImportSummary, ProgressReporter, ProgressSnapshot, RunOutcome},
    source::{DocumentSource, SourceError},
    store::{FailureKind, RequestOutcome, WriteReceipt},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    /// The source is exhausted; only retries and in-flight writes remain.
    Draining,
    Terminated,
}

#[derive(Debug, Snafu)]
pub enum ImportError {
    #[snafu(display("Invalid import settings: {source}"))]
    Settings { source: SettingsError },

    #[snafu(display("Failed to read the next document: {source}"))]
    Source { source: SourceError },
}

enum ControllerEvent {
    Completed {
        write: PendingWrite,
        outcome: RequestOutcome,
        error: Option<CrateError>,
    },
    Tick,
}

#[derive(Debug)]
struct ControllerState {
    total: u64,
    completed: u64,
    in_flight: usize,
    dispatches: u64,
    outcomes: u64,
    boosts: u64,
    run_start: Instant,
    last_boost: Instant,
    source_exhausted: bool,
}

impl ControllerState {
    fn new(total: u64, now: Instant) -> Self {
        Self {
            total,
            completed: 0,
            in_flight: 0,
            dispatches: 0,
            outcomes: 0,
            boosts: 0,
            run_start: now,
            last_boost: now,
            source_exhausted: false,
        }
    }
}

/// Posts a tick into the loop every period until dropped.
struct Ticker(JoinHandle<()>);

impl Ticker {
    fn spawn(period: Duration, events: mpsc::UnboundedSender<ControllerEvent>) -> Self {
        Self(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(instant_now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if events.send(ControllerEvent::Tick).is_err() {
                    break;
                }
            }
        }))
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives every document of a [`DocumentSource`] into a store service.
///
/// The store is any `tower::Service<Document, Response = WriteReceipt>`. It is cloned for
/// each write, like any other tower client.
pub struct Importer<S, D> {
    service: S,
    source: D,
    settings: ImportSettings,
    phase: Phase,
    state: ControllerState,
    stats: ImportStats,
    retry_queue: RetryQueue,
    dead_letters: Vec<DeadLetter>,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
}

impl<S, D> Importer<S, D>
where
    S: Service<Document, Response = WriteReceipt> + Clone + Send + 'static,
    S::Error: Into<CrateError> + Send + 'static,
    S::Future: Send + 'static,
    D: DocumentSource,
{
    pub fn new(service: S, source: D, settings: ImportSettings) -> Result<Self, ImportError> {
        settings.validate().context(SettingsSnafu)?;
        let now = instant_now();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            state: ControllerState::new(source.total(), now),
            stats: ImportStats::new(now),
            service,
            source,
            settings,
            phase: Phase::Idle,
            retry_queue: RetryQueue::default(),
            dead_letters: Vec::new(),
            events_tx,
            events_rx,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Runs until every document is written (or dead-lettered) or the source runs dry.
    pub async fn run<R: ProgressReporter>(self, reporter: R) -> Result<ImportSummary, ImportError> {
        self.run_until(reporter, futures::future::pending()).await
    }

    /// Like [`run`](Self::run), but stops as soon as `shutdown` resolves. Writes still in
    /// flight at that point are abandoned, not awaited.
    pub async fn run_until<R, F>(
        mut self,
        mut reporter: R,
        shutdown: F,
    ) -> Result<ImportSummary, ImportError>
    where
        R: ProgressReporter,
        F: Future<Output = ()>,
    {
        self.start()?;
        let ticker = Ticker::spawn(self.settings.tick_interval, self.events_tx.clone());
        tokio::pin!(shutdown);

        let mut cancelled = false;
        while self.phase != Phase::Terminated {
            let event = tokio::select! {
                biased;
                () = &mut shutdown => {
                    cancelled = true;
                    break;
                }
                event = self.events_rx.recv() => event,
            };
            match event {
                Some(event) => self.handle(event, &mut reporter)?,
                None => break,
            }
        }
        drop(ticker);
        self.phase = Phase::Terminated;

        let summary = self.summary(instant_now(), cancelled);
        match summary.outcome {
            RunOutcome::Completed => info!(
                target: "adaptive_import::controller",
                completed = summary.completed,
                dead_letters = summary.dead_letters.len(),
                elapsed_secs = summary.elapsed.as_secs_f64(),
                "Import finished."
            ),
            RunOutcome::SourceExhausted => warn!(
                target: "adaptive_import::controller",
                completed = summary.completed,
                total = summary.total,
                "Input ended before the announced number of documents."
            ),
            RunOutcome::Cancelled => warn!(
                target: "adaptive_import::controller",
                completed = summary.completed,
                abandoned_in_flight = summary.abandoned_in_flight,
                queued_retries = self.retry_queue.len(),
                "Import stopped before completion."
            ),
        }
        reporter.on_finish(&summary);
        Ok(summary)
    }

    fn start(&mut self) -> Result<(), ImportError> {
        let now = instant_now();
        self.state = ControllerState::new(self.source.total(), now);
        self.stats = ImportStats::new(now);
        self.phase = Phase::Running;
        info!(target: "adaptive_import::controller", total = self.state.total, "Starting import.");

        self.admit(now)?;
        self.check_termination();
        Ok(())
    }

    fn handle<R: ProgressReporter>(
        &mut self,
        event: ControllerEvent,
        reporter: &mut R,
    ) -> Result<(), ImportError> {
        match event {
            ControllerEvent::Completed {
                write,
                outcome,
                error,
            } => self.on_completed(write, outcome, error),
            ControllerEvent::Tick => {
                self.on_tick(reporter);
                Ok(())
            }
        }
    }

    fn on_completed(
        &mut self,
        mut write: PendingWrite,
        outcome: RequestOutcome,
        error: Option<CrateError>,
    ) -> Result<(), ImportError> {
        let now = instant_now();
        debug_assert!(self.state.in_flight > 0, "completion without a dispatch");
        self.state.in_flight = self.state.in_flight.saturating_sub(1);
        self.state.outcomes += 1;
        debug_assert_eq!(
            self.state.in_flight as u64,
            self.state.dispatches - self.state.outcomes
        );

        match outcome {
            RequestOutcome::Success { cost } => {
                self.state.completed += 1;
                self.stats.record_success(now, cost);
                WriteCompleted { cost }.emit();
            }
            RequestOutcome::Failure(kind) => {
                write.attempts += 1;
                match kind {
                    FailureKind::Throttled => self.stats.record_throttle(now),
                    FailureKind::Other => self.stats.record_failure(),
                }
                let message = error
                    .as_ref()
                    .map_or_else(|| kind.as_str().to_owned(), ToString::to_string);
                WriteFailed {
                    document: &write.document,
                    kind,
                    attempts: write.attempts,
                    error: &message,
                }
                .emit();

                if self.settings.retry.allows_retry(write.attempts) {
                    self.retry_queue.push(write);
                } else {
                    let dead_letter = DeadLetter {
                        sequence: write.document.sequence(),
                        id: write.document.id().map(str::to_owned),
                        attempts: write.attempts,
                        last_error: message,
                    };
                    DocumentDeadLettered {
                        dead_letter: &dead_letter,
                    }
                    .emit();
                    self.dead_letters.push(dead_letter);
                }
            }
        }
        InFlightChanged {
            in_flight: self.state.in_flight,
        }
        .emit();

        self.admit(now)?;
        self.check_termination();
        Ok(())
    }

    fn on_tick<R: ProgressReporter>(&mut self, reporter: &mut R) {
        let now = instant_now();
        let snapshot = self.snapshot(now);
        ProgressTicked {
            snapshot: &snapshot,
        }
        .emit();
        reporter.on_tick(&snapshot);
        self.stats.reset_rate(now);
    }

    /// Replaces the completed write if the throttle gate allows it, and adds one more write
    /// when the store has shown no throttling for long enough.
    fn admit(&mut self, now: Instant) -> Result<(), ImportError> {
        let gate = self.stats.throttle_ratio(now, self.settings.gate_window_secs);
        if self.state.in_flight > 0 && !gate.is_below_percent(self.settings.throttle_gate_percent)
        {
            trace!(
                target: "adaptive_import::controller",
                in_flight = self.state.in_flight,
                throttle_ratio = %gate,
                "Throttle gate closed; not replacing the completed write."
            );
            return Ok(());
        }

        if !self.try_dispatch()? {
            return Ok(());
        }

        let elapsed = now.saturating_duration_since(self.state.run_start);
        let since_boost = now.saturating_duration_since(self.state.last_boost);
        if elapsed > self.settings.boost_warmup
            && since_boost > self.settings.boost_interval
            && self
                .stats
                .throttle_ratio(now, self.settings.boost_window_secs)
                .is_zero()
            && self.try_dispatch()?
        {
            self.state.last_boost = now;
            self.state.boosts += 1;
            ConcurrencyBoosted {
                in_flight: self.state.in_flight,
                elapsed,
            }
            .emit();
        }
        Ok(())
    }

    /// Dispatches the oldest retry, else the next fresh document. `false` when neither
    /// exists.
    fn try_dispatch(&mut self) -> Result<bool, ImportError> {
        let write = match self.retry_queue.pop() {
            Some(write) => write,
            None => match self.next_fresh()? {
                Some(document) => PendingWrite::fresh(document),
                None => return Ok(false),
            },
        };
        self.dispatch(write);
        Ok(true)
    }

    fn next_fresh(&mut self) -> Result<Option<Document>, ImportError> {
        if self.state.source_exhausted {
            return Ok(None);
        }
        let next = self.source.next_document().context(SourceSnafu)?;
        if next.is_none() {
            self.state.source_exhausted = true;
            if self.phase == Phase::Running {
                self.phase = Phase::Draining;
                debug!(
                    target: "adaptive_import::controller",
                    in_flight = self.state.in_flight,
                    queued_retries = self.retry_queue.len(),
                    "Source exhausted; draining."
                );
            }
        }
        Ok(next)
    }

    fn dispatch(&mut self, write: PendingWrite) {
        let delay = if write.attempts == 0 {
            Duration::ZERO
        } else {
            self.settings.retry.delay_for(write.attempts)
        };
        trace!(
            target: "adaptive_import::controller",
            document = %write.document,
            attempts = write.attempts,
            delay_ms = delay.as_millis() as u64,
            "Dispatching write."
        );

        self.state.in_flight += 1;
        self.state.dispatches += 1;
        debug_assert_eq!(
            self.state.in_flight as u64,
            self.state.dispatches - self.state.outcomes
        );
        InFlightChanged {
            in_flight: self.state.in_flight,
        }
        .emit();

        let mut service = self.service.clone();
        let events = self.events_tx.clone();
        let document = write.document.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result: Result<WriteReceipt, CrateError> = match service.ready().await {
                Ok(ready) => ready.call(document).await.map_err(Into::into),
                Err(error) => Err(error.into()),
            };
            let outcome = RequestOutcome::from_result(&result);
            // Fails only once the loop is gone, in which case nobody tracks this write.
            let _ = events.send(ControllerEvent::Completed {
                write,
                outcome,
                error: result.err(),
            });
        });
    }

    fn check_termination(&mut self) {
        if self.state.in_flight > 0 || !self.retry_queue.is_empty() {
            return;
        }
        let resolved = self.state.completed + self.dead_letters.len() as u64;
        if resolved >= self.state.total || self.state.source_exhausted {
            self.phase = Phase::Terminated;
        }
    }

    fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            phase: self.phase,
            total: self.state.total,
            completed: self.state.completed,
            in_flight: self.state.in_flight,
            queued_retries: self.retry_queue.len(),
            dead_letters: self.dead_letters.len(),
            throttle_ratio: self.stats.throttle_ratio_since_reset(),
            rate: self.stats.instantaneous_rate(now),
            elapsed: now.saturating_duration_since(self.state.run_start),
            total_cost: self.stats.total_cost(),
        }
    }

    fn summary(&self, now: Instant, cancelled: bool) -> ImportSummary {
        let resolved = self.state.completed + self.dead_letters.len() as u64;
        let outcome = if cancelled {
            RunOutcome::Cancelled
        } else if resolved < self.state.total {
            RunOutcome::SourceExhausted
        } else {
            RunOutcome::Completed
        };
        ImportSummary {
            outcome,
            total: self.state.total,
            completed: self.state.completed,
            dispatches: self.state.dispatches,
            throttles: self.stats.total_throttles(),
            failures: self.stats.total_failures(),
            boosts: self.state.boosts,
            total_cost: self.stats.total_cost(),
            elapsed: now.saturating_duration_since(self.state.run_start),
            abandoned_in_flight: self.state.in_flight,
            dead_letters: self.dead_letters.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future;

    use tokio::time::advance;
    use tower::{service_fn, util::ServiceFn};

    use super::*;
    use crate::{source::VecSource, test_utils::trace_init};

    type Pending = future::Pending<Result<WriteReceipt, CrateError>>;
    type StalledStore = ServiceFn<fn(Document) -> Pending>;

    fn never_completes(_document: Document) -> Pending {
        future::pending()
    }

    /// An importer whose writes never complete, so tests can drive `admit` by hand.
    fn stalled_importer(documents: u64) -> Importer<StalledStore, VecSource> {
        let store: StalledStore = service_fn(never_completes as fn(Document) -> Pending);
        Importer::new(store, VecSource::numbered("doc-", documents), ImportSettings::default())
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn start_dispatches_exactly_one_write() {
        trace_init();
        let mut importer = stalled_importer(10);
        assert_eq!(importer.phase(), Phase::Idle);

        importer.start().unwrap();
        assert_eq!(importer.phase(), Phase::Running);
        assert_eq!(importer.state.in_flight, 1);
        assert_eq!(importer.state.dispatches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_source_terminates_at_start() {
        let mut importer = stalled_importer(0);
        importer.start().unwrap();
        assert_eq!(importer.phase(), Phase::Terminated);
        assert_eq!(importer.state.dispatches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_holds_back_replacement_while_throttled() {
        let mut importer = stalled_importer(10);
        importer.start().unwrap();

        let now = instant_now();
        importer.stats.record_throttle(now);
        importer.admit(now).unwrap();
        assert_eq!(importer.state.in_flight, 1, "gate closed at 100% throttled");

        // 1 of 10 is not below 10%.
        for _ in 0..9 {
            importer.stats.record_success(now, 1.0);
        }
        importer.admit(now).unwrap();
        assert_eq!(importer.state.in_flight, 1);

        // 1 of 11 is.
        importer.stats.record_success(now, 1.0);
        importer.admit(now).unwrap();
        assert_eq!(importer.state.in_flight, 2);
        assert_eq!(importer.state.dispatches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gate_never_blocks_when_nothing_is_in_flight() {
        let mut importer = stalled_importer(10);
        let now = instant_now();
        importer.stats.record_throttle(now);
        importer.phase = Phase::Running;
        importer.admit(now).unwrap();
        assert_eq!(importer.state.in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn boost_waits_for_warmup_and_interval() {
        let mut importer = stalled_importer(100);
        importer.start().unwrap();

        // Before the warm-up: plain one-for-one replacement.
        advance(Duration::from_secs(5)).await;
        importer.admit(instant_now()).unwrap();
        assert_eq!(importer.state.in_flight, 2);
        assert_eq!(importer.state.boosts, 0);

        // Strictly past the warm-up: replacement plus boost.
        advance(Duration::from_millis(1)).await;
        importer.admit(instant_now()).unwrap();
        assert_eq!(importer.state.in_flight, 4);
        assert_eq!(importer.state.boosts, 1);

        // The interval since the last boost is not over yet.
        advance(Duration::from_secs(2)).await;
        importer.admit(instant_now()).unwrap();
        assert_eq!(importer.state.in_flight, 5);
        assert_eq!(importer.state.boosts, 1);

        advance(Duration::from_millis(1)).await;
        importer.admit(instant_now()).unwrap();
        assert_eq!(importer.state.in_flight, 7);
        assert_eq!(importer.state.boosts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn any_throttling_in_the_boost_window_blocks_the_boost() {
        let mut importer = stalled_importer(100);
        importer.start().unwrap();
        advance(Duration::from_secs(10)).await;

        let now = instant_now();
        importer.stats.record_throttle(now);
        for _ in 0..99 {
            importer.stats.record_success(now, 1.0);
        }
        importer.admit(now).unwrap();
        assert_eq!(importer.state.in_flight, 2);
        assert_eq!(importer.state.boosts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn boost_is_a_no_op_when_nothing_is_left() {
        let mut importer = stalled_importer(1);
        importer.start().unwrap();
        advance(Duration::from_secs(10)).await;

        importer.admit(instant_now()).unwrap();
        assert_eq!(importer.state.in_flight, 1);
        assert_eq!(importer.state.boosts, 0);
        assert_eq!(importer.phase(), Phase::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_dispatched_before_fresh_documents() {
        let mut importer = stalled_importer(10);
        importer.start().unwrap();
        importer.retry_queue.push(PendingWrite {
            document: Document::new(42, Some("retry-me".into()), "{}"),
            attempts: 1,
        });

        importer.try_dispatch().unwrap();
        assert!(importer.retry_queue.is_empty());
        assert_eq!(importer.state.in_flight, 2);

        // The source was only consulted once, for the first write.
        let next = importer.source.next_document().unwrap().unwrap();
        assert_eq!(next.id(), Some("doc-1"));
    }

    #[test]
    fn rejects_invalid_settings() {
        let store: StalledStore = service_fn(never_completes as fn(Document) -> Pending);
        let settings = ImportSettings::builder().gate_window_secs(0).build();
        let result = Importer::new(store, VecSource::numbered("doc-", 1), settings);
        assert!(matches!(result, Err(ImportError::Settings { .. })));
    }
}
