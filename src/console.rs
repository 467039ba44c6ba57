use std::io::Write;

use adaptive_import::{ImportSummary, ProgressReporter, ProgressSnapshot, RunOutcome};

const BAR_WIDTH: usize = 10;

/// Prints one progress line per tick and a closing summary.
pub struct ConsoleReporter<W> {
    out: W,
}

impl<W: Write> ConsoleReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }
}

/// `[####------] 40.00% | in flight 3 | throttled 0.00% | 12.0 req/s | 61.5 RU/s`
pub fn progress_line(snapshot: &ProgressSnapshot) -> String {
    let fraction = snapshot.fraction_complete();
    let filled = ((fraction * BAR_WIDTH as f64).floor() as usize).min(BAR_WIDTH);
    let bar = format!("{}{}", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled));

    let mut line = format!(
        "[{bar}] {:.2}% | in flight {} | throttled {}",
        fraction * 100.0,
        snapshot.in_flight,
        snapshot.throttle_ratio,
    );
    match snapshot.rate {
        Some(rate) => line.push_str(&format!(
            " | {:.1} req/s | {:.1} RU/s",
            rate.requests_per_sec, rate.cost_per_sec
        )),
        None => line.push_str(" | - req/s | - RU/s"),
    }
    if snapshot.queued_retries > 0 {
        line.push_str(&format!(" | retrying {}", snapshot.queued_retries));
    }
    line
}

impl<W: Write> ProgressReporter for ConsoleReporter<W> {
    fn on_tick(&mut self, snapshot: &ProgressSnapshot) {
        let _ = writeln!(self.out, "{}", progress_line(snapshot));
    }

    fn on_finish(&mut self, summary: &ImportSummary) {
        let out = &mut self.out;
        let _ = writeln!(
            out,
            "Uploaded {} documents in {:.2} seconds",
            summary.completed,
            summary.elapsed.as_secs_f64()
        );
        match summary.outcome {
            RunOutcome::Completed => {}
            RunOutcome::SourceExhausted => {
                let _ = writeln!(
                    out,
                    "Input ended after {} of {} announced documents",
                    summary.completed + summary.dead_letters.len() as u64,
                    summary.total
                );
            }
            RunOutcome::Cancelled => {
                let _ = writeln!(
                    out,
                    "Stopped with {} of {} documents uploaded; {} writes abandoned in flight",
                    summary.completed, summary.total, summary.abandoned_in_flight
                );
            }
        }
        if !summary.dead_letters.is_empty() {
            let _ = writeln!(out, "Gave up on {} documents:", summary.dead_letters.len());
            for dead_letter in &summary.dead_letters {
                let id = dead_letter.id.as_deref().unwrap_or("<no id>");
                let _ = writeln!(
                    out,
                    "  #{} ({id}) after {} attempts: {}",
                    dead_letter.sequence, dead_letter.attempts, dead_letter.last_error
                );
            }
        }
        let _ = out.flush();
    }
}
