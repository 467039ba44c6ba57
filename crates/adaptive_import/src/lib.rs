//! Throttle-driven adaptive concurrency for bulk imports into a rate-limited store.
//!
//! The crate drives a stream of documents into a store that rejects writes when its
//! provisioned capacity is exceeded. Instead of a fixed worker pool, a single serial
//! decision loop decides after every completed write whether to issue zero, one, or
//! two follow-up writes, using the store's own throttling signal as feedback.
//!
//! # Algorithm Overview
//!
//! After every completion (and once at start):
//! 1. **Gate**: a replacement write is issued only when nothing is in flight or the
//!    trailing throttle ratio is below the gate (default 10%).
//! 2. **Replace**: one write is issued, retries first, then fresh documents.
//! 3. **Boost**: once the run is past its warm-up, no write was throttled in the boost
//!    window and the previous boost is old enough, a second write is issued.
//!
//! Concurrency is never reduced explicitly; it shrinks when completions are not
//! replaced.
//!
//! # Basic Usage
//! ```no_run
//! use adaptive_import::{Importer, ImportSettings, JsonLinesSource, WriteReceipt, Document};
//! use tower::service_fn;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let source = JsonLinesSource::open("documents.jsonl")?;
//! let store = service_fn(|_doc: Document| async { Ok::<_, adaptive_import::Error>(WriteReceipt::new(1.0)) });
//! let summary = Importer::new(store, source, ImportSettings::default())?
//!     .run(())
//!     .await?;
//! println!("uploaded {} documents", summary.completed);
//! # Ok(())
//! # }
//! ```
//!
//! # Metrics
//! Emits metrics through the `metrics` facade via the [`internal_event::InternalEvent`] trait.
pub mod adaptive_concurrency;
pub mod document;
pub mod internal_event;
pub mod progress;
pub mod source;
pub mod store;
#[cfg(test)]
pub mod test_utils;

pub use adaptive_concurrency::{
    ImportSettings, SettingsError,
    controller::{ImportError, Importer, Phase},
    retries::{ExponentialBackoff, JitterMode, RetryPolicy},
    stats::{ImportStats, Rate, ThrottleRatio},
};
pub use document::Document;
pub use progress::{DeadLetter, ImportSummary, ProgressReporter, ProgressSnapshot, RunOutcome};
pub use source::{DocumentSource, JsonLinesSource, SourceError, VecSource};
pub use store::{FailureKind, RequestOutcome, StoreError, WriteReceipt};

#[macro_use]
extern crate tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
