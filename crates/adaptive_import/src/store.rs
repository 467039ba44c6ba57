//! The contract between the controller and the store it writes into.
//!
//! A store is any `tower::Service<Document, Response = WriteReceipt>` whose error converts
//! into [`crate::Error`]. The controller only needs to know whether a failed write was
//! throttled; it finds out by downcasting the boxed error to [`StoreError`].
use std::time::Duration;

use crate::Error as CrateError;
use snafu::Snafu;

/// Store-reported result of an accepted write.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WriteReceipt {
    cost: f64,
}

impl WriteReceipt {
    /// Negative or non-finite charges are recorded as zero.
    pub fn new(cost: f64) -> Self {
        let cost = if cost.is_finite() && cost > 0.0 { cost } else { 0.0 };
        Self { cost }
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }
}

/// Failures a store client reports for a single write.
///
/// Only `Throttled` feeds the throttle ratio; every variant sends the document back to the
/// retry queue.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The store refused the write because provisioned capacity is exhausted.
    #[snafu(display("Write throttled by the store (retry after {retry_after:?})"))]
    Throttled { retry_after: Option<Duration> },

    /// The store answered with any other non-success status.
    #[snafu(display("Store rejected the write (status {status}): {body}"))]
    Rejected { status: u16, body: String },

    /// The write never got an answer (network issue, DNS, connection reset).
    #[snafu(display("Store transport error: {source}"))]
    Transport { source: CrateError },

    #[snafu(display("Store write timed out"))]
    Timeout,

    /// The write could not be built from the document.
    #[snafu(display("Invalid store write: {details}"))]
    InvalidRequest { details: String },
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::Throttled { .. } => FailureKind::Throttled,
            _ => FailureKind::Other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Throttled,
    Other,
}

impl FailureKind {
    /// Classifies a boxed service error. Anything that is not a [`StoreError`] is `Other`.
    pub fn classify(error: &CrateError) -> Self {
        error
            .downcast_ref::<StoreError>()
            .map(StoreError::kind)
            .unwrap_or(FailureKind::Other)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Throttled => "throttled",
            FailureKind::Other => "other",
        }
    }
}

/// What the controller learns from a finished write.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RequestOutcome {
    Success { cost: f64 },
    Failure(FailureKind),
}

impl RequestOutcome {
    pub fn from_result(result: &Result<WriteReceipt, CrateError>) -> Self {
        match result {
            Ok(receipt) => RequestOutcome::Success {
                cost: receipt.cost(),
            },
            Err(error) => RequestOutcome::Failure(FailureKind::classify(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_clamps_invalid_costs() {
        assert_eq!(WriteReceipt::new(5.5).cost(), 5.5);
        assert_eq!(WriteReceipt::new(-1.0).cost(), 0.0);
        assert_eq!(WriteReceipt::new(f64::NAN).cost(), 0.0);
        assert_eq!(WriteReceipt::new(f64::INFINITY).cost(), 0.0);
    }

    #[test]
    fn only_throttled_store_errors_classify_as_throttled() {
        let throttled: CrateError = Box::new(StoreError::Throttled { retry_after: None });
        assert_eq!(FailureKind::classify(&throttled), FailureKind::Throttled);

        let rejected: CrateError = Box::new(StoreError::Rejected {
            status: 503,
            body: "busy".into(),
        });
        assert_eq!(FailureKind::classify(&rejected), FailureKind::Other);

        let foreign: CrateError = "connection reset".into();
        assert_eq!(FailureKind::classify(&foreign), FailureKind::Other);
    }

    #[test]
    fn outcome_from_result() {
        let ok: Result<WriteReceipt, CrateError> = Ok(WriteReceipt::new(2.0));
        assert_eq!(
            RequestOutcome::from_result(&ok),
            RequestOutcome::Success { cost: 2.0 }
        );

        let err: Result<WriteReceipt, CrateError> = Err(Box::new(StoreError::Timeout));
        assert_eq!(
            RequestOutcome::from_result(&err),
            RequestOutcome::Failure(FailureKind::Other)
        );
    }
}
