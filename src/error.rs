//! Error types for key-value and batch consumer operations.
//!
//! Two layers:
//! - [`BrokerError`]: what a broker primitive ([`KvBucket`](crate::KvBucket),
//!   [`PullConsumer`](crate::PullConsumer)) reports at the seam.
//! - [`Error`]: what this crate reports to its callers. Broker-specific shapes
//!   are translated here; only [`Error::OptimisticConcurrency`] is meant to be
//!   branched on.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Boxed source error from a broker client library.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Faults reported by a broker primitive.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The subject has no value.
    #[error("key not found")]
    KeyNotFound,

    /// Compare-and-swap rejected: the expected revision is not the current one.
    #[error("wrong last revision: expected {expected}, current {current:?}")]
    WrongLastRevision { expected: u64, current: Option<u64> },

    /// The broker did not answer in time.
    #[error("broker request timed out")]
    Timeout,

    /// The subscription, consumer or connection is gone.
    #[error("broker handle closed: {0}")]
    Closed(String),

    /// Any other broker or transport fault.
    #[error(transparent)]
    Other(BoxError),
}

impl BrokerError {
    /// Wrap an arbitrary client error.
    pub fn other(err: impl Into<BoxError>) -> Self {
        BrokerError::Other(err.into())
    }

    fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Timeout | BrokerError::Closed(_))
    }
}

/// Which acknowledgement a message was being resolved with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Positive acknowledgement.
    Ack,
    /// Negative acknowledgement, requesting redelivery.
    Nak,
    /// Terminate: never redeliver.
    Term,
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckKind::Ack => f.write_str("ack"),
            AckKind::Nak => f.write_str("nak"),
            AckKind::Term => f.write_str("term"),
        }
    }
}

/// One failed acknowledgement within a batch.
#[derive(Debug)]
pub struct AckFailure {
    /// Position of the message in the batch handed to the handler.
    pub index: usize,
    pub kind: AckKind,
    pub source: BrokerError,
}

/// Every acknowledgement failure from one batch, in batch order.
#[derive(Debug, Default)]
pub struct AckErrors(pub Vec<AckFailure>);

impl AckErrors {
    /// Number of failed acknowledgements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if no acknowledgement failed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Failures in batch order.
    pub fn iter(&self) -> impl Iterator<Item = &AckFailure> {
        self.0.iter()
    }
}

impl fmt::Display for AckErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} acknowledgement(s) failed", self.0.len())?;
        for failure in &self.0 {
            write!(
                f,
                "; message {}: {} failed: {}",
                failure.index, failure.kind, failure.source
            )?;
        }
        Ok(())
    }
}

/// Errors returned by [`KeyValueStore`](crate::KeyValueStore),
/// [`Cursor`](crate::Cursor) and [`BatchProcessor`](crate::BatchProcessor).
#[derive(Debug, Error)]
pub enum Error {
    /// Stored or received bytes are not valid JSON for the target type.
    #[error("failed to decode JSON payload")]
    Decode(#[source] serde_json::Error),

    /// The value could not be serialized as JSON.
    #[error("failed to encode JSON payload")]
    Encode(#[source] serde_json::Error),

    /// Conditional update lost the race: re-read and retry.
    #[error("optimistic concurrency check failed on {subject}: expected revision {expected}")]
    OptimisticConcurrency {
        subject: String,
        expected: u64,
        current: Option<u64>,
    },

    /// Broker or transport fault.
    #[error("backend error")]
    Backend(#[source] BrokerError),

    /// Fetching a batch from the consumer failed.
    #[error("failed to fetch batch")]
    Fetch(#[source] BrokerError),

    /// The batch handler returned the wrong number of outcomes.
    #[error("expected {expected} outcomes, one for each message, but got {actual}")]
    HandlerContract { expected: usize, actual: usize },

    /// A poison message could not be acknowledged.
    #[error("failed to decode message ({decode}) and failed to acknowledge it")]
    PoisonAck {
        decode: serde_json::Error,
        #[source]
        ack: BrokerError,
    },

    /// One or more acknowledgements in a batch failed.
    #[error("{0}")]
    Acknowledgement(AckErrors),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Cancelled partway through acknowledging a batch, after some
    /// acknowledgements had already failed.
    #[error("cancelled while acknowledging: {0}")]
    CancelledAcknowledging(AckErrors),

    /// The configured request timeout elapsed.
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Subject prefix is not a valid broker subject.
    #[error("invalid subject prefix: {0}")]
    InvalidPrefix(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if retrying the same call (after a re-read, for
    /// optimistic concurrency) can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::OptimisticConcurrency { .. }
            | Error::Acknowledgement(_)
            | Error::CancelledAcknowledging(_)
            | Error::DeadlineExceeded(_) => true,
            Error::Backend(err) | Error::Fetch(err) => err.is_transient(),
            _ => false,
        }
    }

    /// Returns true for the optimistic concurrency sentinel.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::OptimisticConcurrency { .. })
    }
}
