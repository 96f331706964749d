//! Error types.
//!
//! Only [`ConfigError`] and [`Error::NotRunning`] ever reach the caller of the
//! runtime handle. Sampling and export errors are logged and counted by the
//! background task.

use std::time::Duration;

use thiserror::Error;

/// An invalid configuration, reported by `init`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// The handle was already initialized and is collecting.
    #[error("already running")]
    AlreadyRunning,
    /// A duration option was zero.
    #[error("`{0}` must be greater than zero")]
    ZeroDuration(&'static str),
    /// `retry_limit` was zero.
    #[error("`retry_limit` must allow at least one attempt")]
    ZeroRetryLimit,
    /// `max_batch_points` was zero.
    #[error("`max_batch_points` must be greater than zero")]
    ZeroBatchSize,
    /// The initial backoff exceeds the maximum backoff.
    #[error("`initial_backoff` ({initial:?}) exceeds `max_backoff` ({max:?})")]
    InvalidBackoff {
        /// The configured initial backoff.
        initial: Duration,
        /// The configured maximum backoff.
        max: Duration,
    },
    /// The collector endpoint could not be parsed.
    #[error("invalid endpoint `{endpoint}`: {reason}")]
    InvalidEndpoint {
        /// The endpoint as configured.
        endpoint: String,
        /// Why it was rejected.
        reason: String,
    },
    /// The protocol name is not one of `grpc`, `http`, `http/protobuf` or `stdout`.
    #[error("unknown protocol `{0}`")]
    UnknownProtocol(String),
    /// The protocol was compiled out of this build.
    #[error("protocol `{0}` is not supported by this build")]
    UnsupportedProtocol(&'static str),
    /// No transport factory was configured.
    #[error("no transport configured")]
    MissingTransport,
    /// The transport could not be created.
    #[error("failed to create transport: {0}")]
    Transport(String),
    /// The background runtime could not be started.
    #[error("failed to start background runtime: {0}")]
    Runtime(String),
}

/// Errors returned by [`RuntimeHandle`](crate::RuntimeHandle) operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The handle is not in the running state.
    #[error("not running")]
    NotRunning,
}

/// A single metric could not be read. Never fatal: the metric is omitted.
#[derive(Debug, Error)]
#[error("failed to read `{metric}`: {reason}")]
pub struct SampleReadError {
    metric: &'static str,
    reason: String,
}

impl SampleReadError {
    /// Creates a new read error for the given metric.
    pub fn new(metric: &'static str, reason: impl ToString) -> Self {
        Self {
            metric,
            reason: reason.to_string(),
        }
    }

    /// The metric that could not be read.
    pub fn metric(&self) -> &'static str {
        self.metric
    }
}

/// A batch could not be encoded. Fatal to that batch only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to serialize batch: {0}")]
pub struct SerializationError(pub String);

/// Broad classification of a transport failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The collector could not be reached.
    Connect,
    /// The attempt exceeded the export timeout.
    Timeout,
    /// The collector answered with an error status.
    Status,
    /// Anything else.
    Other,
}

/// Sending a batch failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind:?} error: {message}")]
pub struct TransportError {
    kind: TransportErrorKind,
    message: String,
    retryable: bool,
    retry_after: Option<Duration>,
}

impl TransportError {
    /// Creates a transient error that will be retried.
    pub fn retryable(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: true,
            retry_after: None,
        }
    }

    /// Creates a permanent error; the batch is dropped without retrying.
    pub fn permanent(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }

    /// An attempt that did not finish within `timeout`.
    pub fn timeout(timeout: Duration) -> Self {
        Self::retryable(
            TransportErrorKind::Timeout,
            format!("no response within {}ms", timeout.as_millis()),
        )
    }

    /// Attaches a server-provided hint on how long to wait before retrying.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// The kind of failure.
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    /// Whether the exporter should try again.
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// The server's retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Exporting a batch failed and the batch was dropped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// The batch could not be encoded.
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    /// A non-retryable transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Every allowed attempt failed with a transient error.
    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The error of the final attempt.
        last: TransportError,
    },
}
