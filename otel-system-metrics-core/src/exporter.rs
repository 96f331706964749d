//! Sends batches through a transport, retrying transient failures.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Backoff;
use crate::error::{ExportError, TransportError};
use crate::{MetricBatch, ObserverOptions, Transport};

/// Counters shared between the exporter, the scheduler and the handle.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    batches_exported: AtomicU64,
    batches_dropped: AtomicU64,
    points_exported: AtomicU64,
    export_attempts: AtomicU64,
    points_dropped: AtomicU64,
    samples_timed_out: AtomicU64,
}

impl Stats {
    pub(crate) fn record_points_dropped(&self, count: u64) {
        if count > 0 {
            self.points_dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_batch_dropped(&self) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sample_timeout(&self) {
        self.samples_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ExportStats {
        ExportStats {
            batches_exported: self.batches_exported.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            points_exported: self.points_exported.load(Ordering::Relaxed),
            export_attempts: self.export_attempts.load(Ordering::Relaxed),
            points_dropped: self.points_dropped.load(Ordering::Relaxed),
            samples_timed_out: self.samples_timed_out.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the observer's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportStats {
    /// Batches accepted by the collector (including empty ones).
    pub batches_exported: u64,
    /// Batches given up on.
    pub batches_dropped: u64,
    /// Points contained in exported batches.
    pub points_exported: u64,
    /// Calls made to the transport, retries included.
    pub export_attempts: u64,
    /// Points the aggregator discarded.
    pub points_dropped: u64,
    /// Samples abandoned after `sample_timeout`.
    pub samples_timed_out: u64,
}

/// Exports batches with bounded retries.
///
/// Each attempt is bounded by the export timeout. An attempt is always
/// finished or dropped before the next one starts.
pub struct Exporter {
    transport: Arc<dyn Transport>,
    retry_limit: u32,
    backoff: Backoff,
    timeout: Duration,
    max_retry_after: Duration,
    stats: Arc<Stats>,
}

impl Exporter {
    /// Creates an exporter using the retry settings of `options`.
    pub fn new(transport: Arc<dyn Transport>, options: &ObserverOptions) -> Self {
        Self::with_stats(transport, options, Arc::default())
    }

    pub(crate) fn with_stats(
        transport: Arc<dyn Transport>,
        options: &ObserverOptions,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            transport,
            retry_limit: options.retry_limit.max(1),
            backoff: options.backoff,
            timeout: options.export_timeout,
            max_retry_after: options.backoff.max.max(options.interval),
            stats,
        }
    }

    /// Exports one batch.
    ///
    /// On error the batch has been dropped and counted.
    pub async fn export(&self, batch: &MetricBatch) -> Result<(), ExportError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            self.stats.export_attempts.fetch_add(1, Ordering::Relaxed);

            let result = match tokio::time::timeout(self.timeout, self.transport.send(batch)).await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::timeout(self.timeout).into()),
            };

            let err = match result {
                Ok(()) => {
                    self.stats.batches_exported.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .points_exported
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    debug!(
                        sequence = batch.sequence(),
                        points = batch.len(),
                        attempts,
                        "exported batch"
                    );
                    return Ok(());
                }
                Err(ExportError::Transport(err)) if err.is_retryable() => err,
                Err(err) => return Err(self.drop_batch(batch, err)),
            };

            if attempts >= self.retry_limit {
                let err = ExportError::RetriesExhausted {
                    attempts,
                    last: err,
                };
                return Err(self.drop_batch(batch, err));
            }

            let mut delay = self.backoff.delay(attempts);
            if let Some(retry_after) = err.retry_after() {
                if retry_after > self.max_retry_after {
                    warn!(
                        requested_ms = retry_after.as_millis() as u64,
                        "collector asked to wait longer than {}ms, capping the delay",
                        self.max_retry_after.as_millis()
                    );
                }
                delay = delay.max(retry_after.min(self.max_retry_after));
            }
            debug!(
                sequence = batch.sequence(),
                attempts,
                error = %err,
                "export failed, retrying in {}ms",
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn drop_batch(&self, batch: &MetricBatch, err: ExportError) -> ExportError {
        self.stats.batches_dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            sequence = batch.sequence(),
            points = batch.len(),
            error = %err,
            "dropping batch"
        );
        err
    }

    /// Releases the transport.
    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
    }

    /// Current counters.
    pub fn stats(&self) -> ExportStats {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for Exporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exporter")
            .field("retry_limit", &self.retry_limit)
            .field("backoff", &self.backoff)
            .field("timeout", &self.timeout)
            .field("max_retry_after", &self.max_retry_after)
            .finish_non_exhaustive()
    }
}
