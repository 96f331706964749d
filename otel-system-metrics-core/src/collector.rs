//! Metric collector trait.

use crate::MetricPoint;

/// A source of metric points.
///
/// Implement this trait to add metrics to the periodic sampling. Built-in
/// host and process collectors live in the `otel-system-metrics-collectors`
/// crate.
///
/// # Example
///
/// ```rust
/// use otel_system_metrics_core::{MetricCollector, MetricPoint};
///
/// struct QueueDepthCollector {
///     // Reference to your work queue
/// }
///
/// impl MetricCollector for QueueDepthCollector {
///     fn collect(&self) -> Vec<MetricPoint> {
///         vec![MetricPoint::gauge("app.queue.depth", 12_i64).with_unit("{item}")]
///     }
///
///     fn name(&self) -> &'static str {
///         "queue-depth"
///     }
/// }
/// ```
pub trait MetricCollector: Send + Sync + 'static {
    /// Reads the current values.
    ///
    /// This runs on a blocking thread once per sample tick. A metric that
    /// cannot be read is left out of the result; the collector should log the
    /// failure and return whatever it could read.
    fn collect(&self) -> Vec<MetricPoint>;

    /// Name of this collector for logging.
    fn name(&self) -> &'static str;
}
