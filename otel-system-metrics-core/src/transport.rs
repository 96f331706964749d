use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ConfigError, ExportError};
use crate::{MetricBatch, ObserverOptions};

/// The trait for transports.
///
/// A transport is responsible for encoding a [`MetricBatch`] and sending it to
/// the collector. It performs a single attempt; retries, backoff and timeouts
/// are handled by the [`Exporter`](crate::Exporter) wrapping it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one batch.
    async fn send(&self, batch: &MetricBatch) -> Result<(), ExportError>;

    /// Releases any resources held by the transport.
    async fn shutdown(&self) {}
}

/// A factory creating transport instances.
///
/// The factory is invoked on the background runtime during `init`, so
/// transports may rely on a tokio runtime being present. Any `Arc<Transport>`
/// is also a factory that hands out clones of itself.
pub trait TransportFactory: Send + Sync {
    /// Given the options, creates a transport.
    fn create_transport(&self, options: &ObserverOptions) -> Result<Arc<dyn Transport>, ConfigError>;
}

impl<F> TransportFactory for F
where
    F: Fn(&ObserverOptions) -> Result<Arc<dyn Transport>, ConfigError> + Send + Sync,
{
    fn create_transport(&self, options: &ObserverOptions) -> Result<Arc<dyn Transport>, ConfigError> {
        (*self)(options)
    }
}

impl<T: Transport> TransportFactory for Arc<T> {
    fn create_transport(&self, options: &ObserverOptions) -> Result<Arc<dyn Transport>, ConfigError> {
        let _ = options;
        Ok(self.clone())
    }
}
