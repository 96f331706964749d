use std::time::SystemTime;

use async_trait::async_trait;
use opentelemetry_proto::tonic::collector::metrics::v1::metrics_service_client::MetricsServiceClient;
use tonic::metadata::{Ascii, MetadataKey, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};
use tracing::{debug, warn};

use crate::otlp::OtlpEncoder;
use crate::{
    ConfigError, ExportError, MetricBatch, ObserverOptions, Transport, TransportError,
    TransportErrorKind,
};

/// A [`Transport`] that calls the OTLP `MetricsService/Export` RPC via [`tonic`].
///
/// The channel connects lazily, so an unreachable collector is reported on
/// the first export rather than during `init`. Only plaintext `http://`
/// endpoints are supported.
///
/// [`tonic`]: https://crates.io/crates/tonic
#[cfg_attr(doc_cfg, doc(cfg(feature = "grpc")))]
pub struct GrpcTransport {
    client: MetricsServiceClient<Channel>,
    metadata: Vec<(MetadataKey<Ascii>, MetadataValue<Ascii>)>,
    encoder: OtlpEncoder,
}

#[cfg_attr(doc_cfg, doc(cfg(feature = "grpc")))]
impl GrpcTransport {
    /// Creates a new Transport.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(options: &ObserverOptions) -> Result<Self, ConfigError> {
        let url = options.endpoint_url()?;
        if url.scheme() != "http" {
            return Err(ConfigError::InvalidEndpoint {
                endpoint: url.to_string(),
                reason: "gRPC export supports plaintext `http://` endpoints only".into(),
            });
        }

        let channel = Endpoint::from_shared(url.to_string())
            .map_err(|err| ConfigError::InvalidEndpoint {
                endpoint: url.to_string(),
                reason: err.to_string(),
            })?
            .timeout(options.export_timeout)
            .connect_timeout(options.export_timeout)
            .connect_lazy();

        let metadata = options
            .headers
            .iter()
            .map(|(name, value)| -> Result<_, ConfigError> {
                let key = MetadataKey::from_bytes(name.to_ascii_lowercase().as_bytes())
                    .map_err(|err| ConfigError::Transport(format!("header `{name}`: {err}")))?;
                let value = MetadataValue::try_from(value.as_str())
                    .map_err(|err| ConfigError::Transport(format!("header `{name}`: {err}")))?;
                Ok((key, value))
            })
            .collect::<Result<_, _>>()?;

        let encoder = OtlpEncoder::new(&options.resource, SystemTime::now())
            .map_err(|err| ConfigError::Transport(err.to_string()))?;

        Ok(Self {
            client: MetricsServiceClient::new(channel),
            metadata,
            encoder,
        })
    }
}

fn transport_error(status: &Status) -> TransportError {
    let message = format!("{:?}: {}", status.code(), status.message());
    match status.code() {
        Code::Unavailable => TransportError::retryable(TransportErrorKind::Connect, message),
        Code::DeadlineExceeded => TransportError::retryable(TransportErrorKind::Timeout, message),
        Code::Cancelled
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::OutOfRange
        | Code::DataLoss => TransportError::retryable(TransportErrorKind::Status, message),
        _ => TransportError::permanent(TransportErrorKind::Status, message),
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn send(&self, batch: &MetricBatch) -> Result<(), ExportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut request = Request::new(self.encoder.request(batch)?);
        for (key, value) in &self.metadata {
            request.metadata_mut().insert(key.clone(), value.clone());
        }

        let response = self
            .client
            .clone()
            .export(request)
            .await
            .map_err(|status| transport_error(&status))?;

        match response.into_inner().partial_success {
            Some(partial) if partial.rejected_data_points > 0 => warn!(
                rejected = partial.rejected_data_points,
                error = %partial.error_message,
                "collector rejected part of the batch"
            ),
            _ => debug!(sequence = batch.sequence(), "collector accepted batch"),
        }
        Ok(())
    }
}

impl std::fmt::Debug for GrpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcTransport")
            .field("metadata_count", &self.metadata.len())
            .finish_non_exhaustive()
    }
}
