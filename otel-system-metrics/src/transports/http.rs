use std::time::SystemTime;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::retry_after::parse_retry_after;
use crate::otlp::OtlpEncoder;
use crate::{
    ConfigError, ExportError, MetricBatch, ObserverOptions, Transport, TransportError,
    TransportErrorKind,
};

const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// A [`Transport`] that posts OTLP protobuf payloads via the [`reqwest`] library.
///
/// This is separately enabled by the `http` feature flag.
///
/// [`reqwest`]: https://crates.io/crates/reqwest
#[cfg_attr(doc_cfg, doc(cfg(feature = "http")))]
#[derive(Debug)]
pub struct ReqwestHttpTransport {
    client: Client,
    url: String,
    headers: HeaderMap,
    encoder: OtlpEncoder,
}

#[cfg_attr(doc_cfg, doc(cfg(feature = "http")))]
impl ReqwestHttpTransport {
    /// Creates a new Transport.
    pub fn new(options: &ObserverOptions) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(options.export_timeout)
            .build()
            .map_err(|err| ConfigError::Transport(err.to_string()))?;
        Self::with_client(options, client)
    }

    /// Creates a new Transport that uses the specified [`Client`].
    pub fn with_client(options: &ObserverOptions, client: Client) -> Result<Self, ConfigError> {
        let url = options.endpoint_url()?.to_string();

        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| ConfigError::Transport(format!("header `{name}`: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| ConfigError::Transport(format!("header `{name}`: {err}")))?;
            headers.append(name, value);
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(PROTOBUF_CONTENT_TYPE));

        let encoder = OtlpEncoder::new(&options.resource, SystemTime::now())
            .map_err(|err| ConfigError::Transport(err.to_string()))?;

        Ok(Self {
            client,
            url,
            headers,
            encoder,
        })
    }
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

#[async_trait]
impl Transport for ReqwestHttpTransport {
    async fn send(&self, batch: &MetricBatch) -> Result<(), ExportError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = self.encoder.encode(batch)?;

        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|err| {
                let kind = if err.is_timeout() {
                    TransportErrorKind::Timeout
                } else if err.is_connect() {
                    TransportErrorKind::Connect
                } else {
                    TransportErrorKind::Other
                };
                TransportError::retryable(kind, err.to_string())
            })?;

        let status = response.status();
        if status.is_success() {
            debug!(status = status.as_u16(), "collector accepted batch");
            return Ok(());
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        let message = match response.text().await {
            Ok(text) if !text.is_empty() => format!("{status}: {text}"),
            _ => status.to_string(),
        };

        let err = if is_retryable(status) {
            TransportError::retryable(TransportErrorKind::Status, message)
        } else {
            TransportError::permanent(TransportErrorKind::Status, message)
        };
        Err(err.with_retry_after(retry_after).into())
    }
}
