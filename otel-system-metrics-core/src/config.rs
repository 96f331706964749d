//! Configuration for the system metrics observer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;
use crate::protocol::AttributeValue;
use crate::{MetricCollector, TransportFactory};

/// Default gRPC collector endpoint.
pub const DEFAULT_GRPC_ENDPOINT: &str = "http://localhost:4317";
/// Default HTTP collector endpoint.
pub const DEFAULT_HTTP_ENDPOINT: &str = "http://localhost:4318/v1/metrics";

const HTTP_METRICS_PATH: &str = "/v1/metrics";

/// The wire protocol used to reach the collector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Protocol {
    /// OTLP over gRPC.
    #[default]
    Grpc,
    /// OTLP over HTTP with a protobuf body.
    HttpProtobuf,
    /// One JSON line per batch on standard output.
    Stdout,
}

impl Protocol {
    /// The name used in configuration and environment variables.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Grpc => "grpc",
            Protocol::HttpProtobuf => "http/protobuf",
            Protocol::Stdout => "stdout",
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            Protocol::Grpc => 4317,
            Protocol::HttpProtobuf | Protocol::Stdout => 4318,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grpc" => Ok(Protocol::Grpc),
            "http" | "http/protobuf" => Ok(Protocol::HttpProtobuf),
            "stdout" => Ok(Protocol::Stdout),
            other => Err(ConfigError::UnknownProtocol(other.to_owned())),
        }
    }
}

/// Exponential backoff between export attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Backoff {
    /// Delay before the second attempt.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Growth factor applied after every failed attempt.
    pub multiplier: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl Backoff {
    /// The delay to wait after `failed_attempts` consecutive failures.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(32) as i32;
        let delay = self.initial.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(delay)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Configuration for the system metrics observer.
///
/// Every field has a default; the facade crate's `init` additionally fills
/// unset fields from the standard `OTEL_*` environment variables.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use otel_system_metrics_core::{ObserverOptions, Protocol};
///
/// let options = ObserverOptions::new()
///     .with_endpoint("collector.internal:4318")
///     .with_protocol(Protocol::HttpProtobuf)
///     .with_interval(Duration::from_secs(15))
///     .with_retry_limit(3);
/// assert!(options.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct ObserverOptions {
    /// The collector address, either `host:port` or an `http(s)://` URL.
    ///
    /// If unset, the protocol's default local endpoint is used.
    pub endpoint: Option<String>,
    /// The wire protocol.
    pub protocol: Protocol,
    /// How often a batch is exported. Default: 30 seconds.
    pub interval: Duration,
    /// How often metrics are sampled. Defaults to `interval`.
    pub sample_interval: Option<Duration>,
    /// Total number of attempts per batch before it is dropped. Default: 5.
    pub retry_limit: u32,
    /// Delays between attempts.
    pub backoff: Backoff,
    /// Upper bound for a single export attempt. Default: 10 seconds.
    pub export_timeout: Duration,
    /// Upper bound for a single sample. Default: 2 seconds.
    pub sample_timeout: Duration,
    /// How long shutdown waits for the final export. Default: 5 seconds.
    pub shutdown_timeout: Duration,
    /// Maximum points buffered per interval. Default: 10 000.
    pub max_batch_points: usize,
    /// The process to observe. Defaults to the current process.
    pub pid: Option<u32>,
    /// Whether the default collectors are registered. Default: true.
    pub default_collectors: bool,
    /// Register the system-wide collector when adding default collectors.
    pub collect_host: bool,
    /// Register the process collector when adding default collectors.
    pub collect_process: bool,
    /// Collectors to sample, in order.
    pub collectors: Vec<Arc<dyn MetricCollector>>,
    /// Attributes describing the observed entity (`service.name`, ...).
    pub resource: BTreeMap<String, AttributeValue>,
    /// Extra headers (HTTP) or metadata (gRPC) sent with every export.
    pub headers: Vec<(String, String)>,
    /// Creates the transport; the facade installs a default factory.
    pub transport: Option<Arc<dyn TransportFactory>>,
}

impl Default for ObserverOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            protocol: Protocol::Grpc,
            interval: Duration::from_secs(30),
            sample_interval: None,
            retry_limit: 5,
            backoff: Backoff::default(),
            export_timeout: Duration::from_secs(10),
            sample_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(5),
            max_batch_points: 10_000,
            pid: None,
            default_collectors: true,
            collect_host: true,
            collect_process: true,
            collectors: Vec::new(),
            resource: BTreeMap::new(),
            headers: Vec::new(),
            transport: None,
        }
    }
}

impl ObserverOptions {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the collector endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the wire protocol.
    #[must_use]
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the export interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the export interval in whole seconds.
    #[must_use]
    pub fn with_interval_seconds(self, seconds: u64) -> Self {
        self.with_interval(Duration::from_secs(seconds))
    }

    /// Samples more often than the export interval.
    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = Some(interval);
        self
    }

    /// Sets the number of attempts per batch.
    #[must_use]
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    /// Sets the backoff between attempts.
    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff.initial = initial;
        self.backoff.max = max;
        self
    }

    /// Sets the timeout of a single export attempt.
    #[must_use]
    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    /// Sets the timeout of a single sample.
    #[must_use]
    pub fn with_sample_timeout(mut self, timeout: Duration) -> Self {
        self.sample_timeout = timeout;
        self
    }

    /// Sets how long shutdown waits for the final export.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the maximum number of points per batch.
    #[must_use]
    pub fn with_max_batch_points(mut self, max: usize) -> Self {
        self.max_batch_points = max;
        self
    }

    /// Observes the given process instead of the current one.
    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Enables or disables the default collectors.
    #[must_use]
    pub fn with_default_collectors(mut self, enabled: bool) -> Self {
        self.default_collectors = enabled;
        self
    }

    /// Enables or disables the system-wide collector.
    #[must_use]
    pub fn with_host_metrics(mut self, enabled: bool) -> Self {
        self.collect_host = enabled;
        self
    }

    /// Enables or disables the process collector.
    #[must_use]
    pub fn with_process_metrics(mut self, enabled: bool) -> Self {
        self.collect_process = enabled;
        self
    }

    /// Adds a custom metric collector.
    #[must_use]
    pub fn add_collector<C: MetricCollector>(mut self, collector: C) -> Self {
        self.collectors.push(Arc::new(collector));
        self
    }

    /// Adds a resource attribute.
    #[must_use]
    pub fn with_resource_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.resource.insert(key.into(), value.into());
        self
    }

    /// Adds a header sent with every export.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Uses the given transport factory.
    #[must_use]
    pub fn with_transport<F: TransportFactory + 'static>(mut self, factory: F) -> Self {
        self.transport = Some(Arc::new(factory));
        self
    }

    /// The effective sample interval.
    pub fn effective_sample_interval(&self) -> Duration {
        self.sample_interval.unwrap_or(self.interval)
    }

    /// Resolves the endpoint into the URL the transport connects to.
    ///
    /// `host:port` forms get an `http://` scheme; the HTTP protocol gets the
    /// `/v1/metrics` path when the endpoint has none.
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        let raw = match self.endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => endpoint,
            _ => match self.protocol {
                Protocol::HttpProtobuf => DEFAULT_HTTP_ENDPOINT,
                Protocol::Grpc | Protocol::Stdout => DEFAULT_GRPC_ENDPOINT,
            },
        };
        let invalid = |reason: &str| ConfigError::InvalidEndpoint {
            endpoint: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let has_scheme = raw.contains("://");
        let with_scheme = if has_scheme {
            raw.to_owned()
        } else {
            format!("http://{raw}")
        };
        let mut url = Url::parse(&with_scheme).map_err(|err| invalid(&err.to_string()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(invalid("missing host"));
        }
        // `Url::port` hides a scheme's default port, so look at what was typed
        if !has_scheme && !has_explicit_port(raw) {
            url.set_port(Some(self.protocol.default_port()))
                .map_err(|()| invalid("cannot set port"))?;
        }
        if self.protocol == Protocol::HttpProtobuf && matches!(url.path(), "" | "/") {
            url.set_path(HTTP_METRICS_PATH);
        }
        Ok(url)
    }

    /// Checks the options for values the observer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("interval", Some(self.interval)),
            ("sample_interval", self.sample_interval),
            ("export_timeout", Some(self.export_timeout)),
            ("sample_timeout", Some(self.sample_timeout)),
            ("shutdown_timeout", Some(self.shutdown_timeout)),
        ];
        for (name, value) in durations {
            if value.is_some_and(|d| d.is_zero()) {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.retry_limit == 0 {
            return Err(ConfigError::ZeroRetryLimit);
        }
        if self.max_batch_points == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.backoff.initial > self.backoff.max {
            return Err(ConfigError::InvalidBackoff {
                initial: self.backoff.initial,
                max: self.backoff.max,
            });
        }
        if self.protocol != Protocol::Stdout {
            self.endpoint_url()?;
        }
        Ok(())
    }
}

/// Whether a scheme-less `host[:port][/path]` endpoint names a port.
fn has_explicit_port(endpoint: &str) -> bool {
    let authority = endpoint.split(['/', '?', '#']).next().unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or_default();
    match host_port.rfind(']') {
        // bracketed IPv6 literal
        Some(end) => host_port[end + 1..].starts_with(':'),
        None => host_port.contains(':'),
    }
}

impl fmt::Debug for ObserverOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverOptions")
            .field("endpoint", &self.endpoint)
            .field("protocol", &self.protocol)
            .field("interval", &self.interval)
            .field("sample_interval", &self.sample_interval)
            .field("retry_limit", &self.retry_limit)
            .field("backoff", &self.backoff)
            .field("export_timeout", &self.export_timeout)
            .field("sample_timeout", &self.sample_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("max_batch_points", &self.max_batch_points)
            .field("pid", &self.pid)
            .field("default_collectors", &self.default_collectors)
            .field("collectors_count", &self.collectors.len())
            .field("resource", &self.resource)
            .field("headers_count", &self.headers.len())
            .field("transport", &self.transport.as_ref().map(|_| "Arc<dyn TransportFactory>"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::grpc_host_port("collector:4317", Protocol::Grpc, "http://collector:4317/")]
    #[case::grpc_host_only("collector", Protocol::Grpc, "http://collector:4317/")]
    #[case::http_host_port("collector:4318", Protocol::HttpProtobuf, "http://collector:4318/v1/metrics")]
    #[case::http_custom_path(
        "https://otel.example.com/custom/metrics",
        Protocol::HttpProtobuf,
        "https://otel.example.com/custom/metrics"
    )]
    #[case::full_url_keeps_scheme_port("https://otel.example.com", Protocol::Grpc, "https://otel.example.com/")]
    #[case::explicit_default_http_port("collector:80", Protocol::Grpc, "http://collector/")]
    #[case::explicit_port_with_path("collector:80/otlp", Protocol::HttpProtobuf, "http://collector/otlp")]
    #[case::ipv6_without_port("[::1]", Protocol::Grpc, "http://[::1]:4317/")]
    #[case::ipv6_with_port("[::1]:9000", Protocol::Grpc, "http://[::1]:9000/")]
    fn test_endpoint_resolution(
        #[case] endpoint: &str,
        #[case] protocol: Protocol,
        #[case] expected: &str,
    ) {
        let options = ObserverOptions::new()
            .with_endpoint(endpoint)
            .with_protocol(protocol);
        assert_eq!(options.endpoint_url().unwrap().as_str(), expected);
    }

    #[test]
    fn test_explicit_default_port_is_kept() {
        let options = ObserverOptions::new().with_endpoint("collector:80");
        let url = options.endpoint_url().unwrap();
        assert_eq!(url.port_or_known_default(), Some(80));
    }

    #[test]
    fn test_default_endpoints() {
        let grpc = ObserverOptions::new();
        assert_eq!(grpc.endpoint_url().unwrap().as_str(), "http://localhost:4317/");

        let http = ObserverOptions::new().with_protocol(Protocol::HttpProtobuf);
        assert_eq!(
            http.endpoint_url().unwrap().as_str(),
            "http://localhost:4318/v1/metrics"
        );
    }

    #[rstest]
    #[case::zero_interval(
        ObserverOptions::new().with_interval(Duration::ZERO),
        ConfigError::ZeroDuration("interval")
    )]
    #[case::zero_sample_interval(
        ObserverOptions::new().with_sample_interval(Duration::ZERO),
        ConfigError::ZeroDuration("sample_interval")
    )]
    #[case::zero_export_timeout(
        ObserverOptions::new().with_export_timeout(Duration::ZERO),
        ConfigError::ZeroDuration("export_timeout")
    )]
    #[case::zero_retry_limit(ObserverOptions::new().with_retry_limit(0), ConfigError::ZeroRetryLimit)]
    #[case::zero_batch(ObserverOptions::new().with_max_batch_points(0), ConfigError::ZeroBatchSize)]
    #[case::inverted_backoff(
        ObserverOptions::new().with_backoff(Duration::from_secs(5), Duration::from_secs(1)),
        ConfigError::InvalidBackoff { initial: Duration::from_secs(5), max: Duration::from_secs(1) }
    )]
    fn test_validation_rejects(#[case] options: ObserverOptions, #[case] expected: ConfigError) {
        assert_eq!(options.validate(), Err(expected));
    }

    #[rstest]
    #[case("ftp://collector:21")]
    #[case("http://:4317")]
    #[case("not a url at all")]
    fn test_validation_rejects_bad_endpoints(#[case] endpoint: &str) {
        let options = ObserverOptions::new().with_endpoint(endpoint);
        assert!(matches!(
            options.validate(),
            Err(ConfigError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_stdout_ignores_endpoint() {
        let options = ObserverOptions::new()
            .with_protocol(Protocol::Stdout)
            .with_endpoint("not a url at all");
        assert!(options.validate().is_ok());
    }

    #[rstest]
    #[case("grpc", Protocol::Grpc)]
    #[case("http", Protocol::HttpProtobuf)]
    #[case("HTTP/PROTOBUF", Protocol::HttpProtobuf)]
    #[case(" stdout ", Protocol::Stdout)]
    fn test_protocol_parsing(#[case] input: &str, #[case] expected: Protocol) {
        assert_eq!(input.parse::<Protocol>(), Ok(expected));
    }

    #[test]
    fn test_unknown_protocol() {
        assert_eq!(
            "http/json".parse::<Protocol>(),
            Err(ConfigError::UnknownProtocol("http/json".into()))
        );
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(60), Duration::from_millis(500));
    }
}
