//! Observes host and process metrics and exports them to an OpenTelemetry
//! collector using the OTLP metrics protocol over gRPC or HTTP.
//!
//! # Quickstart
//!
//! Call [`init`] once, early in the program, and keep the returned
//! [`RuntimeHandle`] alive. A background thread samples the registered
//! collectors, turns counters into rates and exports one batch per interval.
//! Dropping the handle (or calling [`RuntimeHandle::shutdown`]) performs a
//! final export.
//!
//! ```no_run
//! let observer = otel_system_metrics::init(Default::default()).unwrap();
//! // ... application code ...
//! observer.shutdown().unwrap();
//! ```
//!
//! # Configuration
//!
//! [`ObserverOptions`] configures the endpoint, protocol, intervals, retry
//! behavior and resource attributes. Options left at their defaults are
//! filled from the standard environment variables:
//!
//! - `OTEL_EXPORTER_OTLP_METRICS_ENDPOINT`, `OTEL_EXPORTER_OTLP_ENDPOINT`
//! - `OTEL_EXPORTER_OTLP_METRICS_PROTOCOL`, `OTEL_EXPORTER_OTLP_PROTOCOL`
//! - `OTEL_METRIC_EXPORT_INTERVAL` (milliseconds)
//! - `OTEL_EXPORTER_OTLP_METRICS_TIMEOUT`, `OTEL_EXPORTER_OTLP_TIMEOUT` (milliseconds)
//! - `OTEL_EXPORTER_OTLP_HEADERS`
//! - `OTEL_SERVICE_NAME`, `OTEL_RESOURCE_ATTRIBUTES`
//!
//! # Custom metrics
//!
//! Implement [`MetricCollector`] and register it with
//! [`ObserverOptions::add_collector`]. Counter points are exported as
//! cumulative sums and additionally as `<name>.rate` gauges.
//!
//! # Logging
//!
//! The crate logs through [`tracing`] and never installs a subscriber.
//!
//! # Features
//!
//! - `collectors`: The built-in host and process collectors. *Enabled by default*.
//! - `grpc`: The [`tonic`] based gRPC transport. *Enabled by default*.
//! - `http`: The [`reqwest`] based HTTP/protobuf transport. *Enabled by default*.
//! - `native-tls`: Uses the `native-tls` crate for `https://` HTTP endpoints. *Enabled by default*.
//! - `rustls`: Uses `rustls` instead.
//! - `test`: Enables testing support, like the `TestTransport`.
//!
//! [`tracing`]: https://crates.io/crates/tracing
//! [`tonic`]: https://crates.io/crates/tonic
//! [`reqwest`]: https://crates.io/crates/reqwest

#![cfg_attr(doc_cfg, feature(doc_cfg))]
#![warn(missing_docs)]

mod defaults;
mod init;
pub mod otlp;
pub mod transports;

pub use crate::defaults::apply_defaults;
pub use crate::init::{init, init_handle};

pub use otel_system_metrics_core::*;

/// The built-in collectors.
#[cfg(feature = "collectors")]
pub use otel_system_metrics_collectors as collectors;
