//! This crate provides the core of `otel-system-metrics`: the metric data
//! model, sampling, counter-to-rate aggregation, exporting with bounded
//! retries and the background scheduler.
//!
//! Regular users should use the [`otel-system-metrics`] crate instead, which
//! comes with the built-in host and process collectors and the OTLP gRPC and
//! HTTP transports.
//!
//! # Core Concepts
//!
//! A [`RuntimeHandle`] owns a background thread driving the pipeline:
//!
//! - the [`Sampler`] reads every registered [`MetricCollector`] on each
//!   sample tick,
//! - the [`Aggregator`] buffers the points of the current interval and turns
//!   counter readings into `<name>.rate` gauges,
//! - the [`Exporter`] hands each flushed [`MetricBatch`] to a [`Transport`],
//!   retrying transient failures with exponential backoff.
//!
//! Transports are created by a [`TransportFactory`] on the background
//! runtime, so they may use tokio freely.
//!
//! # Features
//!
//! - `test`: Enables testing support, like the [`test::TestTransport`].
//!
//! [`otel-system-metrics`]: https://crates.io/crates/otel-system-metrics

#![warn(missing_docs)]

mod aggregator;
mod collector;
mod config;
mod error;
mod exporter;
mod protocol;
mod runtime;
mod sampler;
mod transport;


pub use aggregator::{counter_rate, Aggregator};
pub use collector::MetricCollector;
pub use config::{Backoff, ObserverOptions, Protocol, DEFAULT_GRPC_ENDPOINT, DEFAULT_HTTP_ENDPOINT};
pub use error::{
    ConfigError, Error, ExportError, SampleReadError, SerializationError, TransportError,
    TransportErrorKind,
};
pub use exporter::{ExportStats, Exporter};
pub use protocol::{AttributeValue, Attributes, MetricBatch, MetricKind, MetricPoint, MetricValue};
pub use runtime::{RuntimeHandle, RuntimeState};
pub use sampler::Sampler;
pub use transport::{Transport, TransportFactory};
