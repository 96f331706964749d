//! Conversion of batches into OTLP export requests.

use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::metrics::v1::{
    metric, number_data_point, AggregationTemporality, Gauge, Metric, NumberDataPoint,
    ResourceMetrics, ScopeMetrics, Sum,
};
use opentelemetry_proto::tonic::resource::v1::Resource;
use prost::Message;

use crate::{AttributeValue, MetricBatch, MetricKind, MetricPoint, MetricValue, SerializationError};

/// The instrumentation scope name reported with every batch.
pub const SCOPE_NAME: &str = "otel-system-metrics";

/// Encodes batches as OTLP `ExportMetricsServiceRequest`s.
///
/// All batches share one resource and one instrumentation scope. Counters
/// are reported as cumulative monotonic sums starting at the encoder's
/// creation time.
#[derive(Clone, Debug)]
pub struct OtlpEncoder {
    resource: Resource,
    start_time_unix_nano: u64,
}

impl OtlpEncoder {
    /// Creates an encoder for the given resource attributes.
    pub fn new(
        resource: &BTreeMap<String, AttributeValue>,
        start: SystemTime,
    ) -> Result<Self, SerializationError> {
        let attributes = resource
            .iter()
            .map(|(key, value)| key_value(key, value))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            resource: Resource {
                attributes,
                ..Default::default()
            },
            start_time_unix_nano: unix_nanos(start)?,
        })
    }

    /// Builds the export request for `batch`.
    ///
    /// Points are grouped into metrics by name, unit and kind in order of
    /// first appearance; data points keep the order of the batch.
    pub fn request(
        &self,
        batch: &MetricBatch,
    ) -> Result<ExportMetricsServiceRequest, SerializationError> {
        let mut metrics: Vec<Metric> = Vec::new();
        let mut index: HashMap<(&str, &str, MetricKind), usize> = HashMap::new();

        for point in batch.points() {
            if point.name().is_empty() {
                return Err(SerializationError("metric name is empty".into()));
            }
            let data_point = self.data_point(point)?;
            let key = (point.name(), point.unit(), point.kind());
            let slot = *index.entry(key).or_insert_with(|| {
                metrics.push(empty_metric(point));
                metrics.len() - 1
            });

            match &mut metrics[slot].data {
                Some(metric::Data::Gauge(gauge)) => gauge.data_points.push(data_point),
                Some(metric::Data::Sum(sum)) => sum.data_points.push(data_point),
                _ => {}
            }
        }

        Ok(ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: Some(self.resource.clone()),
                scope_metrics: vec![ScopeMetrics {
                    scope: Some(InstrumentationScope {
                        name: SCOPE_NAME.into(),
                        version: env!("CARGO_PKG_VERSION").into(),
                        ..Default::default()
                    }),
                    metrics,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        })
    }

    /// Builds the export request for `batch` and encodes it as protobuf.
    pub fn encode(&self, batch: &MetricBatch) -> Result<Vec<u8>, SerializationError> {
        let request = self.request(batch)?;
        let mut body = Vec::with_capacity(request.encoded_len());
        request
            .encode(&mut body)
            .map_err(|err| SerializationError(err.to_string()))?;
        Ok(body)
    }

    fn data_point(&self, point: &MetricPoint) -> Result<NumberDataPoint, SerializationError> {
        let attributes = point
            .attributes()
            .iter()
            .map(|(key, value)| key_value(key, value))
            .collect::<Result<_, _>>()?;
        let start_time_unix_nano = match point.kind() {
            MetricKind::Counter => self.start_time_unix_nano,
            MetricKind::Gauge => 0,
        };
        let value = match point.value() {
            MetricValue::Int(value) => number_data_point::Value::AsInt(value),
            MetricValue::Float(value) => number_data_point::Value::AsDouble(value),
        };

        Ok(NumberDataPoint {
            attributes,
            start_time_unix_nano,
            time_unix_nano: unix_nanos(point.timestamp())?,
            value: Some(value),
            ..Default::default()
        })
    }
}

fn empty_metric(point: &MetricPoint) -> Metric {
    let data = match point.kind() {
        MetricKind::Gauge => metric::Data::Gauge(Gauge::default()),
        MetricKind::Counter => metric::Data::Sum(Sum {
            aggregation_temporality: AggregationTemporality::Cumulative as i32,
            is_monotonic: true,
            ..Default::default()
        }),
    };
    Metric {
        name: point.name().to_owned(),
        unit: point.unit().to_owned(),
        data: Some(data),
        ..Default::default()
    }
}

fn key_value(key: &str, value: &AttributeValue) -> Result<KeyValue, SerializationError> {
    if key.is_empty() {
        return Err(SerializationError("attribute key is empty".into()));
    }
    let value = match value {
        AttributeValue::String(value) => any_value::Value::StringValue(value.clone()),
        AttributeValue::Bool(value) => any_value::Value::BoolValue(*value),
        AttributeValue::Int(value) => any_value::Value::IntValue(*value),
        AttributeValue::Float(value) => any_value::Value::DoubleValue(*value),
    };
    Ok(KeyValue {
        key: key.to_owned(),
        value: Some(AnyValue { value: Some(value) }),
    })
}

fn unix_nanos(time: SystemTime) -> Result<u64, SerializationError> {
    let since_epoch = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|_| SerializationError("timestamp predates the UNIX epoch".into()))?;
    u64::try_from(since_epoch.as_nanos())
        .map_err(|_| SerializationError("timestamp out of range".into()))
}
