//! Protocol types for sampled metrics.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

/// Attributes attached to a [`MetricPoint`], keyed by attribute name.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A single metric reading.
///
/// Points are immutable once built: the builder methods consume the point and
/// return a new one, and there are no setters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    name: String,
    #[serde(rename = "type")]
    kind: MetricKind,
    value: MetricValue,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    unit: String,
    timestamp: SystemTime,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attributes: Attributes,
}

impl MetricPoint {
    /// Creates a new gauge point, timestamped now.
    pub fn gauge(name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        Self::new(name, MetricKind::Gauge, value)
    }

    /// Creates a new counter point carrying an absolute monotonic reading,
    /// timestamped now.
    pub fn counter(name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        Self::new(name, MetricKind::Counter, value)
    }

    fn new(name: impl Into<String>, kind: MetricKind, value: impl Into<MetricValue>) -> Self {
        Self {
            name: name.into(),
            kind,
            value: value.into(),
            unit: String::new(),
            timestamp: SystemTime::now(),
            attributes: Attributes::new(),
        }
    }

    /// Sets the unit for this point.
    #[must_use]
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    /// Adds an attribute to this point.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Adds several attributes to this point.
    #[must_use]
    pub fn with_attributes<I, K, V>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        self.attributes
            .extend(attributes.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Overrides the timestamp of this point.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The metric name, e.g. `process.memory.usage`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this point is a gauge or an absolute counter reading.
    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    /// The recorded value.
    pub fn value(&self) -> MetricValue {
        self.value
    }

    /// The unit of measurement, empty if none was set.
    pub fn unit(&self) -> &str {
        &self.unit
    }

    /// When the reading was taken.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// The attributes of this point.
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Returns the value of a single attribute.
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }
}

/// The kind of metric being recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// A point-in-time value that can go up or down (e.g., current memory usage).
    Gauge,
    /// An absolute reading of a monotonically increasing value (e.g., total bytes read).
    Counter,
}

/// Metric value representation supporting both integers and floats.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    /// An integer value.
    Int(i64),
    /// A floating-point value.
    Float(f64),
}

impl MetricValue {
    /// Returns the value as a float.
    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Int(v) => v as f64,
            MetricValue::Float(v) => v,
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Int(v) => write!(f, "{v}"),
            MetricValue::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<i64> for MetricValue {
    fn from(v: i64) -> Self {
        MetricValue::Int(v)
    }
}

impl From<i32> for MetricValue {
    fn from(v: i32) -> Self {
        MetricValue::Int(v as i64)
    }
}

impl From<u64> for MetricValue {
    fn from(v: u64) -> Self {
        MetricValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<u32> for MetricValue {
    fn from(v: u32) -> Self {
        MetricValue::Int(v as i64)
    }
}

impl From<usize> for MetricValue {
    fn from(v: usize) -> Self {
        MetricValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Float(v)
    }
}

impl From<f32> for MetricValue {
    fn from(v: f32) -> Self {
        MetricValue::Float(v as f64)
    }
}

/// A scalar attribute value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    String(String),
    /// A boolean value.
    Bool(bool),
    /// An integer value.
    Int(i64),
    /// A floating-point value.
    Float(f64),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(v) => f.write_str(v),
            AttributeValue::Bool(v) => write!(f, "{v}"),
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
        }
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_owned())
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        AttributeValue::Int(v as i64)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

/// The points produced within one collection interval, in insertion order.
///
/// A batch is created by [`Aggregator::flush`](crate::Aggregator::flush) and
/// can only be read afterwards.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricBatch {
    sequence: u64,
    interval_start: SystemTime,
    interval_end: SystemTime,
    points: Vec<MetricPoint>,
}

impl MetricBatch {
    pub(crate) fn new(
        sequence: u64,
        interval_start: SystemTime,
        interval_end: SystemTime,
        points: Vec<MetricPoint>,
    ) -> Self {
        Self {
            sequence,
            interval_start,
            interval_end,
            points,
        }
    }

    /// The position of this batch in the sequence of flushed batches, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Start of the collection interval.
    pub fn interval_start(&self) -> SystemTime {
        self.interval_start
    }

    /// End of the collection interval.
    pub fn interval_end(&self) -> SystemTime {
        self.interval_end
    }

    /// The points of this batch in insertion order.
    pub fn points(&self) -> &[MetricPoint] {
        &self.points
    }

    /// Number of points in this batch.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns true if there are no points.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
