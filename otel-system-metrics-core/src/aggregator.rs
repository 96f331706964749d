//! Buffers points between exports and converts counters into rates.

use std::collections::HashMap;
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::protocol::{Attributes, MetricBatch, MetricKind, MetricPoint};

/// Identity of a time series: the metric name plus its attribute set.
#[derive(Debug, PartialEq, Eq, Hash)]
struct SeriesKey {
    name: String,
    attributes: Vec<(String, String)>,
}

impl SeriesKey {
    fn of(point: &MetricPoint) -> Self {
        Self {
            name: point.name().to_owned(),
            attributes: attribute_key(point.attributes()),
        }
    }
}

fn attribute_key(attributes: &Attributes) -> Vec<(String, String)> {
    // BTreeMap iteration is sorted, so equal sets produce equal keys.
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect()
}

/// The most recent absolute reading of a counter series.
#[derive(Clone, Copy, Debug)]
struct Reading {
    value: f64,
    timestamp: SystemTime,
}

/// Computes the per-second rate between two readings.
///
/// Returns `None` when `t2` is not after `t1`.
pub fn counter_rate(v1: f64, t1: SystemTime, v2: f64, t2: SystemTime) -> Option<f64> {
    let elapsed = t2.duration_since(t1).ok()?.as_secs_f64();
    if elapsed <= 0.0 {
        return None;
    }
    Some((v2 - v1) / elapsed)
}

/// Accumulates points for the current interval.
///
/// Every counter point is kept as-is and, once a previous reading of the same
/// series exists, followed by a `<name>.rate` gauge in `<unit>/s`.
#[derive(Debug)]
pub struct Aggregator {
    buffer: Vec<MetricPoint>,
    baselines: HashMap<SeriesKey, Reading>,
    interval_start: SystemTime,
    next_sequence: u64,
    max_points: usize,
    dropped: u64,
}

impl Aggregator {
    /// Creates an aggregator whose first interval starts now.
    pub fn new(max_points: usize) -> Self {
        Self::starting_at(SystemTime::now(), max_points)
    }

    /// Creates an aggregator whose first interval starts at `start`.
    pub fn starting_at(start: SystemTime, max_points: usize) -> Self {
        Self {
            buffer: Vec::new(),
            baselines: HashMap::new(),
            interval_start: start,
            next_sequence: 0,
            max_points,
            dropped: 0,
        }
    }

    /// Appends points to the current interval.
    ///
    /// Returns the number of points dropped because the interval was full or
    /// the point predates the interval.
    pub fn add(&mut self, points: impl IntoIterator<Item = MetricPoint>) -> u64 {
        let mut dropped = 0;
        for point in points {
            if point.timestamp() < self.interval_start {
                warn!(
                    metric = point.name(),
                    "dropping point timestamped before the current interval"
                );
                dropped += 1;
                continue;
            }

            let rate = match point.kind() {
                MetricKind::Counter => self.observe_counter(&point),
                MetricKind::Gauge => None,
            };

            if !self.push(point) {
                dropped += 1;
            }
            if let Some(rate) = rate {
                if !self.push(rate) {
                    dropped += 1;
                }
            }
        }
        self.dropped += dropped;
        dropped
    }

    fn push(&mut self, point: MetricPoint) -> bool {
        if self.buffer.len() >= self.max_points {
            debug!(metric = point.name(), "interval is full, dropping point");
            return false;
        }
        self.buffer.push(point);
        true
    }

    /// Records a counter reading and derives the rate against the previous one.
    fn observe_counter(&mut self, point: &MetricPoint) -> Option<MetricPoint> {
        let current = Reading {
            value: point.value().as_f64(),
            timestamp: point.timestamp(),
        };
        let key = SeriesKey::of(point);

        let Some(previous) = self.baselines.get(&key).copied() else {
            self.baselines.insert(key, current);
            return None;
        };

        if current.timestamp <= previous.timestamp {
            debug!(
                metric = point.name(),
                "counter reading does not advance in time, skipping rate"
            );
            return None;
        }
        self.baselines.insert(key, current);

        if current.value < previous.value {
            debug!(metric = point.name(), "counter reset, re-baselining");
            return None;
        }

        let rate = counter_rate(
            previous.value,
            previous.timestamp,
            current.value,
            current.timestamp,
        )?;
        let unit = if point.unit().is_empty() {
            "1/s".to_owned()
        } else {
            format!("{}/s", point.unit())
        };

        Some(
            MetricPoint::gauge(format!("{}.rate", point.name()), rate)
                .with_unit(unit)
                .with_attributes(point.attributes().clone())
                .with_timestamp(current.timestamp),
        )
    }

    /// Takes the buffered points as a batch and starts the next interval.
    ///
    /// The rate baselines carry over, so the first counter reading of the new
    /// interval is compared against the last reading of this one.
    pub fn flush(&mut self) -> MetricBatch {
        let now = SystemTime::now();
        // A clock that stepped backwards must not produce an inverted interval.
        let batch = self.flush_at(now.max(self.interval_start));
        if now < self.interval_start {
            warn!("system clock moved backwards, restarting the interval at the current time");
            self.interval_start = now;
        }
        batch
    }

    pub(crate) fn flush_at(&mut self, end: SystemTime) -> MetricBatch {
        let points = std::mem::take(&mut self.buffer);
        let end = points
            .iter()
            .map(MetricPoint::timestamp)
            .fold(end, SystemTime::max);

        let batch = MetricBatch::new(self.next_sequence, self.interval_start, end, points);
        self.next_sequence += 1;
        self.interval_start = end;
        batch
    }

    /// Number of points in the current interval.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if the current interval holds no points.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Total number of points dropped since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
