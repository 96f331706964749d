//! Runs the registered collectors.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::{MetricCollector, MetricPoint};

/// Reads all registered collectors in registration order.
#[derive(Clone, Default)]
pub struct Sampler {
    collectors: Vec<Arc<dyn MetricCollector>>,
}

impl Sampler {
    /// Creates a sampler over the given collectors.
    pub fn new(collectors: Vec<Arc<dyn MetricCollector>>) -> Self {
        Self { collectors }
    }

    /// Reads every collector and concatenates their points.
    ///
    /// A collector that panics contributes nothing; the others still run.
    pub fn sample(&self) -> Vec<MetricPoint> {
        let mut points = Vec::new();
        for collector in &self.collectors {
            match panic::catch_unwind(AssertUnwindSafe(|| collector.collect())) {
                Ok(collected) => {
                    debug!(
                        collector = collector.name(),
                        points = collected.len(),
                        "collected metrics"
                    );
                    points.extend(collected);
                }
                Err(_) => {
                    warn!(collector = collector.name(), "collector panicked, skipping");
                }
            }
        }
        points
    }

    /// Number of registered collectors.
    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    /// Returns true if no collector is registered.
    pub fn is_empty(&self) -> bool {
        self.collectors.is_empty()
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.collectors.iter().map(|c| c.name()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, i64);

    impl MetricCollector for Fixed {
        fn collect(&self) -> Vec<MetricPoint> {
            vec![MetricPoint::gauge(self.0, self.1)]
        }

        fn name(&self) -> &'static str {
            self.0
        }
    }

    struct Exploding;

    impl MetricCollector for Exploding {
        fn collect(&self) -> Vec<MetricPoint> {
            panic!("sensor unplugged")
        }

        fn name(&self) -> &'static str {
            "exploding"
        }
    }

    #[test]
    fn test_sample_keeps_registration_order() {
        let sampler = Sampler::new(vec![
            Arc::new(Fixed("b", 2)),
            Arc::new(Fixed("a", 1)),
        ]);
        let names: Vec<_> = sampler.sample().iter().map(|p| p.name().to_owned()).collect();
        assert_eq!(names, ["b", "a"]);
    }

    #[test]
    fn test_panicking_collector_is_skipped() {
        let sampler = Sampler::new(vec![
            Arc::new(Fixed("before", 1)),
            Arc::new(Exploding),
            Arc::new(Fixed("after", 2)),
        ]);
        let points = sampler.sample();
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].name(), "after");
    }
}
