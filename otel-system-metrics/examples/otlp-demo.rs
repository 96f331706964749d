use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use otel_system_metrics::{MetricCollector, MetricPoint, ObserverOptions};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Reports how much work the demo loop has done.
struct WorkCollector(Arc<AtomicU64>);

impl MetricCollector for WorkCollector {
    fn collect(&self) -> Vec<MetricPoint> {
        let done = self.0.load(Ordering::Relaxed);
        vec![MetricPoint::counter("demo.work.items", done).with_unit("{item}")]
    }

    fn name(&self) -> &'static str {
        "demo-work"
    }
}

fn busy_work(rounds: u64) -> u64 {
    (0..rounds).fold(0_u64, |acc, n| acc.wrapping_mul(31).wrapping_add(n))
}

// cargo run --example otlp-demo
// OTEL_EXPORTER_OTLP_PROTOCOL=stdout cargo run --example otlp-demo
fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init()?;

    let done = Arc::new(AtomicU64::new(0));
    let observer = otel_system_metrics::init(
        ObserverOptions::new()
            .with_interval(Duration::from_secs(10))
            .with_sample_interval(Duration::from_secs(2))
            .with_resource_attribute("service.name", "otlp-demo")
            .add_collector(WorkCollector(done.clone())),
    )?;

    for round in 0..30_u64 {
        let checksum = busy_work(5_000_000);
        done.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(round, checksum, "finished round");
        std::thread::sleep(Duration::from_secs(1));
    }

    observer.shutdown()?;
    tracing::info!(stats = ?observer.stats(), "done");
    Ok(())
}
