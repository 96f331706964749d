use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use otel_system_metrics::test::{TestCollector, TestTransport};
use otel_system_metrics::{
    ConfigError, Error, MetricCollector, MetricKind, MetricPoint, ObserverOptions, RuntimeHandle,
    RuntimeState,
};

fn options(transport: &Arc<TestTransport>) -> ObserverOptions {
    ObserverOptions::new()
        .with_default_collectors(false)
        .with_interval(Duration::from_secs(3600))
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
        .with_transport(transport.clone())
}

#[test]
fn test_init_then_shutdown_flushes_a_batch() {
    let transport = TestTransport::new();
    let observer = otel_system_metrics::init(options(&transport)).unwrap();
    observer.shutdown().unwrap();

    let batches = transport.fetch_and_clear_batches();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].is_empty());
    assert_eq!(observer.state(), RuntimeState::Stopped);
    assert_eq!(observer.stats().batches_exported, 1);
}

#[test]
fn test_double_init_fails() {
    let transport = TestTransport::new();
    let handle = RuntimeHandle::new();

    otel_system_metrics::init_handle(&handle, options(&transport)).unwrap();
    let err = otel_system_metrics::init_handle(&handle, options(&transport)).unwrap_err();
    assert_eq!(err, Error::Config(ConfigError::AlreadyRunning));
    assert_eq!(err.to_string(), "already running");

    handle.shutdown().unwrap();
    // only the single background task exported
    assert_eq!(transport.fetch_and_clear_batches().len(), 1);
}

#[test]
fn test_batches_keep_insertion_order() {
    let transport = TestTransport::new();
    let collector = TestCollector::scripted(
        "scripted",
        vec![
            vec![
                MetricPoint::gauge("a", 1_i64),
                MetricPoint::gauge("b", 2_i64),
                MetricPoint::gauge("c", 3_i64),
            ],
            vec![MetricPoint::gauge("d", 4_i64), MetricPoint::gauge("e", 5_i64)],
        ],
    );

    let observer =
        otel_system_metrics::init(options(&transport).add_collector(collector)).unwrap();
    observer.shutdown().unwrap();

    let batches = transport.fetch_and_clear_batches();
    let names: Vec<_> = batches[0].points().iter().map(|p| p.name()).collect();
    assert_eq!(names, ["a", "b", "c", "d", "e"]);
    for point in batches[0].points() {
        assert!(batches[0].interval_start() <= point.timestamp());
        assert!(point.timestamp() <= batches[0].interval_end());
    }
}

#[test]
fn test_outage_exhausts_retry_limit() {
    let transport = TestTransport::new();
    transport.set_outage(true);

    let observer =
        otel_system_metrics::init(options(&transport).with_retry_limit(3)).unwrap();
    observer.shutdown().unwrap();

    assert_eq!(transport.attempts(), 3);
    assert!(transport.fetch_and_clear_batches().is_empty());
    let stats = observer.stats();
    assert_eq!(stats.export_attempts, 3);
    assert_eq!(stats.batches_dropped, 1);
    assert_eq!(stats.batches_exported, 0);
}

/// Reports a counter growing by 100 per sample.
struct Ticker(AtomicI64);

impl MetricCollector for Ticker {
    fn collect(&self) -> Vec<MetricPoint> {
        let value = self.0.fetch_add(100, Ordering::SeqCst) + 100;
        vec![MetricPoint::counter("app.requests", value).with_unit("{request}")]
    }

    fn name(&self) -> &'static str {
        "ticker"
    }
}

#[test]
fn test_periodic_sampling_produces_rates() {
    let transport = TestTransport::new();
    let observer = otel_system_metrics::init(
        options(&transport)
            .with_sample_interval(Duration::from_millis(20))
            .add_collector(Ticker(AtomicI64::new(0))),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(200));
    observer.shutdown().unwrap();

    let batches = transport.fetch_and_clear_batches();
    let points = batches[0].points();
    let counters = points
        .iter()
        .filter(|p| p.kind() == MetricKind::Counter)
        .count();
    let rates: Vec<_> = points
        .iter()
        .filter(|p| p.name() == "app.requests.rate")
        .collect();

    assert!(counters >= 3, "only {counters} samples taken");
    assert_eq!(rates.len(), counters - 1);
    for rate in rates {
        assert_eq!(rate.unit(), "{request}/s");
        assert!(rate.value().as_f64() > 0.0);
    }
}

#[test]
fn test_flush_on_demand() {
    let transport = TestTransport::new();
    let observer = otel_system_metrics::init(options(&transport).add_collector(
        TestCollector::repeating("app", vec![MetricPoint::gauge("app.up", 1_i64)]),
    ))
    .unwrap();

    assert_eq!(observer.flush(Duration::from_secs(5)), Ok(true));
    assert_eq!(transport.fetch_and_clear_batches().len(), 1);

    drop(observer);
    let batches = transport.fetch_and_clear_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].sequence(), 1);
}

#[test]
fn test_invalid_configuration_is_reported() {
    let transport = TestTransport::new();
    let err = otel_system_metrics::init(
        options(&transport).with_sample_timeout(Duration::ZERO),
    )
    .unwrap_err();
    assert_eq!(err, ConfigError::ZeroDuration("sample_timeout"));
}
