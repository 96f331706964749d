//! The background collection task and the handle controlling it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, Error};
use crate::exporter::{ExportStats, Exporter, Stats};
use crate::{Aggregator, MetricBatch, ObserverOptions, Sampler};

/// Extra time the handle waits for the background thread beyond the
/// shutdown timeout before detaching it.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of a [`RuntimeHandle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeState {
    /// Created but never initialized.
    Uninitialized,
    /// Sampling and exporting in the background.
    Running,
    /// Performing the final flush.
    ShuttingDown,
    /// Stopped for good; the handle cannot be restarted.
    Stopped,
}

enum Command {
    Flush(SyncSender<()>),
}

/// The background thread and the channels used to reach it.
struct Worker {
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    done: std::sync::mpsc::Receiver<()>,
    thread: Option<thread::JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl Worker {
    fn spawn(options: ObserverOptions, stats: Arc<Stats>) -> Result<Self, ConfigError> {
        let (startup_sender, startup_receiver) = sync_channel(1);
        let (done_sender, done) = sync_channel(1);
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let shutdown_timeout = options.shutdown_timeout;

        let thread = thread::Builder::new()
            .name("otel-system-metrics".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = startup_sender.send(Err(ConfigError::Runtime(err.to_string())));
                        return;
                    }
                };

                // transports may need a runtime to build their clients
                let scheduler = {
                    let _guard = rt.enter();
                    Scheduler::new(&options, stats)
                };
                let scheduler = match scheduler {
                    Ok(scheduler) => scheduler,
                    Err(err) => {
                        let _ = startup_sender.send(Err(err));
                        return;
                    }
                };
                let _ = startup_sender.send(Ok(()));

                rt.block_on(scheduler.run(command_receiver, worker_cancel));
                let _ = done_sender.send(());
                // a collector stuck in a blocking read must not hold up the join
                rt.shutdown_background();
            })
            .map_err(|err| ConfigError::Runtime(err.to_string()))?;

        match startup_receiver.recv() {
            Ok(Ok(())) => Ok(Self {
                commands,
                cancel,
                done,
                thread: Some(thread),
                shutdown_timeout,
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(ConfigError::Runtime(
                    "background thread exited during startup".into(),
                ))
            }
        }
    }

    fn stop(mut self) {
        self.cancel.cancel();
        match self.done.recv_timeout(self.shutdown_timeout + SHUTDOWN_GRACE) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("background task did not stop in time, detaching it");
            }
        }
    }
}

/// Counts a batch as dropped unless its export ran to completion.
///
/// Export tasks hold one of these, so a task aborted during shutdown still
/// shows up in the stats.
struct UnfinishedExport(Option<Arc<Stats>>);

impl UnfinishedExport {
    fn finished(&mut self) {
        self.0 = None;
    }
}

impl Drop for UnfinishedExport {
    fn drop(&mut self) {
        if let Some(stats) = self.0.take() {
            stats.record_batch_dropped();
        }
    }
}

/// Drives sampling, aggregation and export on the background runtime.
struct Scheduler {
    sampler: Arc<Sampler>,
    aggregator: Aggregator,
    exporter: Arc<Exporter>,
    stats: Arc<Stats>,
    sampling: Arc<AtomicBool>,
    // tokio's mutex is fair, so exports leave in the order they were flushed
    export_turn: Arc<tokio::sync::Mutex<()>>,
    sample_interval: Duration,
    export_interval: Duration,
    sample_timeout: Duration,
    shutdown_timeout: Duration,
}

impl Scheduler {
    fn new(options: &ObserverOptions, stats: Arc<Stats>) -> Result<Self, ConfigError> {
        let factory = options
            .transport
            .as_ref()
            .ok_or(ConfigError::MissingTransport)?;
        let transport = factory.create_transport(options)?;

        Ok(Self {
            sampler: Arc::new(Sampler::new(options.collectors.clone())),
            aggregator: Aggregator::new(options.max_batch_points),
            exporter: Arc::new(Exporter::with_stats(transport, options, stats.clone())),
            stats,
            sampling: Arc::new(AtomicBool::new(false)),
            export_turn: Arc::default(),
            sample_interval: options.effective_sample_interval(),
            export_interval: options.interval,
            sample_timeout: options.sample_timeout,
            shutdown_timeout: options.shutdown_timeout,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) {
        info!(
            collectors = self.sampler.len(),
            interval_ms = self.export_interval.as_millis() as u64,
            "system metrics observer started"
        );

        // counters need a baseline before the first export
        self.sample().await;

        let start = Instant::now();
        let mut sample_tick = time::interval_at(start + self.sample_interval, self.sample_interval);
        sample_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut export_tick = time::interval_at(start + self.export_interval, self.export_interval);
        export_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut exports: Vec<JoinHandle<()>> = Vec::new();

        loop {
            exports.retain(|export| !export.is_finished());

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => match command {
                    Command::Flush(reply) => {
                        if !self.sample_unless_cancelled(&cancel).await {
                            break;
                        }
                        let batch = self.aggregator.flush();
                        exports.push(self.spawn_export(batch, Some(reply)));
                    }
                },
                _ = sample_tick.tick() => {
                    if !self.sample_unless_cancelled(&cancel).await {
                        break;
                    }
                }
                _ = export_tick.tick() => {
                    if exports.is_empty() {
                        let batch = self.aggregator.flush();
                        exports.push(self.spawn_export(batch, None));
                    } else {
                        debug!("previous export still running, deferring flush");
                    }
                }
            }
        }

        self.finish(exports).await;
    }

    /// Exports `batch` on its own task, after every earlier export.
    fn spawn_export(&self, batch: MetricBatch, reply: Option<SyncSender<()>>) -> JoinHandle<()> {
        let exporter = self.exporter.clone();
        let turn = self.export_turn.clone();
        let mut unfinished = UnfinishedExport(Some(self.stats.clone()));

        tokio::spawn(async move {
            let _turn = turn.lock().await;
            // failures are counted by the exporter itself
            let _ = exporter.export(&batch).await;
            unfinished.finished();
            if let Some(reply) = reply {
                let _ = reply.send(());
            }
        })
    }

    /// Final flush after cancellation, bounded by the shutdown timeout.
    async fn finish(mut self, exports: Vec<JoinHandle<()>>) {
        let deadline = Instant::now() + self.shutdown_timeout;

        for mut export in exports {
            if time::timeout_at(deadline, &mut export).await.is_err() {
                warn!("in-flight export exceeded the shutdown timeout, cancelling it");
                export.abort();
                let _ = export.await;
            }
        }

        if time::timeout_at(deadline, self.sample()).await.is_err() {
            debug!("no time left for a final sample");
        }
        let batch = self.aggregator.flush();
        if time::timeout_at(deadline, self.exporter.export(&batch))
            .await
            .is_err()
        {
            self.stats.record_batch_dropped();
            warn!(
                sequence = batch.sequence(),
                points = batch.len(),
                "final export exceeded the shutdown timeout, batch dropped"
            );
        }

        let _ = time::timeout(SHUTDOWN_GRACE, self.exporter.shutdown()).await;
        info!("system metrics observer stopped");
    }

    /// Samples unless cancellation arrives first.
    ///
    /// Returns `false` if cancelled.
    async fn sample_unless_cancelled(&mut self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => false,
            _ = self.sample() => true,
        }
    }

    /// Runs the sampler on the blocking pool and feeds the aggregator.
    async fn sample(&mut self) {
        if self.sampling.swap(true, Ordering::AcqRel) {
            debug!("previous sample still running, skipping tick");
            return;
        }

        let sampler = self.sampler.clone();
        let busy = self.sampling.clone();
        let task = tokio::task::spawn_blocking(move || {
            let points = sampler.sample();
            busy.store(false, Ordering::Release);
            points
        });

        match time::timeout(self.sample_timeout, task).await {
            Ok(Ok(points)) => {
                let dropped = self.aggregator.add(points);
                self.stats.record_points_dropped(dropped);
            }
            Ok(Err(err)) => {
                self.sampling.store(false, Ordering::Release);
                warn!(error = %err, "sample task failed");
            }
            Err(_) => {
                self.stats.record_sample_timeout();
                warn!(
                    "sample exceeded {}ms, discarding it",
                    self.sample_timeout.as_millis()
                );
            }
        }
    }
}

/// The handle to a background system metrics observer.
///
/// A handle starts [`Uninitialized`](RuntimeState::Uninitialized). After
/// [`init`](Self::init) it samples and exports in the background until
/// [`shutdown`](Self::shutdown) is called or the handle is dropped.
///
/// # Examples
///
/// ```
/// use otel_system_metrics_core::{ConfigError, Error, ObserverOptions, RuntimeHandle, RuntimeState};
///
/// let handle = RuntimeHandle::new();
/// assert_eq!(handle.state(), RuntimeState::Uninitialized);
///
/// // nothing to export to without a transport
/// let err = handle.init(ObserverOptions::new()).unwrap_err();
/// assert_eq!(err, Error::Config(ConfigError::MissingTransport));
/// assert_eq!(handle.state(), RuntimeState::Uninitialized);
/// ```
pub struct RuntimeHandle {
    state: Mutex<RuntimeState>,
    worker: Mutex<Option<Worker>>,
    stats: Arc<Stats>,
}

impl Default for RuntimeHandle {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RuntimeHandle {
    /// Creates an uninitialized handle.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RuntimeState::Uninitialized),
            worker: Mutex::new(None),
            stats: Arc::default(),
        }
    }

    /// Creates a handle and initializes it with `options`.
    pub fn start(options: ObserverOptions) -> Result<Self, ConfigError> {
        let handle = Self::new();
        match handle.init(options) {
            Ok(()) => Ok(handle),
            Err(Error::Config(err)) => Err(err),
            // a fresh handle is always uninitialized
            Err(Error::NotRunning) => Err(ConfigError::Runtime("handle was not fresh".into())),
        }
    }

    /// Validates `options` and starts the background task.
    ///
    /// Blocks until the transport has been created. Fails with
    /// [`ConfigError::AlreadyRunning`] while running and with
    /// [`Error::NotRunning`] once the handle has been stopped.
    pub fn init(&self, options: ObserverOptions) -> Result<(), Error> {
        let mut state = lock(&self.state);
        match *state {
            RuntimeState::Uninitialized => {}
            RuntimeState::Running => return Err(ConfigError::AlreadyRunning.into()),
            RuntimeState::ShuttingDown | RuntimeState::Stopped => return Err(Error::NotRunning),
        }

        options.validate()?;
        let worker = Worker::spawn(options, self.stats.clone())?;
        *lock(&self.worker) = Some(worker);
        *state = RuntimeState::Running;
        Ok(())
    }

    /// Samples, flushes and exports immediately.
    ///
    /// Returns `true` if the export finished within `timeout`.
    pub fn flush(&self, timeout: Duration) -> Result<bool, Error> {
        if self.state() != RuntimeState::Running {
            return Err(Error::NotRunning);
        }
        let commands = match lock(&self.worker).as_ref() {
            Some(worker) => worker.commands.clone(),
            None => return Err(Error::NotRunning),
        };

        let (reply, done) = sync_channel(1);
        if commands.send(Command::Flush(reply)).is_err() {
            return Ok(false);
        }
        Ok(done.recv_timeout(timeout).is_ok())
    }

    /// Stops the background task after a final flush and export.
    ///
    /// Waits at most for the configured shutdown timeout. Fails with
    /// [`Error::NotRunning`] unless the handle is running.
    pub fn shutdown(&self) -> Result<(), Error> {
        {
            let mut state = lock(&self.state);
            if *state != RuntimeState::Running {
                return Err(Error::NotRunning);
            }
            *state = RuntimeState::ShuttingDown;
        }

        if let Some(worker) = lock(&self.worker).take() {
            worker.stop();
        }

        *lock(&self.state) = RuntimeState::Stopped;
        let stats = self.stats();
        info!(
            batches_exported = stats.batches_exported,
            batches_dropped = stats.batches_dropped,
            "system metrics observer shut down"
        );
        Ok(())
    }

    /// The current lifecycle state.
    pub fn state(&self) -> RuntimeState {
        *lock(&self.state)
    }

    /// Returns true while the background task is running.
    pub fn is_running(&self) -> bool {
        self.state() == RuntimeState::Running
    }

    /// A snapshot of the export counters.
    pub fn stats(&self) -> ExportStats {
        self.stats.snapshot()
    }
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for RuntimeHandle {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant as StdInstant;

    use crate::test::{TestCollector, TestTransport};
    use crate::{MetricCollector, MetricPoint};

    fn options(transport: &Arc<TestTransport>) -> ObserverOptions {
        ObserverOptions::new()
            .with_interval(Duration::from_secs(3600))
            .add_collector(TestCollector::repeating(
                "test",
                vec![MetricPoint::gauge("test.gauge", 1_i64)],
            ))
            .with_transport(transport.clone())
    }

    #[test]
    fn test_state_transitions() {
        let transport = TestTransport::new();
        let handle = RuntimeHandle::new();
        assert_eq!(handle.state(), RuntimeState::Uninitialized);
        assert_eq!(handle.shutdown(), Err(Error::NotRunning));

        handle.init(options(&transport)).unwrap();
        assert_eq!(handle.state(), RuntimeState::Running);

        handle.shutdown().unwrap();
        assert_eq!(handle.state(), RuntimeState::Stopped);
        assert_eq!(handle.shutdown(), Err(Error::NotRunning));
        assert_eq!(handle.init(options(&transport)), Err(Error::NotRunning));
        assert_eq!(handle.flush(Duration::from_secs(1)), Err(Error::NotRunning));
    }

    #[test]
    fn test_missing_transport_keeps_handle_uninitialized() {
        let handle = RuntimeHandle::new();
        let err = handle.init(ObserverOptions::new()).unwrap_err();
        assert_eq!(err, Error::Config(ConfigError::MissingTransport));
        assert_eq!(handle.state(), RuntimeState::Uninitialized);
    }

    #[test]
    fn test_invalid_options_are_rejected() {
        let transport = TestTransport::new();
        let handle = RuntimeHandle::new();
        let err = handle
            .init(options(&transport).with_retry_limit(0))
            .unwrap_err();
        assert_eq!(err, Error::Config(ConfigError::ZeroRetryLimit));
        assert_eq!(handle.state(), RuntimeState::Uninitialized);
    }

    #[test]
    fn test_flush_exports_immediately() {
        let transport = TestTransport::new();
        let handle = RuntimeHandle::start(options(&transport)).unwrap();

        assert_eq!(handle.flush(Duration::from_secs(5)), Ok(true));
        let batches = transport.fetch_and_clear_batches();
        assert_eq!(batches.len(), 1);
        // initial sample plus the one taken by the flush
        assert_eq!(batches[0].len(), 2);

        handle.shutdown().unwrap();
    }

    #[test]
    fn test_drop_shuts_down() {
        let transport = TestTransport::new();
        let handle = RuntimeHandle::start(options(&transport)).unwrap();
        drop(handle);
        assert_eq!(transport.fetch_and_clear_batches().len(), 1);
    }

    /// Tracks how many `collect` calls run at the same time.
    #[derive(Default)]
    struct Concurrency {
        active: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    struct SlowCollector {
        delay: Duration,
        concurrency: Arc<Concurrency>,
    }

    impl MetricCollector for SlowCollector {
        fn collect(&self) -> Vec<MetricPoint> {
            let c = &self.concurrency;
            c.calls.fetch_add(1, Ordering::SeqCst);
            let active = c.active.fetch_add(1, Ordering::SeqCst) + 1;
            c.peak.fetch_max(active, Ordering::SeqCst);
            thread::sleep(self.delay);
            c.active.fetch_sub(1, Ordering::SeqCst);
            vec![MetricPoint::gauge("slow.gauge", 1_i64)]
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[test]
    fn test_slow_samples_are_discarded_without_overlap() {
        let transport = TestTransport::new();
        let concurrency = Arc::new(Concurrency::default());
        let handle = RuntimeHandle::start(
            ObserverOptions::new()
                .with_interval(Duration::from_secs(3600))
                .with_sample_interval(Duration::from_millis(20))
                .with_sample_timeout(Duration::from_millis(30))
                .add_collector(SlowCollector {
                    delay: Duration::from_millis(100),
                    concurrency: concurrency.clone(),
                })
                .with_transport(transport.clone()),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(400));
        handle.shutdown().unwrap();

        assert_eq!(concurrency.peak.load(Ordering::SeqCst), 1);
        // ticks arriving while a read is still running are skipped
        assert!(concurrency.calls.load(Ordering::SeqCst) <= 6);
        assert!(handle.stats().samples_timed_out >= 2);
        let batches = transport.fetch_and_clear_batches();
        assert!(batches.iter().all(|batch| batch.is_empty()));
    }

    #[test]
    fn test_delayed_test_collector_times_out() {
        let transport = TestTransport::new();
        let handle = RuntimeHandle::start(
            ObserverOptions::new()
                .with_interval(Duration::from_secs(3600))
                .with_sample_timeout(Duration::from_millis(20))
                .add_collector(
                    TestCollector::repeating("late", vec![MetricPoint::gauge("late.gauge", 1_i64)])
                        .with_delay(Duration::from_millis(200)),
                )
                .with_transport(transport.clone()),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        handle.shutdown().unwrap();

        assert!(handle.stats().samples_timed_out >= 1);
        assert!(transport.fetch_and_clear_batches()[0].is_empty());
    }

    #[test]
    fn test_full_interval_counts_dropped_points() {
        let transport = TestTransport::new();
        let handle = RuntimeHandle::start(
            ObserverOptions::new()
                .with_interval(Duration::from_secs(3600))
                .with_max_batch_points(2)
                .add_collector(TestCollector::repeating(
                    "three",
                    vec![
                        MetricPoint::gauge("a", 1_i64),
                        MetricPoint::gauge("b", 2_i64),
                        MetricPoint::gauge("c", 3_i64),
                    ],
                ))
                .with_transport(transport.clone()),
        )
        .unwrap();
        handle.shutdown().unwrap();

        // initial sample keeps two of three, the final sample finds the interval full
        assert_eq!(handle.stats().points_dropped, 4);
        let batches = transport.fetch_and_clear_batches();
        assert_eq!(batches[0].len(), 2);
    }

    fn assert_no_sends_after(transport: &TestTransport) {
        let attempts = transport.attempts();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(transport.attempts(), attempts, "transport used after shutdown");
    }

    #[test]
    fn test_shutdown_cancels_hanging_periodic_export() {
        let transport = TestTransport::new();
        transport.set_hang(true);
        let handle = RuntimeHandle::start(
            ObserverOptions::new()
                .with_interval(Duration::from_millis(50))
                .with_export_timeout(Duration::from_secs(30))
                .with_shutdown_timeout(Duration::from_millis(200))
                .with_transport(transport.clone()),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(150));
        assert!(transport.attempts() >= 1);

        let started = StdInstant::now();
        handle.shutdown().unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(650),
            "shutdown took {:?}",
            started.elapsed()
        );
        assert_eq!(handle.state(), RuntimeState::Stopped);
        // the periodic batch and the final one
        assert_eq!(handle.stats().batches_dropped, 2);
        assert_no_sends_after(&transport);
    }

    #[test]
    fn test_shutdown_cancels_retrying_flush() {
        let transport = TestTransport::new();
        transport.set_outage(true);
        let handle = RuntimeHandle::start(
            ObserverOptions::new()
                .with_interval(Duration::from_secs(3600))
                .with_retry_limit(50)
                .with_backoff(Duration::from_millis(100), Duration::from_millis(100))
                .with_shutdown_timeout(Duration::from_millis(200))
                .with_transport(transport.clone()),
        )
        .unwrap();

        assert_eq!(handle.flush(Duration::from_millis(10)), Ok(false));

        let started = StdInstant::now();
        handle.shutdown().unwrap();
        assert!(
            started.elapsed() < Duration::from_millis(650),
            "shutdown took {:?}",
            started.elapsed()
        );
        assert_eq!(handle.state(), RuntimeState::Stopped);
        assert!(handle.stats().batches_dropped >= 2);
        assert_no_sends_after(&transport);
    }
}
