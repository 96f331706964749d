//! Process metrics collector.

use std::sync::Mutex;

use otel_system_metrics_core::{Attributes, AttributeValue, MetricCollector, MetricPoint, SampleReadError};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

/// Collects metrics of a single process.
///
/// Metrics collected:
/// - `process.cpu.usage` - CPU usage in percent of one core
/// - `process.cpu.utilization` - CPU usage divided by the number of cores
/// - `process.memory.usage` - Resident memory in bytes
/// - `process.memory.virtual` - Virtual memory in bytes
/// - `process.disk.io` - Bytes read and written since process start
/// - `process.thread.count` - Number of threads (Linux only)
/// - `process.open_file_descriptor.count` - Open file descriptors (Linux only)
/// - `process.cpu.time` - User and system CPU seconds (Unix, current process only)
///
/// Every point carries the `process.pid`, `process.executable.name`,
/// `process.executable.path` and `process.command` attributes.
pub struct ProcessCollector {
    pid: Pid,
    system: Mutex<System>,
    cores: usize,
    attributes: Attributes,
}

impl ProcessCollector {
    /// Creates a collector observing the current process.
    pub fn new() -> Self {
        Self::for_pid(std::process::id())
    }

    /// Creates a collector observing the process with the given PID.
    pub fn for_pid(pid: u32) -> Self {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_cpu_usage();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        let cores = System::physical_core_count()
            .filter(|&cores| cores > 0)
            .unwrap_or_else(|| system.cpus().len().max(1));

        let mut attributes = Attributes::new();
        attributes.insert("process.pid".into(), AttributeValue::Int(pid.as_u32().into()));
        match system.process(pid) {
            Some(process) => {
                attributes.insert(
                    "process.executable.name".into(),
                    process.name().to_string_lossy().into_owned().into(),
                );
                if let Some(exe) = process.exe() {
                    attributes.insert(
                        "process.executable.path".into(),
                        exe.to_string_lossy().into_owned().into(),
                    );
                }
                let command = process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ");
                attributes.insert("process.command".into(), command.into());
            }
            None => warn!(pid = pid.as_u32(), "process not found, attributes will be incomplete"),
        }

        Self {
            pid,
            system: Mutex::new(system),
            cores,
            attributes,
        }
    }

    /// The observed process.
    pub fn pid(&self) -> u32 {
        self.pid.as_u32()
    }

    fn observes_self(&self) -> bool {
        self.pid.as_u32() == std::process::id()
    }

    fn point(&self, point: MetricPoint) -> MetricPoint {
        point.with_attributes(self.attributes.clone())
    }
}

impl Default for ProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricCollector for ProcessCollector {
    fn collect(&self) -> Vec<MetricPoint> {
        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(poisoned) => poisoned.into_inner(),
        };
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);

        let Some(process) = system.process(self.pid) else {
            warn!(pid = self.pid.as_u32(), "observed process vanished");
            return Vec::new();
        };

        let mut metrics = Vec::new();

        let cpu_usage = f64::from(process.cpu_usage());
        metrics.push(self.point(MetricPoint::gauge("process.cpu.usage", cpu_usage).with_unit("%")));
        metrics.push(self.point(
            MetricPoint::gauge(
                "process.cpu.utilization",
                cpu_usage / 100.0 / self.cores as f64,
            )
            .with_unit("1"),
        ));

        metrics.push(self.point(
            MetricPoint::gauge("process.memory.usage", process.memory()).with_unit("By"),
        ));
        metrics.push(self.point(
            MetricPoint::gauge("process.memory.virtual", process.virtual_memory()).with_unit("By"),
        ));

        let disk = process.disk_usage();
        for (direction, bytes) in [
            ("read", disk.total_read_bytes),
            ("write", disk.total_written_bytes),
        ] {
            metrics.push(self.point(
                MetricPoint::counter("process.disk.io", bytes)
                    .with_unit("By")
                    .with_attribute("disk.io.direction", direction),
            ));
        }
        drop(system);

        match count_entries(self.pid, "task") {
            Ok(threads) => metrics.push(self.point(
                MetricPoint::gauge("process.thread.count", threads).with_unit("{thread}"),
            )),
            Err(err) => debug!("{}", SampleReadError::new("process.thread.count", err)),
        }

        match count_entries(self.pid, "fd") {
            Ok(fds) => metrics.push(self.point(
                MetricPoint::gauge("process.open_file_descriptor.count", fds).with_unit("{count}"),
            )),
            Err(err) => debug!(
                "{}",
                SampleReadError::new("process.open_file_descriptor.count", err)
            ),
        }

        if self.observes_self() {
            match get_cpu_times() {
                Ok((user_time, system_time)) => {
                    for (mode, seconds) in [("user", user_time), ("system", system_time)] {
                        metrics.push(self.point(
                            MetricPoint::counter("process.cpu.time", seconds)
                                .with_unit("s")
                                .with_attribute("cpu.mode", mode),
                        ));
                    }
                }
                Err(err) => debug!("{}", SampleReadError::new("process.cpu.time", err)),
            }
        }

        metrics
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// Counts the entries of `/proc/<pid>/<dir>`.
#[cfg(target_os = "linux")]
fn count_entries(pid: Pid, dir: &str) -> std::io::Result<usize> {
    let entries = std::fs::read_dir(format!("/proc/{}/{dir}", pid.as_u32()))?;
    Ok(entries.count())
}

/// Fallback for platforms without procfs.
#[cfg(not(target_os = "linux"))]
fn count_entries(_pid: Pid, _dir: &str) -> std::io::Result<usize> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "requires procfs",
    ))
}

/// Gets the CPU times (user, system) of the current process in seconds.
#[cfg(unix)]
fn get_cpu_times() -> std::io::Result<(f64, f64)> {
    use std::mem;

    let usage = unsafe {
        let mut usage: libc::rusage = mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        usage
    };
    let seconds =
        |tv: libc::timeval| tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0;
    Ok((seconds(usage.ru_utime), seconds(usage.ru_stime)))
}

/// Fallback for non-unix platforms.
#[cfg(not(unix))]
fn get_cpu_times() -> std::io::Result<(f64, f64)> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "requires getrusage",
    ))
}
