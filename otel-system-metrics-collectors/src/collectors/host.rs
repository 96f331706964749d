//! System-wide metrics collector.

use std::sync::Mutex;

use otel_system_metrics_core::{MetricCollector, MetricPoint};
use sysinfo::{Networks, ProcessRefreshKind, ProcessesToUpdate, System};

/// Collects host-level metrics.
///
/// Metrics collected:
/// - `system.cpu.utilization` - Average CPU busy fraction across all cores
/// - `system.memory.usage` - Used and free memory in bytes
/// - `system.memory.utilization` - Used fraction of total memory
/// - `system.network.io` - Bytes received and transmitted per interface
/// - `system.process.count` - Number of running processes
pub struct HostCollector {
    state: Mutex<HostState>,
}

struct HostState {
    system: System,
    networks: Networks,
}

impl HostCollector {
    /// Creates a new host collector.
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is computed between two refreshes
        system.refresh_cpu_usage();
        Self {
            state: Mutex::new(HostState {
                system,
                networks: Networks::new_with_refreshed_list(),
            }),
        }
    }
}

impl Default for HostCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricCollector for HostCollector {
    fn collect(&self) -> Vec<MetricPoint> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let HostState { system, networks } = &mut *state;
        let mut metrics = Vec::new();

        system.refresh_cpu_usage();
        metrics.push(
            MetricPoint::gauge(
                "system.cpu.utilization",
                f64::from(system.global_cpu_usage()) / 100.0,
            )
            .with_unit("1"),
        );

        system.refresh_memory();
        let total = system.total_memory();
        let used = system.used_memory();
        metrics.push(
            MetricPoint::gauge("system.memory.usage", used)
                .with_unit("By")
                .with_attribute("system.memory.state", "used"),
        );
        metrics.push(
            MetricPoint::gauge("system.memory.usage", system.free_memory())
                .with_unit("By")
                .with_attribute("system.memory.state", "free"),
        );
        if total > 0 {
            metrics.push(
                MetricPoint::gauge("system.memory.utilization", used as f64 / total as f64)
                    .with_unit("1"),
            );
        }

        networks.refresh(true);
        let mut interfaces: Vec<_> = networks.list().iter().collect();
        interfaces.sort_by(|a, b| a.0.cmp(b.0));
        for (interface, data) in interfaces {
            for (direction, bytes) in [
                ("receive", data.total_received()),
                ("transmit", data.total_transmitted()),
            ] {
                metrics.push(
                    MetricPoint::counter("system.network.io", bytes)
                        .with_unit("By")
                        .with_attribute("network.interface.name", interface.as_str())
                        .with_attribute("network.io.direction", direction),
                );
            }
        }

        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
        metrics.push(
            MetricPoint::gauge("system.process.count", system.processes().len())
                .with_unit("{process}"),
        );

        metrics
    }

    fn name(&self) -> &'static str {
        "host"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otel_system_metrics_core::MetricKind;

    #[test]
    fn test_host_collector() {
        let collector = HostCollector::new();
        let metrics = collector.collect();

        let utilization = metrics
            .iter()
            .find(|m| m.name() == "system.cpu.utilization")
            .map(|m| m.value().as_f64())
            .unwrap();
        assert!((0.0..=1.0).contains(&utilization));

        let states: Vec<_> = metrics
            .iter()
            .filter(|m| m.name() == "system.memory.usage")
            .filter_map(|m| m.attribute("system.memory.state"))
            .map(ToString::to_string)
            .collect();
        assert_eq!(states, ["used", "free"]);

        let processes = metrics
            .iter()
            .find(|m| m.name() == "system.process.count")
            .map(|m| m.value().as_f64())
            .unwrap();
        assert!(processes >= 1.0);
    }

    #[test]
    fn test_network_io_is_a_counter_per_direction() {
        let metrics = HostCollector::new().collect();
        for metric in metrics.iter().filter(|m| m.name() == "system.network.io") {
            assert_eq!(metric.kind(), MetricKind::Counter);
            assert_eq!(metric.unit(), "By");
            assert!(metric.attribute("network.interface.name").is_some());
            let direction = metric.attribute("network.io.direction").unwrap().to_string();
            assert!(direction == "receive" || direction == "transmit");
        }
    }
}
