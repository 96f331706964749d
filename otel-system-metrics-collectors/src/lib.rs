//! Host and process metric collectors for `otel-system-metrics`.
//!
//! The collectors read the operating system through [`sysinfo`] (plus
//! `/proc` and `getrusage` where available) and implement
//! [`MetricCollector`], so they can be registered with any
//! [`ObserverOptions`].
//!
//! # Usage
//!
//! ```rust
//! use otel_system_metrics_collectors::{default_collectors, HostCollector};
//! use otel_system_metrics_core::{MetricCollector, ObserverOptions};
//!
//! let points = HostCollector::new().collect();
//! assert!(points.iter().any(|p| p.name() == "system.cpu.utilization"));
//!
//! let mut options = ObserverOptions::new();
//! options.collectors.extend(default_collectors(&options));
//! ```

#![warn(missing_docs)]

use std::sync::Arc;

use otel_system_metrics_core::{MetricCollector, ObserverOptions};

pub mod collectors;

#[cfg(feature = "host")]
pub use collectors::HostCollector;
#[cfg(feature = "process")]
pub use collectors::ProcessCollector;

/// The built-in collectors enabled by `options`.
///
/// The host collector comes first when enabled; the process collector
/// observes `options.pid`, or the current process when unset.
pub fn default_collectors(options: &ObserverOptions) -> Vec<Arc<dyn MetricCollector>> {
    let mut collectors: Vec<Arc<dyn MetricCollector>> = Vec::new();

    #[cfg(feature = "host")]
    if options.collect_host {
        collectors.push(Arc::new(HostCollector::new()));
    }

    #[cfg(feature = "process")]
    if options.collect_process {
        let collector = match options.pid {
            Some(pid) => ProcessCollector::for_pid(pid),
            None => ProcessCollector::new(),
        };
        collectors.push(Arc::new(collector));
    }

    #[cfg(not(any(feature = "host", feature = "process")))]
    let _ = options;

    collectors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_collectors_follow_options() {
        let names = |options: &ObserverOptions| {
            default_collectors(options)
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
        };

        assert_eq!(names(&ObserverOptions::new()), ["host", "process"]);
        assert_eq!(
            names(&ObserverOptions::new().with_host_metrics(false)),
            ["process"]
        );
        assert!(names(
            &ObserverOptions::new()
                .with_host_metrics(false)
                .with_process_metrics(false)
        )
        .is_empty());
    }

    #[test]
    fn test_process_collector_uses_configured_pid() {
        let collector = ProcessCollector::for_pid(std::process::id());
        assert_eq!(collector.pid(), std::process::id());
    }
}
