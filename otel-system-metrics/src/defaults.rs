use std::env;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::transports::DefaultTransportFactory;
use crate::{AttributeValue, ObserverOptions, Protocol};

const ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
const METRICS_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_METRICS_ENDPOINT";
const PROTOCOL: &str = "OTEL_EXPORTER_OTLP_PROTOCOL";
const METRICS_PROTOCOL: &str = "OTEL_EXPORTER_OTLP_METRICS_PROTOCOL";
const TIMEOUT: &str = "OTEL_EXPORTER_OTLP_TIMEOUT";
const METRICS_TIMEOUT: &str = "OTEL_EXPORTER_OTLP_METRICS_TIMEOUT";
const HEADERS: &str = "OTEL_EXPORTER_OTLP_HEADERS";
const EXPORT_INTERVAL: &str = "OTEL_METRIC_EXPORT_INTERVAL";
const SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
const RESOURCE_ATTRIBUTES: &str = "OTEL_RESOURCE_ATTRIBUTES";

/// Fills the options the caller left at their defaults.
///
/// Values come from the standard `OTEL_*` environment variables; unparseable
/// values are ignored with a warning. Also installs the
/// [`DefaultTransportFactory`], the built-in collectors and the `service.name`,
/// `host.name` and `os.type` resource attributes.
pub fn apply_defaults(mut opts: ObserverOptions) -> ObserverOptions {
    let defaults = ObserverOptions::default();

    if opts.transport.is_none() {
        opts.transport = Some(Arc::new(DefaultTransportFactory));
    }
    if opts.protocol == defaults.protocol {
        if let Some((name, value)) = first_var(&[METRICS_PROTOCOL, PROTOCOL]) {
            match value.parse::<Protocol>() {
                Ok(protocol) => opts.protocol = protocol,
                Err(err) => warn!(variable = name, error = %err, "ignoring environment variable"),
            }
        }
    }
    if opts.endpoint.is_none() {
        opts.endpoint = match (var(METRICS_ENDPOINT), var(ENDPOINT)) {
            (Some(endpoint), _) => Some(endpoint),
            // the generic endpoint is a base URL for every signal
            (None, Some(base)) if opts.protocol == Protocol::HttpProtobuf => {
                Some(format!("{}/v1/metrics", base.trim_end_matches('/')))
            }
            (None, base) => base,
        };
    }
    if opts.interval == defaults.interval {
        if let Some(interval) = millis_var(&[EXPORT_INTERVAL]) {
            opts.interval = interval;
        }
    }
    if opts.export_timeout == defaults.export_timeout {
        if let Some(timeout) = millis_var(&[METRICS_TIMEOUT, TIMEOUT]) {
            opts.export_timeout = timeout;
        }
    }
    if opts.headers.is_empty() {
        if let Some(headers) = var(HEADERS) {
            opts.headers = parse_pairs(HEADERS, &headers);
        }
    }

    if !opts.resource.contains_key("service.name") {
        let service_name = var(SERVICE_NAME).unwrap_or_else(default_service_name);
        opts.resource
            .insert("service.name".into(), service_name.into());
    }
    if let Some(attributes) = var(RESOURCE_ATTRIBUTES) {
        for (key, value) in parse_pairs(RESOURCE_ATTRIBUTES, &attributes) {
            opts.resource.entry(key).or_insert(AttributeValue::String(value));
        }
    }
    if !opts.resource.contains_key("host.name") {
        if let Some(host) = sysinfo::System::host_name() {
            opts.resource.insert("host.name".into(), host.into());
        }
    }
    opts.resource
        .entry("os.type".into())
        .or_insert_with(|| os_type().into());

    #[cfg(feature = "collectors")]
    if opts.default_collectors {
        let mut collectors = otel_system_metrics_collectors::default_collectors(&opts);
        collectors.append(&mut opts.collectors);
        opts.collectors = collectors;
    }

    opts
}

fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn first_var(names: &[&'static str]) -> Option<(&'static str, String)> {
    names
        .iter()
        .find_map(|&name| var(name).map(|value| (name, value)))
}

fn millis_var(names: &[&'static str]) -> Option<Duration> {
    let (name, value) = first_var(names)?;
    match value.parse::<u64>() {
        Ok(millis) if millis > 0 => Some(Duration::from_millis(millis)),
        _ => {
            warn!(
                variable = name,
                value = %value,
                "ignoring environment variable, expected a positive number of milliseconds"
            );
            None
        }
    }
}

/// Parses `key=value` pairs separated by commas.
fn parse_pairs(variable: &str, raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter(|pair| !pair.trim().is_empty())
        .filter_map(|pair| match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Some((key.trim().to_owned(), value.trim().to_owned()))
            }
            _ => {
                warn!(variable, entry = pair, "ignoring malformed entry");
                None
            }
        })
        .collect()
}

fn default_service_name() -> String {
    let executable = env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()));
    match executable {
        Some(executable) => format!("unknown_service:{executable}"),
        None => "unknown_service".into(),
    }
}

fn os_type() -> &'static str {
    match env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    const ALL: &[&str] = &[
        ENDPOINT,
        METRICS_ENDPOINT,
        PROTOCOL,
        METRICS_PROTOCOL,
        TIMEOUT,
        METRICS_TIMEOUT,
        HEADERS,
        EXPORT_INTERVAL,
        SERVICE_NAME,
        RESOURCE_ATTRIBUTES,
    ];

    fn with_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        for name in ALL {
            env::remove_var(name);
        }
        for (name, value) in vars {
            env::set_var(name, value);
        }
        f();
        for name in ALL {
            env::remove_var(name);
        }
    }

    fn bare() -> ObserverOptions {
        ObserverOptions::new().with_default_collectors(false)
    }

    #[test]
    #[serial]
    fn test_environment_fills_unset_options() {
        with_env(
            &[
                (METRICS_ENDPOINT, "metrics.internal:4317"),
                (ENDPOINT, "ignored:4317"),
                (EXPORT_INTERVAL, "15000"),
                (TIMEOUT, "2500"),
                (HEADERS, "authorization=Bearer abc, x-tenant=blue"),
                (SERVICE_NAME, "checkout"),
                (RESOURCE_ATTRIBUTES, "deployment.environment=prod,service.name=shadowed"),
            ],
            || {
                let opts = apply_defaults(bare());
                assert_eq!(opts.endpoint.as_deref(), Some("metrics.internal:4317"));
                assert_eq!(opts.interval, Duration::from_secs(15));
                assert_eq!(opts.export_timeout, Duration::from_millis(2500));
                assert_eq!(
                    opts.headers,
                    [
                        ("authorization".to_owned(), "Bearer abc".to_owned()),
                        ("x-tenant".to_owned(), "blue".to_owned())
                    ]
                );
                assert_eq!(
                    opts.resource.get("service.name"),
                    Some(&AttributeValue::from("checkout"))
                );
                assert_eq!(
                    opts.resource.get("deployment.environment"),
                    Some(&AttributeValue::from("prod"))
                );
                assert!(opts.resource.contains_key("os.type"));
                assert!(opts.transport.is_some());
            },
        );
    }

    #[test]
    #[serial]
    fn test_explicit_options_win() {
        with_env(
            &[
                (ENDPOINT, "from-env:4317"),
                (EXPORT_INTERVAL, "15000"),
                (PROTOCOL, "http/protobuf"),
            ],
            || {
                let opts = apply_defaults(
                    bare()
                        .with_endpoint("explicit:4317")
                        .with_interval(Duration::from_secs(5))
                        .with_protocol(Protocol::Stdout),
                );
                assert_eq!(opts.endpoint.as_deref(), Some("explicit:4317"));
                assert_eq!(opts.interval, Duration::from_secs(5));
                assert_eq!(opts.protocol, Protocol::Stdout);
            },
        );
    }

    #[test]
    #[serial]
    fn test_generic_endpoint_gets_signal_path_for_http() {
        with_env(
            &[(ENDPOINT, "http://collector:4318/"), (PROTOCOL, "http/protobuf")],
            || {
                let opts = apply_defaults(bare());
                assert_eq!(opts.protocol, Protocol::HttpProtobuf);
                assert_eq!(
                    opts.endpoint.as_deref(),
                    Some("http://collector:4318/v1/metrics")
                );
            },
        );
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_ignored() {
        with_env(
            &[
                (PROTOCOL, "carrier-pigeon"),
                (EXPORT_INTERVAL, "soon"),
                (METRICS_TIMEOUT, "0"),
                (HEADERS, "novalue,=empty,ok=1"),
            ],
            || {
                let opts = apply_defaults(bare());
                assert_eq!(opts.protocol, Protocol::Grpc);
                assert_eq!(opts.interval, Duration::from_secs(30));
                assert_eq!(opts.export_timeout, Duration::from_secs(10));
                assert_eq!(opts.headers, [("ok".to_owned(), "1".to_owned())]);
            },
        );
    }

    #[test]
    #[serial]
    fn test_default_service_name() {
        with_env(&[], || {
            let opts = apply_defaults(bare());
            match opts.resource.get("service.name") {
                Some(AttributeValue::String(name)) => assert!(name.starts_with("unknown_service")),
                other => panic!("unexpected service.name {other:?}"),
            }
        });
    }

    #[cfg(feature = "collectors")]
    #[test]
    #[serial]
    fn test_builtin_collectors_come_first() {
        with_env(&[], || {
            let opts = apply_defaults(
                ObserverOptions::new()
                    .with_host_metrics(false)
                    .add_collector(otel_system_metrics_core::test::TestCollector::repeating(
                        "custom",
                        Vec::new(),
                    )),
            );
            let names: Vec<_> = opts.collectors.iter().map(|c| c.name()).collect();
            assert_eq!(names, ["process", "custom"]);
        });
    }
}
