use tracing::info;

use crate::defaults::apply_defaults;
use crate::{ConfigError, Error, ObserverOptions, RuntimeHandle};

/// Starts observing host and process metrics in the background.
///
/// Unset options are filled from the environment (see [`apply_defaults`]),
/// then a new [`RuntimeHandle`] is initialized. The handle must be kept
/// alive: dropping it shuts the observer down after a final export.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
///
/// let observer = otel_system_metrics::init(
///     otel_system_metrics::ObserverOptions::new()
///         .with_endpoint("localhost:4317")
///         .with_interval(Duration::from_secs(10)),
/// )
/// .expect("invalid observer configuration");
///
/// // ... run the application ...
///
/// observer.shutdown().ok();
/// ```
#[must_use = "dropping the handle shuts the observer down immediately"]
pub fn init(options: ObserverOptions) -> Result<RuntimeHandle, ConfigError> {
    let options = apply_defaults(options);
    let protocol = options.protocol;
    let handle = RuntimeHandle::start(options)?;
    info!(%protocol, "exporting system metrics");
    Ok(handle)
}

/// Initializes an existing handle, applying the same defaults as [`init`].
///
/// Fails with [`ConfigError::AlreadyRunning`] if the handle is running and
/// with [`Error::NotRunning`] if it has been stopped.
pub fn init_handle(handle: &RuntimeHandle, options: ObserverOptions) -> Result<(), Error> {
    handle.init(apply_defaults(options))
}
