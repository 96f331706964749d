//! Built-in metric collectors.

#[cfg(feature = "host")]
mod host;
#[cfg(feature = "process")]
mod process;

#[cfg(feature = "host")]
pub use host::HostCollector;
#[cfg(feature = "process")]
pub use process::ProcessCollector;
