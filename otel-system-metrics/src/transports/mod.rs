//! The provided transports.
//!
//! This module exposes all transports that are compiled into the library.
//! The `grpc` and `http` features turn on the network transports; the stdout
//! transport is always available.

use std::sync::Arc;

use crate::{ConfigError, ObserverOptions, Protocol, Transport, TransportFactory};

#[cfg(feature = "http")]
mod retry_after;

#[cfg(feature = "grpc")]
mod grpc;
#[cfg(feature = "grpc")]
pub use grpc::GrpcTransport;

#[cfg(feature = "http")]
mod http;
#[cfg(feature = "http")]
pub use http::ReqwestHttpTransport;

mod stdout;
pub use stdout::{to_json_line, StdoutTransport};

/// Creates the transport matching the configured protocol.
///
/// This is the default value for `transport` on the options. Selecting a
/// protocol whose transport was not compiled in is a configuration error.
#[derive(Clone, Debug, Default)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create_transport(&self, options: &ObserverOptions) -> Result<Arc<dyn Transport>, ConfigError> {
        match options.protocol {
            Protocol::Grpc => {
                #[cfg(feature = "grpc")]
                {
                    Ok(Arc::new(GrpcTransport::new(options)?))
                }
                #[cfg(not(feature = "grpc"))]
                {
                    Err(ConfigError::UnsupportedProtocol("grpc"))
                }
            }
            Protocol::HttpProtobuf => {
                #[cfg(feature = "http")]
                {
                    Ok(Arc::new(ReqwestHttpTransport::new(options)?))
                }
                #[cfg(not(feature = "http"))]
                {
                    Err(ConfigError::UnsupportedProtocol("http/protobuf"))
                }
            }
            Protocol::Stdout => Ok(Arc::new(StdoutTransport::new())),
        }
    }
}
