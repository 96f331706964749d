use std::io::Write;

use async_trait::async_trait;

use crate::{ExportError, MetricBatch, SerializationError, Transport, TransportError, TransportErrorKind};

/// A [`Transport`] that prints every batch as one JSON line on standard output.
///
/// Meant for local debugging; empty batches are printed too.
#[derive(Debug, Default)]
pub struct StdoutTransport {
    _private: (),
}

impl StdoutTransport {
    /// Creates a new Transport.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Renders a batch the way [`StdoutTransport`] prints it.
pub fn to_json_line(batch: &MetricBatch) -> Result<String, SerializationError> {
    let mut line = serde_json::to_string(batch).map_err(|err| SerializationError(err.to_string()))?;
    line.push('\n');
    Ok(line)
}

#[async_trait]
impl Transport for StdoutTransport {
    async fn send(&self, batch: &MetricBatch) -> Result<(), ExportError> {
        let line = to_json_line(batch)?;
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(line.as_bytes())
            .and_then(|()| stdout.flush())
            .map_err(|err| TransportError::permanent(TransportErrorKind::Other, err.to_string()))?;
        Ok(())
    }
}
