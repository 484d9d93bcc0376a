//! Transport error types.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by radio devices and the transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("refusing to send an empty payload")]
    EmptyPayload,

    #[error("transport is closed")]
    Closed,

    #[error("radio workers did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}
