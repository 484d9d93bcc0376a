//! # juliet-radio
//!
//! Duplex transport over a serial radio.
//!
//! This crate provides:
//! - The [`RadioDevice`] abstraction with serial and in-memory loopback devices
//! - [`RadioTransport`], which runs dedicated transmit and receive threads so
//!   neither direction can starve the other
//! - Transport error types

pub mod device;
pub mod error;
pub mod transport;

pub use device::{LoopbackDevice, RadioDevice, SerialDevice};
pub use error::TransportError;
pub use transport::{RadioTransport, TransportConfig, TransportStats};

/// Default serial baud rate.
pub const DEFAULT_BAUD_RATE: u32 = 9600;
