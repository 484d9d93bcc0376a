//! Byte devices the transport can drive.

use crate::error::TransportError;
use parking_lot::{Condvar, Mutex};
use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A half-duplex byte device.
///
/// `read` must return within a bounded time. A read that times out with no
/// data returns `Ok(0)`.
pub trait RadioDevice: Send {
    /// Reads available bytes into `buf`, waiting at most the device timeout.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `data`.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Releases the device. Later reads and writes fail.
    fn close(&mut self) -> io::Result<()>;

    /// Name for logs.
    fn name(&self) -> &str;
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device is closed")
}

/// A serial port radio.
pub struct SerialDevice {
    name: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialDevice {
    /// Opens `port_name` at 8N1 with the given read timeout.
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .open()?;

        debug!("opened serial port {} at {} baud", port_name, baud_rate);

        Ok(Self {
            name: port_name.to_string(),
            port: Some(port),
        })
    }
}

impl RadioDevice for SerialDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let port = self.port.as_mut().ok_or_else(closed_error)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let port = self.port.as_mut().ok_or_else(closed_error)?;
        port.write_all(data)?;
        port.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            debug!("closed serial port {}", self.name);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Default)]
struct Pipe {
    data: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

impl Pipe {
    fn push(&self, bytes: &[u8]) {
        self.data.lock().extend(bytes);
        self.ready.notify_all();
    }

    fn pop_into(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let mut data = self.data.lock();
        if data.is_empty() {
            self.ready.wait_for(&mut data, timeout);
        }
        let n = buf.len().min(data.len());
        for (slot, byte) in buf.iter_mut().zip(data.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

/// An in-memory device.
///
/// [`LoopbackDevice::pair`] links two devices so that writes on one are read
/// by the other. [`LoopbackDevice::echo`] reads back its own writes.
pub struct LoopbackDevice {
    name: String,
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    read_timeout: Duration,
    closed: bool,
}

impl LoopbackDevice {
    /// Default wait for `read`.
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(50);

    /// Creates two devices wired to each other.
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        let a = Self {
            name: "loopback-a".to_string(),
            rx: Arc::clone(&b_to_a),
            tx: Arc::clone(&a_to_b),
            read_timeout: Self::DEFAULT_READ_TIMEOUT,
            closed: false,
        };
        let b = Self {
            name: "loopback-b".to_string(),
            rx: a_to_b,
            tx: b_to_a,
            read_timeout: Self::DEFAULT_READ_TIMEOUT,
            closed: false,
        };
        (a, b)
    }

    /// Creates a device that hears its own transmissions.
    pub fn echo() -> Self {
        let pipe = Arc::new(Pipe::default());
        Self {
            name: "loopback".to_string(),
            rx: Arc::clone(&pipe),
            tx: pipe,
            read_timeout: Self::DEFAULT_READ_TIMEOUT,
            closed: false,
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl RadioDevice for LoopbackDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed {
            return Err(closed_error());
        }
        Ok(self.rx.pop_into(buf, self.read_timeout))
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closed {
            return Err(closed_error());
        }
        self.tx.push(data);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
