//! Duplex radio transport.
//!
//! Two dedicated threads share one device:
//!
//! - `radio-xmit` pops queued payloads, writes each one while holding the
//!   device lock, notifies transmit subscribers, then sleeps the transmit
//!   interval before taking the next payload.
//! - `radio-recv` performs a bounded read while holding the device lock,
//!   notifies receive subscribers when bytes arrived, then yields.
//!
//! The device lock is held only around the single read or write, so the
//! receiver gets the port between transmissions and vice versa.

use crate::device::RadioDevice;
use crate::error::TransportError;
use bytes::Bytes;
use juliet_protocol::{Subscribers, SubscriptionId};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Transport timing.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Pause after each transmission.
    pub transmit_interval: Duration,
    /// How long the transmit thread waits on an empty queue before checking
    /// for shutdown.
    pub queue_poll: Duration,
    /// Pause between receive attempts.
    pub receive_yield: Duration,
    /// Size of the receive buffer.
    pub read_chunk: usize,
    /// Upper bound on `close` waiting for the threads.
    pub shutdown_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            transmit_interval: Duration::from_secs(1),
            queue_poll: Duration::from_millis(100),
            receive_yield: Duration::from_millis(10),
            read_chunk: 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Byte counters.
#[derive(Debug, Default)]
pub struct TransportStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TransportStats {
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }
}

type SharedDevice = Arc<Mutex<Box<dyn RadioDevice>>>;

/// Signals the owning transport when a worker thread exits, even on panic.
struct ExitSignal {
    tx: Sender<&'static str>,
    name: &'static str,
}

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.tx.send(self.name);
    }
}

/// Worker bookkeeping kept until both threads are known to have exited.
struct Workers {
    handles: Vec<JoinHandle<()>>,
    exits: Receiver<&'static str>,
    /// Threads whose exit signal has not arrived yet.
    pending: usize,
    device_closed: bool,
}

/// Queued transmit and continuous receive over one [`RadioDevice`].
pub struct RadioTransport {
    device: SharedDevice,
    device_name: String,
    config: TransportConfig,
    running: Arc<AtomicBool>,
    queue: Mutex<Option<Sender<Bytes>>>,
    workers: Mutex<Workers>,
    on_receive: Arc<Subscribers<[u8]>>,
    on_transmit: Arc<Subscribers<[u8]>>,
    stats: Arc<TransportStats>,
}

impl RadioTransport {
    /// Takes ownership of `device` and starts both worker threads.
    pub fn open<D>(device: D, config: TransportConfig) -> Result<Self, TransportError>
    where
        D: RadioDevice + 'static,
    {
        let device_name = device.name().to_string();
        let boxed: Box<dyn RadioDevice> = Box::new(device);
        let device: SharedDevice = Arc::new(Mutex::new(boxed));
        let running = Arc::new(AtomicBool::new(true));
        let on_receive = Arc::new(Subscribers::new());
        let on_transmit = Arc::new(Subscribers::new());
        let stats = Arc::new(TransportStats::default());

        let (queue_tx, queue_rx) = mpsc::channel::<Bytes>();
        let (exit_tx, exit_rx) = mpsc::channel();

        let xmit = {
            let worker = TransmitWorker {
                device: Arc::clone(&device),
                running: Arc::clone(&running),
                queue: queue_rx,
                on_transmit: Arc::clone(&on_transmit),
                stats: Arc::clone(&stats),
                interval: config.transmit_interval,
                poll: config.queue_poll,
            };
            let signal = ExitSignal {
                tx: exit_tx.clone(),
                name: "radio-xmit",
            };
            thread::Builder::new()
                .name("radio-xmit".to_string())
                .spawn(move || {
                    let _signal = signal;
                    worker.run();
                })?
        };

        let recv = {
            let worker = ReceiveWorker {
                device: Arc::clone(&device),
                running: Arc::clone(&running),
                on_receive: Arc::clone(&on_receive),
                stats: Arc::clone(&stats),
                pause: config.receive_yield,
                chunk: config.read_chunk.max(1),
            };
            let signal = ExitSignal {
                tx: exit_tx,
                name: "radio-recv",
            };
            let spawned = thread::Builder::new()
                .name("radio-recv".to_string())
                .spawn(move || {
                    let _signal = signal;
                    worker.run();
                });
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    running.store(false, Ordering::Release);
                    drop(queue_tx);
                    let _ = xmit.join();
                    return Err(e.into());
                }
            }
        };

        tracing::info!("radio transport started on {}", device_name);

        Ok(Self {
            device,
            device_name,
            config,
            running,
            queue: Mutex::new(Some(queue_tx)),
            workers: Mutex::new(Workers {
                handles: vec![xmit, recv],
                exits: exit_rx,
                pending: 2,
                device_closed: false,
            }),
            on_receive,
            on_transmit,
            stats,
        })
    }

    /// Queues `data` for transmission and returns immediately.
    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        let data = data.into();
        if data.is_empty() {
            return Err(TransportError::EmptyPayload);
        }
        if !self.is_running() {
            return Err(TransportError::Closed);
        }

        let queue = self.queue.lock();
        let tx = queue.as_ref().ok_or(TransportError::Closed)?;
        tx.send(data).map_err(|_| TransportError::Closed)
    }

    /// Registers a handler for received bytes.
    pub fn on_receive<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.on_receive.subscribe(handler)
    }

    /// Registers a handler for transmitted payloads.
    pub fn on_transmit<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.on_transmit.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.on_receive.unsubscribe(id) || self.on_transmit.unsubscribe(id)
    }

    /// Returns true until `close` is called or the device fails.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Stops both threads and closes the device.
    ///
    /// Payloads already queued are still written. Waits up to the configured
    /// shutdown timeout; if a thread has not exited by then the device is
    /// left open and [`TransportError::ShutdownTimeout`] is returned. A later
    /// call waits for the remaining threads again, and the device is only
    /// closed once both have exited.
    pub fn close(&self) -> Result<(), TransportError> {
        self.running.store(false, Ordering::Release);
        self.queue.lock().take();

        let mut workers = self.workers.lock();
        if workers.device_closed {
            return Ok(());
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        while workers.pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match workers.exits.recv_timeout(remaining) {
                Ok(name) => {
                    tracing::debug!("{} stopped", name);
                    workers.pending -= 1;
                }
                // Both signals dropped: every worker is gone.
                Err(RecvTimeoutError::Disconnected) => workers.pending = 0,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        "radio workers on {} still running after {:?}",
                        self.device_name,
                        self.config.shutdown_timeout
                    );
                    return Err(TransportError::ShutdownTimeout(
                        self.config.shutdown_timeout,
                    ));
                }
            }
        }

        for handle in workers.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("radio worker panicked");
            }
        }

        self.device.lock().close()?;
        workers.device_closed = true;
        tracing::info!(
            "radio transport on {} closed (sent {} bytes, received {} bytes)",
            self.device_name,
            self.stats.bytes_sent(),
            self.stats.bytes_received()
        );
        Ok(())
    }
}

impl Drop for RadioTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("radio transport drop: {}", e);
        }
    }
}

struct TransmitWorker {
    device: SharedDevice,
    running: Arc<AtomicBool>,
    queue: Receiver<Bytes>,
    on_transmit: Arc<Subscribers<[u8]>>,
    stats: Arc<TransportStats>,
    interval: Duration,
    poll: Duration,
}

impl TransmitWorker {
    fn run(self) {
        loop {
            let data = match self.queue.recv_timeout(self.poll) {
                Ok(data) => data,
                Err(RecvTimeoutError::Timeout) => {
                    if self.running.load(Ordering::Acquire) {
                        continue;
                    }
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let written = self.device.lock().write_all(&data);
            if let Err(e) = written {
                tracing::error!("radio write failed: {}", e);
                self.running.store(false, Ordering::Release);
                break;
            }

            tracing::debug!("transmitted {} bytes", data.len());
            self.stats
                .bytes_sent
                .fetch_add(data.len() as u64, Ordering::Relaxed);
            self.on_transmit.publish(&data);

            thread::sleep(self.interval);
        }
    }
}

struct ReceiveWorker {
    device: SharedDevice,
    running: Arc<AtomicBool>,
    on_receive: Arc<Subscribers<[u8]>>,
    stats: Arc<TransportStats>,
    pause: Duration,
    chunk: usize,
}

impl ReceiveWorker {
    fn run(self) {
        let mut buf = vec![0u8; self.chunk];

        while self.running.load(Ordering::Acquire) {
            let read = self.device.lock().read(&mut buf);
            match read {
                Ok(0) => {}
                Ok(n) => {
                    tracing::debug!("received {} bytes", n);
                    self.stats
                        .bytes_received
                        .fetch_add(n as u64, Ordering::Relaxed);
                    self.on_receive.publish(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::error!("radio read failed: {}", e);
                    self.running.store(false, Ordering::Release);
                    break;
                }
            }

            if self.pause.is_zero() {
                thread::yield_now();
            } else {
                thread::sleep(self.pause);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::LoopbackDevice;
    use juliet_protocol::{Message, Reassembler};

    fn fast() -> TransportConfig {
        TransportConfig {
            transmit_interval: Duration::from_millis(5),
            queue_poll: Duration::from_millis(10),
            receive_yield: Duration::from_millis(1),
            read_chunk: 64,
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    fn loopback_pair() -> (LoopbackDevice, LoopbackDevice) {
        let (a, b) = LoopbackDevice::pair();
        (
            a.with_read_timeout(Duration::from_millis(10)),
            b.with_read_timeout(Duration::from_millis(10)),
        )
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_empty_send_rejected() {
        let (a, _b) = loopback_pair();
        let transport = RadioTransport::open(a, fast()).unwrap();
        let sent = Arc::new(AtomicU64::new(0));
        let s = Arc::clone(&sent);
        transport.on_transmit(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(
            transport.send(Vec::<u8>::new()),
            Err(TransportError::EmptyPayload)
        ));
        transport.close().unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 0);
        assert_eq!(transport.stats().bytes_sent(), 0);
    }

    #[test]
    fn test_send_then_close_delivers() {
        let (a, b) = loopback_pair();
        let sender = RadioTransport::open(a, fast()).unwrap();
        let listener = RadioTransport::open(b, fast()).unwrap();

        let heard = Arc::new(Mutex::new(Vec::new()));
        let h = Arc::clone(&heard);
        listener.on_receive(move |bytes| h.lock().extend_from_slice(bytes));

        sender.send(&b"hello radio"[..]).unwrap();
        let started = Instant::now();
        sender.close().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!sender.is_running());
        assert_eq!(sender.stats().bytes_sent(), 11);

        assert!(wait_until(Duration::from_secs(2), || heard.lock().len() == 11));
        assert_eq!(heard.lock().as_slice(), b"hello radio");
        listener.close().unwrap();
    }

    #[test]
    fn test_send_after_close_rejected() {
        let (a, _b) = loopback_pair();
        let transport = RadioTransport::open(a, fast()).unwrap();
        transport.close().unwrap();
        assert!(matches!(
            transport.send(&b"late"[..]),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (a, _b) = loopback_pair();
        let transport = RadioTransport::open(a, fast()).unwrap();
        transport.close().unwrap();
        transport.close().unwrap();
    }

    #[test]
    fn test_transmit_order_preserved() {
        let (a, b) = loopback_pair();
        let sender = RadioTransport::open(a, fast()).unwrap();
        let listener = RadioTransport::open(b, fast()).unwrap();

        let heard = Arc::new(Mutex::new(Vec::new()));
        let h = Arc::clone(&heard);
        listener.on_receive(move |bytes| h.lock().extend_from_slice(bytes));

        for chunk in ["one ", "two ", "three"] {
            sender.send(chunk.as_bytes().to_vec()).unwrap();
        }
        sender.close().unwrap();

        assert!(wait_until(Duration::from_secs(2), || heard.lock().len() == 13));
        assert_eq!(heard.lock().as_slice(), b"one two three");
        listener.close().unwrap();
    }

    #[test]
    fn test_frames_through_reassembler() {
        let (a, b) = loopback_pair();
        let sender = RadioTransport::open(a, fast()).unwrap();
        let listener = RadioTransport::open(b, fast()).unwrap();

        let reassembler = Arc::new(Reassembler::new());
        let messages = Arc::new(Mutex::new(Vec::new()));
        let m = Arc::clone(&messages);
        reassembler.subscribe(move |msg: &Message| m.lock().push(msg.clone()));
        let r = Arc::clone(&reassembler);
        listener.on_receive(move |bytes| {
            r.append(bytes);
        });

        let msg = Message::channel("#radio", "over the air").with_sender("unittest");
        sender.send(msg.pack().unwrap()).unwrap();

        assert!(wait_until(Duration::from_secs(2), || messages.lock().len() == 1));
        assert_eq!(messages.lock()[0], msg);

        sender.close().unwrap();
        listener.close().unwrap();
    }

    struct FailingDevice;

    impl RadioDevice for FailingDevice {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
        }

        fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    #[test]
    fn test_device_failure_stops_transport() {
        let transport = RadioTransport::open(FailingDevice, fast()).unwrap();
        assert!(wait_until(Duration::from_secs(2), || !transport.is_running()));
        assert!(matches!(
            transport.send(&b"x"[..]),
            Err(TransportError::Closed)
        ));
        transport.close().unwrap();
    }

    struct StuckDevice;

    impl RadioDevice for StuckDevice {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(500));
            Ok(0)
        }

        fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn name(&self) -> &str {
            "stuck"
        }
    }

    /// Counts writes that reach the device after it was closed.
    struct TrackingDevice {
        closed: Arc<AtomicBool>,
        late_writes: Arc<AtomicU64>,
    }

    impl RadioDevice for TrackingDevice {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_millis(5));
            Ok(0)
        }

        fn write_all(&mut self, _data: &[u8]) -> io::Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                self.late_writes.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "tracking"
        }
    }

    #[test]
    fn test_device_stays_open_while_queue_drains() {
        let closed = Arc::new(AtomicBool::new(false));
        let late_writes = Arc::new(AtomicU64::new(0));
        let device = TrackingDevice {
            closed: Arc::clone(&closed),
            late_writes: Arc::clone(&late_writes),
        };
        let config = TransportConfig {
            transmit_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_millis(50),
            ..fast()
        };
        let transport = RadioTransport::open(device, config).unwrap();
        for _ in 0..4 {
            transport.send(&b"queued"[..]).unwrap();
        }

        assert!(matches!(
            transport.close(),
            Err(TransportError::ShutdownTimeout(_))
        ));
        assert!(!closed.load(Ordering::SeqCst));

        // Keep retrying until the transmit thread has drained the queue.
        let mut attempts = 0;
        while transport.close().is_err() {
            assert!(!closed.load(Ordering::SeqCst));
            attempts += 1;
            assert!(attempts < 40, "workers never stopped");
        }

        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(late_writes.load(Ordering::SeqCst), 0);
        assert_eq!(transport.stats().bytes_sent(), 24);
        transport.close().unwrap();
    }

    #[test]
    fn test_close_times_out_on_stuck_reader() {
        let config = TransportConfig {
            shutdown_timeout: Duration::from_millis(50),
            ..fast()
        };
        let transport = RadioTransport::open(StuckDevice, config).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            transport.close(),
            Err(TransportError::ShutdownTimeout(_))
        ));

        // The reader finishes its read and exits; a retry completes.
        thread::sleep(Duration::from_millis(600));
        transport.close().unwrap();
    }
}
