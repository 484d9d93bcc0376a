//! Idle client detection.
//!
//! A client silent for longer than the idle timeout is sent a PING. One
//! silent for twice the timeout, or whose connection task has gone away, is
//! disconnected.

use crate::registry::Registry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Result of one sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepResult {
    pub probed: usize,
    pub evicted: usize,
}

/// Periodically probes and evicts idle sessions.
pub struct LivenessMonitor {
    registry: Arc<Registry>,
    server_name: String,
    timeout: Duration,
    shutdown: AtomicBool,
    notify: Notify,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<Registry>, server_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            registry,
            server_name: server_name.into(),
            timeout,
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Checks every session against `now`.
    pub fn sweep_at(&self, now: Instant) -> SweepResult {
        let mut result = SweepResult::default();

        for session in self.registry.sessions() {
            let idle = session.idle_at(now);

            if session.is_dead() {
                if self.registry.disconnect(&session, "Connection closed") {
                    result.evicted += 1;
                }
            } else if idle > self.timeout * 2 {
                tracing::info!(
                    "[{}] ping timeout after {}s",
                    session.remote_addr,
                    idle.as_secs()
                );
                session.send("ERROR :Closing link (Ping timeout)");
                if self.registry.disconnect(&session, "Ping timeout") {
                    result.evicted += 1;
                }
            } else if idle > self.timeout && session.mark_probed() {
                session.send(format!("PING :{}", self.server_name));
                result.probed += 1;
            }
        }

        result
    }

    /// Runs the sweep loop (call from a background task).
    pub async fn run(&self) {
        let interval = (self.timeout / 2).max(Duration::from_millis(10));
        tracing::debug!("Liveness monitor started (interval={:?})", interval);

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let result = self.sweep_at(Instant::now());
            if result != SweepResult::default() {
                tracing::debug!(
                    "Liveness sweep: {} probed, {} evicted",
                    result.probed,
                    result.evicted
                );
            }
        }

        tracing::debug!("Liveness monitor stopped");
    }

    /// Signals the monitor to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{test_addr, Session};
    use tokio::sync::mpsc::Receiver;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn setup() -> (LivenessMonitor, Arc<Registry>, Arc<Session>, Receiver<String>) {
        let registry = Arc::new(Registry::new());
        let (session, rx) = Session::new(test_addr());
        let session = Arc::new(session);
        registry.register(session.clone());
        let monitor = LivenessMonitor::new(registry.clone(), "irc.test", TIMEOUT);
        (monitor, registry, session, rx)
    }

    #[test]
    fn test_active_session_untouched() {
        let (monitor, registry, _session, mut rx) = setup();
        let result = monitor.sweep_at(Instant::now() + TIMEOUT / 2);
        assert_eq!(result, SweepResult::default());
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn test_probe_after_timeout() {
        let (monitor, registry, session, mut rx) = setup();
        let now = Instant::now() + TIMEOUT + Duration::from_secs(1);

        assert_eq!(monitor.sweep_at(now).probed, 1);
        assert_eq!(rx.try_recv().unwrap(), "PING :irc.test");

        // One probe per idle period.
        assert_eq!(monitor.sweep_at(now).probed, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.session_count(), 1);

        session.touch();
        assert_eq!(monitor.sweep_at(Instant::now()).probed, 0);
    }

    #[test]
    fn test_evict_after_twice_timeout() {
        let (monitor, registry, session, mut rx) = setup();
        let now = Instant::now() + TIMEOUT * 2 + Duration::from_secs(1);

        assert_eq!(monitor.sweep_at(now).evicted, 1);
        assert_eq!(rx.try_recv().unwrap(), "ERROR :Closing link (Ping timeout)");
        assert!(session.is_closed());
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_evict_dead_session() {
        let (monitor, registry, _session, rx) = setup();
        drop(rx);
        assert_eq!(monitor.sweep_at(Instant::now()).evicted, 1);
        assert_eq!(registry.session_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let (monitor, _registry, _session, _rx) = setup();
        let monitor = Arc::new(monitor);
        let task = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.run().await })
        };
        monitor.shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
