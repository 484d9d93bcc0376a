//! Session management.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::warn;
use uuid::Uuid;

/// Lines a session may have queued before it is dropped as too slow.
pub const OUTBOUND_QUEUE_LEN: usize = 1024;

/// Registration progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Neither NICK nor USER seen yet.
    Unregistered,
    /// One of NICK or USER seen.
    Pending,
    /// Welcome sent; all commands accepted.
    Registered,
    /// Session has been closed and deregistered.
    Closed,
}

impl SessionState {
    fn is_registering(self) -> bool {
        matches!(self, SessionState::Unregistered | SessionState::Pending)
    }
}

#[derive(Debug)]
struct Identity {
    state: SessionState,
    nickname: Option<String>,
    username: Option<String>,
    realname: Option<String>,
    password: Option<String>,
    away: Option<String>,
    channels: BTreeSet<String>,
}

/// A connected client.
///
/// Lines queued with [`Session::send`] are written by the connection task in
/// order. Any task may queue lines.
pub struct Session {
    /// Unique session ID.
    pub id: Uuid,

    /// Remote address.
    pub remote_addr: SocketAddr,

    outbound: mpsc::Sender<String>,

    identity: Mutex<Identity>,

    /// Last time the client was heard from.
    last_contact: Mutex<Instant>,

    /// Set once a liveness probe went out for the current idle period.
    probed: AtomicBool,

    closed: AtomicBool,
    close_notify: Notify,
}

impl Session {
    /// Creates a session and the receiving end of its outbound queue.
    pub fn new(remote_addr: SocketAddr) -> (Self, mpsc::Receiver<String>) {
        Self::with_queue_len(remote_addr, OUTBOUND_QUEUE_LEN)
    }

    /// Like [`Session::new`] with room for `queue_len` pending lines.
    pub fn with_queue_len(
        remote_addr: SocketAddr,
        queue_len: usize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(queue_len.max(1));
        let session = Self {
            id: Uuid::new_v4(),
            remote_addr,
            outbound: tx,
            identity: Mutex::new(Identity {
                state: SessionState::Unregistered,
                nickname: None,
                username: None,
                realname: None,
                password: None,
                away: None,
                channels: BTreeSet::new(),
            }),
            last_contact: Mutex::new(Instant::now()),
            probed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        };
        (session, rx)
    }

    /// Queues a line for the client. Returns false once the session is gone.
    ///
    /// A client that lets its queue fill up is closed; the connection task
    /// then deregisters it.
    pub fn send(&self, line: impl Into<String>) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.outbound.try_send(line.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "[{}] outbound queue full, closing session",
                    self.remote_addr
                );
                self.close();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Marks the session closed and wakes the connection task.
    ///
    /// Lines already queued are still flushed.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.identity.lock().state = SessionState::Closed;
            self.close_notify.notify_one();
        }
    }

    /// Resolves once [`Session::close`] has been called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_notify.notified().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns whether nothing can reach the client any more.
    pub fn is_dead(&self) -> bool {
        self.is_closed() || self.outbound.is_closed()
    }

    /// Records contact from the client.
    pub fn touch(&self) {
        *self.last_contact.lock() = Instant::now();
        self.probed.store(false, Ordering::Release);
    }

    /// Time since last contact, measured at `now`.
    pub fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_contact.lock())
    }

    /// Flags a liveness probe. Returns true only for the first probe of an
    /// idle period.
    pub fn mark_probed(&self) -> bool {
        !self.probed.swap(true, Ordering::AcqRel)
    }

    pub fn state(&self) -> SessionState {
        self.identity.lock().state
    }

    pub fn is_registered(&self) -> bool {
        self.state() == SessionState::Registered
    }

    pub fn nickname(&self) -> Option<String> {
        self.identity.lock().nickname.clone()
    }

    /// Nickname, or `*` before one is set.
    pub fn target(&self) -> String {
        self.nickname().unwrap_or_else(|| "*".to_string())
    }

    /// Only the registry calls this, while holding its nickname index.
    pub(crate) fn set_nickname(&self, nickname: &str) -> Option<String> {
        let mut identity = self.identity.lock();
        if identity.state == SessionState::Unregistered {
            identity.state = SessionState::Pending;
        }
        identity.nickname.replace(nickname.to_string())
    }

    pub fn username(&self) -> Option<String> {
        self.identity.lock().username.clone()
    }

    pub fn realname(&self) -> Option<String> {
        self.identity.lock().realname.clone()
    }

    pub fn set_user(&self, username: &str, realname: Option<&str>) {
        let mut identity = self.identity.lock();
        if identity.state == SessionState::Unregistered {
            identity.state = SessionState::Pending;
        }
        identity.username = Some(username.to_string());
        identity.realname = realname.map(str::to_string);
    }

    pub fn password(&self) -> Option<String> {
        self.identity.lock().password.clone()
    }

    pub fn set_password(&self, password: &str) {
        self.identity.lock().password = Some(password.to_string());
    }

    pub fn away(&self) -> Option<String> {
        self.identity.lock().away.clone()
    }

    pub fn set_away(&self, away: Option<&str>) {
        self.identity.lock().away = away.map(str::to_string);
    }

    /// Returns whether NICK and USER have both arrived and welcome is due.
    pub fn ready_to_register(&self) -> bool {
        let identity = self.identity.lock();
        identity.state.is_registering()
            && identity.nickname.is_some()
            && identity.username.is_some()
    }

    /// Moves to [`SessionState::Registered`]. Returns true exactly once.
    pub fn complete_registration(&self) -> bool {
        let mut identity = self.identity.lock();
        if !identity.state.is_registering()
            || identity.nickname.is_none()
            || identity.username.is_none()
        {
            return false;
        }
        identity.state = SessionState::Registered;
        identity.password = None;
        true
    }

    /// Host part shown in prefixes.
    pub fn host(&self) -> String {
        self.remote_addr.ip().to_string()
    }

    /// `nick!user@host` as used in relayed lines.
    pub fn prefix(&self) -> String {
        let identity = self.identity.lock();
        format!(
            "{}!{}@{}",
            identity.nickname.as_deref().unwrap_or("*"),
            identity.username.as_deref().unwrap_or("*"),
            self.remote_addr.ip()
        )
    }

    /// Channels joined, by display name.
    pub fn channels(&self) -> Vec<String> {
        self.identity.lock().channels.iter().cloned().collect()
    }

    pub(crate) fn add_channel(&self, name: &str) {
        self.identity.lock().channels.insert(name.to_string());
    }

    pub(crate) fn remove_channel(&self, name: &str) {
        self.identity.lock().channels.remove(name);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("nickname", &self.nickname())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40000))
}
