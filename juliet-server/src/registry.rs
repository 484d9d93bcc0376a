//! Session and channel registries.
//!
//! Nicknames and channel names are compared case-insensitively using the
//! RFC 1459 mapping, where `[]\~` are the upper-case forms of `{}|^`.
//!
//! Lock order is channels, then sessions, then a channel's members, then a
//! session's identity. No lock is held while another registry lock is taken
//! in the opposite order.
//!
//! Only registered sessions may claim nicknames or join channels. Both checks
//! happen under the session lock, so once [`Registry::remove`] has run no
//! name or membership can be attached to the session again.

use crate::channel::Channel;
use crate::error::ServerError;
use crate::session::Session;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Folds a nickname or channel name for comparison.
pub fn fold(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            '~' => '^',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

#[derive(Default)]
struct Sessions {
    by_id: HashMap<Uuid, Arc<Session>>,
    by_nick: HashMap<String, Uuid>,
}

/// Outcome of a join request.
#[derive(Debug)]
pub struct Joined {
    pub channel: Arc<Channel>,
    /// False when the session was already a member.
    pub added: bool,
    /// True when this join created the channel.
    pub created: bool,
}

/// All live sessions and channels.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<Sessions>,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<Session>) {
        self.sessions.lock().by_id.insert(session.id, session);
    }

    /// Gives `nickname` to `session`, releasing its previous one.
    ///
    /// Returns the previous nickname. Fails without changing anything when
    /// another session holds the name or `session` has been removed.
    pub fn claim_nickname(
        &self,
        session: &Session,
        nickname: &str,
    ) -> Result<Option<String>, ServerError> {
        let key = fold(nickname);
        let mut sessions = self.sessions.lock();
        if !sessions.by_id.contains_key(&session.id) {
            return Err(ServerError::SessionClosed);
        }

        if let Some(owner) = sessions.by_nick.get(&key) {
            if *owner != session.id {
                return Err(ServerError::NicknameInUse(nickname.to_string()));
            }
        }

        let previous = session.set_nickname(nickname);
        if let Some(old) = &previous {
            let old_key = fold(old);
            if old_key != key {
                sessions.by_nick.remove(&old_key);
            }
        }
        sessions.by_nick.insert(key, session.id);
        Ok(previous)
    }

    pub fn find_by_nick(&self, nickname: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock();
        let id = sessions.by_nick.get(&fold(nickname))?;
        sessions.by_id.get(id).cloned()
    }

    /// Removes a session and its nickname. Returns `None` when it was
    /// already removed.
    pub fn remove(&self, id: &Uuid) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock();
        let session = sessions.by_id.remove(id)?;
        if let Some(nick) = session.nickname() {
            let key = fold(&nick);
            if sessions.by_nick.get(&key) == Some(id) {
                sessions.by_nick.remove(&key);
            }
        }
        Some(session)
    }

    /// Deregisters `session`, tells each peer sharing a channel once that it
    /// quit, leaves all channels and closes it.
    ///
    /// Returns false if the session was already disconnected.
    pub fn disconnect(&self, session: &Session, reason: &str) -> bool {
        if self.remove(&session.id).is_none() {
            return false;
        }

        let quit_line = format!(":{} QUIT :{}", session.prefix(), reason);
        let mut notified = HashSet::new();

        for name in session.channels() {
            let Some(channel) = self.channel(&name) else {
                continue;
            };
            for peer in channel.members() {
                if peer.id != session.id && notified.insert(peer.id) {
                    peer.send(quit_line.as_str());
                }
            }
            self.leave_channel(&channel, session);
        }

        session.close();
        debug!("[{}] disconnected: {}", session.remote_addr, reason);
        true
    }

    /// Adds `session` to channel `name`, creating it with `key` if needed.
    pub fn join_channel(
        &self,
        name: &str,
        key: Option<&str>,
        session: &Arc<Session>,
    ) -> Result<Joined, ServerError> {
        let mut channels = self.channels.lock();
        let sessions = self.sessions.lock();
        if !sessions.by_id.contains_key(&session.id) {
            return Err(ServerError::SessionClosed);
        }
        let folded = fold(name);

        let (channel, created) = match channels.get(&folded) {
            Some(channel) => {
                if !channel.contains(&session.id) && !channel.check_key(key) {
                    return Err(ServerError::BadChannelKey(channel.name().to_string()));
                }
                (channel.clone(), false)
            }
            None => {
                let channel = Arc::new(Channel::new(name, key));
                channels.insert(folded, channel.clone());
                (channel, true)
            }
        };

        let added = channel.add(session.clone());
        if added {
            session.add_channel(channel.name());
        }
        drop(sessions);

        Ok(Joined {
            channel,
            added,
            created,
        })
    }

    /// Removes `session` from `channel`.
    ///
    /// An emptied channel stays registered with its key and topic.
    pub fn leave_channel(&self, channel: &Channel, session: &Session) -> bool {
        let removed = channel.remove(&session.id).is_ok();
        session.remove_channel(channel.name());
        if removed && channel.is_empty() {
            debug!("channel {} is now empty", channel.name());
        }
        removed
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.lock().get(&fold(name)).cloned()
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().values().cloned().collect()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().by_id.values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().by_id.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}
