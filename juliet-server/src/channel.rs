//! Chat channels.

use crate::error::ServerError;
use crate::session::Session;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Longest channel name, prefix included.
pub const MAX_CHANNEL_NAME: usize = 50;

/// Returns whether `name` is a usable channel name: `#` or `&` followed by
/// at least one character, at most 50 in total, and no space, comma, BEL or
/// colon.
pub fn is_valid_channel_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some('#') | Some('&'))
        && (2..=MAX_CHANNEL_NAME).contains(&name.len())
        && chars.all(|c| !matches!(c, ' ' | ',' | '\x07' | ':'))
}

/// A named group of sessions.
pub struct Channel {
    name: String,
    key: Option<String>,
    topic: Mutex<Option<String>>,
    members: Mutex<HashMap<Uuid, Arc<Session>>>,
}

impl Channel {
    pub fn new(name: impl Into<String>, key: Option<&str>) -> Self {
        Self {
            name: name.into(),
            key: key.filter(|k| !k.is_empty()).map(str::to_string),
            topic: Mutex::new(None),
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_key(&self) -> bool {
        self.key.is_some()
    }

    /// Returns whether `attempt` opens the channel.
    pub fn check_key(&self, attempt: Option<&str>) -> bool {
        match &self.key {
            Some(key) => attempt == Some(key.as_str()),
            None => true,
        }
    }

    pub fn topic(&self) -> Option<String> {
        self.topic.lock().clone()
    }

    /// Sets the topic. An empty topic clears it.
    pub fn set_topic(&self, topic: &str) {
        *self.topic.lock() = Some(topic.to_string()).filter(|t| !t.is_empty());
    }

    /// Adds a member. Returns false if it was already present.
    pub fn add(&self, session: Arc<Session>) -> bool {
        let mut members = self.members.lock();
        if members.contains_key(&session.id) {
            return false;
        }
        members.insert(session.id, session);
        true
    }

    /// Removes a member.
    pub fn remove(&self, id: &Uuid) -> Result<Arc<Session>, ServerError> {
        self.members
            .lock()
            .remove(id)
            .ok_or_else(|| ServerError::NotOnChannel(self.name.clone()))
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.members.lock().contains_key(id)
    }

    /// Sends `line` to every member, skipping `sender` unless
    /// `include_sender` is set. Returns the number of recipients.
    pub fn notify(&self, sender: &Session, line: &str, include_sender: bool) -> usize {
        let members = self.members.lock();
        members
            .values()
            .filter(|member| include_sender || member.id != sender.id)
            .filter(|member| member.send(line))
            .count()
    }

    /// Sends `line` to every member.
    pub fn broadcast(&self, line: &str) -> usize {
        let members = self.members.lock();
        members.values().filter(|member| member.send(line)).count()
    }

    pub fn members(&self) -> Vec<Arc<Session>> {
        self.members.lock().values().cloned().collect()
    }

    /// Member nicknames, sorted.
    pub fn nicknames(&self) -> Vec<String> {
        let mut nicks: Vec<String> = self
            .members
            .lock()
            .values()
            .filter_map(|member| member.nickname())
            .collect();
        nicks.sort();
        nicks
    }

    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.lock().is_empty()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("members", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_addr;
    use tokio::sync::mpsc::Receiver;

    fn member(nick: &str) -> (Arc<Session>, Receiver<String>) {
        let (session, rx) = Session::new(test_addr());
        session.set_nickname(nick);
        (Arc::new(session), rx)
    }

    fn drain(rx: &mut Receiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_channel_names() {
        assert!(is_valid_channel_name("#radio"));
        assert!(is_valid_channel_name("&local"));
        assert!(is_valid_channel_name("#a"));
        assert!(!is_valid_channel_name("#"));
        assert!(!is_valid_channel_name("radio"));
        assert!(!is_valid_channel_name("#a b"));
        assert!(!is_valid_channel_name("#a,b"));
        assert!(!is_valid_channel_name("#a:b"));
        assert!(!is_valid_channel_name("#a\x07"));
        assert!(!is_valid_channel_name(&format!("#{}", "x".repeat(50))));
    }

    #[test]
    fn test_add_is_idempotent() {
        let channel = Channel::new("#test", None);
        let (alice, _rx) = member("alice");
        assert!(channel.add(alice.clone()));
        assert!(!channel.add(alice.clone()));
        assert_eq!(channel.len(), 1);
    }

    #[test]
    fn test_remove_absent_is_error() {
        let channel = Channel::new("#test", None);
        let (alice, _rx) = member("alice");
        assert!(matches!(
            channel.remove(&alice.id),
            Err(ServerError::NotOnChannel(name)) if name == "#test"
        ));
        channel.add(alice.clone());
        assert!(channel.remove(&alice.id).is_ok());
        assert!(channel.is_empty());
    }

    #[test]
    fn test_notify_with_and_without_sender() {
        let channel = Channel::new("#test", None);
        let (alice, mut alice_rx) = member("alice");
        let (bob, mut bob_rx) = member("bob");
        channel.add(alice.clone());
        channel.add(bob.clone());

        assert_eq!(channel.notify(&alice, "hello", false), 1);
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(drain(&mut bob_rx), vec!["hello"]);

        assert_eq!(channel.notify(&alice, "again", true), 2);
        assert_eq!(drain(&mut alice_rx), vec!["again"]);
        assert_eq!(drain(&mut bob_rx), vec!["again"]);
    }

    #[test]
    fn test_key() {
        let open = Channel::new("#open", Some(""));
        assert!(!open.has_key());
        assert!(open.check_key(None));
        assert!(open.check_key(Some("anything")));

        let keyed = Channel::new("#keyed", Some("secret"));
        assert!(keyed.has_key());
        assert!(keyed.check_key(Some("secret")));
        assert!(!keyed.check_key(Some("guess")));
        assert!(!keyed.check_key(None));
    }

    #[test]
    fn test_topic_and_nicknames() {
        let channel = Channel::new("#test", None);
        assert_eq!(channel.topic(), None);
        channel.set_topic("radio talk");
        assert_eq!(channel.topic().as_deref(), Some("radio talk"));
        channel.set_topic("");
        assert_eq!(channel.topic(), None);

        let (zed, _z) = member("zed");
        let (amy, _a) = member("amy");
        channel.add(zed);
        channel.add(amy);
        assert_eq!(channel.nicknames(), vec!["amy", "zed"]);
    }
}
