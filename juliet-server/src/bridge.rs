//! Delivery of radio traffic to chat channels.

use crate::error::ServerError;
use crate::registry::Registry;
use juliet_protocol::message::sanitize_sender;
use juliet_protocol::{Message, MessageKind};
use std::sync::Arc;
use tracing::debug;

/// Sender shown for frames that carry no sender id.
pub(crate) const UNKNOWN_SENDER: &str = "radio";

/// Turns decoded radio messages into channel PRIVMSG lines.
pub struct RadioBridge {
    registry: Arc<Registry>,
    server_name: String,
    relay_channel: String,
    /// Our own sender id; frames carrying it are echoes of our traffic.
    station: Option<String>,
}

impl RadioBridge {
    pub fn new(
        registry: Arc<Registry>,
        server_name: impl Into<String>,
        relay_channel: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            server_name: server_name.into(),
            relay_channel: relay_channel.into(),
            station: None,
        }
    }

    /// Sets the local station id. Frames sent under this id are not
    /// delivered again when they come back over the link.
    pub fn with_station(mut self, station: Option<&str>) -> Self {
        self.station = station.and_then(sanitize_sender);
        self
    }

    pub fn relay_channel(&self) -> &str {
        &self.relay_channel
    }

    /// Delivers `message` to the members of its channel. Returns the number
    /// of lines queued.
    pub fn deliver(&self, message: &Message) -> usize {
        if is_echo(message, self.station.as_deref()) {
            debug!("skipping echo of own {} message", message.kind().name());
            return 0;
        }

        let (target, text) = route(message, &self.relay_channel);

        let Some(channel) = self.registry.channel(target) else {
            debug!("no channel {} for radio {} message", target, message.kind().name());
            return 0;
        };

        let sender = message.sender().unwrap_or(UNKNOWN_SENDER);
        let prefix = format!("{}!radio@{}", sender, self.server_name);

        chat_lines(&text)
            .map(|line| {
                channel.broadcast(&format!(
                    ":{} PRIVMSG {} :{}",
                    prefix,
                    channel.name(),
                    line
                ))
            })
            .sum()
    }

    /// Decodes one complete frame and delivers it.
    pub fn deliver_frame(&self, frame: &[u8], verify_checksum: bool) -> Result<usize, ServerError> {
        let message = Message::unpack(frame, verify_checksum)?;
        Ok(self.deliver(&message))
    }
}

/// Whether `message` was sent under our own station id.
pub(crate) fn is_echo(message: &Message, station: Option<&str>) -> bool {
    station.is_some() && message.sender() == station
}

/// Picks the channel a radio message belongs in and the text to show there.
///
/// Channel messages go to the channel they name. Everything else goes to the
/// relay channel, with files announced rather than shown.
pub(crate) fn route<'a>(message: &'a Message, relay_channel: &'a str) -> (&'a str, String) {
    match message.kind() {
        MessageKind::Channel(name) => (name.as_str(), message.content().to_string()),
        MessageKind::Text | MessageKind::CompressedText => {
            (relay_channel, message.content().to_string())
        }
        MessageKind::File {
            filename,
            mime_type,
        } => (
            relay_channel,
            format!(
                "[file] {} ({}, {} bytes)",
                filename.as_deref().unwrap_or("unnamed"),
                mime_type
                    .as_deref()
                    .unwrap_or(juliet_protocol::message::DEFAULT_MIME_TYPE),
                message.content().len()
            ),
        ),
    }
}

/// Splits radio text into non-empty chat lines.
pub(crate) fn chat_lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().filter(|line| !line.is_empty())
}
