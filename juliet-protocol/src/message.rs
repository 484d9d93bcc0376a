//! Message kinds carried over the radio link.
//!
//! Every message packs into one [`RawFrame`]. The frame version selects how
//! the content field is encoded:
//!
//! | version | kind           | content field                                 |
//! |---------|----------------|-----------------------------------------------|
//! | 0       | Text           | escaped text                                  |
//! | 1       | CompressedText | base64(zlib(text))                            |
//! | 2       | Channel        | escaped `"<channel> <text>"`                  |
//! | 3       | File           | `<filename>|<mime>|base64(zlib(content))`     |
//!
//! A text message must carry at least one character; the frame grammar has
//! no way to express an empty content field. The MIME type of a file message
//! is escaped like text, with `|` escaped as well.

use crate::error::ProtocolError;
use crate::escape::{escape, unescape};
use crate::frame::RawFrame;
use crate::signature::Signer;
use crate::TIMESTAMP_FORMAT;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::borrow::Cow;
use std::io::{Read, Write};

pub const VERSION_TEXT: u32 = 0;
pub const VERSION_COMPRESSED_TEXT: u32 = 1;
pub const VERSION_CHANNEL: u32 = 2;
pub const VERSION_FILE: u32 = 3;

/// MIME type used when a file name gives no better guess.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const SAFE_FILENAME_SYMBOLS: &str = ".-_ ";
const SENDER_SYMBOLS: &str = "~/=+_$@#*&%!|-";

/// Payload kind of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    CompressedText,
    /// Text addressed to a named chat channel.
    Channel(String),
    /// A small text attachment.
    File {
        filename: Option<String>,
        mime_type: Option<String>,
    },
}

impl MessageKind {
    /// Wire version tag for this kind.
    pub fn version(&self) -> u32 {
        match self {
            MessageKind::Text => VERSION_TEXT,
            MessageKind::CompressedText => VERSION_COMPRESSED_TEXT,
            MessageKind::Channel(_) => VERSION_CHANNEL,
            MessageKind::File { .. } => VERSION_FILE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::CompressedText => "compressed",
            MessageKind::Channel(_) => "channel",
            MessageKind::File { .. } => "file",
        }
    }
}

/// A radio message.
///
/// Timestamps are always truncated to whole seconds so that a message equals
/// itself after a trip over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    content: String,
    sender: Option<String>,
    signature: Option<String>,
    timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a message of the given kind, stamped with the current time.
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            sender: None,
            signature: None,
            timestamp: Utc::now().trunc_subsecs(0),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Text, content)
    }

    pub fn compressed(content: impl Into<String>) -> Self {
        Self::new(MessageKind::CompressedText, content)
    }

    pub fn channel(channel: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(MessageKind::Channel(channel.into()), content)
    }

    /// Creates a file message.
    ///
    /// The file name is reduced to a safe subset. When no MIME type is given
    /// it is guessed from the file name's extension.
    pub fn file(
        content: impl Into<String>,
        filename: Option<&str>,
        mime_type: Option<&str>,
    ) -> Self {
        let mime_type = match (mime_type, filename) {
            (Some(mime), _) => Some(mime.to_string()),
            (None, Some(name)) => Some(
                mime_guess::from_path(name)
                    .first_raw()
                    .unwrap_or(DEFAULT_MIME_TYPE)
                    .to_string(),
            ),
            (None, None) => None,
        };
        let kind = MessageKind::File {
            filename: filename.and_then(safe_filename),
            mime_type,
        };
        Self::new(kind, content)
    }

    /// Sets the sender. Characters the frame grammar cannot carry are
    /// dropped; an empty result clears the sender.
    pub fn with_sender(mut self, sender: impl AsRef<str>) -> Self {
        self.sender = sanitize_sender(sender.as_ref());
        self
    }

    /// Sets the signature. Non-alphanumeric characters are dropped; an empty
    /// result clears the signature.
    pub fn with_signature(mut self, signature: impl AsRef<str>) -> Self {
        let sig: String = signature
            .as_ref()
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect();
        self.signature = (!sig.is_empty()).then_some(sig);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp.trunc_subsecs(0);
        self
    }

    /// Signs the message with `signer`.
    pub fn sign_with(self, signer: &dyn Signer) -> Self {
        match signer.sign(&self) {
            Some(sig) => self.with_signature(sig),
            None => self,
        }
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn version(&self) -> u32 {
        self.kind.version()
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Target channel for channel messages.
    pub fn channel_name(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Channel(name) => Some(name),
            _ => None,
        }
    }

    /// Encodes the content field for this message's kind.
    pub fn encode_content(&self) -> String {
        match &self.kind {
            MessageKind::Text => escape(&self.content).into_owned(),
            MessageKind::CompressedText => compress(&self.content),
            MessageKind::Channel(channel) => {
                escape(&format!("{} {}", channel, self.content)).into_owned()
            }
            MessageKind::File {
                filename,
                mime_type,
            } => format!(
                "{}|{}|{}",
                filename.as_deref().unwrap_or_default(),
                escape_mime(mime_type.as_deref().unwrap_or_default()),
                compress(&self.content)
            ),
        }
    }

    /// Renders the message as a wire frame.
    ///
    /// Fails with [`ProtocolError::Format`] when the content field would be
    /// empty, which only happens for a text message without text.
    pub fn pack(&self) -> Result<Bytes, ProtocolError> {
        let content = self.encode_content();
        if content.is_empty() {
            return Err(ProtocolError::format(format!(
                "{} message has no content",
                self.kind.name()
            )));
        }
        let timestamp = self.timestamp.format(TIMESTAMP_FORMAT).to_string();
        let frame = RawFrame::new(
            self.version(),
            self.sender.as_deref().unwrap_or_default(),
            &timestamp,
            &content,
            self.signature.as_deref().unwrap_or_default(),
        );
        Ok(Bytes::from(frame.to_string()))
    }

    /// Decodes one wire frame.
    ///
    /// With `verify_checksum` set, a frame whose checksum does not match its
    /// fields is rejected. The checksum is checked before the version, so a
    /// corrupted frame reports as a checksum failure.
    pub fn unpack(data: &[u8], verify_checksum: bool) -> Result<Self, ProtocolError> {
        let text =
            std::str::from_utf8(data).map_err(|_| ProtocolError::format("invalid UTF-8"))?;
        let frame = RawFrame::parse(text)?;

        if verify_checksum {
            frame.verify()?;
        }

        let (kind, content) = match frame.version {
            VERSION_TEXT => (MessageKind::Text, unescape(frame.content).into_owned()),
            VERSION_COMPRESSED_TEXT => (MessageKind::CompressedText, decompress(frame.content)?),
            VERSION_CHANNEL => {
                let text = unescape(frame.content);
                let (channel, content) = text
                    .split_once(' ')
                    .ok_or_else(|| ProtocolError::format("channel message without channel"))?;
                (MessageKind::Channel(channel.to_string()), content.to_string())
            }
            VERSION_FILE => {
                let mut parts = frame.content.splitn(3, '|');
                let (filename, mime_type, data) = match (parts.next(), parts.next(), parts.next())
                {
                    (Some(f), Some(m), Some(d)) => (f, m, d),
                    _ => return Err(ProtocolError::format("file message missing fields")),
                };
                let kind = MessageKind::File {
                    filename: safe_filename(filename),
                    mime_type: (!mime_type.is_empty()).then(|| unescape(mime_type).into_owned()),
                };
                (kind, decompress(data)?)
            }
            other => return Err(ProtocolError::UnsupportedVersion(other)),
        };

        let timestamp = if frame.timestamp.is_empty() {
            Utc::now().trunc_subsecs(0)
        } else {
            parse_timestamp(frame.timestamp)?
        };

        Ok(Self {
            kind,
            content,
            sender: (!frame.sender.is_empty()).then(|| frame.sender.to_string()),
            signature: (!frame.signature.is_empty()).then(|| frame.signature.to_string()),
            timestamp,
        })
    }
}

fn escape_mime(mime_type: &str) -> Cow<'_, str> {
    match escape(mime_type) {
        Cow::Borrowed(text) if !text.contains('|') => Cow::Borrowed(text),
        escaped => Cow::Owned(escaped.replace('|', "%7C")),
    }
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>, ProtocolError> {
    let naive = NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .map_err(|e| ProtocolError::format(format!("bad timestamp {:?}: {}", text, e)))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Reduces a file name to alphanumerics and `.-_ `, trimmed. Returns `None`
/// when nothing is left.
pub fn safe_filename(unsafe_name: &str) -> Option<String> {
    let kept: String = unsafe_name
        .chars()
        .filter(|c| c.is_alphanumeric() || SAFE_FILENAME_SYMBOLS.contains(*c))
        .collect();
    let trimmed = kept.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Drops characters the sender field cannot carry. Returns `None` when
/// nothing is left.
pub fn sanitize_sender(sender: &str) -> Option<String> {
    let kept: String = sender
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || SENDER_SYMBOLS.contains(*c))
        .collect();
    (!kept.is_empty()).then_some(kept)
}

fn compress(text: &str) -> String {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let compressed = encoder
        .write_all(text.as_bytes())
        .and_then(|_| encoder.finish())
        .unwrap_or_default();
    STANDARD.encode(compressed)
}

fn decompress(text: &str) -> Result<String, ProtocolError> {
    let compressed = STANDARD
        .decode(text)
        .map_err(|e| ProtocolError::format(format!("bad base64 payload: {}", e)))?;
    let mut out = String::new();
    ZlibDecoder::new(compressed.as_slice())
        .read_to_string(&mut out)
        .map_err(|e| ProtocolError::format(format!("bad compressed payload: {}", e)))?;
    Ok(out)
}
