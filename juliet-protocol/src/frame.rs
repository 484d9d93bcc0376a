//! Text frame grammar for the radio link.
//!
//! A frame is a single line of UTF-8 text:
//!
//! ```text
//! >>{version}:{crc}:{sender}:{timestamp}:{content}:{signature}<<
//!
//! version    one or more hex digits selecting the message kind
//! crc        exactly four hex digits (CRC16 over the four fields after it)
//! sender     optional, [A-Za-z0-9~/=+_$@#*&%!|-]
//! timestamp  optional, YYYYMMDDHHMMSS in UTC
//! content    escaped or encoded payload, never empty
//! signature  optional, ASCII alphanumerics
//! ```
//!
//! Content may contain further `:` characters; the signature is always the
//! text after the last one.

use crate::checksum::checksum;
use crate::error::ProtocolError;
use std::fmt;
use std::ops::Range;

/// Opening frame marker.
pub const FRAME_START: &[u8] = b">>";

/// Closing frame marker.
pub const FRAME_END: &[u8] = b"<<";

const SENDER_SYMBOLS: &str = "~/=+_$@#*&%!|-";

/// Locates the leftmost complete frame in `buf`.
///
/// A frame starts with `>>`, has a body of at least one byte containing no
/// `<` or `>`, and ends with `<<`. Returns the byte range of the whole frame
/// including markers.
pub fn find_frame(buf: &[u8]) -> Option<Range<usize>> {
    let mut start = 0;

    while start + FRAME_START.len() <= buf.len() {
        let offset = buf[start..]
            .windows(FRAME_START.len())
            .position(|w| w == FRAME_START)?;
        let open = start + offset;
        let body = open + FRAME_START.len();

        let body_len = buf[body..]
            .iter()
            .position(|&b| b == b'<' || b == b'>')
            .unwrap_or(buf.len() - body);
        let close = body + body_len;

        if body_len > 0 && buf[close..].starts_with(FRAME_END) {
            return Some(open..close + FRAME_END.len());
        }

        start = open + 1;
    }

    None
}

/// The fields of one frame, borrowed from the wire text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub version: u32,
    pub crc: u16,
    pub sender: &'a str,
    pub timestamp: &'a str,
    pub content: &'a str,
    pub signature: &'a str,
}

impl<'a> RawFrame<'a> {
    /// Builds a frame and computes its checksum.
    pub fn new(
        version: u32,
        sender: &'a str,
        timestamp: &'a str,
        content: &'a str,
        signature: &'a str,
    ) -> Self {
        let mut frame = Self {
            version,
            crc: 0,
            sender,
            timestamp,
            content,
            signature,
        };
        frame.crc = frame.compute_crc();
        frame
    }

    /// Parses a complete frame, markers included.
    pub fn parse(text: &'a str) -> Result<Self, ProtocolError> {
        let inner = text
            .strip_prefix(">>")
            .and_then(|t| t.strip_suffix("<<"))
            .ok_or_else(|| ProtocolError::format("missing frame markers"))?;

        let mut fields = inner.splitn(5, ':');
        let (version, crc, sender, timestamp, rest) = match (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) {
            (Some(v), Some(c), Some(s), Some(t), Some(r)) => (v, c, s, t, r),
            _ => return Err(ProtocolError::format("too few fields")),
        };
        let (content, signature) = rest
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::format("missing signature field"))?;

        if version.is_empty() || !version.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::format(format!("bad version {:?}", version)));
        }
        let version = u32::from_str_radix(version, 16)
            .map_err(|_| ProtocolError::format("version out of range"))?;

        if crc.len() != 4 || !crc.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ProtocolError::format(format!("bad checksum {:?}", crc)));
        }
        let crc = u16::from_str_radix(crc, 16)
            .map_err(|_| ProtocolError::format("checksum out of range"))?;

        if !sender
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || SENDER_SYMBOLS.contains(c))
        {
            return Err(ProtocolError::format(format!("bad sender {:?}", sender)));
        }

        if !(timestamp.is_empty()
            || (timestamp.len() == 14 && timestamp.bytes().all(|b| b.is_ascii_digit())))
        {
            return Err(ProtocolError::format(format!(
                "bad timestamp {:?}",
                timestamp
            )));
        }

        if content.is_empty() || content.contains('\n') {
            return Err(ProtocolError::format("empty or multi-line content"));
        }

        if !signature.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ProtocolError::format(format!(
                "bad signature {:?}",
                signature
            )));
        }

        Ok(Self {
            version,
            crc,
            sender,
            timestamp,
            content,
            signature,
        })
    }

    /// Checksum over sender, timestamp, content and signature.
    pub fn compute_crc(&self) -> u16 {
        checksum(&[self.sender, self.timestamp, self.content, self.signature])
    }

    /// Fails with [`ProtocolError::Checksum`] when the carried checksum does
    /// not match the fields.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        let actual = self.compute_crc();
        if actual != self.crc {
            return Err(ProtocolError::Checksum {
                expected: self.crc,
                actual,
            });
        }
        Ok(())
    }
}

impl fmt::Display for RawFrame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ">>{:X}:{:04X}:{}:{}:{}:{}<<",
            self.version, self.crc, self.sender, self.timestamp, self.content, self.signature
        )
    }
}
