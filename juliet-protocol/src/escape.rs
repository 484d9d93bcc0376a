//! Reserved character escaping for frame payloads.
//!
//! Only the characters that would break framing are replaced, which keeps
//! escaped text short and readable on a plain terminal. Decoding accepts any
//! `%XX` sequence.

use std::borrow::Cow;

fn entity(ch: char) -> Option<&'static str> {
    match ch {
        '%' => Some("%25"),
        ':' => Some("%3A"),
        '>' => Some("%3E"),
        '<' => Some("%3C"),
        '\r' => Some("%0D"),
        '\n' => Some("%0A"),
        _ => None,
    }
}

/// Replaces frame-reserved characters with percent entities.
pub fn escape(text: &str) -> Cow<'_, str> {
    if !text.chars().any(|ch| entity(ch).is_some()) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len() + 8);
    for ch in text.chars() {
        match entity(ch) {
            Some(rep) => out.push_str(rep),
            None => out.push(ch),
        }
    }
    Cow::Owned(out)
}

/// Decodes `%XX` sequences. Malformed sequences are kept verbatim and
/// invalid UTF-8 is replaced.
pub fn unescape(text: &str) -> Cow<'_, str> {
    if !text.contains('%') {
        return Cow::Borrowed(text);
    }

    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}

fn hex_value(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}
