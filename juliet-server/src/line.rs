//! Client line framing and command parsing.

use bytes::BytesMut;
use tracing::warn;

/// Longest accepted command line, excluding the terminator.
pub const MAX_LINE_LEN: usize = 8191;

/// Splits a client byte stream into lines terminated by `\n` or `\r\n`.
///
/// An unterminated fragment stays buffered until the rest arrives. Lines
/// over [`MAX_LINE_LEN`] are dropped whole.
pub struct LineBuffer {
    buffer: BytesMut,
    discarding: bool,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            discarding: false,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete non-empty line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') else {
                if self.buffer.len() > MAX_LINE_LEN {
                    warn!("discarding unterminated line of {} bytes", self.buffer.len());
                    self.buffer.clear();
                    self.discarding = true;
                }
                return None;
            };

            let mut line = self.buffer.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                line.truncate(pos - 1);
            }

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_LINE_LEN {
                warn!("discarding line of {} bytes", line.len());
                continue;
            }

            return Some(String::from_utf8_lossy(&line).into_owned());
        }
    }

    /// Returns the number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// One parsed command line.
///
/// `[:prefix] COMMAND param param ... [:remarks]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub prefix: Option<String>,
    /// Upper-cased command word.
    pub command: String,
    pub params: Vec<String>,
    /// Text after the first parameter that starts with `:`.
    pub remarks: Option<String>,
}

impl Line {
    /// Parses a line. Returns `None` when it holds no command.
    pub fn parse(text: &str) -> Option<Self> {
        let mut rest = text
            .trim_end_matches(|c| c == '\r' || c == '\n')
            .trim_start_matches(' ');

        let mut prefix = None;
        if let Some(stripped) = rest.strip_prefix(':') {
            let (p, tail) = stripped.split_once(' ')?;
            prefix = Some(p.to_string());
            rest = tail.trim_start_matches(' ');
        }

        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, tail)) => (command, tail),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        let mut remarks = None;
        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(text) = rest.strip_prefix(':') {
                remarks = Some(text.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, tail)) => {
                    params.push(param.to_string());
                    rest = tail;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
            remarks,
        })
    }

    /// Returns argument `index`, counting the remarks as the last argument.
    pub fn arg(&self, index: usize) -> Option<&str> {
        match self.params.get(index) {
            Some(param) => Some(param),
            None if index == self.params.len() => self.remarks.as_deref(),
            None => None,
        }
    }

    /// Number of arguments, remarks included.
    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(self.remarks.is_some())
    }
}
