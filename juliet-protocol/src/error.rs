//! Protocol error types.

use thiserror::Error;

/// Errors raised while decoding a radio frame.
///
/// Every variant is local to a single frame: callers drop the frame and
/// carry on with the rest of the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Format(String),

    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },

    #[error("unsupported message version: {0:#x}")]
    UnsupportedVersion(u32),
}

impl ProtocolError {
    pub(crate) fn format(reason: impl Into<String>) -> Self {
        ProtocolError::Format(reason.into())
    }

    /// Returns true for integrity failures, which may be waived by callers
    /// that disable checksum verification.
    pub fn is_checksum(&self) -> bool {
        matches!(self, ProtocolError::Checksum { .. })
    }
}
