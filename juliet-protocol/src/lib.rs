//! # juliet-protocol
//!
//! Radio link protocol for juliet.
//!
//! This crate provides:
//! - The `>>…<<` text frame grammar with a CRC16 integrity field
//! - Versioned message kinds (plain, compressed, channel, file)
//! - Reserved character escaping for frame-safe payloads
//! - A reassembler that pulls complete frames out of a chunked byte stream
//! - Ordered, synchronous publish/subscribe used across the bridge

pub mod checksum;
pub mod error;
pub mod escape;
pub mod event;
pub mod frame;
pub mod message;
pub mod reassembler;
pub mod signature;

pub use checksum::{checksum, crc16};
pub use error::ProtocolError;
pub use event::{Subscribers, SubscriptionId};
pub use frame::{find_frame, RawFrame, FRAME_END, FRAME_START};
pub use message::{Message, MessageKind};
pub use reassembler::Reassembler;
pub use signature::{NullSigner, Signer};

/// Default cap on bytes held by a [`Reassembler`] (5 MiB).
pub const DEFAULT_MAX_BUFFER: usize = 5 * 1024 * 1024;

/// Timestamp layout used on the wire (UTC, second precision).
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
