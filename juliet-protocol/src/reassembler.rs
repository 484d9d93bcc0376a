//! Frame reassembly from a chunked byte stream.
//!
//! Radio reads arrive in arbitrary pieces. The reassembler keeps everything
//! that has not yet formed a frame, pulls out each complete frame as soon as
//! its closing marker arrives, and hands the decoded message to subscribers.
//! Bytes in front of a frame are discarded along with it, which lets the
//! stream resynchronize after noise or a truncated transmission.

use crate::event::{Subscribers, SubscriptionId};
use crate::frame::find_frame;
use crate::message::Message;
use crate::DEFAULT_MAX_BUFFER;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Extracts and decodes frames from appended bytes.
///
/// All operations take a single lock, and subscribers are called while it is
/// held, so deliveries from concurrent appends never interleave. Subscribers
/// must not call back into the same reassembler.
pub struct Reassembler {
    buffer: Mutex<BytesMut>,
    max_len: usize,
    verify_checksum: bool,
    on_message: Subscribers<Message>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            buffer: Mutex::new(BytesMut::with_capacity(4096)),
            max_len: DEFAULT_MAX_BUFFER,
            verify_checksum: true,
            on_message: Subscribers::new(),
        }
    }

    /// Caps the bytes kept between appends.
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Accepts frames with a bad checksum when `verify` is false.
    pub fn with_checksum_verification(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Registers a handler for decoded messages.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on_message.subscribe(handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.on_message.unsubscribe(id)
    }

    /// Appends bytes and delivers every frame completed by them.
    ///
    /// Returns the number of messages delivered. Frames that fail to decode
    /// are logged and skipped.
    pub fn append(&self, data: &[u8]) -> usize {
        let mut buffer = self.buffer.lock();
        debug!("adding {} bytes to reassembly buffer", data.len());
        buffer.extend_from_slice(data);

        let mut delivered = 0;
        while let Some(range) = find_frame(&buffer) {
            let chunk = buffer.split_to(range.end);
            let frame = &chunk[range.start..];

            match Message::unpack(frame, self.verify_checksum) {
                Ok(msg) => {
                    self.on_message.publish(&msg);
                    delivered += 1;
                }
                Err(e) => {
                    let preview = &frame[..frame.len().min(16)];
                    warn!(
                        "dropping radio frame {:?}: {}",
                        String::from_utf8_lossy(preview),
                        e
                    );
                }
            }
        }

        if buffer.len() > self.max_len {
            let excess = buffer.len() - self.max_len;
            debug!("reassembly buffer full, discarding {} bytes", excess);
            buffer.advance(excess);
        }

        delivered
    }

    /// Discards all buffered bytes.
    pub fn reset(&self) {
        self.buffer.lock().clear();
    }

    /// Returns the number of bytes waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const HELLO: &[u8] = b">>0:36FB:unittest:20210319143703:hello world:<<";

    fn collecting() -> (Reassembler, Arc<Mutex<Vec<Message>>>) {
        let reassembler = Reassembler::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        reassembler.subscribe(move |msg: &Message| sink.lock().push(msg.clone()));
        (reassembler, seen)
    }

    #[test]
    fn test_single_frame() {
        let (r, seen) = collecting();
        assert_eq!(r.append(HELLO), 1);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].sender(), Some("unittest"));
        assert_eq!(seen[0].content(), "hello world");
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_split_frame() {
        let (r, seen) = collecting();
        assert_eq!(r.append(b">>0:36FB:unittest:20210"), 0);
        assert_eq!(r.buffered(), 23);
        assert_eq!(r.append(b"319143703:hello world:<<"), 1);

        let whole = Message::unpack(HELLO, true).unwrap();
        assert_eq!(seen.lock().as_slice(), &[whole]);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_every_split_point() {
        for split in 1..HELLO.len() {
            let (r, seen) = collecting();
            r.append(&HELLO[..split]);
            r.append(&HELLO[split..]);
            assert_eq!(seen.lock().len(), 1, "split at {}", split);
        }
    }

    #[test]
    fn test_multiple_frames_with_bad_tail() {
        let (r, seen) = collecting();
        let data = b">>0:59F6:unittest:20210319145252:hello:<<\
>>0:A2F3:unittest:20210319145320:world:<<>>BAD";
        assert_eq!(r.append(data), 2);

        let seen = seen.lock();
        assert_eq!(seen[0].content(), "hello");
        assert_eq!(seen[1].content(), "world");
        assert_eq!(r.buffered(), b">>BAD".len());
    }

    #[test]
    fn test_resync_after_truncated_frame() {
        let (r, seen) = collecting();
        r.append(b">>0::unitt>>0:36FB:unittest:20210");
        r.append(b"319143703:hello world:<<");

        assert_eq!(seen.lock().len(), 1);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_bad_frame_dropped() {
        let (r, seen) = collecting();
        assert_eq!(r.append(b">>B:unittest:202103:blue:<<"), 0);
        assert!(seen.lock().is_empty());
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_bad_frame_does_not_block_next() {
        let (r, seen) = collecting();
        let mut data = b">>0:36FB:unittest:20210319143703:tampered:<<".to_vec();
        data.extend_from_slice(HELLO);
        assert_eq!(r.append(&data), 1);
        assert_eq!(seen.lock()[0].content(), "hello world");
    }

    #[test]
    fn test_file_with_reserved_mime_then_text() {
        let (r, seen) = collecting();
        let file = Message::file("attached", Some("a.txt"), Some("x/<<odd>>"))
            .with_sender("unittest");
        let mut data = file.pack().unwrap().to_vec();
        data.extend_from_slice(HELLO);
        assert_eq!(r.append(&data), 2);

        let seen = seen.lock();
        assert_eq!(seen[0], file);
        assert_eq!(seen[1].content(), "hello world");
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_checksum_opt_out() {
        let r = Reassembler::new().with_checksum_verification(false);
        assert_eq!(
            r.append(b">>0:0000:unittest:20210319143703:tampered:<<"),
            1
        );
    }

    #[test]
    fn test_buffer_trimmed_to_max() {
        let (r, seen) = {
            let r = Reassembler::new().with_max_len(16);
            let seen = Arc::new(Mutex::new(0usize));
            let sink = Arc::clone(&seen);
            r.subscribe(move |_: &Message| *sink.lock() += 1);
            (r, seen)
        };

        r.append(&[b'x'; 64]);
        assert_eq!(r.buffered(), 16);

        // A complete frame larger than the cap is still found before trimming.
        r.append(HELLO);
        assert_eq!(*seen.lock(), 1);
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_reset() {
        let (r, _) = collecting();
        r.append(b">>0:36FB:unit");
        r.reset();
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let r = Reassembler::new();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        let id = r.subscribe(move |_: &Message| *c.lock() += 1);

        r.append(HELLO);
        assert!(r.unsubscribe(id));
        r.append(HELLO);

        assert_eq!(*count.lock(), 1);
    }
}
