use std::collections::VecDeque;
use std::convert::TryInto;
use std::sync::Mutex;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::busline::common::fault;
use crate::busline::common::{Error, Result};
use crate::busline::config::conf;
use crate::busline::protocol::message::{Message, Tag, HEADER_LEN};

// A small freelist of read buffers, reused across loaders and decode
// scratch space. DISABLE_MEM_POOLS turns it off so leak checkers see
// every allocation individually.
static BUFFER_POOL: Mutex<Vec<BytesMut>> = Mutex::new(Vec::new());
const BUFFER_POOL_MAX: usize = 4;

pub fn acquire_buffer(capacity: usize) -> BytesMut {
    if !fault::mem_pools_disabled() {
        if let Some(mut buf) = BUFFER_POOL.lock().unwrap().pop() {
            buf.clear();
            return buf;
        }
    }
    BytesMut::with_capacity(capacity)
}

pub fn release_buffer(mut buf: BytesMut) {
    if fault::mem_pools_disabled() {
        return;
    }
    if fault::guards_enabled() {
        // poison recycled buffers so reads of stale contents show up
        let capacity = buf.capacity();
        buf.clear();
        buf.resize(capacity, 0xa5);
        buf.clear();
    }
    let mut pool = BUFFER_POOL.lock().unwrap();
    if pool.len() < BUFFER_POOL_MAX {
        pool.push(buf);
    }
}

/// The framing engine: accumulates raw bytes from the backend, splits them
/// into validated message frames, and reports corruption. The transport
/// drains it through peek/pop and puts a message back when the live-bytes
/// counter refuses it.
pub struct MessageLoader {
    buffer: BytesMut,
    messages: VecDeque<Message>,
    corrupted: bool,
    max_message_size: usize,
}

impl MessageLoader {
    pub fn new() -> Self {
        MessageLoader {
            buffer: acquire_buffer(conf().recv_buffer_size),
            messages: VecDeque::new(),
            corrupted: false,
            max_message_size: conf().max_message_size,
        }
    }

    /// The raw read buffer. The backend appends socket bytes here; the
    /// transport appends recovered handshake-trailer bytes here.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Make room for an upcoming read of len bytes. Fails only when the
    /// allocation gate refuses, leaving the buffer untouched.
    pub fn reserve_read_space(&mut self, len: usize) -> Result<()> {
        if !fault::try_alloc(len) {
            return Err(Error::out_of_memory());
        }
        self.buffer.reserve(len);
        Ok(())
    }

    /// Append bytes to the read buffer, all or nothing.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        if !fault::try_alloc(bytes.len()) {
            return Err(Error::out_of_memory());
        }
        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Split all complete frames out of the buffer onto the message queue.
    /// A malformed header or oversized frame marks the stream corrupt and
    /// stops parsing; Err is returned only when the allocation gate refuses.
    pub fn queue_messages(&mut self) -> Result<()> {
        while !self.corrupted {
            if self.buffer.len() < HEADER_LEN {
                break;
            }

            let tag = match Tag::new(self.buffer[0]) {
                Ok(tag) => tag,
                Err(_) => {
                    warn!(tag = self.buffer[0], "invalid message tag, stream is corrupt");
                    self.corrupted = true;
                    break;
                }
            };
            let body_len =
                u32::from_be_bytes((&self.buffer[5..9]).try_into().unwrap()) as usize;
            let frame_len = HEADER_LEN + body_len;
            if frame_len > self.max_message_size {
                warn!(
                    frame_len,
                    max = self.max_message_size,
                    "message exceeds maximum size, stream is corrupt"
                );
                self.corrupted = true;
                break;
            }

            if frame_len > self.buffer.len() {
                // We don't have the whole message yet; make sure there is
                // room for the rest of it
                self.reserve_read_space(frame_len - self.buffer.len())?;
                break;
            }

            if !fault::try_alloc(frame_len) {
                return Err(Error::out_of_memory());
            }
            let msg = Message::new(self.buffer.split_to(frame_len).freeze());
            debug!(msg = ?&msg, tag = %tag, "loader framed message");
            self.messages.push_back(msg);
        }
        Ok(())
    }

    pub fn peek_message(&self) -> Option<&Message> {
        self.messages.front()
    }

    pub fn pop_message(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    /// Return a popped message to the head of the queue, preserving order.
    pub fn putback_message(&mut self, msg: Message) {
        self.messages.push_front(msg);
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted
    }

    pub fn set_max_message_size(&mut self, size: usize) {
        self.max_message_size = size;
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Drop for MessageLoader {
    fn drop(&mut self) {
        release_buffer(std::mem::take(&mut self.buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::busline::protocol::message::MessageBuilder;

    fn frame(tag: Tag, serial: u32, body: &[u8]) -> Message {
        let mut mb = MessageBuilder::new(tag, serial);
        mb.write_bytes(body);
        mb.finish()
    }

    #[test]
    #[serial_test::serial]
    fn test_frames_in_order() {
        let mut loader = MessageLoader::new();
        loader
            .append_bytes(frame(Tag::MethodCall, 1, b"one").as_bytes())
            .unwrap();
        loader
            .append_bytes(frame(Tag::Signal, 2, b"two").as_bytes())
            .unwrap();

        loader.queue_messages().unwrap();
        assert!(!loader.is_corrupted());
        assert_eq!(loader.pop_message().unwrap().serial(), 1);
        assert_eq!(loader.pop_message().unwrap().serial(), 2);
        assert!(loader.pop_message().is_none());
    }

    #[test]
    #[serial_test::serial]
    fn test_partial_frame_waits() {
        let msg = frame(Tag::MethodCall, 1, &[0xaa; 64]);
        let mut loader = MessageLoader::new();
        loader.append_bytes(&msg.as_bytes()[..20]).unwrap();

        loader.queue_messages().unwrap();
        assert!(loader.peek_message().is_none());

        loader.append_bytes(&msg.as_bytes()[20..]).unwrap();
        loader.queue_messages().unwrap();
        assert_eq!(loader.pop_message().unwrap().len(), msg.len());
    }

    #[test]
    #[serial_test::serial]
    fn test_bad_tag_corrupts() {
        let mut loader = MessageLoader::new();
        loader.append_bytes(&[0xff; 16]).unwrap();
        loader.queue_messages().unwrap();
        assert!(loader.is_corrupted());
        assert!(loader.peek_message().is_none());
    }

    #[test]
    #[serial_test::serial]
    fn test_oversized_frame_corrupts() {
        let mut loader = MessageLoader::new();
        loader.set_max_message_size(32);
        loader
            .append_bytes(frame(Tag::MethodCall, 1, &[0; 64]).as_bytes())
            .unwrap();
        loader.queue_messages().unwrap();
        assert!(loader.is_corrupted());
    }

    #[test]
    #[serial_test::serial]
    fn test_messages_before_corruption_survive() {
        let mut loader = MessageLoader::new();
        loader
            .append_bytes(frame(Tag::MethodCall, 1, b"good").as_bytes())
            .unwrap();
        loader.append_bytes(&[0xff; 16]).unwrap();

        loader.queue_messages().unwrap();
        assert!(loader.is_corrupted());
        assert_eq!(loader.pop_message().unwrap().serial(), 1);
        assert!(loader.pop_message().is_none());
    }

    #[test]
    #[serial_test::serial]
    fn test_putback_preserves_order() {
        let mut loader = MessageLoader::new();
        loader
            .append_bytes(frame(Tag::MethodCall, 1, b"a").as_bytes())
            .unwrap();
        loader
            .append_bytes(frame(Tag::MethodCall, 2, b"b").as_bytes())
            .unwrap();
        loader.queue_messages().unwrap();

        let first = loader.pop_message().unwrap();
        loader.putback_message(first);
        assert_eq!(loader.pop_message().unwrap().serial(), 1);
        assert_eq!(loader.pop_message().unwrap().serial(), 2);
    }

    #[test]
    #[serial_test::serial]
    fn test_queue_messages_oom() {
        let mut loader = MessageLoader::new();
        loader
            .append_bytes(frame(Tag::MethodCall, 1, b"payload").as_bytes())
            .unwrap();

        fault::set_fail_alloc_counter(0);
        assert!(loader.queue_messages().unwrap_err().is_out_of_memory());
        fault::clear_fail_alloc();

        // nothing was lost; the retry frames the message
        loader.queue_messages().unwrap();
        assert_eq!(loader.pop_message().unwrap().serial(), 1);
    }
}
