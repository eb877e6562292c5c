use std::convert::TryInto;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use strum::Display;

use crate::busline::common::{Error, Result};

/// Fixed frame header: tag(1) | serial(4, BE) | body length(4, BE)
pub const HEADER_LEN: usize = 9;

#[derive(Display, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    MethodCall = 1,
    MethodReturn = 2,
    Error = 3,
    Signal = 4,
}

impl Tag {
    pub fn new(b: u8) -> Result<Tag> {
        match b {
            1 => Ok(Tag::MethodCall),
            2 => Ok(Tag::MethodReturn),
            3 => Ok(Tag::Error),
            4 => Ok(Tag::Signal),
            _ => Err(Error::corrupted()),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// One framed message: a reference-counted slice of the read buffer holding
/// the complete frame, header included. The body's internal layout belongs
/// to the layer above; the transport only moves frames.
#[derive(Clone, PartialEq, Eq)]
pub struct Message(Bytes);

impl Message {
    /// Wraps a complete frame. The caller (normally the loader) has already
    /// validated the header.
    pub fn new(frame: Bytes) -> Self {
        debug_assert!(frame.len() >= HEADER_LEN);
        Message(frame)
    }

    pub fn tag(&self) -> Tag {
        // A Message is only constructed from a validated frame
        Tag::new(self.0[0]).expect("message constructed from unvalidated frame")
    }

    pub fn serial(&self) -> u32 {
        u32::from_be_bytes(self.0[1..5].try_into().unwrap())
    }

    pub fn body(&self) -> Bytes {
        self.0.slice(HEADER_LEN..)
    }

    /// Total size of the frame in bytes, header included. This is the size
    /// tracked by the live-bytes counter.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// The serialized wire form of this message.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Message{{{} serial={} len={}}}",
            self.tag(),
            self.serial(),
            self.len()
        )
    }
}

/// Builds outgoing frames.
pub struct MessageBuilder {
    data: BytesMut,
}

impl MessageBuilder {
    pub fn new(tag: Tag, serial: u32) -> Self {
        let mut data = BytesMut::with_capacity(HEADER_LEN + 64);
        data.put_u8(tag.as_u8());
        data.put_u32(serial);
        data.put_u32(0); // body length, patched in finish()
        MessageBuilder { data }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.write_bytes(s.as_bytes())
    }

    pub fn finish(mut self) -> Message {
        let body_len = (self.data.len() - HEADER_LEN) as u32;
        self.data[5..9].copy_from_slice(&body_len.to_be_bytes());
        Message::new(self.data.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_read_back() {
        let mut mb = MessageBuilder::new(Tag::MethodCall, 7);
        mb.write_str("hello");
        let msg = mb.finish();

        assert_eq!(msg.tag(), Tag::MethodCall);
        assert_eq!(msg.serial(), 7);
        assert_eq!(msg.len(), HEADER_LEN + 5);
        assert_eq!(&msg.body()[..], b"hello");
    }

    #[test]
    fn test_empty_body() {
        let msg = MessageBuilder::new(Tag::Signal, 0).finish();
        assert_eq!(msg.len(), HEADER_LEN);
        assert!(msg.body().is_empty());
    }

    #[test]
    fn test_tag_rejects_unknown() {
        assert!(Tag::new(0).is_err());
        assert!(Tag::new(5).is_err());
    }
}
