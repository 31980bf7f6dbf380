//! The wire framing: every message is a tag byte, a big-endian length and
//! the payload. The explicit tag replaces the original try-binary-then-text
//! decode fallback, the length prefix makes partial TCP reads harmless.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::io::{self, Cursor};

/// Header size: 1 byte tag + 4 bytes payload length.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Maximum payload size. This is the receive buffer the original protocol
/// was designed around; a 20x10 board snapshot stays far below it.
pub const MAX_FRAME_SIZE: usize = 25_600;

/// One decoded protocol frame. The tag is one of the constants in the crate
/// root; the payload stays opaque until a handler interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Builds a frame from a tag and an already serialized payload.
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Frame {
            tag,
            payload: payload.into(),
        }
    }

    /// A frame without payload (sentinels like `GAME_STARTED` or `TOP_OUT`).
    pub fn empty(tag: u8) -> Self {
        Frame {
            tag,
            payload: Bytes::new(),
        }
    }

    /// A frame carrying plain UTF-8 text.
    pub fn text(tag: u8, text: &str) -> Self {
        Frame {
            tag,
            payload: Bytes::copy_from_slice(text.as_bytes()),
        }
    }

    /// A frame with a postcard serialized payload.
    pub fn binary<T: Serialize>(tag: u8, payload: &T) -> Result<Self, postcard::Error> {
        let raw = postcard::to_stdvec(payload)?;
        Ok(Frame {
            tag,
            payload: Bytes::from(raw),
        })
    }

    /// The payload interpreted as UTF-8, lossy. Control text is always short
    /// and produced by our own clients, so replacement characters only show
    /// up for genuinely broken frames.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }

    /// The size of the encoded frame on the wire.
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Appends the encoded frame to the buffer.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        buf.put_u8(self.tag);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Encodes into a freshly frozen buffer.
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Tries to cut one frame off the front of the buffer. `Ok(None)` means
    /// more data is needed, an error means the stream is corrupt beyond the
    /// point where skipping a single frame could help.
    pub fn decode(buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming it.
        let mut cursor = Cursor::new(&buf[..]);
        let tag = cursor.get_u8();
        let payload_len = cursor.get_u32() as usize;

        if payload_len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "frame payload of {} bytes exceeds the limit of {}",
                    payload_len, MAX_FRAME_SIZE
                ),
            ));
        }

        let total = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < total {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Frame { tag, payload }))
    }
}

/// Streaming decoder for one connection. Raw reads get fed in, complete
/// frames come out as soon as they are buffered in full.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: BytesMut,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Appends raw bytes from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pops the next complete frame, if one is buffered.
    pub fn decode_next(&mut self) -> io::Result<Option<Frame>> {
        Frame::decode(&mut self.buffer)
    }

    /// The amount of not yet consumed bytes.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BOARD_STATE, CONTROL_TEXT, TOP_OUT};

    #[test]
    fn encode_decode_roundtrip() {
        let original = Frame::text(CONTROL_TEXT, "Ready%alice");
        let mut buf = BytesMut::new();
        original.encode(&mut buf);

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(original, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let mut codec = FrameCodec::new();
        let frame1 = Frame::new(BOARD_STATE, vec![1u8, 2, 3, 4, 5, 6, 7, 8]);
        let frame2 = Frame::empty(TOP_OUT);

        let mut wire = BytesMut::new();
        frame1.encode(&mut wire);
        frame2.encode(&mut wire);

        // Less than a header must not produce a frame.
        codec.feed(&wire[..3]);
        assert!(codec.decode_next().unwrap().is_none());

        codec.feed(&wire[3..]);
        assert_eq!(codec.decode_next().unwrap().unwrap(), frame1);
        assert_eq!(codec.decode_next().unwrap().unwrap(), frame2);
        assert!(codec.decode_next().unwrap().is_none());
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(BOARD_STATE);
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);

        assert!(Frame::decode(&mut buf).is_err());
    }

    #[test]
    fn empty_frame_is_header_only() {
        let frame = Frame::empty(TOP_OUT);
        assert_eq!(frame.encoded_size(), FRAME_HEADER_SIZE);

        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(decoded.payload.is_empty());
    }
}
