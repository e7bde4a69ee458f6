//! Frame encoding and parsing for the multiplexed transport.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 9;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 16 * 1024;

/// Greeting prefix the server puts in front of the caller's name.
pub const GREETING: &str = "Hello ";

/// Longest name whose greeting still fits in one frame.
pub const MAX_NAME: usize = MAX_PAYLOAD - GREETING.len();

/// Largest usable stream id (the high bit is reserved).
pub const MAX_STREAM_ID: u32 = (1 << 31) - 1;

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Client → server: start a call. Payload is the UTF-8 name.
    Request,
    /// Server → client: the call succeeded. Payload is the UTF-8 message.
    Response,
    /// Server → client: the call failed. Payload is a UTF-8 reason.
    Error,
    /// Server → client on stream 0: the connection is going away.
    GoAway,
}

impl Kind {
    fn to_byte(self) -> u8 {
        match self {
            Kind::Request => 0x1,
            Kind::Response => 0x2,
            Kind::Error => 0x3,
            Kind::GoAway => 0x7,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x1 => Some(Kind::Request),
            0x2 => Some(Kind::Response),
            0x3 => Some(Kind::Error),
            0x7 => Some(Kind::GoAway),
            _ => None,
        }
    }
}

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: Kind,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(stream_id: u32, name: &str) -> Self {
        Self::new(Kind::Request, stream_id, name)
    }

    pub fn response(stream_id: u32, message: &str) -> Self {
        Self::new(Kind::Response, stream_id, message)
    }

    pub fn error(stream_id: u32, reason: &str) -> Self {
        Self::new(Kind::Error, stream_id, reason)
    }

    pub fn go_away() -> Self {
        Self::new(Kind::GoAway, 0, "")
    }

    fn new(kind: Kind, stream_id: u32, payload: &str) -> Self {
        Self {
            kind,
            stream_id,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        }
    }

    /// Payload as text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Encode a frame to bytes
    #[cfg(test)]
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        self.encode_into(&mut buf).expect("payload within limit");
        buf
    }

    /// Encode a frame into an existing buffer.
    ///
    /// A payload over `MAX_PAYLOAD` is refused and nothing is written.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let len = self.payload.len() as u32;
        buf.reserve(HEADER_LEN + self.payload.len());
        buf.put_uint(u64::from(len), 3);
        buf.put_u8(self.kind.to_byte());
        buf.put_u8(0); // flags
        buf.put_u32(self.stream_id & MAX_STREAM_ID);
        buf.extend_from_slice(&self.payload);
        Ok(())
    }
}

/// Frame-level parse errors. Any of these poisons the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown frame type 0x{0:02x}")]
    UnknownKind(u8),
    #[error("payload of {0} bytes exceeds the 16384 byte limit")]
    PayloadTooLarge(usize),
}

/// Parse result.
#[derive(Debug)]
pub enum ParseResult {
    /// A whole frame and the number of bytes it occupied.
    Complete(Frame, usize),
    /// Need more data.
    Incomplete,
    /// The bytes cannot be a frame.
    Error(FrameError),
}

/// Parse one frame from the front of the input buffer.
pub fn parse(input: &[u8]) -> ParseResult {
    if input.len() < HEADER_LEN {
        return ParseResult::Incomplete;
    }

    let len = (usize::from(input[0]) << 16) | (usize::from(input[1]) << 8) | usize::from(input[2]);
    if len > MAX_PAYLOAD {
        return ParseResult::Error(FrameError::PayloadTooLarge(len));
    }

    let kind = match Kind::from_byte(input[3]) {
        Some(kind) => kind,
        None => return ParseResult::Error(FrameError::UnknownKind(input[3])),
    };
    // input[4] holds flags; none are defined yet

    let stream_id = u32::from_be_bytes([input[5], input[6], input[7], input[8]]) & MAX_STREAM_ID;

    let total = HEADER_LEN + len;
    if input.len() < total {
        return ParseResult::Incomplete;
    }

    let frame = Frame {
        kind,
        stream_id,
        payload: Bytes::copy_from_slice(&input[HEADER_LEN..total]),
    };
    ParseResult::Complete(frame, total)
}
