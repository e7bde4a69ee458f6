//! Multiplexed transport: many calls interleaved over one TCP connection.
//!
//! Each call lives on its own stream. The client opens streams with odd,
//! strictly increasing ids; the server answers each stream independently,
//! so a slow call never holds up the others sharing the connection.
//!
//! ## Frame Format
//!
//! HTTP/2-shaped 9-byte header followed by the payload:
//!
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+-------------------------------+
//! |R|                 Stream Identifier (31)                      |
//! +=+=============================================================+
//! |                   Payload (0...)                            ...
//! +---------------------------------------------------------------+
//! ```
//!
//! Types: `REQUEST` (0x1) carries the caller's name, `RESPONSE` (0x2) the
//! greeting, `ERROR` (0x3) a per-call failure reason, `GOAWAY` (0x7, stream
//! 0) announces the connection is closing.
//!
//! ## Exchange
//!
//! ```text
//! Client:  REQUEST  stream=1 "Request-0"
//! Client:  REQUEST  stream=3 "Request-1"
//! Server:  RESPONSE stream=3 "Hello Request-1"
//! Server:  RESPONSE stream=1 "Hello Request-0"
//! ```

pub mod client;
pub mod frame;
pub mod server;

pub use client::MuxClient;
pub use server::MuxServer;

use bytes::{Buf, BytesMut};
use frame::{Frame, FrameError, ParseResult};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Why a connection stopped yielding frames.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Frame(#[from] FrameError),
    #[error("connection closed mid-frame")]
    Truncated,
}

/// Buffers a byte stream and yields whole frames.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    /// Next frame, or `None` on a clean EOF between frames.
    ///
    /// Cancel safe: partial frames stay buffered across calls.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ReadError> {
        loop {
            match frame::parse(&self.buffer) {
                ParseResult::Complete(frame, consumed) => {
                    self.buffer.advance(consumed);
                    return Ok(Some(frame));
                }
                ParseResult::Error(e) => return Err(e.into()),
                ParseResult::Incomplete => {}
            }

            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(ReadError::Truncated)
                };
            }
        }
    }
}

/// Drain queued frames onto the socket until every sender is gone.
///
/// The single owner of the write half, so frames never interleave.
pub async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(BUFFER_SIZE);

    while let Some(frame) = frames.recv().await {
        buf.clear();
        encode_or_drop(&frame, &mut buf);
        // Coalesce whatever else is already queued into one write
        while let Ok(next) = frames.try_recv() {
            encode_or_drop(&next, &mut buf);
        }
        if !buf.is_empty() {
            writer.write_all(&buf).await?;
        }
    }

    writer.shutdown().await
}

/// An unframeable frame is dropped rather than corrupting the stream.
fn encode_or_drop(frame: &Frame, buf: &mut BytesMut) {
    if let Err(e) = frame.encode_into(buf) {
        warn!(stream_id = frame.stream_id, error = %e, "Dropping frame");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame::Kind;

    #[tokio::test]
    async fn test_reader_reassembles_split_frames() {
        let bytes = Frame::response(7, "Hello Request-3").encode();
        let (head, tail) = bytes.split_at(5);
        let mock = tokio_test::io::Builder::new()
            .read(head)
            .read(tail)
            .build();

        let mut reader = FrameReader::new(mock);
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.kind, Kind::Response);
        assert_eq!(frame.stream_id, 7);
        assert_eq!(frame.text(), Some("Hello Request-3"));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_reports_truncation() {
        let bytes = Frame::request(1, "Request-0").encode();
        let mock = tokio_test::io::Builder::new().read(&bytes[..10]).build();

        let mut reader = FrameReader::new(mock);
        assert!(matches!(
            reader.next_frame().await,
            Err(ReadError::Truncated)
        ));
    }

    #[tokio::test]
    async fn test_writer_coalesces_queue() {
        let mut expected = Frame::request(1, "a").encode();
        Frame::request(3, "b").encode_into(&mut expected).unwrap();
        let mock = tokio_test::io::Builder::new().write(&expected).build();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Frame::request(1, "a")).unwrap();
        tx.send(Frame::request(3, "b")).unwrap();
        drop(tx);

        write_frames(mock, rx).await.unwrap();
    }

    #[tokio::test]
    async fn test_writer_skips_oversized_frame() {
        let expected = Frame::response(3, "ok").encode();
        let mock = tokio_test::io::Builder::new().write(&expected).build();

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Frame::response(1, &"x".repeat(frame::MAX_PAYLOAD + 1)))
            .unwrap();
        tx.send(Frame::response(3, "ok")).unwrap();
        drop(tx);

        write_frames(mock, rx).await.unwrap();
    }
}
