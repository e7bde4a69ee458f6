//! Multiplexed server: answers every stream of a connection concurrently.

use super::frame::{Frame, Kind, GREETING, MAX_PAYLOAD};
use super::{write_frames, FrameReader, ReadError};
use crate::error::ServeError;
use crate::listener::{self, is_transient, ServerStats, MAX_CONNECTIONS};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};

/// Server instance
pub struct MuxServer {
    listener: TcpListener,
    delay: Duration,
    stats: Arc<ServerStats>,
    connection_limit: Arc<Semaphore>,
}

impl MuxServer {
    /// Bind the listening socket. Each call will take `delay` to answer.
    pub async fn bind(addr: &str, delay: Duration) -> Result<Self, ServeError> {
        Ok(MuxServer {
            listener: listener::bind(addr).await?,
            delay,
            stats: Arc::new(ServerStats::default()),
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until a fatal accept error.
    pub async fn run(self) -> Result<(), ServeError> {
        let addr = self.local_addr().map_err(ServeError::Accept)?;
        info!(address = %addr, "Mux server listening");

        loop {
            // Wait for a connection slot
            let Ok(permit) = self.connection_limit.clone().acquire_owned().await else {
                return Ok(());
            };

            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    self.stats.connection_accepted();

                    let delay = self.delay;
                    let stats = Arc::clone(&self.stats);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, delay, stats).await {
                            debug!(peer = %peer, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "Failed to accept connection");
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    return Err(ServeError::Accept(e));
                }
            }
        }
    }
}

/// Serve one connection until the client goes away.
///
/// Outstanding calls are aborted when the connection ends.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    delay: Duration,
    stats: Arc<ServerStats>,
) -> Result<(), ReadError> {
    stream.set_nodelay(true)?;
    let (reader, writer) = stream.into_split();
    let (frames, queue) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_frames(writer, queue));

    let mut reader = FrameReader::new(reader);
    let mut calls = JoinSet::new();
    let mut last_stream_id = 0;

    let result = loop {
        // Reap finished calls so the set only holds in-flight work
        while calls.try_join_next().is_some() {}

        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                trace!(peer = %peer, "Connection closed by client");
                break Ok(());
            }
            Err(e) => break Err(e),
        };

        if frame.kind != Kind::Request {
            warn!(peer = %peer, kind = ?frame.kind, "Unexpected frame from client");
            let _ = frames.send(Frame::go_away());
            break Ok(());
        }

        let stream_id = frame.stream_id;
        if stream_id % 2 == 0 || stream_id <= last_stream_id {
            warn!(peer = %peer, stream_id, "Rejecting out-of-order stream id");
            let _ = frames.send(Frame::error(stream_id, "stream id must be odd and increasing"));
            continue;
        }
        last_stream_id = stream_id;

        let Some(name) = frame.text().map(str::to_owned) else {
            let _ = frames.send(Frame::error(stream_id, "name is not valid UTF-8"));
            continue;
        };

        trace!(peer = %peer, stream_id, name = %name, "Processing call");
        let frames = frames.clone();
        let stats = Arc::clone(&stats);
        calls.spawn(async move {
            listener::simulate_work(peer, delay).await;
            let reply = format!("{GREETING}{name}");
            let frame = if reply.len() > MAX_PAYLOAD {
                warn!(peer = %peer, stream_id, "Reply exceeds frame limit");
                Frame::error(stream_id, "reply exceeds frame limit")
            } else {
                stats.call_served();
                Frame::response(stream_id, &reply)
            };
            // The writer is gone only when the connection already closed
            let _ = frames.send(frame);
        });
    };

    if !calls.is_empty() {
        debug!(peer = %peer, outstanding = calls.len(), "Aborting outstanding calls");
    }
    calls.shutdown().await;
    drop(frames);
    match writer_task.await {
        Ok(Err(e)) => debug!(peer = %peer, error = %e, "Write failed"),
        Err(e) => debug!(peer = %peer, error = %e, "Writer task failed"),
        Ok(Ok(())) => {}
    }
    debug!(
        peer = %peer,
        connections = stats.connections(),
        calls = stats.calls(),
        "Connection closed"
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    async fn start(delay: Duration) -> (SocketAddr, Arc<ServerStats>) {
        let server = MuxServer::bind("127.0.0.1:0", delay).await.unwrap();
        let addr = server.local_addr().unwrap();
        let stats = server.stats();
        tokio::spawn(server.run());
        (addr, stats)
    }

    async fn connect(addr: SocketAddr) -> (FrameReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        (FrameReader::new(reader), writer)
    }

    #[tokio::test]
    async fn test_greets_by_name() {
        let (addr, stats) = start(Duration::from_millis(10)).await;
        let (mut reader, mut writer) = connect(addr).await;

        writer.write_all(&Frame::request(1, "Request-0").encode()).await.unwrap();
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame, Frame::response(1, "Hello Request-0"));
        assert_eq!(stats.calls(), 1);
    }

    #[tokio::test]
    async fn test_streams_answer_independently() {
        let (addr, _stats) = start(Duration::from_millis(200)).await;
        let (mut reader, mut writer) = connect(addr).await;

        let start = std::time::Instant::now();
        let mut batch = Frame::request(1, "a").encode();
        Frame::request(3, "b").encode_into(&mut batch).unwrap();
        Frame::request(5, "c").encode_into(&mut batch).unwrap();
        writer.write_all(&batch).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let frame = reader.next_frame().await.unwrap().unwrap();
            assert_eq!(frame.kind, Kind::Response);
            seen.push(frame.stream_id);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 3, 5]);
        assert!(start.elapsed() < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn test_rejects_reused_stream_id() {
        let (addr, _stats) = start(Duration::from_millis(10)).await;
        let (mut reader, mut writer) = connect(addr).await;

        writer.write_all(&Frame::request(3, "a").encode()).await.unwrap();
        writer.write_all(&Frame::request(1, "b").encode()).await.unwrap();

        let mut frames = vec![
            reader.next_frame().await.unwrap().unwrap(),
            reader.next_frame().await.unwrap().unwrap(),
        ];
        frames.sort_by_key(|f| f.stream_id);
        assert_eq!(frames[0].kind, Kind::Error);
        assert_eq!(frames[1], Frame::response(3, "Hello a"));
    }

    #[tokio::test]
    async fn test_invalid_name_fails_only_that_call() {
        let (addr, _stats) = start(Duration::from_millis(10)).await;
        let (mut reader, mut writer) = connect(addr).await;

        let mut bad = Frame::request(1, "").encode();
        bad[2] = 2;
        bad.extend_from_slice(&[0xff, 0xfe]);
        writer.write_all(&bad).await.unwrap();
        writer.write_all(&Frame::request(3, "ok").encode()).await.unwrap();

        let first = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(first.kind, Kind::Error);
        assert_eq!(first.stream_id, 1);
        let second = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(second, Frame::response(3, "Hello ok"));
    }

    #[tokio::test]
    async fn test_unframeable_reply_fails_only_that_call() {
        let (addr, stats) = start(Duration::from_millis(50)).await;
        let (mut reader, mut writer) = connect(addr).await;

        // The request fits, "Hello " + name does not
        let mut batch = Frame::request(1, &"x".repeat(MAX_PAYLOAD)).encode();
        Frame::request(3, "sibling").encode_into(&mut batch).unwrap();
        writer.write_all(&batch).await.unwrap();

        let mut frames = vec![
            reader.next_frame().await.unwrap().unwrap(),
            reader.next_frame().await.unwrap().unwrap(),
        ];
        frames.sort_by_key(|f| f.stream_id);
        assert_eq!(frames[0].kind, Kind::Error);
        assert_eq!(frames[0].stream_id, 1);
        assert_eq!(frames[1], Frame::response(3, "Hello sibling"));
        assert_eq!(stats.calls(), 1);

        // Connection still carries new calls
        writer.write_all(&Frame::request(5, "later").encode()).await.unwrap();
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame, Frame::response(5, "Hello later"));
    }

    #[tokio::test]
    async fn test_survives_client_drop() {
        let (addr, stats) = start(Duration::from_millis(100)).await;

        // First client vanishes with a call in flight
        let (reader, mut writer) = connect(addr).await;
        writer.write_all(&Frame::request(1, "gone").encode()).await.unwrap();
        drop(writer);
        drop(reader);

        let (mut reader, mut writer) = connect(addr).await;
        writer.write_all(&Frame::request(1, "again").encode()).await.unwrap();
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame, Frame::response(1, "Hello again"));
        assert_eq!(stats.connections(), 2);
    }
}
