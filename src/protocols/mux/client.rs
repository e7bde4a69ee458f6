//! Multiplexed client: one connection, any number of concurrent calls.

use super::frame::{Frame, Kind, MAX_NAME, MAX_STREAM_ID};
use super::{write_frames, FrameReader, ReadError};
use crate::call::{Request, Response, Transport};
use crate::error::{CallError, ConnectError};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

type Outcome = Result<String, CallError>;

/// How the connection ended.
#[derive(Debug, Clone)]
enum Shutdown {
    Closed,
    Protocol(String),
}

impl Shutdown {
    fn error(&self) -> CallError {
        match self {
            Shutdown::Closed => CallError::TransportClosed,
            Shutdown::Protocol(reason) => CallError::Protocol(reason.clone()),
        }
    }
}

/// Calls waiting for their response, keyed by stream id.
struct Pending {
    next_stream_id: u32,
    calls: HashMap<u32, oneshot::Sender<Outcome>>,
    shutdown: Option<Shutdown>,
}

impl Pending {
    fn allocate(&mut self) -> Option<u32> {
        let id = self.next_stream_id;
        if id > MAX_STREAM_ID {
            return None;
        }
        self.next_stream_id = id.saturating_add(2);
        Some(id)
    }
}

struct Shared {
    pending: Mutex<Pending>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail every outstanding call and refuse new ones.
    fn fail_all(&self, shutdown: Shutdown) {
        let mut pending = self.lock();
        if pending.shutdown.is_none() {
            pending.shutdown = Some(shutdown.clone());
        }
        let failed = pending.calls.len();
        for (_, waiter) in pending.calls.drain() {
            let _ = waiter.send(Err(shutdown.error()));
        }
        if failed > 0 {
            debug!(failed, "Failed outstanding calls");
        }
    }
}

/// A client holding exactly one connection to a `MuxServer`.
pub struct MuxClient {
    peer: SocketAddr,
    shared: Arc<Shared>,
    frames: mpsc::UnboundedSender<Frame>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl MuxClient {
    /// Dial the server. No call can be dispatched before this succeeds.
    pub async fn connect(addr: &str) -> Result<Self, ConnectError> {
        let connect_error = |source| ConnectError {
            addr: addr.to_string(),
            source,
        };

        let stream = TcpStream::connect(addr).await.map_err(connect_error)?;
        stream.set_nodelay(true).map_err(connect_error)?;
        let peer = stream.peer_addr().map_err(connect_error)?;
        debug!(peer = %peer, "Connected");

        let (reader, writer) = stream.into_split();
        let shared = Arc::new(Shared {
            pending: Mutex::new(Pending {
                next_stream_id: 1,
                calls: HashMap::new(),
                shutdown: None,
            }),
        });

        let (frames, queue) = mpsc::unbounded_channel();
        let writer_task = {
            let shared = Arc::clone(&shared);
            tokio::spawn(async move {
                if let Err(e) = write_frames(writer, queue).await {
                    debug!(error = %e, "Write failed");
                    shared.fail_all(Shutdown::Closed);
                }
            })
        };
        let reader_task = tokio::spawn(read_responses(
            FrameReader::new(reader),
            Arc::clone(&shared),
        ));

        Ok(MuxClient {
            peer,
            shared,
            frames,
            reader_task,
            writer_task,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Start a call on a fresh stream of the shared connection.
    ///
    /// Safe to invoke from many tasks at once. The returned `Call` resolves
    /// to exactly one outcome.
    pub fn dispatch(&self, request: Request) -> Call {
        let id = request.id;
        // The greeting must fit in one frame too
        if request.name.len() > MAX_NAME {
            return Call::failed(
                id,
                CallError::Protocol(format!("name exceeds {MAX_NAME} bytes")),
            );
        }

        let (waiter, outcome) = oneshot::channel();
        let mut pending = self.shared.lock();
        if let Some(shutdown) = &pending.shutdown {
            return Call::failed(id, shutdown.error());
        }
        let Some(stream_id) = pending.allocate() else {
            return Call::failed(id, CallError::StreamIdsExhausted);
        };

        // Queue while still holding the lock so stream ids hit the wire in order
        if self.frames.send(Frame::request(stream_id, &request.name)).is_err() {
            return Call::failed(id, CallError::TransportClosed);
        }
        pending.calls.insert(stream_id, waiter);
        trace!(id, stream_id, issued_at = %request.issued_at, "Dispatched");

        Call {
            id,
            state: CallState::Pending(outcome),
        }
    }

    /// Number of calls still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.shared.lock().calls.len()
    }

    /// Tear the connection down, failing anything still in flight.
    pub fn close(self) {
        debug!(peer = %self.peer, in_flight = self.in_flight(), "Closing connection");
        self.shared.fail_all(Shutdown::Closed);
        // Drop aborts both tasks, which releases the socket
    }
}

impl Drop for MuxClient {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl Transport for MuxClient {
    fn name(&self) -> &'static str {
        "mux"
    }

    fn call(&self, request: Request) -> impl Future<Output = Result<Response, CallError>> + Send {
        self.dispatch(request)
    }
}

/// Demultiplex responses back to their callers until the connection ends.
async fn read_responses(mut reader: FrameReader<OwnedReadHalf>, shared: Arc<Shared>) {
    let shutdown = loop {
        let frame = match reader.next_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Server closed the connection");
                break Shutdown::Closed;
            }
            Err(ReadError::Frame(e)) => {
                warn!(error = %e, "Malformed frame from server");
                break Shutdown::Protocol(e.to_string());
            }
            Err(e) => {
                debug!(error = %e, "Read failed");
                break Shutdown::Closed;
            }
        };

        let outcome = match (frame.kind, frame.text()) {
            (Kind::GoAway, _) => {
                debug!("Server sent GOAWAY");
                break Shutdown::Closed;
            }
            (Kind::Request, _) => {
                warn!(stream_id = frame.stream_id, "Server sent a request frame");
                break Shutdown::Protocol("unexpected request frame".to_string());
            }
            (Kind::Response, Some(message)) => Ok(message.to_string()),
            (Kind::Error, Some(reason)) => Err(CallError::Remote {
                message: reason.to_string(),
            }),
            (_, None) => Err(CallError::Protocol(
                "payload is not valid UTF-8".to_string(),
            )),
        };

        let waiter = shared.lock().calls.remove(&frame.stream_id);
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => warn!(stream_id = frame.stream_id, "Response for unknown stream"),
        }
    };

    shared.fail_all(shutdown);
}

enum CallState {
    Pending(oneshot::Receiver<Outcome>),
    Failed(Option<CallError>),
}

/// One in-flight call. Resolves to its response or the reason it failed.
pub struct Call {
    id: u64,
    state: CallState,
}

impl Call {
    fn failed(id: u64, error: CallError) -> Self {
        Call {
            id,
            state: CallState::Failed(Some(error)),
        }
    }
}

impl Future for Call {
    type Output = Result<Response, CallError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            CallState::Pending(outcome) => match Pin::new(outcome).poll(cx) {
                Poll::Ready(Ok(Ok(message))) => Poll::Ready(Ok(Response::new(this.id, message))),
                Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e)),
                // Sender dropped with the client itself
                Poll::Ready(Err(_)) => Poll::Ready(Err(CallError::TransportClosed)),
                Poll::Pending => Poll::Pending,
            },
            CallState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(CallError::TransportClosed)))
            }
        }
    }
}
