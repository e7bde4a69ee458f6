//! HTTP/1.1 client with an idle-connection pool.
//!
//! A connection carries one request at a time. Concurrent calls therefore
//! need concurrent connections: each call checks out an idle one or dials a
//! new one, and puts it back only after the response body is fully read.

use crate::call::{Request, Response, Transport};
use crate::error::{CallError, ConnectError};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Limited};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{HeaderValue, CONNECTION, HOST};
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::sync::{Mutex, MutexGuard};
use tokio::net::TcpStream;
use tracing::{debug, trace};

/// Largest response body a call will buffer.
pub const MAX_BODY_SIZE: usize = 64 * 1024;

type Sender = SendRequest<Empty<Bytes>>;

/// A fully drained response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

/// Client for an `HttpServer`.
pub struct HttpClient {
    addr: String,
    /// `None` disables pooling: every call dials and closes its own connection.
    idle: Option<Mutex<Vec<Sender>>>,
}

impl HttpClient {
    pub fn new(addr: impl Into<String>, pool: bool) -> Self {
        Self {
            addr: addr.into(),
            idle: pool.then(|| Mutex::new(Vec::new())),
        }
    }

    /// Issue `GET path`, wait for the whole response, release the connection.
    pub async fn get(&self, path: &str) -> Result<HttpResponse, CallError> {
        let mut sender = match self.checkout().await {
            Some(sender) => {
                trace!(addr = %self.addr, "Reusing idle connection");
                sender
            }
            None => self.dial().await?,
        };

        let mut request = hyper::Request::get(path)
            .body(Empty::<Bytes>::new())
            .map_err(|e| CallError::Protocol(e.to_string()))?;
        let host = HeaderValue::from_str(&self.addr)
            .map_err(|e| CallError::Protocol(e.to_string()))?;
        request.headers_mut().insert(HOST, host);
        if self.idle.is_none() {
            request
                .headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }

        let response = sender.send_request(request).await?;
        let status = response.status();
        let body = Limited::new(response.into_body(), MAX_BODY_SIZE)
            .collect()
            .await
            .map_err(|e| CallError::Protocol(format!("response body: {e}")))?
            .to_bytes();

        self.release(sender);

        if status != StatusCode::OK {
            return Err(CallError::Status {
                code: status.as_u16(),
            });
        }
        Ok(HttpResponse { status, body })
    }

    /// Idle connections currently parked in the pool.
    #[cfg(test)]
    pub fn idle_connections(&self) -> usize {
        self.idle.as_ref().map_or(0, |idle| lock(idle).len())
    }

    /// Take a live idle connection; it belongs to the caller alone until
    /// released. Connections the server has since closed are discarded.
    async fn checkout(&self) -> Option<Sender> {
        let idle = self.idle.as_ref()?;
        loop {
            let popped = lock(idle).pop();
            let mut sender = popped?;
            match sender.ready().await {
                Ok(()) => return Some(sender),
                Err(e) => trace!(error = %e, "Discarding closed idle connection"),
            }
        }
    }

    fn release(&self, sender: Sender) {
        let Some(idle) = &self.idle else {
            return;
        };
        if sender.is_closed() {
            return;
        }
        let mut idle = lock(idle);
        idle.push(sender);
        trace!(idle = idle.len(), "Returned connection to pool");
    }

    async fn dial(&self) -> Result<Sender, ConnectError> {
        let connect_error = |source| ConnectError {
            addr: self.addr.clone(),
            source,
        };
        let stream = TcpStream::connect(&self.addr).await.map_err(connect_error)?;
        stream.set_nodelay(true).map_err(connect_error)?;
        let local = stream.local_addr().ok();

        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| connect_error(io::Error::other(e)))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Connection driver failed");
            }
        });

        debug!(local = ?local, addr = %self.addr, "Dialed new connection");
        Ok(sender)
    }
}

fn lock(idle: &Mutex<Vec<Sender>>) -> MutexGuard<'_, Vec<Sender>> {
    idle.lock().unwrap_or_else(|e| e.into_inner())
}

impl Transport for HttpClient {
    fn name(&self) -> &'static str {
        "http"
    }

    fn call(&self, request: Request) -> impl Future<Output = Result<Response, CallError>> + Send {
        async move {
            let response = self.get("/").await?;
            trace!(id = request.id, status = %response.status, "Call completed");
            Ok(Response::new(
                request.id,
                String::from_utf8_lossy(&response.body),
            ))
        }
    }
}
