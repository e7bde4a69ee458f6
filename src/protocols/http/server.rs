//! HTTP/1.1 server: `GET /` answers `Hello!` after the simulated work.

use crate::error::ServeError;
use crate::listener::{self, is_transient, ServerStats, MAX_CONNECTIONS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Body of every successful response.
pub const HELLO: &[u8] = b"Hello!";

/// Server instance
pub struct HttpServer {
    listener: TcpListener,
    delay: Duration,
    serial: bool,
    stats: Arc<ServerStats>,
    connection_limit: Arc<Semaphore>,
}

impl HttpServer {
    /// Bind the listening socket.
    ///
    /// With `serial` set, connections are served one at a time from the
    /// accept loop, so concurrent clients queue behind each other. A serial
    /// server disables keep-alive; an idle pooled connection would otherwise
    /// stall the accept loop.
    pub async fn bind(addr: &str, delay: Duration, serial: bool) -> Result<Self, ServeError> {
        Ok(HttpServer {
            listener: listener::bind(addr).await?,
            delay,
            serial,
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
        info!(address = %addr, serial = self.serial, "HTTP server listening");

        loop {
            let Ok(permit) = self.connection_limit.clone().acquire_owned().await else {
                return Ok(());
            };

            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient(&e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    return Err(ServeError::Accept(e));
                }
            };
            debug!(peer = %peer, "New connection");
            self.stats.connection_accepted();

            let delay = self.delay;
            let serial = self.serial;
            let stats = Arc::clone(&self.stats);
            if serial {
                serve_connection(stream, peer, delay, false, stats).await;
                drop(permit);
            } else {
                tokio::spawn(async move {
                    serve_connection(stream, peer, delay, true, stats).await;
                    drop(permit);
                });
            }
        }
    }
}

/// Serve requests on one connection until either side closes it.
///
/// Malformed requests never reach the handler: hyper answers them with a
/// 4xx status and closes.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    delay: Duration,
    keep_alive: bool,
    stats: Arc<ServerStats>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let handler_stats = Arc::clone(&stats);
    let service = service_fn(move |request| {
        let stats = Arc::clone(&handler_stats);
        async move { Ok::<_, Infallible>(respond(request, peer, delay, &stats).await) }
    });

    let result = http1::Builder::new()
        .timer(TokioTimer::new())
        .keep_alive(keep_alive)
        .serve_connection(TokioIo::new(stream), service)
        .await;
    if let Err(e) = result {
        debug!(peer = %peer, error = %e, "Connection error");
    }
    debug!(
        peer = %peer,
        connections = stats.connections(),
        calls = stats.calls(),
        "Connection closed"
    );
}

async fn respond(
    request: Request<Incoming>,
    peer: SocketAddr,
    delay: Duration,
    stats: &ServerStats,
) -> Response<Full<Bytes>> {
    trace!(peer = %peer, method = %request.method(), path = request.uri().path(), "Processing request");

    let status = route(request.method(), request.uri().path());
    let body = if status == StatusCode::OK {
        listener::simulate_work(peer, delay).await;
        stats.call_served();
        Bytes::from_static(HELLO)
    } else {
        Bytes::new()
    };

    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn route(method: &Method, path: &str) -> StatusCode {
    match (method, path) {
        (&Method::GET, "/") => StatusCode::OK,
        (_, "/") => StatusCode::METHOD_NOT_ALLOWED,
        _ => StatusCode::NOT_FOUND,
    }
}
