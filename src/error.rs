//! Error types shared by both transports and the benchmark driver.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// The initial connection to the server could not be established.
#[derive(Error, Debug)]
#[error("failed to connect to {addr}: {source}")]
pub struct ConnectError {
    pub addr: String,
    #[source]
    pub source: io::Error,
}

/// A single request/response exchange failed.
#[derive(Error, Debug)]
pub enum CallError {
    /// The connection carrying the call went away before the response arrived.
    #[error("transport closed")]
    TransportClosed,

    /// The HTTP exchange failed below the status line: the connection
    /// broke or the response did not parse.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// The peer sent bytes that do not parse.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected this call.
    #[error("remote error: {message}")]
    Remote { message: String },

    /// The HTTP server answered with something other than 200.
    #[error("unexpected status {code}")]
    Status { code: u16 },

    /// Every stream id on this connection has been used.
    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    /// The call could not dial its own connection.
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// The server could not bind or accept.
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("cannot resolve listen address '{0}'")]
    Address(String),
}

/// A benchmark run was aborted.
#[derive(Error, Debug)]
pub enum BenchError {
    /// The first failed call; the run stops here.
    #[error("request {id} failed: {source}")]
    Call {
        id: u64,
        #[source]
        source: CallError,
    },

    /// A worker task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Every worker finished but fewer results than calls arrived.
    #[error("lost {missing} of {expected} results")]
    Lost { missing: usize, expected: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_display() {
        assert_eq!(CallError::TransportClosed.to_string(), "transport closed");
        assert_eq!(
            CallError::Status { code: 404 }.to_string(),
            "unexpected status 404"
        );
    }

    #[test]
    fn test_bench_error_keeps_source() {
        let err = BenchError::Call {
            id: 3,
            source: CallError::TransportClosed,
        };
        assert_eq!(err.to_string(), "request 3 failed: transport closed");
        assert!(std::error::Error::source(&err).is_some());
    }
}
