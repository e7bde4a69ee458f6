//! Logical calls: the request/response pair both transports carry.
//!
//! A call is `Pending` from dispatch until exactly one terminal outcome
//! arrives: a `Response` or a `CallError`. Nothing is retried.

use crate::error::CallError;
use chrono::{DateTime, Utc};
use std::future::Future;

/// One outbound call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Sequence number assigned by the dispatcher.
    pub id: u64,
    /// Payload; the multiplexed server greets it by name.
    pub name: String,
    pub issued_at: DateTime<Utc>,
}

impl Request {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            issued_at: Utc::now(),
        }
    }

    /// `Request-<id>`, the name every benchmark call carries.
    pub fn numbered(id: u64) -> Self {
        Self::new(id, format!("Request-{id}"))
    }
}

/// The successful outcome of a call, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub id: u64,
    pub message: String,
    pub completed_at: DateTime<Utc>,
}

impl Response {
    pub fn new(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
            completed_at: Utc::now(),
        }
    }
}

/// A client that can carry calls to a server.
///
/// Implementations must be usable from many tasks at once through `&self`.
pub trait Transport: Send + Sync + 'static {
    /// Human-readable transport name for reports.
    fn name(&self) -> &'static str;

    /// Perform one call and wait for its terminal outcome.
    fn call(&self, request: Request)
        -> impl Future<Output = Result<Response, CallError>> + Send;
}
