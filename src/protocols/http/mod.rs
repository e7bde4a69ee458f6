//! Per-request transport: plain HTTP/1.1.
//!
//! A connection carries at most one request at a time, so N concurrent
//! calls need N connections. The client keeps a pool of idle connections
//! and reuses them once their previous response has been fully read.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  GET / HTTP/1.1\r\nHost: localhost:8080\r\n\r\n
//! Response: HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nHello!
//! ```
//!
//! Other paths answer `404`, other methods on `/` answer `405`. Framing,
//! keep-alive and malformed messages are handled by hyper on both sides.

pub mod client;
pub mod server;

pub use client::HttpClient;
pub use server::HttpServer;
