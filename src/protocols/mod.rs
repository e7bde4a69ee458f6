//! Transport implementations.
//!
//! - `mux`: many concurrent calls over one TCP connection
//! - `http`: HTTP/1.1, one in-flight request per TCP connection

pub mod http;
pub mod mux;
