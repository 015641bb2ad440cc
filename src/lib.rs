//! h2mux - multiplexed HTTP/2 client and server engine
//!
//! This crate provides an HTTP/2 engine that runs many concurrent
//! request/response streams over one already-established byte-stream
//! transport. Both roles are implemented: a client connection that callers
//! submit requests to from any thread, and a server connection that runs one
//! handler per inbound stream.

pub mod h2;
pub mod transport;

pub use transport::Transport;
