//! HTTP/2 protocol implementation
//!
//! This module provides a multiplexed HTTP/2 client and server over any
//! [`Transport`](crate::Transport).
//!
//! # Architecture
//!
//! - **Frame handling**: all HTTP/2 frame types (DATA, HEADERS, PRIORITY,
//!   RST_STREAM, SETTINGS, PUSH_PROMISE, PING, GOAWAY, WINDOW_UPDATE,
//!   CONTINUATION) are parsed and validated by [`codec`]
//! - **HPACK compression**: header blocks go through the `hpack` crate as a
//!   black box, one encoder and one decoder per connection
//! - **Flow control**: connection and stream windows in [`flow_control`]
//! - **Stream lifecycle**: the RFC 9113 state machine in [`stream`]
//! - **Priority handling**: write ordering by [`scheduler`]
//! - **Client**: [`ClientConn`] shares one connection between any number of
//!   threads, guarded by a state lock and a separate writer lock
//! - **Server**: [`ServerConn`] runs a single control loop that owns all
//!   connection state; handlers talk to it through channels
//!
//! # Examples
//!
//! ## HTTP/2 Client
//!
//! ```no_run
//! use h2mux::h2::{ClientBuilder, Request};
//! use std::net::TcpStream;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("127.0.0.1:8080")?;
//! let conn = ClientBuilder::new().handshake(stream)?;
//!
//! let response = conn.round_trip(Request::get("http://127.0.0.1:8080/"))?;
//! println!("Status: {}", response.status());
//! let body = response.into_body().read_to_bytes()?;
//! println!("Body: {} bytes", body.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## HTTP/2 Server
//!
//! ```no_run
//! use h2mux::h2::{ResponseWriter, ServerBuilder, ServerRequest};
//! use std::io::Write;
//! use std::net::TcpListener;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("127.0.0.1:8080")?;
//! let (stream, _) = listener.accept()?;
//!
//! let handler = |_req: ServerRequest, mut resp: ResponseWriter| {
//!     resp.set_header("content-type", "text/plain");
//!     let _ = resp.write_all(b"OK");
//! };
//! let (conn, _handle) = ServerBuilder::new().build(stream, handler)?;
//! conn.serve()?;
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod flow_control;
pub mod frames;
pub mod headers;
pub mod hpack;
pub mod pipe;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod stream;
pub mod supervisor;

pub use cancel::CancelToken;
pub use client::{ClientConn, ClientState, Request, Response, ResponseBody};
pub use config::{ClientBuilder, ClientConfig, RetryPolicy, SchedulerKind, ServerBuilder, ServerConfig};
pub use error::{ConnectionError, Error, ErrorCode, GoAwayError, Origin, Result, StreamError};
pub use frames::{Frame, FrameFlags, FrameType};
pub use headers::HeaderField;
pub use retry::{Body, ConnectionSource, RetryingClient};
pub use server::{Handler, RequestBody, ResponseWriter, ServerConn, ServerHandle, ServerRequest};
pub use settings::{Settings, SettingsBuilder};
pub use stream::{StreamId, StreamState};

/// HTTP/2 connection preface that must be sent by clients
///
/// From RFC 9113 Section 3.4:
/// "PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Default initial window size (65535 bytes)
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65535;

/// Default maximum frame size (16384 bytes)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;

/// Default header table size (4096 bytes)
pub const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;

/// Maximum stream ID value (2^31 - 1)
pub const MAX_STREAM_ID: u32 = 0x7FFFFFFF;

/// Stream ID 0 (connection-level)
pub const CONNECTION_STREAM_ID: u32 = 0;

/// Largest flow-control window (2^31 - 1)
pub const MAX_WINDOW_SIZE: i32 = i32::MAX;
