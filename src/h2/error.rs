//! HTTP/2 error types
//!
//! This module defines error types for HTTP/2 operations, mapping to
//! the error codes defined in RFC 9113 Section 7.
//!
//! Violations are classified where they are detected: the codec and the
//! stream state machine produce either a [`ConnectionError`] (fatal for the
//! whole connection) or a [`StreamError`] (scoped to one stream). Callers
//! never have to reinterpret a generic I/O failure.

use super::stream::StreamId;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::sync::Arc;

/// HTTP/2 error codes as defined in RFC 9113 Section 7
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Graceful shutdown
    NoError = 0x0,
    /// Protocol error detected
    ProtocolError = 0x1,
    /// Implementation fault
    InternalError = 0x2,
    /// Flow-control limits exceeded
    FlowControlError = 0x3,
    /// Settings not acknowledged
    SettingsTimeout = 0x4,
    /// Frame received for closed stream
    StreamClosed = 0x5,
    /// Frame size incorrect
    FrameSizeError = 0x6,
    /// Stream not processed
    RefusedStream = 0x7,
    /// Stream cancelled
    Cancel = 0x8,
    /// Compression state not updated
    CompressionError = 0x9,
    /// TCP connection error for CONNECT method
    ConnectError = 0xa,
    /// Processing capacity exceeded
    EnhanceYourCalm = 0xb,
    /// Negotiated TLS parameters not acceptable
    InadequateSecurity = 0xc,
    /// Use HTTP/1.1 for the request
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Convert error code to u32
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Create error code from u32
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0x0 => Some(ErrorCode::NoError),
            0x1 => Some(ErrorCode::ProtocolError),
            0x2 => Some(ErrorCode::InternalError),
            0x3 => Some(ErrorCode::FlowControlError),
            0x4 => Some(ErrorCode::SettingsTimeout),
            0x5 => Some(ErrorCode::StreamClosed),
            0x6 => Some(ErrorCode::FrameSizeError),
            0x7 => Some(ErrorCode::RefusedStream),
            0x8 => Some(ErrorCode::Cancel),
            0x9 => Some(ErrorCode::CompressionError),
            0xa => Some(ErrorCode::ConnectError),
            0xb => Some(ErrorCode::EnhanceYourCalm),
            0xc => Some(ErrorCode::InadequateSecurity),
            0xd => Some(ErrorCode::Http11Required),
            _ => None,
        }
    }

    /// Decode a code received on the wire
    ///
    /// Unknown codes carry no special meaning and are treated as
    /// `INTERNAL_ERROR` (RFC 9113 Section 7).
    pub fn from_wire(code: u32) -> Self {
        Self::from_u32(code).unwrap_or(ErrorCode::InternalError)
    }

    /// Get error name
    pub fn name(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::FlowControlError => "FLOW_CONTROL_ERROR",
            ErrorCode::SettingsTimeout => "SETTINGS_TIMEOUT",
            ErrorCode::StreamClosed => "STREAM_CLOSED",
            ErrorCode::FrameSizeError => "FRAME_SIZE_ERROR",
            ErrorCode::RefusedStream => "REFUSED_STREAM",
            ErrorCode::Cancel => "CANCEL",
            ErrorCode::CompressionError => "COMPRESSION_ERROR",
            ErrorCode::ConnectError => "CONNECT_ERROR",
            ErrorCode::EnhanceYourCalm => "ENHANCE_YOUR_CALM",
            ErrorCode::InadequateSecurity => "INADEQUATE_SECURITY",
            ErrorCode::Http11Required => "HTTP_1_1_REQUIRED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u32())
    }
}

/// Which endpoint raised a stream error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Detected locally; we sent (or will send) RST_STREAM
    Local,
    /// The peer reset the stream
    Remote,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => f.write_str("local"),
            Origin::Remote => f.write_str("remote"),
        }
    }
}

/// A fatal, connection-wide protocol violation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("connection error {code}: {reason}")]
pub struct ConnectionError {
    pub code: ErrorCode,
    pub reason: String,
}

impl ConnectionError {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        ConnectionError {
            code,
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::ProtocolError, reason)
    }
}

/// A violation scoped to a single stream
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stream {id} error {code} ({origin})")]
pub struct StreamError {
    pub id: StreamId,
    pub code: ErrorCode,
    pub origin: Origin,
}

impl StreamError {
    /// A stream error detected by this endpoint
    pub fn local(id: StreamId, code: ErrorCode) -> Self {
        StreamError {
            id,
            code,
            origin: Origin::Local,
        }
    }

    /// A stream reset received from the peer
    pub fn remote(id: StreamId, code: ErrorCode) -> Self {
        StreamError {
            id,
            code,
            origin: Origin::Remote,
        }
    }
}

/// The peer sent GOAWAY and this stream is affected by it
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("received GOAWAY (last stream {last_stream_id}, {code})")]
pub struct GoAwayError {
    /// Highest stream id the peer may have processed
    pub last_stream_id: StreamId,
    pub code: ErrorCode,
    pub debug_data: Bytes,
    /// True when the failed stream's id is above `last_stream_id`, meaning
    /// the peer guarantees it never processed it.
    pub unprocessed: bool,
}

/// HTTP/2 errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// I/O error on the transport
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    /// Fatal connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Stream-scoped error
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Peer sent GOAWAY
    #[error(transparent)]
    GoAway(#[from] GoAwayError),

    /// The connection cannot take new streams; try another one
    #[error("connection cannot accept new streams")]
    NoReusableConnection,

    /// The caller cancelled the operation
    #[error("operation cancelled")]
    Canceled,

    /// Timeout waiting for an operation
    #[error("timeout: {0}")]
    Timeout(&'static str),

    /// Connection closed
    #[error("connection closed")]
    ConnectionClosed,

    /// The request could not be encoded
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid settings value
    #[error("invalid settings value: {0}")]
    InvalidSettings(String),

    /// The peer's header list exceeded our advertised maximum
    #[error("header list too large")]
    HeaderListTooLarge,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(inner) => io::Error::new(inner.kind(), inner.to_string()),
            Error::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, err),
            Error::Canceled => io::Error::new(io::ErrorKind::Interrupted, err),
            Error::ConnectionClosed => io::Error::new(io::ErrorKind::ConnectionAborted, err),
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

impl Error {
    /// Shorthand for a connection-scoped PROTOCOL_ERROR
    pub fn protocol(reason: impl Into<String>) -> Self {
        Error::Connection(ConnectionError::protocol(reason))
    }

    /// Shorthand for a connection error with an explicit code
    pub fn connection(code: ErrorCode, reason: impl Into<String>) -> Self {
        Error::Connection(ConnectionError::new(code, reason))
    }

    /// Shorthand for a locally detected stream error
    pub fn stream(id: StreamId, code: ErrorCode) -> Self {
        Error::Stream(StreamError::local(id, code))
    }

    /// Error code when this is a connection error
    pub fn connection_code(&self) -> Option<ErrorCode> {
        match self {
            Error::Connection(e) => Some(e.code),
            _ => None,
        }
    }

    /// Error code when this is a stream error
    pub fn stream_code(&self) -> Option<ErrorCode> {
        match self {
            Error::Stream(e) => Some(e.code),
            _ => None,
        }
    }

    /// True when the request provably never reached the peer's application
    ///
    /// Only clean refusals qualify: the connection was unusable before the
    /// stream was opened, the peer refused the stream, or the peer's GOAWAY
    /// excluded it. Generic I/O failures after sending never qualify.
    pub fn is_retryable_unstarted(&self) -> bool {
        match self {
            Error::NoReusableConnection => true,
            Error::Stream(e) => e.origin == Origin::Remote && e.code == ErrorCode::RefusedStream,
            Error::GoAway(e) => e.unprocessed,
            _ => false,
        }
    }
}

/// Result type for HTTP/2 operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_conversion() {
        assert_eq!(ErrorCode::NoError.as_u32(), 0x0);
        assert_eq!(ErrorCode::ProtocolError.as_u32(), 0x1);
        assert_eq!(ErrorCode::Http11Required.as_u32(), 0xd);

        assert_eq!(ErrorCode::from_u32(0x0), Some(ErrorCode::NoError));
        assert_eq!(ErrorCode::from_u32(0x1), Some(ErrorCode::ProtocolError));
        assert_eq!(ErrorCode::from_u32(0xff), None);
        assert_eq!(ErrorCode::from_wire(0xff), ErrorCode::InternalError);
    }

    #[test]
    fn test_error_code_name() {
        assert_eq!(ErrorCode::NoError.name(), "NO_ERROR");
        assert_eq!(ErrorCode::ProtocolError.name(), "PROTOCOL_ERROR");
        assert_eq!(ErrorCode::FlowControlError.name(), "FLOW_CONTROL_ERROR");
    }

    #[test]
    fn test_error_display() {
        let err = Error::protocol("bad frame");
        assert_eq!(
            err.to_string(),
            "connection error PROTOCOL_ERROR (0x1): bad frame"
        );

        let err = Error::stream(42, ErrorCode::StreamClosed);
        assert_eq!(err.to_string(), "stream 42 error STREAM_CLOSED (0x5) (local)");
    }

    #[test]
    fn test_retry_classification() {
        assert!(Error::NoReusableConnection.is_retryable_unstarted());
        assert!(Error::Stream(StreamError::remote(3, ErrorCode::RefusedStream))
            .is_retryable_unstarted());
        assert!(!Error::Stream(StreamError::local(3, ErrorCode::RefusedStream))
            .is_retryable_unstarted());
        assert!(!Error::Stream(StreamError::remote(3, ErrorCode::Cancel)).is_retryable_unstarted());

        let goaway = GoAwayError {
            last_stream_id: 5,
            code: ErrorCode::NoError,
            debug_data: Bytes::new(),
            unprocessed: true,
        };
        assert!(Error::GoAway(goaway).is_retryable_unstarted());

        let io = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(!io.is_retryable_unstarted());
    }

    #[test]
    fn test_error_is_clone_for_fanout() {
        let err = Error::from(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        let copies: Vec<Error> = (0..3).map(|_| err.clone()).collect();
        assert!(copies.iter().all(|e| matches!(e, Error::Io(_))));
    }
}
