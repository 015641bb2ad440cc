//! HTTP/2 stream lifecycle
//!
//! This module implements the stream state machine of RFC 9113 Section 5.1.
//! Push reservations are never used, so the reserved states are folded away.

use super::error::ErrorCode;
use super::frames::FrameType;
use super::MAX_STREAM_ID;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 9113 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Idle: No frames have been sent/received
    Idle,
    /// Open: Both sides can send frames
    Open,
    /// Half-closed (local): We can't send, they can
    HalfClosedLocal,
    /// Half-closed (remote): They can't send, we can
    HalfClosedRemote,
    /// Closed: Stream is closed
    Closed,
}

impl StreamState {
    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    /// Check if stream is closed
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }

    /// We sent HEADERS
    pub fn send_headers(&mut self, end_stream: bool) {
        if *self == StreamState::Idle {
            *self = StreamState::Open;
        }
        if end_stream {
            self.send_end();
        }
    }

    /// The peer sent HEADERS (initial or trailers)
    pub fn recv_headers(&mut self, end_stream: bool) {
        if *self == StreamState::Idle {
            *self = StreamState::Open;
        }
        if end_stream {
            self.recv_end();
        }
    }

    /// We sent END_STREAM
    pub fn send_end(&mut self) {
        *self = match *self {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    /// The peer sent END_STREAM
    pub fn recv_end(&mut self) {
        *self = match *self {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// Move to closed (RST_STREAM either way, or a fatal stream error)
    ///
    /// Returns true only for the call that actually closed the stream.
    pub fn close(&mut self) -> bool {
        let was_open = *self != StreamState::Closed;
        *self = StreamState::Closed;
        was_open
    }
}

/// What to do with an inbound frame given the target stream's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Process the frame
    Accept,
    /// Drop it silently
    Ignore,
    /// Reset the stream with this code
    StreamError(ErrorCode),
    /// Tear down the connection
    ConnectionError(&'static str),
}

/// Legality of an inbound frame on a stream
///
/// `state` must already account for the implicit-close rule (see
/// [`StreamIdTracker::state_of`]); `implicitly_closed` tells whether the
/// stream is unknown and only considered closed because a higher id was
/// seen.
pub fn classify_inbound(state: StreamState, frame: FrameType, implicitly_closed: bool) -> Inbound {
    if frame == FrameType::Priority {
        return Inbound::Accept;
    }
    match state {
        StreamState::Idle => match frame {
            FrameType::Headers => Inbound::Accept,
            _ => Inbound::ConnectionError("frame on idle stream"),
        },
        StreamState::Open | StreamState::HalfClosedLocal => Inbound::Accept,
        StreamState::HalfClosedRemote => match frame {
            FrameType::WindowUpdate | FrameType::RstStream => Inbound::Accept,
            _ => Inbound::StreamError(ErrorCode::StreamClosed),
        },
        StreamState::Closed => match frame {
            FrameType::WindowUpdate | FrameType::RstStream => Inbound::Ignore,
            FrameType::Headers if implicitly_closed => {
                Inbound::ConnectionError("HEADERS on a closed stream")
            }
            _ => Inbound::StreamError(ErrorCode::StreamClosed),
        },
    }
}

/// Highest stream ids seen for each initiator
///
/// A stream id at or below the highest seen for its initiator that is not
/// in the live stream table is closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamIdTracker {
    max_client: StreamId,
    max_server: StreamId,
}

impl StreamIdTracker {
    pub fn new() -> Self {
        StreamIdTracker::default()
    }

    /// Odd ids are opened by clients
    pub fn is_client_initiated(id: StreamId) -> bool {
        id % 2 == 1
    }

    /// Record that `id` was opened
    pub fn observe(&mut self, id: StreamId) {
        let max = if Self::is_client_initiated(id) {
            &mut self.max_client
        } else {
            &mut self.max_server
        };
        if id > *max {
            *max = id;
        }
    }

    pub fn max_client(&self) -> StreamId {
        self.max_client
    }

    /// State of a stream that is not in the live table
    pub fn state_of(&self, id: StreamId) -> StreamState {
        let max = if Self::is_client_initiated(id) {
            self.max_client
        } else {
            self.max_server
        };
        if id != 0 && id <= max {
            StreamState::Closed
        } else {
            StreamState::Idle
        }
    }
}

/// Allocates client stream ids: 1, 3, 5, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamIdAllocator {
    next: StreamId,
}

impl StreamIdAllocator {
    pub fn client() -> Self {
        StreamIdAllocator { next: 1 }
    }

    /// Id the next call to `allocate` will return
    pub fn peek(&self) -> StreamId {
        self.next
    }

    /// Take the next id, or `None` once the id space is exhausted
    pub fn allocate(&mut self) -> Option<StreamId> {
        if self.next > MAX_STREAM_ID {
            return None;
        }
        let id = self.next;
        self.next += 2;
        Some(id)
    }

    pub fn exhausted(&self) -> bool {
        self.next > MAX_STREAM_ID
    }
}
