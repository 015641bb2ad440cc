//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 9113 Section 5.2.
//!
//! HTTP/2 uses flow control to prevent senders from overwhelming receivers
//! with data. Flow control is applied at both the connection and stream level;
//! the two windows are independent and a DATA frame needs credit in both.

use super::MAX_WINDOW_SIZE;
use std::fmt;

/// Below this many consumed bytes a receiver holds back its WINDOW_UPDATE
pub const MIN_WINDOW_REFRESH: i32 = 4 << 10;

/// Flow-control accounting failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowError {
    /// Credit would exceed 2^31-1
    Overflow,
    /// More bytes were consumed than were granted
    Exhausted,
}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowError::Overflow => f.write_str("flow-control window exceeds 2^31-1"),
            WindowError::Exhausted => f.write_str("flow-control window exhausted"),
        }
    }
}

/// Send-direction window
///
/// Tracks the credit the peer has granted us. The value may go negative
/// after the peer shrinks SETTINGS_INITIAL_WINDOW_SIZE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlWindow {
    available: i32,
}

impl FlowControlWindow {
    /// Create a new flow control window with specified initial size
    pub fn new(initial_size: u32) -> Self {
        FlowControlWindow {
            available: initial_size.min(MAX_WINDOW_SIZE as u32) as i32,
        }
    }

    /// Remaining credit (never below zero)
    pub fn available(&self) -> i32 {
        self.available.max(0)
    }

    /// Raw signed value
    pub fn raw(&self) -> i32 {
        self.available
    }

    /// Spend `n` bytes of credit
    pub fn take(&mut self, n: u32) -> Result<(), WindowError> {
        if n as i64 > self.available() as i64 {
            return Err(WindowError::Exhausted);
        }
        self.available -= n as i32;
        Ok(())
    }

    /// Apply a WINDOW_UPDATE increment or a SETTINGS delta
    ///
    /// Rejects any result above 2^31-1; the window is left unchanged.
    pub fn add(&mut self, delta: i32) -> Result<(), WindowError> {
        let sum = self.available as i64 + delta as i64;
        if sum > MAX_WINDOW_SIZE as i64 || sum < i32::MIN as i64 {
            return Err(WindowError::Overflow);
        }
        self.available = sum as i32;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new(super::DEFAULT_INITIAL_WINDOW_SIZE)
    }
}

/// How many bytes may be sent now given stream and connection credit
pub fn sendable(stream: &FlowControlWindow, conn: &FlowControlWindow) -> u32 {
    stream.available().min(conn.available()).max(0) as u32
}

/// Receive-direction window
///
/// `avail` is the credit the peer still holds; `unsent` counts bytes the
/// application consumed that we have not yet returned with WINDOW_UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflowWindow {
    avail: i32,
    unsent: i32,
}

impl InflowWindow {
    pub fn new(initial_size: u32) -> Self {
        InflowWindow {
            avail: initial_size.min(MAX_WINDOW_SIZE as u32) as i32,
            unsent: 0,
        }
    }

    /// Credit the peer may still use
    pub fn available(&self) -> i32 {
        self.avail
    }

    /// Bytes consumed but not yet credited back
    pub fn unsent(&self) -> i32 {
        self.unsent
    }

    /// Charge an inbound DATA frame against the window
    pub fn take(&mut self, n: u32) -> Result<(), WindowError> {
        if n as i64 > self.avail as i64 {
            return Err(WindowError::Exhausted);
        }
        self.avail -= n as i32;
        Ok(())
    }

    /// Return `n` consumed bytes
    ///
    /// Returns the increment to announce in a WINDOW_UPDATE, or 0 when the
    /// refund is still too small to be worth a frame.
    pub fn add(&mut self, n: u32) -> Result<u32, WindowError> {
        let unsent = self.unsent as i64 + n as i64;
        if unsent + self.avail as i64 > MAX_WINDOW_SIZE as i64 {
            return Err(WindowError::Overflow);
        }
        self.unsent = unsent as i32;
        if self.unsent < MIN_WINDOW_REFRESH && self.unsent < self.avail {
            return Ok(0);
        }
        self.avail += self.unsent;
        let increment = self.unsent as u32;
        self.unsent = 0;
        Ok(increment)
    }
}

/// Charge one DATA frame against both the connection and the stream window
///
/// Either both windows are charged or neither is.
pub fn take_inflows(
    conn: &mut InflowWindow,
    stream: &mut InflowWindow,
    n: u32,
) -> Result<(), WindowError> {
    if n as i64 > conn.avail as i64 || n as i64 > stream.avail as i64 {
        return Err(WindowError::Exhausted);
    }
    conn.avail -= n as i32;
    stream.avail -= n as i32;
    Ok(())
}

/// Delta to apply to every open stream's send window after the peer changes
/// SETTINGS_INITIAL_WINDOW_SIZE
pub fn initial_window_delta(old: u32, new: u32) -> i32 {
    (new as i64 - old as i64) as i32
}
