//! HTTP/2 settings management
//!
//! This module implements HTTP/2 SETTINGS frames and parameters
//! as defined in RFC 9113 Section 6.5.

use super::error::{ConnectionError, Error, ErrorCode, Result};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;
use std::fmt;

/// Largest legal SETTINGS_MAX_FRAME_SIZE value (2^24 - 1)
pub const MAX_MAX_FRAME_SIZE: u32 = 0x00FF_FFFF;

/// Largest legal SETTINGS_INITIAL_WINDOW_SIZE value (2^31 - 1)
pub const MAX_INITIAL_WINDOW_SIZE: u32 = 0x7FFF_FFFF;

/// Upper bound on parameters in one SETTINGS frame before we call it abuse
const MAX_SETTINGS_PER_FRAME: usize = 100;

/// HTTP/2 settings parameters (RFC 9113 Section 6.5.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SettingsParameter {
    /// SETTINGS_HEADER_TABLE_SIZE (0x1)
    /// Allows the sender to inform the remote endpoint of the maximum size
    /// of the header compression table
    HeaderTableSize = 0x1,

    /// SETTINGS_ENABLE_PUSH (0x2)
    /// Used to disable server push
    EnablePush = 0x2,

    /// SETTINGS_MAX_CONCURRENT_STREAMS (0x3)
    /// Indicates the maximum number of concurrent streams
    MaxConcurrentStreams = 0x3,

    /// SETTINGS_INITIAL_WINDOW_SIZE (0x4)
    /// Indicates the sender's initial window size for stream-level flow control
    InitialWindowSize = 0x4,

    /// SETTINGS_MAX_FRAME_SIZE (0x5)
    /// Indicates the size of the largest frame payload
    MaxFrameSize = 0x5,

    /// SETTINGS_MAX_HEADER_LIST_SIZE (0x6)
    /// Advises peer of the maximum size of header list
    MaxHeaderListSize = 0x6,

    /// SETTINGS_ENABLE_CONNECT_PROTOCOL (0x8) - RFC 8441
    EnableConnectProtocol = 0x8,

    /// SETTINGS_NO_RFC7540_PRIORITIES (0x9) - RFC 9218
    NoRfc7540Priorities = 0x9,
}

impl SettingsParameter {
    /// Convert to u16
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Create from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x1 => Some(SettingsParameter::HeaderTableSize),
            0x2 => Some(SettingsParameter::EnablePush),
            0x3 => Some(SettingsParameter::MaxConcurrentStreams),
            0x4 => Some(SettingsParameter::InitialWindowSize),
            0x5 => Some(SettingsParameter::MaxFrameSize),
            0x6 => Some(SettingsParameter::MaxHeaderListSize),
            0x8 => Some(SettingsParameter::EnableConnectProtocol),
            0x9 => Some(SettingsParameter::NoRfc7540Priorities),
            _ => None,
        }
    }

    /// Get parameter name
    pub fn name(&self) -> &'static str {
        match self {
            SettingsParameter::HeaderTableSize => "HEADER_TABLE_SIZE",
            SettingsParameter::EnablePush => "ENABLE_PUSH",
            SettingsParameter::MaxConcurrentStreams => "MAX_CONCURRENT_STREAMS",
            SettingsParameter::InitialWindowSize => "INITIAL_WINDOW_SIZE",
            SettingsParameter::MaxFrameSize => "MAX_FRAME_SIZE",
            SettingsParameter::MaxHeaderListSize => "MAX_HEADER_LIST_SIZE",
            SettingsParameter::EnableConnectProtocol => "ENABLE_CONNECT_PROTOCOL",
            SettingsParameter::NoRfc7540Priorities => "NO_RFC7540_PRIORITIES",
        }
    }
}

impl fmt::Display for SettingsParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:x})", self.name(), self.as_u16())
    }
}

/// HTTP/2 settings
///
/// Every field is optional: `None` means "not carried in this frame" (or,
/// for an effective settings set, "protocol default").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Header table size (default: 4096)
    pub header_table_size: Option<u32>,

    /// Enable server push (default: true)
    pub enable_push: Option<bool>,

    /// Maximum concurrent streams (default: unlimited)
    pub max_concurrent_streams: Option<u32>,

    /// Initial window size (default: 65535)
    pub initial_window_size: Option<u32>,

    /// Maximum frame size (default: 16384, range: 16384-16777215)
    pub max_frame_size: Option<u32>,

    /// Maximum header list size (default: unlimited)
    pub max_header_list_size: Option<u32>,

    /// Enable CONNECT protocol (default: false)
    pub enable_connect_protocol: Option<bool>,

    /// Disable RFC 7540 priorities (default: false)
    pub no_rfc7540_priorities: Option<bool>,
}

impl Settings {
    /// Create empty settings
    pub fn new() -> Self {
        Settings::default()
    }

    /// Get header table size (with default)
    pub fn get_header_table_size(&self) -> u32 {
        self.header_table_size.unwrap_or(DEFAULT_HEADER_TABLE_SIZE)
    }

    /// Get enable push (with default)
    pub fn get_enable_push(&self) -> bool {
        self.enable_push.unwrap_or(true)
    }

    /// Get max concurrent streams (None = unlimited)
    pub fn get_max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    /// Get initial window size (with default)
    pub fn get_initial_window_size(&self) -> u32 {
        self.initial_window_size.unwrap_or(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Get max frame size (with default)
    pub fn get_max_frame_size(&self) -> u32 {
        self.max_frame_size.unwrap_or(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Get max header list size (None = unlimited)
    pub fn get_max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    /// Number of parameters carried
    pub fn len(&self) -> usize {
        [
            self.header_table_size.is_some(),
            self.enable_push.is_some(),
            self.max_concurrent_streams.is_some(),
            self.initial_window_size.is_some(),
            self.max_frame_size.is_some(),
            self.max_header_list_size.is_some(),
            self.enable_connect_protocol.is_some(),
            self.no_rfc7540_priorities.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate settings values
    ///
    /// The error code matches what RFC 9113 Section 6.5.2 mandates when the
    /// same value arrives from a peer.
    pub fn validate(&self) -> std::result::Result<(), ConnectionError> {
        if let Some(initial_window_size) = self.initial_window_size {
            if initial_window_size > MAX_INITIAL_WINDOW_SIZE {
                return Err(ConnectionError::new(
                    ErrorCode::FlowControlError,
                    format!(
                        "initial window size {} exceeds maximum (2^31-1)",
                        initial_window_size
                    ),
                ));
            }
        }

        if let Some(max_frame_size) = self.max_frame_size {
            if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&max_frame_size) {
                return Err(ConnectionError::protocol(format!(
                    "max frame size {} outside valid range (16384-16777215)",
                    max_frame_size
                )));
            }
        }

        Ok(())
    }

    /// Merge settings from another Settings object
    /// (values in `other` override values in `self`)
    pub fn merge(&mut self, other: &Settings) {
        if other.header_table_size.is_some() {
            self.header_table_size = other.header_table_size;
        }
        if other.enable_push.is_some() {
            self.enable_push = other.enable_push;
        }
        if other.max_concurrent_streams.is_some() {
            self.max_concurrent_streams = other.max_concurrent_streams;
        }
        if other.initial_window_size.is_some() {
            self.initial_window_size = other.initial_window_size;
        }
        if other.max_frame_size.is_some() {
            self.max_frame_size = other.max_frame_size;
        }
        if other.max_header_list_size.is_some() {
            self.max_header_list_size = other.max_header_list_size;
        }
        if other.enable_connect_protocol.is_some() {
            self.enable_connect_protocol = other.enable_connect_protocol;
        }
        if other.no_rfc7540_priorities.is_some() {
            self.no_rfc7540_priorities = other.no_rfc7540_priorities;
        }
    }

    /// Serialize the parameters into a SETTINGS payload
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut put = |param: SettingsParameter, value: u32| {
            buf.put_u16(param.as_u16());
            buf.put_u32(value);
        };

        if let Some(val) = self.header_table_size {
            put(SettingsParameter::HeaderTableSize, val);
        }
        if let Some(val) = self.enable_push {
            put(SettingsParameter::EnablePush, val as u32);
        }
        if let Some(val) = self.max_concurrent_streams {
            put(SettingsParameter::MaxConcurrentStreams, val);
        }
        if let Some(val) = self.initial_window_size {
            put(SettingsParameter::InitialWindowSize, val);
        }
        if let Some(val) = self.max_frame_size {
            put(SettingsParameter::MaxFrameSize, val);
        }
        if let Some(val) = self.max_header_list_size {
            put(SettingsParameter::MaxHeaderListSize, val);
        }
        if let Some(val) = self.enable_connect_protocol {
            put(SettingsParameter::EnableConnectProtocol, val as u32);
        }
        if let Some(val) = self.no_rfc7540_priorities {
            put(SettingsParameter::NoRfc7540Priorities, val as u32);
        }
    }

    /// Parse a (non-ACK) SETTINGS payload
    ///
    /// Unknown parameters are ignored. A repeated known parameter or an
    /// excessive parameter count is treated as a protocol violation.
    pub fn decode(payload: &[u8]) -> std::result::Result<Settings, ConnectionError> {
        if payload.len() % 6 != 0 {
            return Err(ConnectionError::new(
                ErrorCode::FrameSizeError,
                "SETTINGS payload is not a multiple of 6 bytes",
            ));
        }
        if payload.len() / 6 > MAX_SETTINGS_PER_FRAME {
            return Err(ConnectionError::protocol("too many SETTINGS parameters"));
        }

        let mut settings = Settings::new();
        let mut seen = Vec::with_capacity(payload.len() / 6);

        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);

            let Some(param) = SettingsParameter::from_u16(id) else {
                continue;
            };
            if seen.contains(&param) {
                return Err(ConnectionError::protocol(format!(
                    "duplicate SETTINGS parameter {}",
                    param
                )));
            }
            seen.push(param);

            let as_flag = |value: u32| -> std::result::Result<bool, ConnectionError> {
                match value {
                    0 => Ok(false),
                    1 => Ok(true),
                    _ => Err(ConnectionError::protocol(format!(
                        "{} must be 0 or 1, got {}",
                        param, value
                    ))),
                }
            };

            match param {
                SettingsParameter::HeaderTableSize => settings.header_table_size = Some(value),
                SettingsParameter::EnablePush => settings.enable_push = Some(as_flag(value)?),
                SettingsParameter::MaxConcurrentStreams => {
                    settings.max_concurrent_streams = Some(value)
                }
                SettingsParameter::InitialWindowSize => settings.initial_window_size = Some(value),
                SettingsParameter::MaxFrameSize => settings.max_frame_size = Some(value),
                SettingsParameter::MaxHeaderListSize => {
                    settings.max_header_list_size = Some(value)
                }
                SettingsParameter::EnableConnectProtocol => {
                    settings.enable_connect_protocol = Some(as_flag(value)?)
                }
                SettingsParameter::NoRfc7540Priorities => {
                    settings.no_rfc7540_priorities = Some(as_flag(value)?)
                }
            }
        }

        settings.validate()?;
        Ok(settings)
    }
}

/// Builder for HTTP/2 settings
#[derive(Debug, Clone, Default)]
pub struct SettingsBuilder {
    settings: Settings,
}

impl SettingsBuilder {
    /// Create a new settings builder
    pub fn new() -> Self {
        SettingsBuilder::default()
    }

    /// Set header table size
    pub fn header_table_size(mut self, size: u32) -> Self {
        self.settings.header_table_size = Some(size);
        self
    }

    /// Set enable push
    pub fn enable_push(mut self, enable: bool) -> Self {
        self.settings.enable_push = Some(enable);
        self
    }

    /// Set max concurrent streams
    pub fn max_concurrent_streams(mut self, max: u32) -> Self {
        self.settings.max_concurrent_streams = Some(max);
        self
    }

    /// Set initial window size
    pub fn initial_window_size(mut self, size: u32) -> Self {
        self.settings.initial_window_size = Some(size);
        self
    }

    /// Set max frame size
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.settings.max_frame_size = Some(size);
        self
    }

    /// Set max header list size
    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.settings.max_header_list_size = Some(size);
        self
    }

    /// Set enable CONNECT protocol
    pub fn enable_connect_protocol(mut self, enable: bool) -> Self {
        self.settings.enable_connect_protocol = Some(enable);
        self
    }

    /// Set no RFC 7540 priorities
    pub fn no_rfc7540_priorities(mut self, disable: bool) -> Self {
        self.settings.no_rfc7540_priorities = Some(disable);
        self
    }

    /// Build the settings
    pub fn build(self) -> Result<Settings> {
        self.settings
            .validate()
            .map_err(|e| Error::InvalidSettings(e.reason))?;
        Ok(self.settings)
    }
}

/// Tracks local SETTINGS that were sent but not yet acknowledged
///
/// A parameter only takes effect for the peer once it has acknowledged the
/// frame carrying it; until then the previous value is still in force.
#[derive(Debug, Default)]
pub struct LocalSettings {
    acked: Settings,
    pending: VecDeque<Settings>,
}

impl LocalSettings {
    pub fn new() -> Self {
        LocalSettings::default()
    }

    /// Record a SETTINGS frame we are about to send
    pub fn sent(&mut self, settings: Settings) {
        self.pending.push_back(settings);
    }

    /// Number of SETTINGS frames awaiting acknowledgment
    pub fn unacked(&self) -> usize {
        self.pending.len()
    }

    /// Apply the oldest pending frame after the peer's ACK
    ///
    /// An ACK with nothing outstanding is a protocol violation.
    pub fn acknowledged(&mut self) -> std::result::Result<&Settings, ConnectionError> {
        let settings = self
            .pending
            .pop_front()
            .ok_or_else(|| ConnectionError::protocol("SETTINGS ACK without pending SETTINGS"))?;
        self.acked.merge(&settings);
        Ok(&self.acked)
    }

    /// Settings the peer has acknowledged
    pub fn effective(&self) -> &Settings {
        &self.acked
    }
}
