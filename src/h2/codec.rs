//! HTTP/2 frame encoding and decoding
//!
//! [`FrameCodec`] holds the stateless serializers and the per-type payload
//! parser. [`FrameReader`] and [`FrameWriter`] wrap one direction of a
//! transport each and own that direction's HPACK context.
//!
//! A header block split across HEADERS and CONTINUATION frames is read and
//! written as a single unit: the reader refuses any interleaved frame, and
//! the writer emits the whole sequence from one buffer.

use super::error::{ConnectionError, Error, ErrorCode, Result, StreamError};
use super::frames::*;
use super::headers::{self, HeaderField};
use super::hpack::{HeaderDecoder, HeaderEncoder};
use super::settings::Settings;
use super::stream::StreamId;
use super::{CONNECTION_PREFACE, DEFAULT_MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{BufReader, BufWriter, Read, Write};

/// HTTP/2 frame header size (9 bytes)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Cap on the compressed size of one header block, relative to the
/// advertised header list limit
const HEADER_BLOCK_FACTOR: usize = 4;

/// Lower bound for the compressed header block cap
const MIN_HEADER_BLOCK_LIMIT: usize = 64 << 10;

/// Stateless frame serialization and payload parsing
pub struct FrameCodec;

/// One wire frame after payload parsing but before header reassembly
#[derive(Debug)]
pub enum RawFrame {
    Frame(Frame),
    Headers(HeadersFrame),
    Continuation(ContinuationFrame),
    /// Unknown or extension frame type; skipped by readers
    Unknown(FrameHeader),
}

fn conn_err(code: ErrorCode, reason: &str) -> Error {
    Error::Connection(ConnectionError::new(code, reason))
}

fn frame_size_err(kind: FrameType) -> Error {
    conn_err(
        ErrorCode::FrameSizeError,
        &format!("{} frame with invalid length", kind.name()),
    )
}

impl FrameCodec {
    /// Append a frame header
    pub fn encode_header(
        buf: &mut BytesMut,
        frame_type: FrameType,
        flags: FrameFlags,
        stream_id: StreamId,
        length: usize,
    ) {
        buf.reserve(FRAME_HEADER_SIZE + length);
        buf.put_uint(length as u64, 3);
        buf.put_u8(frame_type.as_u8());
        buf.put_u8(flags.as_u8());
        // Reserved bit is always sent as 0
        buf.put_u32(stream_id & 0x7FFF_FFFF);
    }

    /// Decode a frame header
    pub fn decode_header(bytes: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        let length = ((bytes[0] as u32) << 16) | ((bytes[1] as u32) << 8) | (bytes[2] as u32);
        let stream_id = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) & 0x7FFF_FFFF;
        FrameHeader {
            length,
            kind: bytes[3],
            flags: FrameFlags::from_u8(bytes[4]),
            stream_id,
        }
    }

    /// Encode a DATA frame
    pub fn encode_data_frame(buf: &mut BytesMut, frame: &DataFrame) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, frame.end_stream);
        if frame.padding.is_some() {
            flags.set(FrameFlags::PADDED);
        }

        Self::encode_header(buf, FrameType::Data, flags, frame.stream_id, frame.frame_size());
        if let Some(pad_len) = frame.padding {
            buf.put_u8(pad_len);
            buf.put_slice(&frame.data);
            buf.put_bytes(0, pad_len as usize);
        } else {
            buf.put_slice(&frame.data);
        }
    }

    /// Encode a HEADERS frame carrying one fragment
    pub fn encode_headers_frame(buf: &mut BytesMut, frame: &HeadersFrame) {
        let mut payload_len = frame.header_block.len();
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_STREAM, frame.end_stream);
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);

        if frame.priority.is_some() {
            flags.set(FrameFlags::PRIORITY);
            payload_len += 5;
        }
        if let Some(pad_len) = frame.padding {
            flags.set(FrameFlags::PADDED);
            payload_len += 1 + pad_len as usize;
        }

        Self::encode_header(buf, FrameType::Headers, flags, frame.stream_id, payload_len);
        if let Some(pad_len) = frame.padding {
            buf.put_u8(pad_len);
        }
        if let Some(priority) = &frame.priority {
            Self::put_priority(buf, priority);
        }
        buf.put_slice(&frame.header_block);
        if let Some(pad_len) = frame.padding {
            buf.put_bytes(0, pad_len as usize);
        }
    }

    /// Encode a CONTINUATION frame
    pub fn encode_continuation_frame(buf: &mut BytesMut, frame: &ContinuationFrame) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::END_HEADERS, frame.end_headers);
        Self::encode_header(
            buf,
            FrameType::Continuation,
            flags,
            frame.stream_id,
            frame.header_block.len(),
        );
        buf.put_slice(&frame.header_block);
    }

    /// Encode a SETTINGS frame
    pub fn encode_settings_frame(buf: &mut BytesMut, frame: &SettingsFrame) {
        let mut payload = BytesMut::new();
        let mut flags = FrameFlags::empty();
        if frame.ack {
            flags.set(FrameFlags::ACK);
        } else {
            frame.settings.encode(&mut payload);
        }

        // Stream ID must be 0 for SETTINGS
        Self::encode_header(buf, FrameType::Settings, flags, 0, payload.len());
        buf.put_slice(&payload);
    }

    /// Encode a PING frame
    pub fn encode_ping_frame(buf: &mut BytesMut, frame: &PingFrame) {
        let mut flags = FrameFlags::empty();
        flags.set_if(FrameFlags::ACK, frame.ack);
        Self::encode_header(buf, FrameType::Ping, flags, 0, 8);
        buf.put_slice(&frame.data);
    }

    /// Encode a GOAWAY frame
    pub fn encode_goaway_frame(buf: &mut BytesMut, frame: &GoawayFrame) {
        let payload_len = 8 + frame.debug_data.len();
        Self::encode_header(buf, FrameType::Goaway, FrameFlags::empty(), 0, payload_len);
        buf.put_u32(frame.last_stream_id & 0x7FFF_FFFF);
        buf.put_u32(frame.error_code.as_u32());
        buf.put_slice(&frame.debug_data);
    }

    /// Encode a WINDOW_UPDATE frame
    pub fn encode_window_update_frame(buf: &mut BytesMut, frame: &WindowUpdateFrame) {
        Self::encode_header(buf, FrameType::WindowUpdate, FrameFlags::empty(), frame.stream_id, 4);
        buf.put_u32(frame.size_increment & 0x7FFF_FFFF);
    }

    /// Encode a RST_STREAM frame
    pub fn encode_rst_stream_frame(buf: &mut BytesMut, frame: &RstStreamFrame) {
        Self::encode_header(buf, FrameType::RstStream, FrameFlags::empty(), frame.stream_id, 4);
        buf.put_u32(frame.error_code.as_u32());
    }

    /// Encode a PRIORITY frame
    pub fn encode_priority_frame(buf: &mut BytesMut, frame: &PriorityFrame) {
        Self::encode_header(buf, FrameType::Priority, FrameFlags::empty(), frame.stream_id, 5);
        Self::put_priority(buf, &frame.priority);
    }

    fn put_priority(buf: &mut BytesMut, priority: &PrioritySpec) {
        let mut dep = priority.stream_dependency & 0x7FFF_FFFF;
        if priority.exclusive {
            dep |= 0x8000_0000;
        }
        buf.put_u32(dep);
        buf.put_u8(priority.weight);
    }

    fn get_priority(payload: &mut Bytes) -> PrioritySpec {
        let dep = payload.get_u32();
        let weight = payload.get_u8();
        PrioritySpec {
            stream_dependency: dep & 0x7FFF_FFFF,
            exclusive: dep & 0x8000_0000 != 0,
            weight,
        }
    }

    /// Strip padding from a PADDED payload
    fn strip_padding(kind: FrameType, payload: &mut Bytes) -> Result<Option<u8>> {
        if payload.is_empty() {
            return Err(frame_size_err(kind));
        }
        let pad_len = payload.get_u8();
        if pad_len as usize > payload.len() {
            return Err(conn_err(
                ErrorCode::ProtocolError,
                &format!("{} padding exceeds payload", kind.name()),
            ));
        }
        payload.truncate(payload.len() - pad_len as usize);
        Ok(Some(pad_len))
    }

    /// Parse and validate one frame payload
    ///
    /// Structural violations are returned as connection errors; per-stream
    /// malformations (for example a PRIORITY frame of the wrong size) as
    /// stream errors.
    pub fn parse_frame(header: FrameHeader, mut payload: Bytes) -> Result<RawFrame> {
        let Some(kind) = header.frame_type() else {
            return Ok(RawFrame::Unknown(header));
        };
        let flags = header.flags;
        let id = header.stream_id;

        let needs_stream = matches!(
            kind,
            FrameType::Data
                | FrameType::Headers
                | FrameType::Priority
                | FrameType::RstStream
                | FrameType::PushPromise
                | FrameType::Continuation
        );
        if needs_stream && id == 0 {
            return Err(conn_err(
                ErrorCode::ProtocolError,
                &format!("{} frame on stream 0", kind.name()),
            ));
        }
        if matches!(kind, FrameType::Settings | FrameType::Ping | FrameType::Goaway) && id != 0 {
            return Err(conn_err(
                ErrorCode::ProtocolError,
                &format!("{} frame on stream {}", kind.name(), id),
            ));
        }

        let frame = match kind {
            FrameType::Data => {
                let padding = if flags.is_padded() {
                    Self::strip_padding(kind, &mut payload)?
                } else {
                    None
                };
                Frame::Data(DataFrame {
                    stream_id: id,
                    data: payload,
                    end_stream: flags.is_end_stream(),
                    padding,
                })
            }
            FrameType::Headers => {
                let padding = if flags.is_padded() {
                    Self::strip_padding(kind, &mut payload)?
                } else {
                    None
                };
                let priority = if flags.is_priority() {
                    if payload.len() < 5 {
                        return Err(frame_size_err(kind));
                    }
                    Some(Self::get_priority(&mut payload))
                } else {
                    None
                };
                return Ok(RawFrame::Headers(HeadersFrame {
                    stream_id: id,
                    header_block: payload,
                    end_stream: flags.is_end_stream(),
                    end_headers: flags.is_end_headers(),
                    priority,
                    padding,
                }));
            }
            FrameType::Priority => {
                if payload.len() != 5 {
                    return Err(Error::Stream(StreamError::local(id, ErrorCode::FrameSizeError)));
                }
                let priority = Self::get_priority(&mut payload);
                if priority.stream_dependency == id {
                    return Err(Error::Stream(StreamError::local(id, ErrorCode::ProtocolError)));
                }
                Frame::Priority(PriorityFrame {
                    stream_id: id,
                    priority,
                })
            }
            FrameType::RstStream => {
                if payload.len() != 4 {
                    return Err(frame_size_err(kind));
                }
                Frame::RstStream(RstStreamFrame {
                    stream_id: id,
                    error_code: ErrorCode::from_wire(payload.get_u32()),
                })
            }
            FrameType::Settings => {
                if flags.is_ack() {
                    if !payload.is_empty() {
                        return Err(frame_size_err(kind));
                    }
                    Frame::Settings(SettingsFrame::ack())
                } else {
                    Frame::Settings(SettingsFrame::new(Settings::decode(&payload)?))
                }
            }
            FrameType::PushPromise => {
                let padding = if flags.is_padded() {
                    Self::strip_padding(kind, &mut payload)?
                } else {
                    None
                };
                if payload.len() < 4 {
                    return Err(frame_size_err(kind));
                }
                let promised_stream_id = payload.get_u32() & 0x7FFF_FFFF;
                Frame::PushPromise(PushPromiseFrame {
                    stream_id: id,
                    promised_stream_id,
                    header_block: payload,
                    end_headers: flags.is_end_headers(),
                    padding,
                })
            }
            FrameType::Ping => {
                if payload.len() != 8 {
                    return Err(frame_size_err(kind));
                }
                let mut data = [0u8; 8];
                payload.copy_to_slice(&mut data);
                Frame::Ping(PingFrame {
                    ack: flags.is_ack(),
                    data,
                })
            }
            FrameType::Goaway => {
                if payload.len() < 8 {
                    return Err(frame_size_err(kind));
                }
                let last_stream_id = payload.get_u32() & 0x7FFF_FFFF;
                let error_code = ErrorCode::from_wire(payload.get_u32());
                Frame::Goaway(GoawayFrame {
                    last_stream_id,
                    error_code,
                    debug_data: payload,
                })
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(frame_size_err(kind));
                }
                let size_increment = payload.get_u32() & 0x7FFF_FFFF;
                if size_increment == 0 {
                    return Err(if id == 0 {
                        conn_err(ErrorCode::ProtocolError, "WINDOW_UPDATE with zero increment")
                    } else {
                        Error::Stream(StreamError::local(id, ErrorCode::ProtocolError))
                    });
                }
                Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id: id,
                    size_increment,
                })
            }
            FrameType::Continuation => {
                return Ok(RawFrame::Continuation(ContinuationFrame {
                    stream_id: id,
                    header_block: payload,
                    end_headers: flags.is_end_headers(),
                }));
            }
        };
        Ok(RawFrame::Frame(frame))
    }
}

/// Reads typed frames from one transport direction
///
/// Exactly one thread reads from a connection; the reader owns the
/// connection's HPACK decoder.
pub struct FrameReader<R: Read> {
    reader: BufReader<R>,
    max_frame_size: u32,
    decoder: HeaderDecoder,
}

impl<R: Read> FrameReader<R> {
    /// Create a reader enforcing our advertised limits
    pub fn new(reader: R, max_header_list_size: u32) -> Self {
        FrameReader {
            reader: BufReader::new(reader),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            decoder: HeaderDecoder::new(max_header_list_size as usize),
        }
    }

    /// Largest payload accepted (our SETTINGS_MAX_FRAME_SIZE)
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Budget for a decoded header list (our SETTINGS_MAX_HEADER_LIST_SIZE)
    pub fn set_max_header_list_size(&mut self, size: u32) {
        self.decoder.set_max_list_size(size as usize);
    }

    fn max_header_block(&self) -> usize {
        (self.decoder.max_list_size() * HEADER_BLOCK_FACTOR).max(MIN_HEADER_BLOCK_LIMIT)
    }

    /// Read and check the client connection preface
    pub fn read_preface(&mut self) -> Result<()> {
        let mut preface = [0u8; 24];
        self.reader.read_exact(&mut preface)?;
        if preface != CONNECTION_PREFACE {
            return Err(Error::protocol("invalid connection preface"));
        }
        Ok(())
    }

    fn read_raw(&mut self) -> Result<RawFrame> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.reader.read_exact(&mut header)?;
        let header = FrameCodec::decode_header(&header);

        if header.length > self.max_frame_size {
            return Err(conn_err(
                ErrorCode::FrameSizeError,
                &format!(
                    "frame payload {} exceeds maximum {}",
                    header.length, self.max_frame_size
                ),
            ));
        }

        let mut payload = vec![0u8; header.length as usize];
        if header.length > 0 {
            self.reader.read_exact(&mut payload)?;
        }

        FrameCodec::parse_frame(header, Bytes::from(payload))
    }

    /// Read the next frame
    ///
    /// Blocks until a complete frame (or complete header block) is
    /// available. Unknown frame types are skipped.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            match self.read_raw()? {
                RawFrame::Frame(frame) => return Ok(frame),
                RawFrame::Unknown(header) => {
                    tracing::trace!(kind = header.kind, stream_id = header.stream_id, "skipping unknown frame");
                }
                RawFrame::Headers(headers) => return self.read_header_block(headers),
                RawFrame::Continuation(_) => {
                    return Err(Error::protocol("CONTINUATION without preceding HEADERS"));
                }
            }
        }
    }

    fn read_header_block(&mut self, first: HeadersFrame) -> Result<Frame> {
        let limit = self.max_header_block();
        let mut end_headers = first.end_headers;
        let mut block = BytesMut::from(&first.header_block[..]);

        while !end_headers {
            let cont = match self.read_raw()? {
                RawFrame::Continuation(cont) if cont.stream_id == first.stream_id => cont,
                RawFrame::Continuation(_) => {
                    return Err(Error::protocol("CONTINUATION for a different stream"));
                }
                _ => return Err(Error::protocol("expected CONTINUATION frame")),
            };
            if block.len() + cont.header_block.len() > limit {
                return Err(conn_err(
                    ErrorCode::EnhanceYourCalm,
                    "header block exceeds size limit",
                ));
            }
            block.extend_from_slice(&cont.header_block);
            end_headers = cont.end_headers;
        }

        let decoded = self.decoder.decode(&block)?;
        let id = first.stream_id;

        // The decoder has consumed the block; anything below only affects
        // this stream.
        if decoded.invalid {
            return Err(Error::Stream(StreamError::local(id, ErrorCode::ProtocolError)));
        }
        if let Err(reason) = headers::check_block(&decoded.fields) {
            tracing::debug!(stream_id = id, reason, "malformed header block");
            return Err(Error::Stream(StreamError::local(id, ErrorCode::ProtocolError)));
        }
        if let Some(priority) = &first.priority {
            if priority.stream_dependency == id {
                return Err(Error::Stream(StreamError::local(id, ErrorCode::ProtocolError)));
            }
        }

        Ok(Frame::MetaHeaders(MetaHeadersFrame {
            stream_id: id,
            end_stream: first.end_stream,
            priority: first.priority,
            fields: decoded.fields,
            truncated: decoded.truncated,
        }))
    }
}

/// Writes frames to one transport direction
///
/// Not safe for concurrent use: each connection has exactly one writer
/// role, which owns the HPACK encoder. Frames are staged in a buffer and
/// reach the transport on [`flush`](Self::flush).
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
    buf: BytesMut,
    encoder: HeaderEncoder,
    max_frame_size: u32,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        FrameWriter {
            writer: BufWriter::new(writer),
            buf: BytesMut::with_capacity(16 << 10),
            encoder: HeaderEncoder::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Largest payload the peer accepts (its SETTINGS_MAX_FRAME_SIZE)
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Bytes staged but not yet flushed
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn write_preface(&mut self) {
        self.buf.put_slice(CONNECTION_PREFACE);
    }

    pub fn write_settings(&mut self, settings: &Settings) {
        FrameCodec::encode_settings_frame(&mut self.buf, &SettingsFrame::new(settings.clone()));
    }

    pub fn write_settings_ack(&mut self) {
        FrameCodec::encode_settings_frame(&mut self.buf, &SettingsFrame::ack());
    }

    pub fn write_ping(&mut self, ack: bool, data: [u8; 8]) {
        FrameCodec::encode_ping_frame(&mut self.buf, &PingFrame { ack, data });
    }

    pub fn write_goaway(&mut self, last_stream_id: StreamId, code: ErrorCode, debug_data: Bytes) {
        FrameCodec::encode_goaway_frame(
            &mut self.buf,
            &GoawayFrame::new(last_stream_id, code, debug_data),
        );
    }

    pub fn write_rst_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        FrameCodec::encode_rst_stream_frame(
            &mut self.buf,
            &RstStreamFrame {
                stream_id,
                error_code,
            },
        );
    }

    pub fn write_window_update(&mut self, stream_id: StreamId, size_increment: u32) {
        FrameCodec::encode_window_update_frame(
            &mut self.buf,
            &WindowUpdateFrame::new(stream_id, size_increment),
        );
    }

    pub fn write_priority(&mut self, stream_id: StreamId, priority: PrioritySpec) {
        FrameCodec::encode_priority_frame(&mut self.buf, &PriorityFrame { stream_id, priority });
    }

    /// Stage one DATA frame; `data` must fit the peer's max frame size
    pub fn write_data(&mut self, stream_id: StreamId, end_stream: bool, data: Bytes) {
        debug_assert!(data.len() <= self.max_frame_size as usize);
        FrameCodec::encode_data_frame(&mut self.buf, &DataFrame::new(stream_id, data, end_stream));
    }

    /// Encode a header list and stage it as HEADERS + CONTINUATION*
    ///
    /// The whole sequence lands in the buffer before anything else can, so
    /// no other frame interleaves with it on the wire.
    pub fn write_headers(
        &mut self,
        stream_id: StreamId,
        fields: &[HeaderField],
        end_stream: bool,
        priority: Option<PrioritySpec>,
    ) {
        let block = self.encoder.encode(fields);
        let max = self.max_frame_size as usize;
        let first_max = if priority.is_some() { max - 5 } else { max };

        let mut rest = block;
        let first = rest.split_to(rest.len().min(first_max));
        FrameCodec::encode_headers_frame(
            &mut self.buf,
            &HeadersFrame {
                stream_id,
                header_block: first,
                end_stream,
                end_headers: rest.is_empty(),
                priority,
                padding: None,
            },
        );

        while !rest.is_empty() {
            let chunk = rest.split_to(rest.len().min(max));
            FrameCodec::encode_continuation_frame(
                &mut self.buf,
                &ContinuationFrame {
                    stream_id,
                    header_block: chunk,
                    end_headers: rest.is_empty(),
                },
            );
        }
    }

    /// Push staged frames to the transport
    pub fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.writer.write_all(&self.buf)?;
            self.buf.clear();
        }
        self.writer.flush()?;
        Ok(())
    }

    /// Access the underlying transport
    pub fn get_ref(&self) -> &W {
        self.writer.get_ref()
    }
}
