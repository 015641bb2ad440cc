//! HTTP/2 client connection
//!
//! A [`ClientConn`] multiplexes requests from any number of threads over one
//! transport. All connection state sits behind one mutex paired with a
//! condition variable that is signalled whenever credit, stream slots or
//! settings change. Frames go out through a separate writer lock; the
//! writer lock is always taken before the state lock, never after.
//!
//! One read-loop thread dispatches inbound frames. Each request body is sent
//! by its own thread so that a body blocked on flow control never stalls
//! other streams.

use super::cancel::{CancelGuard, CancelToken};
use super::codec::{FrameReader, FrameWriter};
use super::config::ClientConfig;
use super::error::{Error, ErrorCode, GoAwayError, Result, StreamError};
use super::flow_control::{self, FlowControlWindow, InflowWindow};
use super::frames::{
    DataFrame, Frame, GoawayFrame, MetaHeadersFrame, PingFrame, RstStreamFrame, SettingsFrame,
    WindowUpdateFrame,
};
use super::headers::{self, HeaderField, ResponseHead};
use super::pipe::Pipe;
use super::retry::Body;
use super::settings::LocalSettings;
use super::stream::{StreamId, StreamIdAllocator, StreamState};
use super::supervisor::{self, HealthAction, HealthCheck, IdleTimer};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use crate::transport::{self, Transport};
use bytes::{Bytes, BytesMut};
use crossbeam_channel::{after, bounded, never, select, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

type BoxedWriter = Box<dyn Write + Send>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// An outgoing request
pub struct Request {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    /// Path and query; `*` only for `OPTIONS`
    pub path: String,
    pub headers: Vec<HeaderField>,
    pub body: Body,
    pub trailers: Vec<HeaderField>,
    pub cancel: Option<CancelToken>,
}

impl Request {
    /// Build a request for an absolute URL such as `https://host:port/p?q`
    ///
    /// A URL without a scheme is taken as `https`.
    pub fn new(method: impl Into<String>, url: &str) -> Request {
        let (scheme, rest) = url.split_once("://").unwrap_or(("https", url));
        let rest = rest.split('#').next().unwrap_or_default();
        let split = rest.find(|c| c == '/' || c == '?').unwrap_or(rest.len());
        let path = match &rest[split..] {
            "" => "/".to_string(),
            query if query.starts_with('?') => format!("/{}", query),
            path => path.to_string(),
        };

        Request {
            method: method.into(),
            scheme: scheme.to_ascii_lowercase(),
            authority: rest[..split].to_string(),
            path,
            headers: Vec::new(),
            body: Body::Empty,
            trailers: Vec::new(),
            cancel: None,
        }
    }

    pub fn get(url: &str) -> Request {
        Request::new("GET", url)
    }

    pub fn post(url: &str, body: impl Into<Body>) -> Request {
        Request::new("POST", url).with_body(body)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HeaderField::new(name, value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn trailer(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers.push(HeaderField::new(name, value));
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// A copy for another attempt, if the body can be produced again
    pub fn try_clone(&self) -> Option<Request> {
        Some(Request {
            method: self.method.clone(),
            scheme: self.scheme.clone(),
            authority: self.authority.clone(),
            path: self.path.clone(),
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
            trailers: self.trailers.clone(),
            cancel: self.cancel.clone(),
        })
    }

    /// Pseudo-headers followed by the validated regular fields
    fn head_fields(&self) -> Result<Vec<HeaderField>> {
        if self.method.is_empty() || !self.method.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(Error::InvalidRequest(format!("invalid method {:?}", self.method)));
        }

        let mut fields = Vec::with_capacity(self.headers.len() + 5);
        fields.push(HeaderField::new(":method", &self.method));
        if self.method == "CONNECT" {
            if self.authority.is_empty() {
                return Err(Error::InvalidRequest("CONNECT without authority".into()));
            }
            fields.push(HeaderField::new(":authority", &self.authority));
        } else {
            let path_ok = self.path.starts_with('/') || (self.path == "*" && self.method == "OPTIONS");
            if !path_ok {
                return Err(Error::InvalidRequest(format!("invalid path {:?}", self.path)));
            }
            if self.scheme.is_empty() {
                return Err(Error::InvalidRequest("missing scheme".into()));
            }
            fields.push(HeaderField::new(":scheme", &self.scheme));
            if !self.authority.is_empty() {
                fields.push(HeaderField::new(":authority", &self.authority));
            }
            fields.push(HeaderField::new(":path", &self.path));
        }

        let regular = headers::normalize_outgoing(&self.headers).map_err(Error::InvalidRequest)?;
        let has_length = regular.iter().any(|f| f.name == "content-length");
        // :authority replaces Host
        fields.extend(regular.into_iter().filter(|f| f.name != "host"));

        if !has_length {
            if let Some(len) = self.body.len() {
                let expects_body = matches!(self.method.as_str(), "POST" | "PUT" | "PATCH");
                if len > 0 || expects_body {
                    fields.push(HeaderField::new("content-length", len.to_string()));
                }
            }
        }
        Ok(fields)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("scheme", &self.scheme)
            .field("authority", &self.authority)
            .field("path", &self.path)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

/// A failed submission
///
/// `request` is handed back when none of it was consumed, so the caller can
/// submit it elsewhere unchanged.
#[derive(Debug)]
pub struct RoundTripFailure {
    pub error: Error,
    pub request: Option<Request>,
}

impl RoundTripFailure {
    fn new(error: Error, request: Option<Request>) -> Self {
        RoundTripFailure { error, request }
    }
}

/// Response status, headers and a streaming body
pub struct Response {
    status: u16,
    headers: Vec<HeaderField>,
    stream_id: StreamId,
    body: ResponseBody,
}

impl Response {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &[HeaderField] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        headers::find(&self.headers, name)
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("stream_id", &self.stream_id)
            .field("headers", &self.headers)
            .finish()
    }
}

/// Response body reader
///
/// Flow-control credit is returned to the server as the body is read.
/// Dropping the body before EOF resets the stream with CANCEL.
pub struct ResponseBody {
    inner: Arc<Inner>,
    id: StreamId,
    pipe: Pipe,
    trailers: Arc<Mutex<Option<Vec<HeaderField>>>>,
    finished: bool,
    _cancel: Option<CancelGuard>,
}

impl ResponseBody {
    /// Read the remaining body into memory
    pub fn read_to_bytes(mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        let mut buf = vec![0u8; 16 << 10];
        loop {
            let n = self.read_chunk(&mut buf)?;
            if n == 0 {
                return Ok(out.freeze());
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Trailers, available once the body has been read to EOF
    pub fn trailers(&self) -> Option<Vec<HeaderField>> {
        lock(&self.trailers).clone()
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.pipe.read(buf) {
            Ok(0) => {
                self.finished = true;
                Ok(0)
            }
            Ok(n) => {
                self.inner.return_credit(self.id, n);
                Ok(n)
            }
            Err(err) => {
                self.finished = true;
                Err(err)
            }
        }
    }
}

impl Read for ResponseBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunk(buf).map_err(io::Error::from)
    }
}

impl Drop for ResponseBody {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.cancel_stream(self.id, Error::Canceled);
        }
        let unread = self.pipe.close_reader();
        if unread > 0 {
            self.inner.return_credit(0, unread);
        }
    }
}

/// Snapshot of a connection for pool bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientState {
    pub closed: bool,
    pub closing: bool,
    pub streams_active: usize,
    pub streams_pending: usize,
    pub max_concurrent_streams: u32,
    /// When the connection last became idle; `None` while streams are open
    pub last_idle: Option<Instant>,
}

/// Frames the read loop owes the peer
enum Outgoing {
    WindowUpdate(StreamId, u32),
    Reset(StreamId, ErrorCode),
    PingAck([u8; 8]),
}

enum BodyError {
    /// The stream or connection went away; nothing left to do
    Stopped,
    /// Reading the request body failed
    Source(io::Error),
}

struct ClientStream {
    state: StreamState,
    send_flow: FlowControlWindow,
    recv_flow: InflowWindow,
    /// Present until response headers (or an error) are delivered
    head_tx: Option<Sender<Result<ResponseHead>>>,
    head_request: bool,
    body: Pipe,
    trailers: Arc<Mutex<Option<Vec<HeaderField>>>>,
    content_length: Option<u64>,
    received: u64,
    aborted: bool,
}

impl ClientStream {
    /// Deliver `err` to whoever waits on this stream; later calls are no-ops
    fn abort(&mut self, err: Error) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        if let Some(tx) = self.head_tx.take() {
            let _ = tx.send(Err(err.clone()));
        }
        self.body.close_with_error(err);
    }
}

struct ConnState {
    streams: HashMap<StreamId, ClientStream>,
    ids: StreamIdAllocator,
    /// Callers holding a concurrency slot but not yet a stream id
    pending: usize,

    peer_max_streams: u32,
    peer_initial_window: u32,
    peer_max_frame_size: u32,
    peer_max_header_list: Option<u32>,
    seen_settings: bool,
    local_settings: LocalSettings,

    conn_send: FlowControlWindow,
    conn_recv: InflowWindow,

    goaway: Option<GoAwayError>,
    closing: bool,
    closed: bool,
    do_not_reuse: bool,
    fatal: Option<Error>,

    pings: HashMap<[u8; 8], Sender<()>>,
    health: HealthCheck,
    idle: IdleTimer,
}

impl ConnState {
    fn accepts_new_streams(&self) -> bool {
        !self.closed
            && !self.closing
            && !self.do_not_reuse
            && self.goaway.is_none()
            && self.fatal.is_none()
            && !self.ids.exhausted()
    }

    fn closed_error(&self) -> Error {
        self.fatal.clone().unwrap_or(Error::ConnectionClosed)
    }
}

struct Inner {
    config: ClientConfig,
    state: Mutex<ConnState>,
    cond: Condvar,
    writer: Mutex<FrameWriter<BoxedWriter>>,
    closer: Mutex<Box<dyn Transport>>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        lock(&self.state)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, ConnState>) -> MutexGuard<'a, ConnState> {
        match self.cond.wait(guard) {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn wait_until<'a>(
        &self,
        guard: MutexGuard<'a, ConnState>,
        deadline: Option<Instant>,
    ) -> MutexGuard<'a, ConnState> {
        let Some(deadline) = deadline else {
            return self.wait(guard);
        };
        let timeout = deadline.saturating_duration_since(Instant::now());
        match self.cond.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Stage frames under the writer lock and flush them
    ///
    /// A failed write is fatal for the connection.
    fn write_frames<F>(&self, stage: F) -> Result<()>
    where
        F: FnOnce(&mut FrameWriter<BoxedWriter>),
    {
        let result = {
            let mut writer = lock(&self.writer);
            stage(&mut writer);
            writer.flush()
        };
        if let Err(err) = &result {
            self.fail(err.clone());
        }
        result
    }

    fn flush_outgoing(&self, out: Vec<Outgoing>) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        self.write_frames(|writer| {
            for frame in out {
                match frame {
                    Outgoing::WindowUpdate(id, increment) => writer.write_window_update(id, increment),
                    Outgoing::Reset(id, code) => writer.write_rst_stream(id, code),
                    Outgoing::PingAck(data) => writer.write_ping(true, data),
                }
            }
        })
    }

    fn shutdown_transport(&self) {
        if let Err(e) = lock(&self.closer).shutdown() {
            tracing::trace!(error = %e, "transport shutdown failed");
        }
    }

    /// Tear the connection down, failing every stream with `err`
    fn close_locked(&self, st: &mut ConnState, err: Error) {
        if st.fatal.is_none() {
            st.fatal = Some(err.clone());
        }
        if !st.closed {
            tracing::debug!(error = %err, streams = st.streams.len(), "closing client connection");
        }
        st.closed = true;
        for (_, mut stream) in st.streams.drain() {
            stream.state.close();
            stream.abort(err.clone());
        }
        st.pings.clear();
        self.cond.notify_all();
        self.shutdown_transport();
    }

    fn fail(&self, err: Error) {
        let mut st = self.lock_state();
        self.close_locked(&mut st, err);
    }

    /// Bookkeeping after any stream leaves the table
    fn stream_removed(&self, st: &mut ConnState) {
        self.cond.notify_all();
        if !st.streams.is_empty() {
            return;
        }
        st.idle.set_idle(Instant::now());
        let close_on_idle = st.do_not_reuse || st.closing || st.goaway.is_some();
        if close_on_idle && st.pending == 0 && !st.closed {
            tracing::debug!("last stream finished on a retiring connection");
            self.close_locked(st, Error::ConnectionClosed);
        }
    }

    fn note_error_code(&self, st: &mut ConnState, id: StreamId, code: ErrorCode) {
        if !st.do_not_reuse && self.config.do_not_reuse_codes.contains(&code) {
            tracing::debug!(stream_id = id, %code, "marking connection do-not-reuse");
            st.do_not_reuse = true;
        }
    }

    /// Locally reset a stream: fail its caller, queue RST_STREAM
    fn reset_locked(
        &self,
        st: &mut ConnState,
        id: StreamId,
        code: ErrorCode,
        err: Error,
        out: &mut Vec<Outgoing>,
    ) -> Option<Pipe> {
        let mut stream = st.streams.remove(&id)?;
        tracing::debug!(stream_id = id, %code, "resetting stream");
        if stream.state.close() {
            out.push(Outgoing::Reset(id, code));
        }
        stream.abort(err);
        self.note_error_code(st, id, code);
        self.stream_removed(st);
        Some(stream.body)
    }

    /// Answer a stream error from the peer's side of the wire
    ///
    /// A stream we never opened is idle, so the error is a connection
    /// PROTOCOL_ERROR instead (RFC 9113 Section 5.1).
    fn reset_stream(&self, id: StreamId, code: ErrorCode) -> Result<()> {
        let mut out = Vec::new();
        {
            let mut st = self.lock_state();
            if id % 2 == 0 || id >= st.ids.peek() {
                return Err(Error::protocol(format!("frame on idle stream {}", id)));
            }
            if st.streams.contains_key(&id) {
                self.reset_locked(&mut st, id, code, Error::stream(id, code), &mut out);
            } else {
                out.push(Outgoing::Reset(id, code));
            }
        }
        let _ = self.flush_outgoing(out);
        Ok(())
    }

    /// Caller-side cancellation: RST_STREAM(CANCEL), drop buffered data and
    /// give its connection credit back
    fn cancel_stream(&self, id: StreamId, err: Error) {
        let mut out = Vec::new();
        {
            let mut st = self.lock_state();
            if let Some(pipe) = self.reset_locked(&mut st, id, ErrorCode::Cancel, err.clone(), &mut out) {
                let dropped = pipe.break_with_error(err);
                if dropped > 0 {
                    if let Ok(increment) = st.conn_recv.add(dropped as u32) {
                        if increment > 0 {
                            out.push(Outgoing::WindowUpdate(0, increment));
                        }
                    }
                }
            }
        }
        let _ = self.flush_outgoing(out);
    }

    /// The application consumed `n` bytes of stream `id` (0: connection only)
    fn return_credit(&self, id: StreamId, n: usize) {
        let mut out = Vec::new();
        {
            let mut st = self.lock_state();
            if st.closed {
                return;
            }
            if let Ok(increment) = st.conn_recv.add(n as u32) {
                if increment > 0 {
                    out.push(Outgoing::WindowUpdate(0, increment));
                }
            }
            if let Some(stream) = st.streams.get_mut(&id) {
                if stream.state.can_receive() {
                    if let Ok(increment) = stream.recv_flow.add(n as u32) {
                        if increment > 0 {
                            out.push(Outgoing::WindowUpdate(id, increment));
                        }
                    }
                }
            }
        }
        let _ = self.flush_outgoing(out);
    }

    fn refund_conn(st: &mut ConnState, n: u32, out: &mut Vec<Outgoing>) {
        if n == 0 {
            return;
        }
        if let Ok(increment) = st.conn_recv.add(n) {
            if increment > 0 {
                out.push(Outgoing::WindowUpdate(0, increment));
            }
        }
    }

    fn handle_frame(&self, frame: Frame) -> Result<()> {
        tracing::trace!(frame = frame.frame_type().name(), stream_id = frame.stream_id(), "read frame");
        let frame = match frame {
            Frame::Settings(settings) => return self.handle_settings(settings),
            other => other,
        };

        let mut out = Vec::new();
        let result = {
            let mut st = self.lock_state();
            st.health.frame_read(Instant::now());
            if !st.seen_settings {
                return Err(Error::protocol("first frame from server was not SETTINGS"));
            }
            match frame {
                Frame::Data(data) => self.handle_data(&mut st, data, &mut out),
                Frame::MetaHeaders(headers) => self.handle_headers(&mut st, headers, &mut out),
                Frame::RstStream(rst) => self.handle_rst_stream(&mut st, rst),
                Frame::Ping(ping) => {
                    self.handle_ping(&mut st, ping, &mut out);
                    Ok(())
                }
                Frame::Goaway(goaway) => {
                    self.handle_goaway(&mut st, goaway);
                    Ok(())
                }
                Frame::WindowUpdate(update) => self.handle_window_update(&mut st, update, &mut out),
                Frame::PushPromise(_) => Err(Error::protocol("PUSH_PROMISE with push disabled")),
                Frame::Priority(_) | Frame::Settings(_) => Ok(()),
            }
        };
        self.flush_outgoing(out)?;
        result
    }

    fn handle_settings(&self, frame: SettingsFrame) -> Result<()> {
        if frame.ack {
            let mut st = self.lock_state();
            st.health.frame_read(Instant::now());
            if !st.seen_settings {
                return Err(Error::protocol("first frame from server was not SETTINGS"));
            }
            st.local_settings.acknowledged()?;
            return Ok(());
        }

        let mut writer = lock(&self.writer);
        {
            let mut st = self.lock_state();
            st.health.frame_read(Instant::now());
            let settings = &frame.settings;

            if let Some(size) = settings.max_frame_size {
                st.peer_max_frame_size = size;
                writer.set_max_frame_size(size);
            }
            match settings.max_concurrent_streams {
                Some(max) => st.peer_max_streams = max,
                None if !st.seen_settings => {
                    st.peer_max_streams = self.config.default_max_concurrent_streams
                }
                None => {}
            }
            if let Some(size) = settings.initial_window_size {
                let delta = flow_control::initial_window_delta(st.peer_initial_window, size);
                st.peer_initial_window = size;
                for stream in st.streams.values_mut() {
                    stream.send_flow.add(delta).map_err(|_| {
                        Error::connection(
                            ErrorCode::FlowControlError,
                            "SETTINGS_INITIAL_WINDOW_SIZE overflows a stream window",
                        )
                    })?;
                }
            }
            if let Some(size) = settings.max_header_list_size {
                st.peer_max_header_list = Some(size);
            }
            if let Some(size) = settings.header_table_size {
                if size < DEFAULT_HEADER_TABLE_SIZE {
                    tracing::warn!(size, "peer header table smaller than the encoder's table");
                }
            }

            tracing::debug!(
                max_streams = st.peer_max_streams,
                initial_window = st.peer_initial_window,
                max_frame_size = st.peer_max_frame_size,
                "applied server SETTINGS"
            );
            st.seen_settings = true;
            self.cond.notify_all();
        }
        writer.write_settings_ack();
        writer.flush()
    }

    fn handle_data(&self, st: &mut ConnState, frame: DataFrame, out: &mut Vec<Outgoing>) -> Result<()> {
        let id = frame.stream_id;
        let size = frame.frame_size() as u32;

        let status = match st.streams.get(&id) {
            None => {
                if id % 2 == 0 || id >= st.ids.peek() {
                    return Err(Error::protocol(format!("DATA on idle stream {}", id)));
                }
                None
            }
            Some(stream) if stream.head_tx.is_some() => Some(ErrorCode::ProtocolError),
            Some(stream) if !stream.state.can_receive() => Some(ErrorCode::StreamClosed),
            Some(_) => Some(ErrorCode::NoError),
        };

        match status {
            // Already reset here; the credit still counts.
            None => {
                st.conn_recv
                    .take(size)
                    .map_err(|_| Error::connection(ErrorCode::FlowControlError, "connection window exceeded"))?;
                Self::refund_conn(st, size, out);
                return Ok(());
            }
            Some(ErrorCode::NoError) => {}
            Some(code) => {
                st.conn_recv
                    .take(size)
                    .map_err(|_| Error::connection(ErrorCode::FlowControlError, "connection window exceeded"))?;
                Self::refund_conn(st, size, out);
                self.reset_locked(st, id, code, Error::stream(id, code), out);
                return Ok(());
            }
        }

        let ConnState { streams, conn_recv, .. } = &mut *st;
        let Some(stream) = streams.get_mut(&id) else {
            return Ok(());
        };
        flow_control::take_inflows(conn_recv, &mut stream.recv_flow, size)
            .map_err(|_| Error::connection(ErrorCode::FlowControlError, "peer exceeded flow-control window"))?;

        // Padding is never delivered; hand its credit straight back.
        let data_len = frame.data.len() as u32;
        let padding = size - data_len;
        if padding > 0 {
            if let Ok(increment) = stream.recv_flow.add(padding) {
                if increment > 0 {
                    out.push(Outgoing::WindowUpdate(id, increment));
                }
            }
        }

        stream.received += data_len as u64;
        let length_mismatch = match stream.content_length {
            Some(declared) => {
                stream.received > declared || (frame.end_stream && stream.received != declared)
            }
            None => false,
        };
        let delivered = !length_mismatch && (data_len == 0 || stream.body.write(&frame.data).is_ok());

        if padding > 0 {
            Self::refund_conn(st, padding, out);
        }
        if length_mismatch {
            tracing::debug!(stream_id = id, "response body does not match content-length");
            Self::refund_conn(st, data_len, out);
            self.reset_locked(st, id, ErrorCode::ProtocolError, Error::stream(id, ErrorCode::ProtocolError), out);
            return Ok(());
        }
        if !delivered {
            Self::refund_conn(st, data_len, out);
        }

        if frame.end_stream {
            self.end_of_response(st, id, out);
        }
        Ok(())
    }

    /// The server finished its side of stream `id`
    fn end_of_response(&self, st: &mut ConnState, id: StreamId, out: &mut Vec<Outgoing>) {
        let Some(stream) = st.streams.get_mut(&id) else {
            return;
        };
        stream.state.recv_end();
        stream.body.close();
        if stream.state.is_closed() {
            st.streams.remove(&id);
            self.stream_removed(st);
        } else if stream.state.can_send() {
            // Complete response while the request body is still going:
            // stop sending it (RFC 9113 section 8.1).
            tracing::debug!(stream_id = id, "response complete before request body");
            stream.state.close();
            out.push(Outgoing::Reset(id, ErrorCode::NoError));
            st.streams.remove(&id);
            self.stream_removed(st);
        }
    }

    fn handle_headers(
        &self,
        st: &mut ConnState,
        frame: MetaHeadersFrame,
        out: &mut Vec<Outgoing>,
    ) -> Result<()> {
        let id = frame.stream_id;
        if id % 2 == 0 {
            return Err(Error::protocol("HEADERS on a server-initiated stream"));
        }
        let Some(stream) = st.streams.get_mut(&id) else {
            if id >= st.ids.peek() {
                return Err(Error::protocol(format!("HEADERS on idle stream {}", id)));
            }
            return Ok(());
        };

        if !stream.state.can_receive() {
            self.reset_locked(st, id, ErrorCode::StreamClosed, Error::stream(id, ErrorCode::StreamClosed), out);
            return Ok(());
        }
        if frame.truncated {
            tracing::debug!(stream_id = id, "response header list too large");
            self.reset_locked(st, id, ErrorCode::Cancel, Error::HeaderListTooLarge, out);
            return Ok(());
        }

        let protocol_error = Error::stream(id, ErrorCode::ProtocolError);

        if stream.head_tx.is_none() {
            // Trailers
            if !frame.end_stream || headers::check_trailers(&frame.fields).is_err() {
                self.reset_locked(st, id, ErrorCode::ProtocolError, protocol_error, out);
                return Ok(());
            }
            if let Some(declared) = stream.content_length {
                if declared != stream.received {
                    self.reset_locked(st, id, ErrorCode::ProtocolError, protocol_error, out);
                    return Ok(());
                }
            }
            *lock(&stream.trailers) = Some(frame.fields);
            self.end_of_response(st, id, out);
            return Ok(());
        }

        let head = match ResponseHead::parse(frame.fields) {
            Ok(head) => head,
            Err(reason) => {
                tracing::debug!(stream_id = id, reason, "malformed response headers");
                self.reset_locked(st, id, ErrorCode::ProtocolError, protocol_error, out);
                return Ok(());
            }
        };

        if (100..200).contains(&head.status) {
            if head.status == 101 || frame.end_stream {
                self.reset_locked(st, id, ErrorCode::ProtocolError, protocol_error, out);
            } else {
                tracing::trace!(stream_id = id, status = head.status, "skipping informational response");
            }
            return Ok(());
        }

        let content_length = match headers::content_length(&head.fields) {
            Ok(length) => length,
            Err(reason) => {
                tracing::debug!(stream_id = id, reason, "malformed content-length");
                self.reset_locked(st, id, ErrorCode::ProtocolError, protocol_error, out);
                return Ok(());
            }
        };
        let bodiless = stream.head_request || head.status == 204 || head.status == 304;
        stream.content_length = if bodiless { None } else { content_length };
        if frame.end_stream && stream.content_length.map_or(false, |n| n > 0) {
            self.reset_locked(st, id, ErrorCode::ProtocolError, protocol_error, out);
            return Ok(());
        }

        tracing::debug!(stream_id = id, status = head.status, "response headers");
        if let Some(tx) = stream.head_tx.take() {
            let _ = tx.send(Ok(head));
        }
        if frame.end_stream {
            self.end_of_response(st, id, out);
        }
        Ok(())
    }

    fn handle_rst_stream(&self, st: &mut ConnState, frame: RstStreamFrame) -> Result<()> {
        let id = frame.stream_id;
        let Some(mut stream) = st.streams.remove(&id) else {
            if id % 2 == 1 && id >= st.ids.peek() {
                return Err(Error::protocol(format!("RST_STREAM on idle stream {}", id)));
            }
            return Ok(());
        };
        tracing::debug!(stream_id = id, code = %frame.error_code, "stream reset by server");
        stream.state.close();
        stream.abort(Error::Stream(StreamError::remote(id, frame.error_code)));
        self.note_error_code(st, id, frame.error_code);
        self.stream_removed(st);
        Ok(())
    }

    fn handle_ping(&self, st: &mut ConnState, frame: PingFrame, out: &mut Vec<Outgoing>) {
        if !frame.ack {
            out.push(Outgoing::PingAck(frame.data));
            return;
        }
        if st.health.ping_acked(&frame.data) {
            tracing::trace!("health-check PING acknowledged");
        }
        if let Some(tx) = st.pings.remove(&frame.data) {
            let _ = tx.send(());
        }
    }

    fn handle_goaway(&self, st: &mut ConnState, frame: GoawayFrame) {
        let last = match &st.goaway {
            Some(prev) => prev.last_stream_id.min(frame.last_stream_id),
            None => frame.last_stream_id,
        };
        if frame.error_code == ErrorCode::NoError {
            tracing::debug!(last_stream_id = last, "received GOAWAY");
        } else {
            tracing::warn!(last_stream_id = last, code = %frame.error_code, "received GOAWAY");
        }

        let goaway = GoAwayError {
            last_stream_id: last,
            code: frame.error_code,
            debug_data: frame.debug_data,
            unprocessed: false,
        };
        let doomed: Vec<StreamId> = st.streams.keys().copied().filter(|id| *id > last).collect();
        for id in doomed {
            if let Some(mut stream) = st.streams.remove(&id) {
                stream.state.close();
                stream.abort(Error::GoAway(GoAwayError {
                    unprocessed: true,
                    ..goaway.clone()
                }));
            }
        }
        st.goaway = Some(goaway);
        self.stream_removed(st);
    }

    fn handle_window_update(
        &self,
        st: &mut ConnState,
        frame: WindowUpdateFrame,
        out: &mut Vec<Outgoing>,
    ) -> Result<()> {
        let id = frame.stream_id;
        let increment = frame.size_increment as i32;
        if id == 0 {
            st.conn_send.add(increment).map_err(|_| {
                Error::connection(ErrorCode::FlowControlError, "connection window overflow")
            })?;
            self.cond.notify_all();
            return Ok(());
        }
        match st.streams.get_mut(&id) {
            Some(stream) => {
                if stream.send_flow.add(increment).is_err() {
                    let err = Error::stream(id, ErrorCode::FlowControlError);
                    self.reset_locked(st, id, ErrorCode::FlowControlError, err, out);
                } else {
                    self.cond.notify_all();
                }
            }
            None if id % 2 == 1 && id >= st.ids.peek() => {
                return Err(Error::protocol(format!("WINDOW_UPDATE on idle stream {}", id)));
            }
            None => {}
        }
        Ok(())
    }

    /// Wait for send credit on stream `id`; returns how many bytes were taken
    fn acquire_credit(&self, id: StreamId, want: usize) -> Option<usize> {
        let mut st = self.lock_state();
        loop {
            if st.closed {
                return None;
            }
            let max_frame = st.peer_max_frame_size as usize;
            let ConnState { streams, conn_send, .. } = &mut *st;
            let stream = streams.get_mut(&id)?;
            if stream.aborted || !stream.state.can_send() {
                return None;
            }
            let n = (flow_control::sendable(&stream.send_flow, conn_send) as usize)
                .min(want)
                .min(max_frame);
            if n > 0 {
                stream.send_flow.take(n as u32).ok()?;
                conn_send.take(n as u32).ok()?;
                return Some(n);
            }
            st = self.wait(st);
        }
    }

    /// Write one frame of the request body, checking the stream is still live
    fn write_body_frame<F>(&self, id: StreamId, end_stream: bool, stage: F) -> std::result::Result<(), BodyError>
    where
        F: FnOnce(&mut FrameWriter<BoxedWriter>),
    {
        let result = {
            let mut writer = lock(&self.writer);
            {
                let st = self.lock_state();
                match st.streams.get(&id) {
                    Some(stream) if !stream.aborted && stream.state.can_send() => {}
                    _ => return Err(BodyError::Stopped),
                }
            }
            stage(&mut writer);
            writer.flush()
        };
        if let Err(err) = result {
            self.fail(err);
            return Err(BodyError::Stopped);
        }
        if end_stream {
            let mut st = self.lock_state();
            if let Some(stream) = st.streams.get_mut(&id) {
                stream.state.send_end();
                if stream.state.is_closed() {
                    st.streams.remove(&id);
                    self.stream_removed(&mut st);
                }
            }
        }
        Ok(())
    }

    /// Credit taken for a frame that was never written
    fn restore_conn_credit(&self, n: usize) {
        let mut st = self.lock_state();
        if st.conn_send.add(n as i32).is_ok() {
            self.cond.notify_all();
        }
    }

    fn write_body(&self, id: StreamId, body: Body, trailers: &[HeaderField]) -> std::result::Result<(), BodyError> {
        let mut source = body.into_source().map_err(BodyError::Source)?;
        let has_trailers = !trailers.is_empty();
        let mut ended = false;

        loop {
            let (mut chunk, last) = source
                .next_chunk(self.config.max_body_chunk)
                .map_err(BodyError::Source)?;
            while !chunk.is_empty() {
                let n = self.acquire_credit(id, chunk.len()).ok_or(BodyError::Stopped)?;
                let part = chunk.split_to(n);
                let end = last && chunk.is_empty() && !has_trailers;
                if let Err(err) = self.write_body_frame(id, end, |w| w.write_data(id, end, part)) {
                    self.restore_conn_credit(n);
                    return Err(err);
                }
                ended = end;
            }
            if last {
                break;
            }
        }

        if has_trailers {
            self.write_body_frame(id, true, |w| w.write_headers(id, trailers, true, None))?;
        } else if !ended {
            self.write_body_frame(id, true, |w| w.write_data(id, true, Bytes::new()))?;
        }
        Ok(())
    }

    fn send_body(&self, id: StreamId, body: Body, trailers: Vec<HeaderField>) {
        match self.write_body(id, body, &trailers) {
            Ok(()) => tracing::trace!(stream_id = id, "request body sent"),
            Err(BodyError::Stopped) => tracing::trace!(stream_id = id, "request body abandoned"),
            Err(BodyError::Source(e)) => {
                tracing::debug!(stream_id = id, error = %e, "request body read failed");
                self.cancel_stream(id, Error::from(e));
            }
        }
    }
}

fn read_loop<R: Read>(inner: Arc<Inner>, mut reader: FrameReader<R>) {
    let err = loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(Error::Stream(e)) => match inner.reset_stream(e.id, e.code) {
                Ok(()) => continue,
                Err(err) => break err,
            },
            Err(err) => break err,
        };
        let result = match inner.handle_frame(frame) {
            Err(Error::Stream(e)) => inner.reset_stream(e.id, e.code),
            other => other,
        };
        if let Err(err) = result {
            break err;
        }
    };

    let err = match err {
        Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof => Error::ConnectionClosed,
        other => other,
    };
    if let Error::Connection(e) = &err {
        tracing::warn!(code = %e.code, reason = %e.reason, "client connection error");
        let debug = Bytes::copy_from_slice(e.reason.as_bytes());
        let _ = inner.write_frames(|w| w.write_goaway(0, e.code, debug));
    }
    inner.fail(err);
    tracing::trace!("client read loop exited");
}

fn supervise(inner: Arc<Inner>) {
    let mut st = inner.lock_state();
    loop {
        if st.closed {
            return;
        }
        let now = Instant::now();
        match st.health.poll(now) {
            HealthAction::SendPing(data) => {
                tracing::debug!("connection read-idle, sending health-check PING");
                drop(st);
                let _ = inner.write_frames(|w| w.write_ping(false, data));
                st = inner.lock_state();
                continue;
            }
            HealthAction::Dead => {
                tracing::warn!("health-check PING not acknowledged");
                inner.close_locked(&mut st, Error::Timeout("health-check ping"));
                return;
            }
            HealthAction::Healthy => {}
        }
        if st.streams.is_empty() && st.pending == 0 && st.idle.expired(now) {
            tracing::debug!("closing idle client connection");
            inner.close_locked(&mut st, Error::ConnectionClosed);
            return;
        }
        let deadline = supervisor::earliest(&[st.health.next_deadline(), st.idle.deadline()]);
        st = inner.wait_until(st, deadline);
    }
}

/// Client side of an HTTP/2 connection
///
/// Cheap to clone; every clone drives the same connection. The connection
/// stays up until [`close`](Self::close), [`shutdown`](Self::shutdown), an
/// idle timeout, or a fatal error.
#[derive(Clone)]
pub struct ClientConn {
    inner: Arc<Inner>,
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn").field("state", &self.state()).finish()
    }
}

impl ClientConn {
    /// Send the preface and our SETTINGS, then start the read loop
    ///
    /// Does not wait for the server's SETTINGS; requests submitted before
    /// they arrive use the configured initial concurrency limit.
    pub fn handshake<T: Transport>(transport: T, config: ClientConfig) -> Result<ClientConn> {
        let (reader, writer, closer) = transport::split(transport)?;
        let settings = config.local_settings();

        let mut frames = FrameWriter::new(Box::new(writer) as BoxedWriter);
        frames.write_preface();
        frames.write_settings(&settings);
        if config.conn_window_size > DEFAULT_INITIAL_WINDOW_SIZE {
            frames.write_window_update(0, config.conn_window_size - DEFAULT_INITIAL_WINDOW_SIZE);
        }
        frames.flush()?;

        let now = Instant::now();
        let mut local_settings = LocalSettings::new();
        local_settings.sent(settings);

        let state = ConnState {
            streams: HashMap::new(),
            ids: StreamIdAllocator::client(),
            pending: 0,
            peer_max_streams: config.initial_max_concurrent_streams,
            peer_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
            peer_max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            peer_max_header_list: None,
            seen_settings: false,
            local_settings,
            conn_send: FlowControlWindow::default(),
            conn_recv: InflowWindow::new(config.conn_window_size.max(DEFAULT_INITIAL_WINDOW_SIZE)),
            goaway: None,
            closing: false,
            closed: false,
            do_not_reuse: false,
            fatal: None,
            pings: HashMap::new(),
            health: HealthCheck::new(config.read_idle_timeout, config.ping_timeout, now),
            idle: IdleTimer::new(config.idle_timeout, now),
        };

        let mut frame_reader = FrameReader::new(reader, config.max_header_list_size);
        frame_reader.set_max_frame_size(config.max_read_frame_size);
        let supervised = config.read_idle_timeout.is_some() || config.idle_timeout.is_some();

        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(state),
            cond: Condvar::new(),
            writer: Mutex::new(frames),
            closer: Mutex::new(Box::new(closer)),
        });

        let spawned = {
            let inner = inner.clone();
            thread::Builder::new()
                .name("h2-client-read".into())
                .spawn(move || read_loop(inner, frame_reader))
        };
        if let Err(e) = spawned {
            inner.fail(Error::ConnectionClosed);
            return Err(e.into());
        }
        if supervised {
            let watched = inner.clone();
            let spawned = thread::Builder::new()
                .name("h2-client-supervisor".into())
                .spawn(move || supervise(watched));
            if let Err(e) = spawned {
                inner.fail(Error::ConnectionClosed);
                return Err(e.into());
            }
        }

        tracing::debug!("client connection established");
        Ok(ClientConn { inner })
    }

    /// Send a request and wait for the response headers
    pub fn round_trip(&self, request: Request) -> Result<Response> {
        self.try_round_trip(request).map_err(|failure| failure.error)
    }

    /// Like [`round_trip`](Self::round_trip), but hands the request back
    /// when it was never started
    pub fn try_round_trip(&self, request: Request) -> std::result::Result<Response, RoundTripFailure> {
        let inner = &self.inner;
        let fields = match request.head_fields() {
            Ok(fields) => fields,
            Err(err) => return Err(RoundTripFailure::new(err, None)),
        };
        let trailers = match headers::normalize_outgoing(&request.trailers) {
            Ok(trailers) => trailers,
            Err(reason) => return Err(RoundTripFailure::new(Error::InvalidRequest(reason), None)),
        };
        let cancel = request.cancel.clone();

        let (cancelled, _cancel_wake) = match &cancel {
            Some(token) => {
                let waker = inner.clone();
                let guard = token.on_cancel(move || {
                    let _st = waker.lock_state();
                    waker.cond.notify_all();
                });
                let (rx, channel_guard) = token.channel();
                (rx, Some((guard, channel_guard)))
            }
            None => (never(), None),
        };
        let is_cancelled = || cancel.as_ref().map_or(false, CancelToken::is_cancelled);

        // Wait for a concurrency slot.
        {
            let mut st = inner.lock_state();
            let list_size: usize = fields.iter().map(HeaderField::size).sum();
            if let Some(max) = st.peer_max_header_list {
                if list_size > max as usize {
                    let err = Error::InvalidRequest("header list exceeds the server's limit".into());
                    return Err(RoundTripFailure::new(err, None));
                }
            }
            loop {
                if !st.accepts_new_streams() {
                    return Err(RoundTripFailure::new(Error::NoReusableConnection, Some(request)));
                }
                if is_cancelled() {
                    return Err(RoundTripFailure::new(Error::Canceled, Some(request)));
                }
                if st.streams.len() + st.pending < st.peer_max_streams as usize {
                    st.pending += 1;
                    break;
                }
                st = inner.wait(st);
            }
        }

        let end_stream = request.body.is_empty() && trailers.is_empty();
        let head_request = request.method == "HEAD";
        let pipe = Pipe::new();
        let response_trailers = Arc::new(Mutex::new(None));
        let (head_tx, head_rx) = bounded(1);

        // Allocate the id and write HEADERS under the writer lock so that
        // ids reach the wire in increasing order.
        let id = {
            let mut writer = lock(&inner.writer);
            let id = {
                let mut st = inner.lock_state();
                st.pending -= 1;
                let id = match st.ids.allocate() {
                    Some(id) if st.accepts_new_streams() => id,
                    _ => {
                        inner.cond.notify_all();
                        return Err(RoundTripFailure::new(Error::NoReusableConnection, Some(request)));
                    }
                };
                let mut state = StreamState::Idle;
                state.send_headers(end_stream);
                let peer_initial_window = st.peer_initial_window;
                st.streams.insert(
                    id,
                    ClientStream {
                        state,
                        send_flow: FlowControlWindow::new(peer_initial_window),
                        recv_flow: InflowWindow::new(inner.config.initial_window_size),
                        head_tx: Some(head_tx),
                        head_request,
                        body: pipe.clone(),
                        trailers: response_trailers.clone(),
                        content_length: None,
                        received: 0,
                        aborted: false,
                    },
                );
                st.idle.set_busy();
                id
            };
            tracing::debug!(stream_id = id, method = %request.method, path = %request.path, "opening stream");
            writer.write_headers(id, &fields, end_stream, None);
            if let Err(err) = writer.flush() {
                drop(writer);
                inner.fail(err.clone());
                return Err(RoundTripFailure::new(err, None));
            }
            id
        };

        if !end_stream {
            let body_inner = inner.clone();
            let Request { body, .. } = request;
            let spawned = thread::Builder::new()
                .name(format!("h2-client-body-{}", id))
                .spawn(move || body_inner.send_body(id, body, trailers));
            if let Err(e) = spawned {
                inner.cancel_stream(id, Error::from(e));
                return Err(RoundTripFailure::new(Error::Canceled, None));
            }
        }

        let timeout = match inner.config.response_header_timeout {
            Some(timeout) => after(timeout),
            None => never(),
        };
        let head = select! {
            recv(head_rx) -> msg => match msg {
                Ok(Ok(head)) => head,
                Ok(Err(err)) => return Err(RoundTripFailure::new(err, None)),
                Err(_) => {
                    let err = inner.lock_state().closed_error();
                    return Err(RoundTripFailure::new(err, None));
                }
            },
            recv(cancelled) -> _ => {
                inner.cancel_stream(id, Error::Canceled);
                return Err(RoundTripFailure::new(Error::Canceled, None));
            },
            recv(timeout) -> _ => {
                tracing::debug!(stream_id = id, "timed out waiting for response headers");
                let err = Error::Timeout("response headers");
                inner.cancel_stream(id, err.clone());
                return Err(RoundTripFailure::new(err, None));
            },
        };

        // Cancellation now interrupts the body instead.
        let body_cancel = cancel.as_ref().map(|token| {
            let waker = inner.clone();
            token.on_cancel(move || waker.cancel_stream(id, Error::Canceled))
        });
        if is_cancelled() {
            inner.cancel_stream(id, Error::Canceled);
            return Err(RoundTripFailure::new(Error::Canceled, None));
        }

        Ok(Response {
            status: head.status,
            headers: head.fields,
            stream_id: id,
            body: ResponseBody {
                inner: inner.clone(),
                id,
                pipe,
                trailers: response_trailers,
                finished: false,
                _cancel: body_cancel,
            },
        })
    }

    /// Measure a PING round trip
    pub fn ping(&self, timeout: Duration) -> Result<Duration> {
        let data = supervisor::ping_payload();
        let (tx, rx): (Sender<()>, Receiver<()>) = bounded(1);
        {
            let mut st = self.inner.lock_state();
            if st.closed {
                return Err(st.closed_error());
            }
            st.pings.insert(data, tx);
        }
        let start = Instant::now();
        self.inner.write_frames(|w| w.write_ping(false, data))?;
        match rx.recv_timeout(timeout) {
            Ok(()) => Ok(start.elapsed()),
            Err(RecvTimeoutError::Timeout) => {
                self.inner.lock_state().pings.remove(&data);
                Err(Error::Timeout("ping"))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.inner.lock_state().closed_error()),
        }
    }

    /// True when a new request would be accepted right now
    pub fn can_take_new_request(&self) -> bool {
        let st = self.inner.lock_state();
        st.accepts_new_streams() && st.streams.len() + st.pending < st.peer_max_streams as usize
    }

    pub fn state(&self) -> ClientState {
        let st = self.inner.lock_state();
        ClientState {
            closed: st.closed,
            closing: st.closing,
            streams_active: st.streams.len(),
            streams_pending: st.pending,
            max_concurrent_streams: st.peer_max_streams,
            last_idle: st.idle.idle_since(),
        }
    }

    /// Stop taking requests, let open streams finish, then close
    ///
    /// Sends GOAWAY(NO_ERROR) once. With a `timeout`, remaining streams are
    /// aborted when it expires and `Err(Timeout)` is returned.
    pub fn shutdown(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let first = {
            let mut st = self.inner.lock_state();
            if st.closed {
                return Ok(());
            }
            let first = !st.closing;
            st.closing = true;
            self.inner.cond.notify_all();
            first
        };
        if first {
            tracing::debug!("client graceful shutdown");
            let _ = self
                .inner
                .write_frames(|w| w.write_goaway(0, ErrorCode::NoError, Bytes::new()));
        }

        let mut st = self.inner.lock_state();
        loop {
            if st.closed {
                return Ok(());
            }
            if st.streams.is_empty() && st.pending == 0 {
                self.inner.close_locked(&mut st, Error::ConnectionClosed);
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    tracing::debug!(streams = st.streams.len(), "graceful shutdown timed out");
                    self.inner.close_locked(&mut st, Error::ConnectionClosed);
                    return Err(Error::Timeout("graceful shutdown"));
                }
            }
            st = self.inner.wait_until(st, deadline);
        }
    }

    /// Abort every stream and close the transport now
    pub fn close(&self) {
        let mut st = self.inner.lock_state();
        if st.closed {
            return;
        }
        self.inner.close_locked(&mut st, Error::ConnectionClosed);
    }
}
