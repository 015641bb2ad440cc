//! HTTP/2 server connection
//!
//! [`ServerConn::serve`] runs one control loop that owns every piece of
//! mutable connection state: the stream table, flow-control windows,
//! settings and the write scheduler. It is fed by three kinds of threads:
//!
//! - the reader, which parses frames and hands them over one at a time
//! - the writer, which writes batches picked by the scheduler and reports
//!   back when they are on the wire
//! - one handler thread per stream, which submits write requests and
//!   body-consumption notices through a channel
//!
//! Handlers never touch connection state directly.

use super::codec::{FrameReader, FrameWriter};
use super::config::ServerConfig;
use super::error::{ConnectionError, Error, ErrorCode, Result, StreamError};
use super::flow_control::{self, FlowControlWindow, InflowWindow};
use super::frames::{
    DataFrame, Frame, FrameType, GoawayFrame, MetaHeadersFrame, PingFrame, PriorityFrame,
    RstStreamFrame, SettingsFrame, WindowUpdateFrame,
};
use super::headers::{self, HeaderField, RequestHead};
use super::pipe::Pipe;
use super::scheduler::{FrameWriteRequest, SendCredit, WriteFrame, WriteScheduler};
use super::settings::LocalSettings;
use super::stream::{classify_inbound, Inbound, StreamId, StreamIdTracker, StreamState};
use super::supervisor::{self, HealthAction, HealthCheck, IdleTimer, ShutdownState};
use super::{DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE};
use crate::transport::{self, Transport};
use bytes::{Bytes, BytesMut};
use crossbeam_channel::{at, bounded, never, select, unbounded, Receiver, Sender};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Frames handed to the writer per batch
const MAX_WRITE_BATCH: usize = 32;

/// Recently reset stream ids remembered for late DATA
const MAX_RECENTLY_RESET: usize = 64;

/// How long a due close waits for an in-flight write to finish
const CLOSE_FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Response bytes buffered before a DATA frame is queued
const RESPONSE_BUFFER_SIZE: usize = 16 << 10;

/// Application callback for one request
///
/// Runs on its own thread. The response is finished when the
/// [`ResponseWriter`] is dropped or [`ResponseWriter::finish`] is called; a
/// panic resets the stream with INTERNAL_ERROR.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: ServerRequest, response: ResponseWriter);
}

impl<F> Handler for F
where
    F: Fn(ServerRequest, ResponseWriter) + Send + Sync + 'static,
{
    fn handle(&self, request: ServerRequest, response: ResponseWriter) {
        self(request, response)
    }
}

/// Messages into the control loop from everything except the reader
enum Event {
    /// A handler wants a frame written on its stream
    Write(FrameWriteRequest),
    /// A handler read this many request body bytes
    Consumed(StreamId, usize),
    /// A handler dropped its request body; the count is what it never read
    BodyClosed(StreamId, usize),
    /// A handler abandoned its stream
    Reset(StreamId, ErrorCode),
    /// The writer finished a batch
    Wrote(Vec<FrameWriteRequest>, Result<()>),
    Shutdown(ShutdownCommand),
}

#[derive(Debug, Clone, Copy)]
enum ShutdownCommand {
    Graceful(Option<Duration>),
    Immediate,
}

enum WriterMsg {
    Batch(Vec<FrameWriteRequest>),
    MaxFrameSize(u32),
}

/// An inbound request as seen by a handler
pub struct ServerRequest {
    head: RequestHead,
    stream_id: StreamId,
    body: RequestBody,
}

impl ServerRequest {
    pub fn method(&self) -> &str {
        &self.head.method
    }

    pub fn scheme(&self) -> Option<&str> {
        self.head.scheme.as_deref()
    }

    pub fn authority(&self) -> Option<&str> {
        self.head.authority.as_deref()
    }

    /// `None` only for CONNECT
    pub fn path(&self) -> Option<&str> {
        self.head.path.as_deref()
    }

    /// `:protocol` of an extended CONNECT
    pub fn protocol(&self) -> Option<&str> {
        self.head.protocol.as_deref()
    }

    pub fn headers(&self) -> &[HeaderField] {
        &self.head.fields
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn body_mut(&mut self) -> &mut RequestBody {
        &mut self.body
    }

    pub fn into_body(self) -> RequestBody {
        self.body
    }
}

impl fmt::Debug for ServerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRequest")
            .field("stream_id", &self.stream_id)
            .field("head", &self.head)
            .finish()
    }
}

/// Request body reader
///
/// Reading returns flow-control credit to the client. A reset of the
/// stream or loss of the connection interrupts a blocked read.
pub struct RequestBody {
    id: StreamId,
    pipe: Pipe,
    trailers: Arc<Mutex<Option<Vec<HeaderField>>>>,
    events: Sender<Event>,
    eof: bool,
}

impl RequestBody {
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

    /// Trailers, once the body has been read to EOF
    pub fn trailers(&self) -> Option<Vec<HeaderField>> {
        match self.trailers.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.eof {
            return Ok(0);
        }
        let n = self.pipe.read(buf)?;
        if n == 0 {
            self.eof = true;
        } else {
            let _ = self.events.send(Event::Consumed(self.id, n));
        }
        Ok(n)
    }
}

impl Read for RequestBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_chunk(buf).map_err(io::Error::from)
    }
}

impl Drop for RequestBody {
    fn drop(&mut self) {
        if self.eof {
            return;
        }
        let unread = self.pipe.close_reader();
        let _ = self.events.send(Event::BodyClosed(self.id, unread));
    }
}

/// Builds the response for one stream
///
/// Headers go out with the first flush or when the writer finishes. Body
/// bytes are buffered and queued as DATA; every flush waits until the data
/// is on the wire, which is where flow-control backpressure reaches the
/// handler.
pub struct ResponseWriter {
    id: StreamId,
    events: Sender<Event>,
    head_request: bool,
    status: u16,
    headers: Vec<HeaderField>,
    trailers: Vec<HeaderField>,
    buf: BytesMut,
    wrote_head: bool,
    finished: bool,
}

impl ResponseWriter {
    fn new(id: StreamId, events: Sender<Event>, head_request: bool) -> Self {
        ResponseWriter {
            id,
            events,
            head_request,
            status: 200,
            headers: Vec::new(),
            trailers: Vec::new(),
            buf: BytesMut::new(),
            wrote_head: false,
            finished: false,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.id
    }

    /// Status code; ignored once headers were sent
    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Set a header, replacing any earlier value with the same name
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into().to_ascii_lowercase();
        self.headers.retain(|f| f.name != name);
        self.headers.push(HeaderField::new(name, value));
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(HeaderField::new(name, value));
    }

    /// Add a trailer, sent after the body
    pub fn set_trailer(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.trailers.push(HeaderField::new(name, value));
    }

    pub fn headers_sent(&self) -> bool {
        self.wrote_head
    }

    /// Send status and headers now without ending the stream
    pub fn send_head(&mut self) -> Result<()> {
        if self.wrote_head {
            return Ok(());
        }
        self.write_head(false, true)
    }

    /// Finish the response and wait until it has been written
    pub fn finish(mut self) -> Result<()> {
        let result = self.close(true);
        if let Err(Error::InvalidRequest(_)) = &result {
            let _ = self.events.send(Event::Reset(self.id, ErrorCode::InternalError));
        }
        result
    }

    /// Abandon the response with RST_STREAM
    pub fn reset(mut self, code: ErrorCode) {
        self.finished = true;
        let _ = self.events.send(Event::Reset(self.id, code));
    }

    fn submit(&self, write: WriteFrame, wait: bool) -> Result<()> {
        if !wait {
            let wr = FrameWriteRequest::stream(self.id, write);
            return self
                .events
                .send(Event::Write(wr))
                .map_err(|_| Error::ConnectionClosed);
        }
        let (tx, rx) = bounded(1);
        let wr = FrameWriteRequest::stream(self.id, write).with_done(tx);
        self.events
            .send(Event::Write(wr))
            .map_err(|_| Error::ConnectionClosed)?;
        match rx.recv() {
            Ok(result) => result,
            // Dropped unwritten: the stream or connection went away.
            Err(_) => Err(Error::stream(self.id, ErrorCode::StreamClosed)),
        }
    }

    fn head_fields(&self) -> Result<Vec<HeaderField>> {
        if !(200..=999).contains(&self.status) {
            return Err(Error::InvalidRequest(format!("invalid response status {}", self.status)));
        }
        let regular = headers::normalize_outgoing(&self.headers).map_err(Error::InvalidRequest)?;
        let mut fields = Vec::with_capacity(regular.len() + 1);
        fields.push(HeaderField::new(":status", self.status.to_string()));
        fields.extend(regular);
        Ok(fields)
    }

    fn write_head(&mut self, end_stream: bool, wait: bool) -> Result<()> {
        let fields = self.head_fields()?;
        self.wrote_head = true;
        self.submit(WriteFrame::Headers { fields, end_stream }, wait)
    }

    fn send_buffered(&mut self) -> Result<()> {
        if self.finished {
            return Err(Error::stream(self.id, ErrorCode::StreamClosed));
        }
        if !self.wrote_head {
            self.write_head(false, self.buf.is_empty())?;
        }
        if self.buf.is_empty() {
            return Ok(());
        }
        let data = self.buf.split().freeze();
        self.submit(
            WriteFrame::Data {
                data,
                end_stream: false,
            },
            true,
        )
    }

    fn close(&mut self, wait: bool) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let trailers = headers::normalize_outgoing(&self.trailers).map_err(Error::InvalidRequest)?;
        let has_trailers = !trailers.is_empty();

        if !self.wrote_head {
            let bodiless = self.head_request || self.status == 204 || self.status == 304;
            let has_length = self.headers.iter().any(|f| f.name.eq_ignore_ascii_case("content-length"));
            if !bodiless && !has_length {
                self.headers
                    .push(HeaderField::new("content-length", self.buf.len().to_string()));
            }
            if self.buf.is_empty() && !has_trailers {
                return self.write_head(true, wait);
            }
            self.write_head(false, false)?;
        }

        if !self.buf.is_empty() || !has_trailers {
            let data = self.buf.split().freeze();
            self.submit(
                WriteFrame::Data {
                    data,
                    end_stream: !has_trailers,
                },
                wait && !has_trailers,
            )?;
        }
        if has_trailers {
            self.submit(
                WriteFrame::Headers {
                    fields: trailers,
                    end_stream: true,
                },
                wait,
            )?;
        }
        Ok(())
    }
}

impl Write for ResponseWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "response already finished"));
        }
        self.buf.extend_from_slice(data);
        if self.buf.len() >= RESPONSE_BUFFER_SIZE {
            self.send_buffered()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered().map_err(io::Error::from)
    }
}

impl Drop for ResponseWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if thread::panicking() {
            self.finished = true;
            let _ = self.events.send(Event::Reset(self.id, ErrorCode::InternalError));
            return;
        }
        if let Err(err) = self.close(false) {
            tracing::debug!(stream_id = self.id, error = %err, "could not finish response");
            let _ = self.events.send(Event::Reset(self.id, ErrorCode::InternalError));
        }
    }
}

/// Control handle for a running [`ServerConn`]
#[derive(Clone)]
pub struct ServerHandle {
    events: Sender<Event>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle").finish()
    }
}

impl ServerHandle {
    /// Send GOAWAY(NO_ERROR), finish open streams, then close
    ///
    /// Streams still open after the configured grace period are aborted.
    pub fn graceful_shutdown(&self) {
        let _ = self.events.send(Event::Shutdown(ShutdownCommand::Graceful(None)));
    }

    /// Like [`graceful_shutdown`](Self::graceful_shutdown) with an explicit
    /// grace period
    pub fn graceful_shutdown_timeout(&self, timeout: Duration) {
        let _ = self
            .events
            .send(Event::Shutdown(ShutdownCommand::Graceful(Some(timeout))));
    }

    /// Abort every stream, send GOAWAY and close shortly after
    pub fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown(ShutdownCommand::Immediate));
    }
}

/// Server side of one HTTP/2 connection
pub struct ServerConn<T: Transport> {
    transport: T,
    handler: Arc<dyn Handler>,
    config: ServerConfig,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
}

impl<T: Transport> ServerConn<T> {
    /// Wrap an accepted transport; nothing is read or written yet
    pub fn new<H: Handler>(transport: T, handler: H, config: ServerConfig) -> Result<(Self, ServerHandle)> {
        config
            .local_settings()
            .validate()
            .map_err(|e| Error::InvalidSettings(e.reason))?;
        let (events_tx, events_rx) = unbounded();
        let handle = ServerHandle {
            events: events_tx.clone(),
        };
        let conn = ServerConn {
            transport,
            handler: Arc::new(handler),
            config,
            events_tx,
            events_rx,
        };
        Ok((conn, handle))
    }

    /// Serve the connection until it closes
    ///
    /// Returns `Ok` after a graceful shutdown or when the client went away,
    /// and the connection error when the client violated the protocol.
    pub fn serve(self) -> Result<()> {
        let ServerConn {
            transport,
            handler,
            config,
            events_tx,
            events_rx,
        } = self;
        let (reader, writer, closer) = transport::split(transport)?;

        let (frames_tx, frames_rx) = bounded(1);
        let mut frame_reader = FrameReader::new(reader, config.max_header_list_size);
        frame_reader.set_max_frame_size(config.max_read_frame_size);
        thread::Builder::new()
            .name("h2-server-read".into())
            .spawn(move || read_loop(frame_reader, frames_tx))?;

        let (writer_tx, writer_rx) = unbounded();
        let wrote_tx = events_tx.clone();
        let spawned = thread::Builder::new()
            .name("h2-server-write".into())
            .spawn(move || write_loop(FrameWriter::new(writer), writer_rx, wrote_tx));
        if let Err(e) = spawned {
            let _ = closer.shutdown();
            return Err(e.into());
        }

        let mut conn = Conn::new(config, handler, events_tx, writer_tx);
        let result = conn.run(&frames_rx, &events_rx);
        drop(conn);

        if let Err(e) = closer.shutdown() {
            tracing::trace!(error = %e, "transport shutdown failed");
        }
        tracing::debug!("server connection closed");
        result
    }
}

fn read_loop<R: Read>(mut reader: FrameReader<R>, frames: Sender<Result<Frame>>) {
    if let Err(err) = reader.read_preface() {
        let _ = frames.send(Err(err));
        return;
    }
    loop {
        let result = reader.read_frame();
        let fatal = matches!(&result, Err(err) if !matches!(err, Error::Stream(_)));
        if frames.send(result).is_err() || fatal {
            break;
        }
    }
    tracing::trace!("server read loop exited");
}

fn write_loop<W: Write>(mut writer: FrameWriter<W>, rx: Receiver<WriterMsg>, events: Sender<Event>) {
    for msg in rx {
        match msg {
            WriterMsg::MaxFrameSize(size) => writer.set_max_frame_size(size),
            WriterMsg::Batch(batch) => {
                for wr in &batch {
                    stage_frame(&mut writer, wr);
                }
                let result = writer.flush();
                let failed = result.is_err();
                if events.send(Event::Wrote(batch, result)).is_err() || failed {
                    break;
                }
            }
        }
    }
    tracing::trace!("server writer exited");
}

fn stage_frame<W: Write>(writer: &mut FrameWriter<W>, wr: &FrameWriteRequest) {
    let id = wr.stream_id;
    match &wr.write {
        WriteFrame::Headers { fields, end_stream } => writer.write_headers(id, fields, *end_stream, None),
        WriteFrame::Data { data, end_stream } => writer.write_data(id, *end_stream, data.clone()),
        WriteFrame::WindowUpdate(increment) => writer.write_window_update(id, *increment),
        WriteFrame::RstStream(code) => writer.write_rst_stream(id, *code),
        WriteFrame::Settings(settings) => writer.write_settings(settings),
        WriteFrame::SettingsAck => writer.write_settings_ack(),
        WriteFrame::Ping { ack, data } => writer.write_ping(*ack, *data),
        WriteFrame::GoAway {
            last_stream_id,
            code,
            debug_data,
        } => writer.write_goaway(*last_stream_id, *code, debug_data.clone()),
    }
}

/// The client hung up; not a failure of this connection
fn peer_gone(err: &Error) -> bool {
    match err {
        Error::ConnectionClosed => true,
        Error::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

fn run_handler(handler: Arc<dyn Handler>, request: ServerRequest, response: ResponseWriter) {
    let id = request.stream_id;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request, response)));
    if outcome.is_err() {
        tracing::error!(stream_id = id, "handler panicked");
    }
}

struct ServerStream {
    state: StreamState,
    send_flow: FlowControlWindow,
    recv_flow: InflowWindow,
    body: Pipe,
    trailers: Arc<Mutex<Option<Vec<HeaderField>>>>,
    content_length: Option<u64>,
    received: u64,
    /// The handler no longer reads the body
    body_closed: bool,
    /// END_STREAM is queued; later writes are refused
    end_queued: bool,
}

/// Send credit as the schedulers see it
struct Credit<'a> {
    conn: &'a mut FlowControlWindow,
    streams: &'a mut HashMap<StreamId, ServerStream>,
    max_frame_size: u32,
}

impl SendCredit for Credit<'_> {
    fn available(&self, stream: StreamId) -> i32 {
        match self.streams.get(&stream) {
            Some(s) => flow_control::sendable(&s.send_flow, self.conn) as i32,
            None => 0,
        }
    }

    fn take(&mut self, stream: StreamId, n: u32) {
        if let Some(s) = self.streams.get_mut(&stream) {
            let _ = s.send_flow.take(n);
        }
        let _ = self.conn.take(n);
    }

    fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }
}

/// State owned by the control loop
struct Conn {
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    events: Sender<Event>,
    writer: Sender<WriterMsg>,

    streams: HashMap<StreamId, ServerStream>,
    ids: StreamIdTracker,
    recently_reset: VecDeque<StreamId>,
    scheduler: Box<dyn WriteScheduler>,
    writing: bool,
    queued_control: usize,

    conn_send: FlowControlWindow,
    conn_recv: InflowWindow,
    peer_initial_window: u32,
    peer_max_frame_size: u32,
    local_settings: LocalSettings,
    seen_settings: bool,

    shutdown: ShutdownState,
    goaway_pending: bool,
    preface_deadline: Option<Instant>,
    health: HealthCheck,
    idle: IdleTimer,
    /// Why the connection failed, reported by `serve`
    error: Option<Error>,
}

impl Conn {
    fn new(config: ServerConfig, handler: Arc<dyn Handler>, events: Sender<Event>, writer: Sender<WriterMsg>) -> Self {
        let now = Instant::now();
        Conn {
            scheduler: config.scheduler.build(),
            conn_recv: InflowWindow::new(config.conn_window_size.max(DEFAULT_INITIAL_WINDOW_SIZE)),
            preface_deadline: Some(now + config.preface_timeout),
            health: HealthCheck::new(config.read_idle_timeout, config.ping_timeout, now),
            idle: IdleTimer::new(config.idle_timeout, now),
            config,
            handler,
            events,
            writer,
            streams: HashMap::new(),
            ids: StreamIdTracker::new(),
            recently_reset: VecDeque::new(),
            writing: false,
            queued_control: 0,
            conn_send: FlowControlWindow::default(),
            peer_initial_window: DEFAULT_INITIAL_WINDOW_SIZE,
            peer_max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            local_settings: LocalSettings::new(),
            seen_settings: false,
            shutdown: ShutdownState::Running,
            goaway_pending: false,
            error: None,
        }
    }

    fn run(&mut self, frames: &Receiver<Result<Frame>>, events: &Receiver<Event>) -> Result<()> {
        // Our SETTINGS go out first (RFC 9113 Section 3.4).
        let settings = self.config.local_settings();
        self.local_settings.sent(settings.clone());
        self.queue_control(0, WriteFrame::Settings(settings));
        if self.config.conn_window_size > DEFAULT_INITIAL_WINDOW_SIZE {
            let increment = self.config.conn_window_size - DEFAULT_INITIAL_WINDOW_SIZE;
            self.queue_control(0, WriteFrame::WindowUpdate(increment));
        }

        loop {
            self.schedule_writes();
            self.check_drained();
            if self.shutdown.is_closed() {
                return match self.error.take() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }

            let timer = match self.next_deadline() {
                Some(deadline) => at(deadline),
                None => never(),
            };
            select! {
                recv(frames) -> msg => match msg {
                    Ok(Ok(frame)) => self.on_frame(frame),
                    Ok(Err(err)) => self.on_read_error(err),
                    Err(_) => self.on_read_error(Error::ConnectionClosed),
                },
                recv(events) -> msg => {
                    if let Ok(event) = msg {
                        self.on_event(event);
                    }
                },
                recv(timer) -> _ => self.on_timer(Instant::now()),
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let preface = if self.seen_settings { None } else { self.preface_deadline };
        let idle = if self.shutdown.is_running() && self.streams.is_empty() {
            self.idle.deadline()
        } else {
            None
        };
        supervisor::earliest(&[preface, self.health.next_deadline(), idle, self.close_at()])
    }

    /// When the transport closes; held back while a batch or the GOAWAY is
    /// still on its way to the writer
    fn close_at(&self) -> Option<Instant> {
        let deadline = self.shutdown.close_deadline()?;
        if self.writing || self.goaway_pending {
            Some(deadline + CLOSE_FLUSH_GRACE)
        } else {
            Some(deadline)
        }
    }

    fn on_timer(&mut self, now: Instant) {
        if !self.seen_settings && self.preface_deadline.map_or(false, |d| now >= d) {
            tracing::debug!("client preface timed out");
            self.close(Some(Error::Timeout("client preface")));
            return;
        }
        if let Some(deadline) = self.close_at() {
            if now >= deadline {
                tracing::debug!(streams = self.streams.len(), "shutdown deadline reached");
                self.close(None);
                return;
            }
        }
        match self.health.poll(now) {
            HealthAction::SendPing(data) => {
                tracing::debug!("connection read-idle, sending health-check PING");
                self.queue_control(0, WriteFrame::Ping { ack: false, data });
            }
            HealthAction::Dead => {
                tracing::warn!("health-check PING not acknowledged");
                self.close(Some(Error::Timeout("health-check ping")));
                return;
            }
            HealthAction::Healthy => {}
        }
        if self.shutdown.is_running() && self.streams.is_empty() && self.idle.expired(now) {
            tracing::debug!("closing idle server connection");
            self.start_graceful(Some(Duration::ZERO));
        }
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Write(wr) => self.submit_write(wr),
            Event::Consumed(id, n) => self.return_credit(id, n),
            Event::BodyClosed(id, unread) => {
                self.refund_conn(unread as u32);
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.body_closed = true;
                }
            }
            Event::Reset(id, code) => {
                if self.streams.contains_key(&id) {
                    self.reset_stream(id, code);
                }
            }
            Event::Wrote(batch, result) => self.on_wrote(batch, result),
            Event::Shutdown(ShutdownCommand::Graceful(timeout)) => self.start_graceful(timeout),
            Event::Shutdown(ShutdownCommand::Immediate) => {
                self.abort(ConnectionError::new(ErrorCode::NoError, "server shutting down"), false)
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        if matches!(self.shutdown, ShutdownState::Aborting { .. }) {
            return;
        }
        tracing::trace!(frame = frame.frame_type().name(), stream_id = frame.stream_id(), "read frame");
        self.health.frame_read(Instant::now());

        let result = self.process_frame(frame).and_then(|()| {
            if self.queued_control > self.config.max_queued_control_frames {
                return Err(Error::connection(
                    ErrorCode::EnhanceYourCalm,
                    "too many queued control frames",
                ));
            }
            Ok(())
        });
        if let Err(err) = result {
            self.handle_error(err);
        }
    }

    fn on_read_error(&mut self, err: Error) {
        if let Error::Stream(e) = &err {
            // The header block was consumed; the stream counts as opened.
            if StreamIdTracker::is_client_initiated(e.id) && e.id > self.ids.max_client() {
                self.ids.observe(e.id);
            }
        }
        if peer_gone(&err) {
            tracing::debug!("client closed the connection");
            self.close(None);
            return;
        }
        self.handle_error(err);
    }

    fn handle_error(&mut self, err: Error) {
        match err {
            Error::Stream(e) => self.reset_stream(e.id, e.code),
            Error::Connection(e) => self.abort(e, true),
            other => self.close(Some(other)),
        }
    }

    fn process_frame(&mut self, frame: Frame) -> Result<()> {
        if !self.seen_settings && !matches!(&frame, Frame::Settings(s) if !s.ack) {
            return Err(Error::protocol("first frame from client was not SETTINGS"));
        }

        // After our GOAWAY, frames for streams it excluded are dropped.
        let id = frame.stream_id();
        if !self.shutdown.is_running() && id % 2 == 1 && id > self.ids.max_client() {
            if let Frame::Data(data) = &frame {
                self.charge_and_refund(data.frame_size() as u32)?;
            }
            return Ok(());
        }

        match frame {
            Frame::Settings(settings) => self.on_settings(settings),
            Frame::Ping(ping) => {
                self.on_ping(ping);
                Ok(())
            }
            Frame::Goaway(goaway) => {
                self.on_goaway(goaway);
                Ok(())
            }
            Frame::WindowUpdate(update) => self.on_window_update(update),
            Frame::RstStream(rst) => self.on_rst_stream(rst),
            Frame::Priority(priority) => self.on_priority(priority),
            Frame::PushPromise(_) => Err(Error::protocol("client sent PUSH_PROMISE")),
            Frame::Data(data) => self.on_data(data),
            Frame::MetaHeaders(headers) => self.on_headers(headers),
        }
    }

    fn on_settings(&mut self, frame: SettingsFrame) -> Result<()> {
        if frame.ack {
            let acked = self.local_settings.acknowledged()?;
            tracing::debug!(settings = acked.len(), "client acknowledged SETTINGS");
            return Ok(());
        }

        let settings = frame.settings;
        if let Some(size) = settings.max_frame_size {
            self.peer_max_frame_size = size;
            let _ = self.writer.send(WriterMsg::MaxFrameSize(size));
        }
        if let Some(size) = settings.initial_window_size {
            let delta = flow_control::initial_window_delta(self.peer_initial_window, size);
            self.peer_initial_window = size;
            for stream in self.streams.values_mut() {
                stream.send_flow.add(delta).map_err(|_| {
                    Error::connection(
                        ErrorCode::FlowControlError,
                        "SETTINGS_INITIAL_WINDOW_SIZE overflows a stream window",
                    )
                })?;
            }
        }
        if let Some(size) = settings.header_table_size {
            if size < DEFAULT_HEADER_TABLE_SIZE {
                tracing::warn!(size, "client header table smaller than the encoder's table");
            }
        }

        tracing::debug!(
            initial_window = self.peer_initial_window,
            max_frame_size = self.peer_max_frame_size,
            "applied client SETTINGS"
        );
        self.seen_settings = true;
        self.queue_control(0, WriteFrame::SettingsAck);
        Ok(())
    }

    fn on_ping(&mut self, frame: PingFrame) {
        if frame.ack {
            if self.health.ping_acked(&frame.data) {
                tracing::trace!("health-check PING acknowledged");
            }
            return;
        }
        self.queue_control(
            0,
            WriteFrame::Ping {
                ack: true,
                data: frame.data,
            },
        );
    }

    fn on_goaway(&mut self, frame: GoawayFrame) {
        if frame.error_code == ErrorCode::NoError {
            tracing::debug!(last_stream_id = frame.last_stream_id, "client sent GOAWAY");
        } else {
            tracing::warn!(
                last_stream_id = frame.last_stream_id,
                code = %frame.error_code,
                "client sent GOAWAY"
            );
        }
        self.start_graceful(None);
    }

    fn on_window_update(&mut self, frame: WindowUpdateFrame) -> Result<()> {
        let id = frame.stream_id;
        let increment = frame.size_increment as i32;
        if id == 0 {
            return self.conn_send.add(increment).map_err(|_| {
                Error::connection(ErrorCode::FlowControlError, "connection window overflow")
            });
        }
        match self.streams.get_mut(&id) {
            Some(stream) => stream
                .send_flow
                .add(increment)
                .map_err(|_| Error::stream(id, ErrorCode::FlowControlError)),
            None => match self.ids.state_of(id) {
                StreamState::Idle => Err(Error::protocol(format!("WINDOW_UPDATE on idle stream {}", id))),
                _ => Ok(()),
            },
        }
    }

    fn on_rst_stream(&mut self, frame: RstStreamFrame) -> Result<()> {
        let id = frame.stream_id;
        let Some(stream) = self.streams.remove(&id) else {
            if self.ids.state_of(id) == StreamState::Idle {
                return Err(Error::protocol(format!("RST_STREAM on idle stream {}", id)));
            }
            return Ok(());
        };
        tracing::debug!(stream_id = id, code = %frame.error_code, "stream reset by client");
        let dropped = stream
            .body
            .break_with_error(Error::Stream(StreamError::remote(id, frame.error_code)));
        self.refund_conn(dropped as u32);
        self.scheduler.close_stream(id);
        self.stream_removed();
        Ok(())
    }

    fn on_priority(&mut self, frame: PriorityFrame) -> Result<()> {
        if frame.priority.stream_dependency == frame.stream_id {
            return Err(Error::stream(frame.stream_id, ErrorCode::ProtocolError));
        }
        self.scheduler.adjust_stream(frame.stream_id, frame.priority);
        Ok(())
    }

    fn on_data(&mut self, frame: DataFrame) -> Result<()> {
        let id = frame.stream_id;
        let size = frame.frame_size() as u32;

        let inbound = match self.streams.get(&id) {
            Some(stream) => classify_inbound(stream.state, FrameType::Data, false),
            None => classify_inbound(self.ids.state_of(id), FrameType::Data, true),
        };
        match inbound {
            Inbound::Accept => {}
            Inbound::ConnectionError(reason) => return Err(Error::protocol(reason)),
            Inbound::Ignore => return self.charge_and_refund(size),
            Inbound::StreamError(code) => {
                self.charge_and_refund(size)?;
                if self.recently_reset.contains(&id) {
                    return Ok(());
                }
                // Not a stream we reset: STREAM_CLOSED (RFC 9113 Section 5.1).
                return Err(Error::stream(id, code));
            }
        }

        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        flow_control::take_inflows(&mut self.conn_recv, &mut stream.recv_flow, size)
            .map_err(|_| Error::connection(ErrorCode::FlowControlError, "client exceeded flow-control window"))?;

        let data_len = frame.data.len() as u32;
        let padding = size - data_len;
        let mut refund_conn = padding;
        let mut refund_stream = padding;

        stream.received += data_len as u64;
        if let Some(declared) = stream.content_length {
            if stream.received > declared || (frame.end_stream && stream.received != declared) {
                tracing::debug!(stream_id = id, declared, received = stream.received, "request body does not match content-length");
                self.refund_conn(size);
                return Err(Error::stream(id, ErrorCode::ProtocolError));
            }
        }

        if data_len > 0 && (stream.body_closed || stream.body.write(&frame.data).is_err()) {
            refund_conn += data_len;
            refund_stream += data_len;
        }
        if refund_stream > 0 && !frame.end_stream {
            if let Ok(increment) = stream.recv_flow.add(refund_stream) {
                if increment > 0 {
                    self.queue_control(id, WriteFrame::WindowUpdate(increment));
                }
            }
        }
        self.refund_conn(refund_conn);

        if frame.end_stream {
            self.end_of_request(id);
        }
        Ok(())
    }

    fn on_headers(&mut self, frame: MetaHeadersFrame) -> Result<()> {
        let id = frame.stream_id;
        if !StreamIdTracker::is_client_initiated(id) {
            return Err(Error::protocol(format!("client opened even stream {}", id)));
        }
        if self.streams.contains_key(&id) {
            return self.on_trailers(frame);
        }
        if id <= self.ids.max_client() {
            if self.recently_reset.contains(&id) {
                return Ok(());
            }
            return match classify_inbound(StreamState::Closed, FrameType::Headers, true) {
                Inbound::ConnectionError(reason) => Err(Error::protocol(reason)),
                _ => Ok(()),
            };
        }
        self.ids.observe(id);

        if self.streams.len() >= self.config.max_concurrent_streams as usize {
            // The client may not have seen our limit yet.
            let code = if self.local_settings.unacked() > 0 {
                ErrorCode::RefusedStream
            } else {
                ErrorCode::ProtocolError
            };
            tracing::debug!(stream_id = id, %code, "concurrent stream limit reached");
            return Err(Error::stream(id, code));
        }

        if frame.truncated {
            tracing::debug!(stream_id = id, "request header list too large");
            self.open_stream(id, frame.end_stream, None, Pipe::new());
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.body_closed = true;
                stream.end_queued = true;
            }
            let fields = vec![HeaderField::new(":status", "431")];
            self.scheduler.push(FrameWriteRequest::stream(
                id,
                WriteFrame::Headers {
                    fields,
                    end_stream: true,
                },
            ));
            return Ok(());
        }

        let priority = frame.priority;
        let end_stream = frame.end_stream;
        let head = RequestHead::parse(frame.fields).map_err(|reason| {
            tracing::debug!(stream_id = id, reason, "malformed request headers");
            Error::stream(id, ErrorCode::ProtocolError)
        })?;
        let content_length = headers::content_length(&head.fields).map_err(|reason| {
            tracing::debug!(stream_id = id, reason, "malformed content-length");
            Error::stream(id, ErrorCode::ProtocolError)
        })?;
        if end_stream && content_length.map_or(false, |n| n > 0) {
            return Err(Error::stream(id, ErrorCode::ProtocolError));
        }

        let pipe = Pipe::new();
        let trailers = self.open_stream(id, end_stream, content_length, pipe.clone());
        if let Some(priority) = priority {
            self.scheduler.adjust_stream(id, priority);
        }
        tracing::debug!(stream_id = id, method = %head.method, path = ?head.path, "opening stream");

        let head_request = head.method == "HEAD";
        let request = ServerRequest {
            head,
            stream_id: id,
            body: RequestBody {
                id,
                pipe,
                trailers,
                events: self.events.clone(),
                eof: false,
            },
        };
        let response = ResponseWriter::new(id, self.events.clone(), head_request);
        let handler = self.handler.clone();
        let spawned = thread::Builder::new()
            .name(format!("h2-handler-{}", id))
            .spawn(move || run_handler(handler, request, response));
        if let Err(e) = spawned {
            tracing::warn!(stream_id = id, error = %e, "could not start handler");
            return Err(Error::stream(id, ErrorCode::InternalError));
        }
        Ok(())
    }

    fn open_stream(
        &mut self,
        id: StreamId,
        end_stream: bool,
        content_length: Option<u64>,
        body: Pipe,
    ) -> Arc<Mutex<Option<Vec<HeaderField>>>> {
        let mut state = StreamState::Idle;
        state.recv_headers(end_stream);
        if end_stream {
            body.close();
        }
        let trailers = Arc::new(Mutex::new(None));
        self.streams.insert(
            id,
            ServerStream {
                state,
                send_flow: FlowControlWindow::new(self.peer_initial_window),
                recv_flow: InflowWindow::new(self.config.initial_window_size),
                body,
                trailers: trailers.clone(),
                content_length,
                received: 0,
                body_closed: false,
                end_queued: false,
            },
        );
        self.scheduler.open_stream(id);
        self.idle.set_busy();
        trailers
    }

    fn on_trailers(&mut self, frame: MetaHeadersFrame) -> Result<()> {
        let id = frame.stream_id;
        let Some(stream) = self.streams.get_mut(&id) else {
            return Ok(());
        };
        match classify_inbound(stream.state, FrameType::Headers, false) {
            Inbound::Accept => {}
            Inbound::Ignore => return Ok(()),
            Inbound::StreamError(code) => return Err(Error::stream(id, code)),
            Inbound::ConnectionError(reason) => return Err(Error::protocol(reason)),
        }
        if !frame.end_stream || frame.truncated || headers::check_trailers(&frame.fields).is_err() {
            tracing::debug!(stream_id = id, "malformed request trailers");
            return Err(Error::stream(id, ErrorCode::ProtocolError));
        }
        if let Some(declared) = stream.content_length {
            if declared != stream.received {
                return Err(Error::stream(id, ErrorCode::ProtocolError));
            }
        }
        match stream.trailers.lock() {
            Ok(mut guard) => *guard = Some(frame.fields),
            Err(poisoned) => *poisoned.into_inner() = Some(frame.fields),
        }
        self.end_of_request(id);
        Ok(())
    }

    /// The client finished its side of stream `id`
    fn end_of_request(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        stream.state.recv_end();
        stream.body.close();
        if stream.state.is_closed() {
            self.remove_stream(id);
        }
    }

    /// Our side of stream `id` has been written out
    fn sent_end(&mut self, id: StreamId) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        stream.state.send_end();
        if stream.state.is_closed() {
            self.remove_stream(id);
        } else if stream.state == StreamState::HalfClosedLocal {
            // Complete response while the request body is still arriving
            // (RFC 9113 Section 8.1).
            tracing::debug!(stream_id = id, "response complete before request body");
            self.reset_stream(id, ErrorCode::NoError);
        }
    }

    fn remove_stream(&mut self, id: StreamId) {
        if self.streams.remove(&id).is_some() {
            tracing::trace!(stream_id = id, "stream closed");
            self.scheduler.close_stream(id);
            self.stream_removed();
        }
    }

    fn stream_removed(&mut self) {
        if self.streams.is_empty() {
            self.idle.set_idle(Instant::now());
        }
    }

    fn reset_stream(&mut self, id: StreamId, code: ErrorCode) {
        tracing::debug!(stream_id = id, %code, "resetting stream");
        if let Some(stream) = self.streams.remove(&id) {
            let dropped = stream.body.break_with_error(Error::stream(id, code));
            self.refund_conn(dropped as u32);
            self.scheduler.close_stream(id);
            self.stream_removed();
        }
        if self.recently_reset.len() == MAX_RECENTLY_RESET {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(id);
        self.queue_control(id, WriteFrame::RstStream(code));
    }

    fn submit_write(&mut self, wr: FrameWriteRequest) {
        let id = wr.stream_id;
        match self.streams.get_mut(&id) {
            Some(stream) if stream.state.can_send() && !stream.end_queued => {
                if wr.ends_stream() {
                    stream.end_queued = true;
                }
                self.scheduler.push(wr);
            }
            _ => wr.complete(Err(Error::stream(id, ErrorCode::StreamClosed))),
        }
    }

    fn return_credit(&mut self, id: StreamId, n: usize) {
        self.refund_conn(n as u32);
        if let Some(stream) = self.streams.get_mut(&id) {
            if stream.state.can_receive() {
                if let Ok(increment) = stream.recv_flow.add(n as u32) {
                    if increment > 0 {
                        self.queue_control(id, WriteFrame::WindowUpdate(increment));
                    }
                }
            }
        }
    }

    fn refund_conn(&mut self, n: u32) {
        if n == 0 {
            return;
        }
        if let Ok(increment) = self.conn_recv.add(n) {
            if increment > 0 {
                self.queue_control(0, WriteFrame::WindowUpdate(increment));
            }
        }
    }

    /// DATA we will not deliver still counts against the connection window
    fn charge_and_refund(&mut self, size: u32) -> Result<()> {
        self.conn_recv
            .take(size)
            .map_err(|_| Error::connection(ErrorCode::FlowControlError, "connection window exceeded"))?;
        self.refund_conn(size);
        Ok(())
    }

    fn queue_control(&mut self, id: StreamId, write: WriteFrame) {
        if matches!(write, WriteFrame::GoAway { .. }) {
            self.goaway_pending = true;
        }
        let wr = if id == 0 {
            FrameWriteRequest::control(write)
        } else {
            FrameWriteRequest::control_for(id, write)
        };
        self.queued_control += 1;
        self.scheduler.push(wr);
    }

    fn schedule_writes(&mut self) {
        if self.writing || self.shutdown.is_closed() {
            return;
        }
        let mut batch = Vec::new();
        let mut credit = Credit {
            conn: &mut self.conn_send,
            streams: &mut self.streams,
            max_frame_size: self.peer_max_frame_size,
        };
        while batch.len() < MAX_WRITE_BATCH {
            match self.scheduler.pop(&mut credit) {
                Some(wr) => batch.push(wr),
                None => break,
            }
        }
        if batch.is_empty() {
            return;
        }
        tracing::trace!(frames = batch.len(), "writing batch");
        if self.writer.send(WriterMsg::Batch(batch)).is_err() {
            self.close(Some(Error::ConnectionClosed));
            return;
        }
        self.writing = true;
    }

    fn on_wrote(&mut self, batch: Vec<FrameWriteRequest>, result: Result<()>) {
        self.writing = false;
        if let Err(err) = result {
            tracing::debug!(error = %err, "server write failed");
            for wr in batch {
                wr.complete(Err(err.clone()));
            }
            let cause = if peer_gone(&err) { None } else { Some(err) };
            self.close(cause);
            return;
        }
        for wr in batch {
            if wr.is_control() {
                self.queued_control = self.queued_control.saturating_sub(1);
            }
            match &wr.write {
                WriteFrame::GoAway { .. } => self.goaway_pending = false,
                WriteFrame::RstStream(_) => {}
                _ if wr.stream_id != 0 && wr.ends_stream() => self.sent_end(wr.stream_id),
                _ => {}
            }
            wr.complete(Ok(()));
        }
    }

    fn start_graceful(&mut self, timeout: Option<Duration>) {
        let deadline = Instant::now() + timeout.unwrap_or(self.config.graceful_timeout);
        if !self.shutdown.begin_drain(Some(deadline)) {
            return;
        }
        let last = self.ids.max_client();
        tracing::debug!(last_stream_id = last, streams = self.streams.len(), "graceful shutdown");
        self.queue_control(
            0,
            WriteFrame::GoAway {
                last_stream_id: last,
                code: ErrorCode::NoError,
                debug_data: Bytes::new(),
            },
        );
    }

    /// Error GOAWAY, then close after the abrupt-close delay
    fn abort(&mut self, err: ConnectionError, record: bool) {
        let close_at = Instant::now() + self.config.abrupt_close_delay;
        if !self.shutdown.begin_abort(close_at) {
            return;
        }
        if record {
            tracing::warn!(code = %err.code, reason = %err.reason, "server connection error");
            self.error.get_or_insert_with(|| Error::Connection(err.clone()));
        } else {
            tracing::debug!(streams = self.streams.len(), "immediate shutdown");
        }
        self.fail_streams(Error::Connection(err.clone()));
        let last = self.ids.max_client();
        self.queue_control(
            0,
            WriteFrame::GoAway {
                last_stream_id: last,
                code: err.code,
                debug_data: Bytes::copy_from_slice(err.reason.as_bytes()),
            },
        );
    }

    fn check_drained(&mut self) {
        if let ShutdownState::Draining { .. } = self.shutdown {
            if self.streams.is_empty() && !self.writing && !self.goaway_pending {
                tracing::debug!("connection drained");
                self.shutdown = ShutdownState::Closed;
            }
        }
    }

    fn fail_streams(&mut self, err: Error) {
        for (id, stream) in self.streams.drain() {
            stream.body.break_with_error(err.clone());
            self.scheduler.close_stream(id);
        }
        self.idle.set_idle(Instant::now());
    }

    fn close(&mut self, err: Option<Error>) {
        if self.shutdown.is_closed() {
            return;
        }
        if let Some(err) = err {
            tracing::debug!(error = %err, "closing server connection");
            self.error.get_or_insert(err);
        }
        let cause = self.error.clone().unwrap_or(Error::ConnectionClosed);
        self.fail_streams(cause);
        self.shutdown = ShutdownState::Closed;
    }
}
