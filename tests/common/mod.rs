//! Shared helpers for the loopback integration tests

#![allow(dead_code)]

use h2mux::h2::codec::{FrameReader, FrameWriter};
use h2mux::h2::frames::Frame;
use h2mux::h2::{
    ClientBuilder, ClientConn, Handler, HeaderField, Result, ServerBuilder, ServerHandle, Settings,
};
use std::collections::VecDeque;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// A server accepting exactly one connection
pub struct TestServer {
    pub addr: SocketAddr,
    handle: mpsc::Receiver<ServerHandle>,
    join: JoinHandle<Result<()>>,
}

impl TestServer {
    pub fn start<H: Handler>(builder: ServerBuilder, handler: H) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle_tx, handle_rx) = mpsc::channel();
        let join = thread::spawn(move || {
            let (stream, _) = listener.accept()?;
            let (conn, handle) = builder.build(stream, handler)?;
            let _ = handle_tx.send(handle);
            conn.serve()
        });
        TestServer {
            addr,
            handle: handle_rx,
            join,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn connect(&self) -> ClientConn {
        connect_with(self.addr, ClientBuilder::new())
    }

    /// Available once a client connected
    pub fn handle(&self) -> ServerHandle {
        self.handle.recv_timeout(READ_TIMEOUT).unwrap()
    }

    pub fn join(self) -> Result<()> {
        self.join.join().unwrap()
    }
}

pub fn connect_with(addr: SocketAddr, builder: ClientBuilder) -> ClientConn {
    let stream = TcpStream::connect(addr).unwrap();
    builder.handshake(stream).unwrap()
}

/// Hand-driven peer speaking frames directly
pub struct RawPeer {
    pub reader: FrameReader<TcpStream>,
    pub writer: FrameWriter<TcpStream>,
    /// Frames read while settling, replayed by `next_frame`
    backlog: VecDeque<Frame>,
}

impl RawPeer {
    fn new(stream: TcpStream) -> RawPeer {
        stream.set_read_timeout(Some(READ_TIMEOUT)).unwrap();
        let reader = FrameReader::new(stream.try_clone().unwrap(), 1 << 20);
        RawPeer {
            reader,
            writer: FrameWriter::new(stream),
            backlog: VecDeque::new(),
        }
    }

    /// Connect and send only the client preface
    pub fn connect(addr: SocketAddr) -> RawPeer {
        let mut peer = RawPeer::new(TcpStream::connect(addr).unwrap());
        peer.writer.write_preface();
        peer
    }

    /// Connect as a client: preface plus the given SETTINGS
    pub fn client(addr: SocketAddr, settings: Settings) -> RawPeer {
        let mut peer = RawPeer::connect(addr);
        peer.writer.write_settings(&settings);
        peer.writer.flush().unwrap();
        peer
    }

    /// Accept one client and consume its preface
    pub fn accept(listener: &TcpListener) -> RawPeer {
        let (stream, _) = listener.accept().unwrap();
        let mut peer = RawPeer::new(stream);
        peer.reader.read_preface().unwrap();
        peer
    }

    pub fn next_frame(&mut self) -> Frame {
        match self.backlog.pop_front() {
            Some(frame) => frame,
            None => self.reader.read_frame().unwrap(),
        }
    }

    /// Read until `pick` accepts a frame
    pub fn read_until<T>(&mut self, mut pick: impl FnMut(&Frame) -> Option<T>) -> T {
        loop {
            let frame = self.next_frame();
            if let Some(found) = pick(&frame) {
                return found;
            }
        }
    }

    /// Answer the peer's SETTINGS and wait for it to acknowledge ours
    pub fn settle(&mut self, ours: &Settings) {
        self.writer.write_settings(ours);
        self.writer.flush().unwrap();
        let mut acked = false;
        let mut answered = false;
        while !(acked && answered) {
            match self.reader.read_frame().unwrap() {
                Frame::Settings(s) if s.ack => acked = true,
                Frame::Settings(_) => {
                    self.writer.write_settings_ack();
                    self.writer.flush().unwrap();
                    answered = true;
                }
                Frame::WindowUpdate(_) => {}
                other => self.backlog.push_back(other),
            }
        }
    }

    pub fn send_request(&mut self, stream_id: u32, path: &str, end_stream: bool) {
        let fields = request_fields("GET", path);
        self.writer.write_headers(stream_id, &fields, end_stream, None);
        self.writer.flush().unwrap();
    }

    pub fn send_response(&mut self, stream_id: u32, status: u16, body: &[u8]) {
        let fields = vec![HeaderField::new(":status", status.to_string())];
        self.writer.write_headers(stream_id, &fields, body.is_empty(), None);
        if !body.is_empty() {
            self.writer
                .write_data(stream_id, true, bytes::Bytes::copy_from_slice(body));
        }
        self.writer.flush().unwrap();
    }
}

pub fn request_fields(method: &str, path: &str) -> Vec<HeaderField> {
    vec![
        HeaderField::new(":method", method),
        HeaderField::new(":scheme", "http"),
        HeaderField::new(":authority", "localhost"),
        HeaderField::new(":path", path),
    ]
}
