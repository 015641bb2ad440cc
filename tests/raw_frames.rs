//! Protocol tests against a hand-driven peer
//!
//! One side is a real h2mux connection, the other writes and reads frames
//! directly so that misbehaviour and exact frame sequences can be checked.

mod common;

use bytes::{Bytes, BytesMut};
use common::{init_tracing, request_fields, RawPeer, TestServer};
use h2mux::h2::codec::FrameCodec;
use h2mux::h2::frames::{Frame, HeadersFrame};
use h2mux::h2::{
    ClientBuilder, Error, ErrorCode, HeaderField, Request, ResponseWriter, ServerBuilder,
    ServerRequest, Settings,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

fn ok_handler(_req: ServerRequest, mut resp: ResponseWriter) {
    resp.write_all(b"ok").unwrap();
}

fn status_of(fields: &[HeaderField]) -> Option<&str> {
    fields.iter().find(|f| f.name == ":status").map(|f| f.value.as_str())
}

// ---- server under test ----

#[test]
fn test_malformed_path_resets_only_that_stream() {
    init_tracing();
    let server = TestServer::start(ServerBuilder::new(), ok_handler);
    let mut peer = RawPeer::client(server.addr, Settings::default());
    peer.settle(&Settings::default());

    let mut bad = request_fields("GET", "relative");
    bad.push(HeaderField::new("x-case", "bad"));
    peer.writer.write_headers(1, &bad, true, None);
    peer.send_request(3, "/fine", true);

    let mut reset = None;
    let mut status = None;
    while reset.is_none() || status.is_none() {
        match peer.next_frame() {
            Frame::RstStream(rst) if rst.stream_id == 1 => reset = Some(rst.error_code),
            Frame::MetaHeaders(h) if h.stream_id == 3 => {
                status = status_of(&h.fields).map(str::to_string);
            }
            Frame::Goaway(g) => panic!("unexpected GOAWAY {:?}", g),
            _ => {}
        }
    }
    assert_eq!(reset, Some(ErrorCode::ProtocolError));
    assert_eq!(status.as_deref(), Some("200"));
}

#[test]
fn test_data_on_idle_stream_is_connection_error() {
    init_tracing();
    let server = TestServer::start(ServerBuilder::new(), ok_handler);
    let mut peer = RawPeer::client(server.addr, Settings::default());
    peer.settle(&Settings::default());

    peer.writer.write_data(1, true, Bytes::from_static(b"nope"));
    peer.writer.flush().unwrap();

    let code = peer.read_until(|frame| match frame {
        Frame::Goaway(g) => Some(g.error_code),
        _ => None,
    });
    assert_eq!(code, ErrorCode::ProtocolError);
    match server.join() {
        Err(Error::Connection(e)) => assert_eq!(e.code, ErrorCode::ProtocolError),
        other => panic!("unexpected serve result {:?}", other),
    }
}

#[test]
fn test_first_frame_must_be_settings() {
    init_tracing();
    let server = TestServer::start(ServerBuilder::new(), ok_handler);
    let mut peer = RawPeer::connect(server.addr);
    peer.writer.write_ping(false, [0; 8]);
    peer.writer.flush().unwrap();

    let code = peer.read_until(|frame| match frame {
        Frame::Goaway(g) => Some(g.error_code),
        _ => None,
    });
    assert_eq!(code, ErrorCode::ProtocolError);
    assert!(server.join().is_err());
}

#[test]
fn test_ping_is_acknowledged_with_same_payload() {
    init_tracing();
    let server = TestServer::start(ServerBuilder::new(), ok_handler);
    let mut peer = RawPeer::client(server.addr, Settings::default());
    peer.settle(&Settings::default());

    let payload = *b"h2mux-pg";
    peer.writer.write_ping(false, payload);
    peer.writer.flush().unwrap();
    let echoed = peer.read_until(|frame| match frame {
        Frame::Ping(p) if p.ack => Some(p.data),
        _ => None,
    });
    assert_eq!(echoed, payload);
}

#[test]
fn test_excess_stream_refused_before_settings_ack() {
    init_tracing();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = std::sync::Mutex::new(release_rx);
    let server = TestServer::start(
        ServerBuilder::new().max_concurrent_streams(1),
        move |_req: ServerRequest, mut resp: ResponseWriter| {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            resp.write_all(b"ok").unwrap();
        },
    );
    let mut peer = RawPeer::client(server.addr, Settings::default());
    // Never acknowledge the server's SETTINGS.
    peer.send_request(1, "/a", true);
    peer.send_request(3, "/b", true);

    let code = peer.read_until(|frame| match frame {
        Frame::RstStream(rst) if rst.stream_id == 3 => Some(rst.error_code),
        _ => None,
    });
    assert_eq!(code, ErrorCode::RefusedStream);
    release_tx.send(()).unwrap();
}

#[test]
fn test_excess_stream_after_ack_is_protocol_error() {
    init_tracing();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let release_rx = std::sync::Mutex::new(release_rx);
    let server = TestServer::start(
        ServerBuilder::new().max_concurrent_streams(1),
        move |_req: ServerRequest, mut resp: ResponseWriter| {
            let _ = release_rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            resp.write_all(b"ok").unwrap();
        },
    );
    let mut peer = RawPeer::client(server.addr, Settings::default());
    peer.settle(&Settings::default());
    peer.send_request(1, "/a", true);
    peer.send_request(3, "/b", true);

    let code = peer.read_until(|frame| match frame {
        Frame::RstStream(rst) if rst.stream_id == 3 => Some(rst.error_code),
        _ => None,
    });
    assert_eq!(code, ErrorCode::ProtocolError);
    release_tx.send(()).unwrap();
}

#[test]
fn test_oversized_header_list_gets_431() {
    init_tracing();
    let server = TestServer::start(ServerBuilder::new().max_header_list_size(512), ok_handler);
    let mut peer = RawPeer::client(server.addr, Settings::default());
    peer.settle(&Settings::default());

    let mut fields = request_fields("GET", "/");
    fields.push(HeaderField::new("x-big", "v".repeat(2048)));
    peer.writer.write_headers(1, &fields, true, None);
    peer.writer.flush().unwrap();

    let (status, end_stream) = peer.read_until(|frame| match frame {
        Frame::MetaHeaders(h) if h.stream_id == 1 => {
            Some((status_of(&h.fields).map(str::to_string), h.end_stream))
        }
        _ => None,
    });
    assert_eq!(status.as_deref(), Some("431"));
    assert!(end_stream);
}

#[test]
fn test_stream_window_overrun_is_flow_control_error() {
    init_tracing();
    let server = TestServer::start(
        ServerBuilder::new().initial_window_size(16),
        |req: ServerRequest, _resp: ResponseWriter| {
            thread::sleep(Duration::from_millis(200));
            drop(req);
        },
    );
    let mut peer = RawPeer::client(server.addr, Settings::default());
    peer.settle(&Settings::default());

    peer.send_request(1, "/upload", false);
    peer.writer.write_data(1, false, Bytes::from(vec![0u8; 64]));
    peer.writer.flush().unwrap();

    let code = peer.read_until(|frame| match frame {
        Frame::Goaway(g) => Some(g.error_code),
        _ => None,
    });
    assert_eq!(code, ErrorCode::FlowControlError);
}

#[test]
fn test_response_finished_before_request_body_resets_no_error() {
    init_tracing();
    let server = TestServer::start(ServerBuilder::new(), ok_handler);
    let mut peer = RawPeer::client(server.addr, Settings::default());
    peer.settle(&Settings::default());

    peer.send_request(1, "/early", false);
    let code = peer.read_until(|frame| match frame {
        Frame::RstStream(rst) if rst.stream_id == 1 => Some(rst.error_code),
        _ => None,
    });
    assert_eq!(code, ErrorCode::NoError);

    // DATA racing the reset is dropped without a connection error.
    peer.writer.write_data(1, true, Bytes::from_static(b"late"));
    peer.send_request(3, "/next", true);
    let status = peer.read_until(|frame| match frame {
        Frame::MetaHeaders(h) if h.stream_id == 3 => status_of(&h.fields).map(str::to_string),
        Frame::Goaway(g) => panic!("unexpected GOAWAY {:?}", g),
        _ => None,
    });
    assert_eq!(status, "200");
}

#[test]
fn test_data_after_completed_stream_is_stream_closed() {
    init_tracing();
    let server = TestServer::start(ServerBuilder::new(), ok_handler);
    let mut peer = RawPeer::client(server.addr, Settings::default());
    peer.settle(&Settings::default());

    peer.send_request(1, "/", true);
    peer.read_until(|frame| match frame {
        Frame::Data(d) if d.stream_id == 1 && d.end_stream => Some(()),
        _ => None,
    });

    peer.writer.write_data(1, false, Bytes::from_static(b"late"));
    peer.writer.flush().unwrap();
    let code = peer.read_until(|frame| match frame {
        Frame::RstStream(rst) if rst.stream_id == 1 => Some(rst.error_code),
        Frame::Goaway(g) => panic!("unexpected GOAWAY {:?}", g),
        _ => None,
    });
    assert_eq!(code, ErrorCode::StreamClosed);
}

#[test]
fn test_request_body_reaches_handler() {
    init_tracing();
    let (body_tx, body_rx) = mpsc::channel();
    let body_tx = std::sync::Mutex::new(body_tx);
    let server = TestServer::start(ServerBuilder::new(), move |req: ServerRequest, mut resp: ResponseWriter| {
        let mut body = req.into_body();
        let mut buf = Vec::new();
        body.read_to_end(&mut buf).unwrap();
        let trailers = body.trailers();
        body_tx.lock().unwrap().send((buf, trailers)).unwrap();
        resp.set_status(204);
    });
    let mut peer = RawPeer::client(server.addr, Settings::default());
    peer.settle(&Settings::default());

    let mut fields = request_fields("POST", "/in");
    fields.push(HeaderField::new("content-length", "5"));
    peer.writer.write_headers(1, &fields, false, None);
    peer.writer.write_data(1, false, Bytes::from_static(b"hel"));
    peer.writer.write_data(1, false, Bytes::from_static(b"lo"));
    peer.writer
        .write_headers(1, &[HeaderField::new("x-sum", "5")], true, None);
    peer.writer.flush().unwrap();

    let (body, trailers) = body_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(body, b"hello");
    assert_eq!(trailers, Some(vec![HeaderField::new("x-sum", "5")]));

    let status = peer.read_until(|frame| match frame {
        Frame::MetaHeaders(h) if h.stream_id == 1 => status_of(&h.fields).map(str::to_string),
        _ => None,
    });
    assert_eq!(status, "204");
}

#[test]
fn test_content_length_mismatch_resets_stream() {
    init_tracing();
    let server = TestServer::start(ServerBuilder::new(), |req: ServerRequest, _resp: ResponseWriter| {
        let _ = req.into_body().read_to_bytes();
    });
    let mut peer = RawPeer::client(server.addr, Settings::default());
    peer.settle(&Settings::default());

    let mut fields = request_fields("POST", "/in");
    fields.push(HeaderField::new("content-length", "2"));
    peer.writer.write_headers(1, &fields, false, None);
    peer.writer.write_data(1, true, Bytes::from_static(b"abc"));
    peer.writer.flush().unwrap();

    let code = peer.read_until(|frame| match frame {
        Frame::RstStream(rst) if rst.stream_id == 1 => Some(rst.error_code),
        _ => None,
    });
    assert_eq!(code, ErrorCode::ProtocolError);
}

#[test]
fn test_server_immediate_shutdown_sends_goaway() {
    init_tracing();
    let server = TestServer::start(
        ServerBuilder::new().abrupt_close_delay(Duration::from_millis(50)),
        ok_handler,
    );
    let mut peer = RawPeer::client(server.addr, Settings::default());
    peer.settle(&Settings::default());
    peer.send_request(1, "/", true);
    peer.read_until(|frame| match frame {
        Frame::Data(d) if d.stream_id == 1 && d.end_stream => Some(()),
        _ => None,
    });

    server.handle().shutdown();
    let (last, code) = peer.read_until(|frame| match frame {
        Frame::Goaway(g) => Some((g.last_stream_id, g.error_code)),
        _ => None,
    });
    assert_eq!(last, 1);
    assert_eq!(code, ErrorCode::NoError);
    server.join().unwrap();
}

#[test]
fn test_idle_close_sends_goaway_before_eof() {
    init_tracing();
    let server = TestServer::start(
        ServerBuilder::new().idle_timeout(Duration::from_millis(200)),
        ok_handler,
    );
    let mut peer = RawPeer::client(server.addr, Settings::default());
    peer.settle(&Settings::default());

    let (last, code) = peer.read_until(|frame| match frame {
        Frame::Goaway(g) => Some((g.last_stream_id, g.error_code)),
        _ => None,
    });
    assert_eq!(last, 0);
    assert_eq!(code, ErrorCode::NoError);

    // Nothing follows the GOAWAY but the end of the stream.
    loop {
        match peer.reader.read_frame() {
            Ok(Frame::Ping(_)) | Ok(Frame::Settings(_)) => {}
            Ok(other) => panic!("unexpected frame after GOAWAY {:?}", other),
            Err(_) => break,
        }
    }
    server.join().unwrap();
}

// ---- client under test ----

#[test]
fn test_get_against_raw_server() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept(&listener);
        peer.settle(&Settings::default());
        let (id, end_stream) = peer.read_until(|frame| match frame {
            Frame::MetaHeaders(h) => Some((h.stream_id, h.end_stream)),
            _ => None,
        });
        assert_eq!(id, 1);
        assert!(end_stream);
        peer.send_response(1, 200, b"abc");
        peer
    });

    let conn = common::connect_with(addr, ClientBuilder::new());
    let response = conn.round_trip(Request::get(&format!("http://{}/", addr))).unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(&response.into_body().read_to_bytes().unwrap()[..], b"abc");
    let _peer = server.join().unwrap();
}

#[test]
fn test_malformed_headers_on_idle_stream_is_connection_error() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept(&listener);
        peer.settle(&Settings::default());
        peer.read_until(|frame| match frame {
            Frame::MetaHeaders(h) if h.stream_id == 1 => Some(()),
            _ => None,
        });

        // Literal without indexing, uppercase name "X-A": a stream error, but
        // stream 9 was never opened by the client.
        let block = [0x00, 0x03, b'X', b'-', b'A', 0x01, b'1'];
        let mut buf = BytesMut::new();
        FrameCodec::encode_headers_frame(
            &mut buf,
            &HeadersFrame::new(9, Bytes::copy_from_slice(&block), true, true),
        );
        let mut raw: &TcpStream = peer.writer.get_ref();
        raw.write_all(&buf).unwrap();

        peer.read_until(|frame| match frame {
            Frame::Goaway(g) => Some(g.error_code),
            _ => None,
        })
    });

    let conn = common::connect_with(addr, ClientBuilder::new());
    let err = conn
        .round_trip(Request::get(&format!("http://{}/", addr)))
        .unwrap_err();
    assert_eq!(err.connection_code(), Some(ErrorCode::ProtocolError));
    assert_eq!(server.join().unwrap(), ErrorCode::ProtocolError);
    assert!(!conn.can_take_new_request());
}

#[test]
fn test_goaway_fails_streams_above_last_id() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept(&listener);
        peer.settle(&Settings::default());
        loop {
            let id = peer.read_until(|frame| match frame {
                Frame::MetaHeaders(h) => Some(h.stream_id),
                _ => None,
            });
            if id < 7 {
                peer.send_response(id, 200, b"x");
                continue;
            }
            peer.writer.write_goaway(5, ErrorCode::NoError, Bytes::new());
            peer.writer.flush().unwrap();
            return peer;
        }
    });

    let conn = common::connect_with(addr, ClientBuilder::new());
    let url = format!("http://{}/", addr);
    for _ in 0..3 {
        let response = conn.round_trip(Request::get(&url)).unwrap();
        response.into_body().read_to_bytes().unwrap();
    }
    let failure = conn.try_round_trip(Request::get(&url)).unwrap_err();
    match &failure.error {
        Error::GoAway(e) => {
            assert_eq!(e.last_stream_id, 5);
            assert!(e.unprocessed);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(failure.error.is_retryable_unstarted());
    assert!(!conn.can_take_new_request());
    let err = conn.round_trip(Request::get(&url)).unwrap_err();
    assert!(matches!(err, Error::NoReusableConnection));
    let _peer = server.join().unwrap();
}

#[test]
fn test_blocked_body_resumes_on_exact_window_update() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (settled_tx, settled_rx) = mpsc::channel();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept(&listener);
        let settings = Settings {
            initial_window_size: Some(10),
            ..Settings::default()
        };
        // The client's ACK means it applied the 10-byte window.
        peer.settle(&settings);
        settled_tx.send(()).unwrap();

        let mut received = Vec::new();
        let mut updates = 0;
        loop {
            if let Frame::Data(d) = peer.next_frame() {
                received.extend_from_slice(&d.data);
                if d.end_stream {
                    break;
                }
                if received.len() == 10 {
                    // Exactly what the client still needs.
                    peer.writer.write_window_update(d.stream_id, 5);
                    peer.writer.flush().unwrap();
                    updates += 1;
                }
            }
        }
        peer.send_response(1, 200, b"");
        (received, updates)
    });

    let conn = common::connect_with(addr, ClientBuilder::new());
    settled_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let response = conn
        .round_trip(Request::post(&format!("http://{}/up", addr), "0123456789abcde"))
        .unwrap();
    assert_eq!(response.status(), 200);
    let (received, updates) = server.join().unwrap();
    assert_eq!(received, b"0123456789abcde");
    assert_eq!(updates, 1);
}

#[test]
fn test_refused_stream_is_retried_on_new_connection() {
    init_tracing();
    use h2mux::h2::{ClientConn, RetryPolicy, RetryingClient};
    use std::sync::atomic::{AtomicUsize, Ordering};

    let refusing = TcpListener::bind("127.0.0.1:0").unwrap();
    let refusing_addr = refusing.local_addr().unwrap();
    let refuser = thread::spawn(move || {
        let mut peer = RawPeer::accept(&refusing);
        peer.settle(&Settings::default());
        let id = peer.read_until(|frame| match frame {
            Frame::MetaHeaders(h) => Some(h.stream_id),
            _ => None,
        });
        peer.writer.write_rst_stream(id, ErrorCode::RefusedStream);
        peer.writer.flush().unwrap();
        peer
    });
    let good = TestServer::start(ServerBuilder::new(), ok_handler);
    let good_addr = good.addr;

    let calls = AtomicUsize::new(0);
    let client = RetryingClient::new(
        move || -> h2mux::h2::Result<ClientConn> {
            let addr = if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                refusing_addr
            } else {
                good_addr
            };
            Ok(common::connect_with(addr, ClientBuilder::new()))
        },
        RetryPolicy::immediate(2),
    );

    let response = client.round_trip(Request::post("http://localhost/r", "payload")).unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(&response.into_body().read_to_bytes().unwrap()[..], b"ok");
    let _peer = refuser.join().unwrap();
}

#[test]
fn test_response_header_timeout() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let mut peer = RawPeer::accept(&listener);
        peer.settle(&Settings::default());
        peer.read_until(|frame| match frame {
            Frame::RstStream(rst) => Some(rst.error_code),
            _ => None,
        })
    });

    let conn = common::connect_with(
        addr,
        ClientBuilder::new().response_header_timeout(Duration::from_millis(100)),
    );
    let err = conn.round_trip(Request::get(&format!("http://{}/", addr))).unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(server.join().unwrap(), ErrorCode::Cancel);
}
