//! HTTP/2 performance benchmarks
//!
//! Measures:
//! - frame encoding and decoding through the codec
//! - HPACK round trips for a typical request header list
//! - write scheduling across many weighted streams
//! - flow-control window accounting
//! - request/response round trips over loopback TCP
//!
//! Run with: cargo bench --bench h2_performance

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use h2mux::h2::codec::{FrameCodec, FrameReader, FrameWriter};
use h2mux::h2::flow_control::{self, FlowControlWindow, InflowWindow};
use h2mux::h2::frames::{DataFrame, FrameFlags, FrameType, PrioritySpec};
use h2mux::h2::scheduler::{
    FrameWriteRequest, PrioritySchedulerConfig, PriorityWriteScheduler, SendCredit, WriteFrame,
    WriteScheduler,
};
use h2mux::h2::{
    ClientBuilder, HeaderField, Request, ResponseWriter, ServerBuilder, ServerRequest, StreamId,
    DEFAULT_MAX_FRAME_SIZE,
};
use std::io::{Cursor, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

fn request_fields() -> Vec<HeaderField> {
    vec![
        HeaderField::new(":method", "GET"),
        HeaderField::new(":scheme", "https"),
        HeaderField::new(":authority", "example.com"),
        HeaderField::new(":path", "/api/v1/items?page=2"),
        HeaderField::new("user-agent", "h2mux-bench/0.1"),
        HeaderField::new("accept", "application/json"),
        HeaderField::new("accept-encoding", "gzip, deflate, br"),
        HeaderField::new("cookie", "session=0123456789abcdef; theme=dark"),
    ]
}

// ========== Codec ==========

fn bench_frame_header(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_header");

    group.bench_function("encode", |b| {
        let mut buf = BytesMut::with_capacity(64);
        b.iter(|| {
            buf.clear();
            FrameCodec::encode_header(
                &mut buf,
                black_box(FrameType::Data),
                black_box(FrameFlags::from_u8(0x01)),
                black_box(1),
                black_box(1024),
            );
            black_box(&buf);
        });
    });

    let mut encoded = BytesMut::new();
    FrameCodec::encode_header(&mut encoded, FrameType::Headers, FrameFlags::from_u8(0x05), 1, 4096);
    let mut header = [0u8; 9];
    header.copy_from_slice(&encoded[..9]);
    group.bench_function("decode", |b| {
        b.iter(|| black_box(FrameCodec::decode_header(black_box(&header))));
    });

    group.finish();
}

fn bench_data_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_frame");

    for size in [1024usize, 16384] {
        let payload = Bytes::from(vec![0u8; size]);
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("encode", size), &payload, |b, payload| {
            let mut buf = BytesMut::with_capacity(size + 16);
            b.iter(|| {
                buf.clear();
                let frame = DataFrame::new(1, payload.clone(), false);
                FrameCodec::encode_data_frame(&mut buf, black_box(&frame));
                black_box(&buf);
            });
        });

        let mut wire = BytesMut::new();
        for _ in 0..64 {
            FrameCodec::encode_data_frame(&mut wire, &DataFrame::new(1, payload.clone(), false));
        }
        let wire = wire.freeze();
        group.bench_with_input(BenchmarkId::new("read_64", size), &wire, |b, wire| {
            b.iter(|| {
                let mut reader = FrameReader::new(Cursor::new(wire.clone()), 1 << 16);
                for _ in 0..64 {
                    black_box(reader.read_frame().unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_header_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("header_block");
    let fields = request_fields();

    group.bench_function("encode", |b| {
        let mut writer = FrameWriter::new(std::io::sink());
        b.iter(|| {
            writer.write_headers(1, black_box(&fields), true, None);
            writer.flush().unwrap();
        });
    });

    // Same encoder for the whole batch so the dynamic table is exercised.
    let mut writer = FrameWriter::new(Vec::new());
    for i in 0..100u32 {
        writer.write_headers(i * 2 + 1, &fields, true, None);
    }
    writer.flush().unwrap();
    let wire = Bytes::copy_from_slice(writer.get_ref());
    group.bench_function("decode_100", |b| {
        b.iter(|| {
            let mut reader = FrameReader::new(Cursor::new(wire.clone()), 1 << 16);
            for _ in 0..100 {
                black_box(reader.read_frame().unwrap());
            }
        });
    });

    group.finish();
}

// ========== Scheduling ==========

struct Unlimited;

impl SendCredit for Unlimited {
    fn available(&self, _stream: StreamId) -> i32 {
        i32::MAX
    }

    fn take(&mut self, _stream: StreamId, _n: u32) {}

    fn max_frame_size(&self) -> u32 {
        DEFAULT_MAX_FRAME_SIZE
    }
}

fn bench_priority_scheduler(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_scheduler");
    let chunk = Bytes::from(vec![0u8; 4096]);

    for streams in [10u32, 100] {
        group.bench_with_input(BenchmarkId::new("push_pop", streams), &streams, |b, &streams| {
            b.iter(|| {
                let mut ws = PriorityWriteScheduler::new(PrioritySchedulerConfig::default());
                for i in 0..streams {
                    let id = i * 2 + 1;
                    ws.open_stream(id);
                    ws.adjust_stream(
                        id,
                        PrioritySpec {
                            stream_dependency: if i % 4 == 0 { 0 } else { id - 2 },
                            exclusive: false,
                            weight: (i % 256) as u8,
                        },
                    );
                    for _ in 0..4 {
                        ws.push(FrameWriteRequest::stream(
                            id,
                            WriteFrame::Data {
                                data: chunk.clone(),
                                end_stream: false,
                            },
                        ));
                    }
                }
                let mut credit = Unlimited;
                while let Some(wr) = ws.pop(&mut credit) {
                    black_box(wr);
                }
            });
        });
    }

    group.finish();
}

// ========== Flow control ==========

fn bench_flow_control(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_control");

    group.bench_function("send_cycle", |b| {
        let mut conn = FlowControlWindow::default();
        let mut stream = FlowControlWindow::default();
        b.iter(|| {
            let n = flow_control::sendable(&stream, &conn).min(1024);
            stream.take(n).unwrap();
            conn.take(n).unwrap();
            stream.add(n as i32).unwrap();
            conn.add(n as i32).unwrap();
        });
    });

    group.bench_function("receive_cycle", |b| {
        let mut conn = InflowWindow::new(1 << 20);
        let mut stream = InflowWindow::new(1 << 20);
        b.iter(|| {
            flow_control::take_inflows(&mut conn, &mut stream, 1024).unwrap();
            black_box(conn.add(1024).unwrap());
            black_box(stream.add(1024).unwrap());
        });
    });

    group.finish();
}

// ========== Loopback round trips ==========

fn bench_round_trips(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_trip");
    group.sample_size(20);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let (conn, _handle) = ServerBuilder::new()
            .build(stream, |req: ServerRequest, mut resp: ResponseWriter| {
                let size: usize = req.header("x-size").and_then(|v| v.parse().ok()).unwrap_or(0);
                let _ = resp.write_all(&vec![b'x'; size]);
            })
            .unwrap();
        let _ = conn.serve();
    });
    let conn = ClientBuilder::new()
        .handshake(TcpStream::connect(addr).unwrap())
        .unwrap();
    let url = format!("http://{}/", addr);

    for size in [0usize, 64 << 10, 1 << 20] {
        group.throughput(Throughput::Bytes(size.max(1) as u64));
        group.bench_with_input(BenchmarkId::new("get", size), &size, |b, &size| {
            b.iter(|| {
                let response = conn
                    .round_trip(Request::get(&url).header("x-size", size.to_string()))
                    .unwrap();
                black_box(response.into_body().read_to_bytes().unwrap());
            });
        });
    }

    group.bench_function("parallel_16", |b| {
        b.iter(|| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    let conn = conn.clone();
                    let url = url.clone();
                    thread::spawn(move || {
                        let response = conn.round_trip(Request::get(&url)).unwrap();
                        response.into_body().read_to_bytes().unwrap()
                    })
                })
                .collect();
            for worker in workers {
                black_box(worker.join().unwrap());
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_header,
    bench_data_frames,
    bench_header_blocks,
    bench_priority_scheduler,
    bench_flow_control,
    bench_round_trips,
);
criterion_main!(benches);
