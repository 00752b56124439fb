// ABOUTME: Benchmark suite for dispatch and framing performance
// ABOUTME: Measures router dispatch under middleware and the frame/codec round trip

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use gantry::{
    frame, handlers, recovery, BinaryCodec, Codec, Context, Envelope, Request, ResponseWriter,
    Router,
};

fn sample_request(type_url: &str) -> Request {
    Request {
        type_url: type_url.to_string(),
        data: Bytes::from_static(b"Ping"),
        remote_addr: None,
    }
}

fn run_dispatch(c: &mut Criterion, name: &str, router: &Router, type_url: &str) {
    let codec: Arc<dyn Codec> = Arc::new(BinaryCodec);
    let request = sample_request(type_url);

    c.bench_function(name, |b| {
        b.iter(|| {
            let mut writer = ResponseWriter::new(BytesMut::new(), codec.clone());
            router.serve_proto(&mut writer, black_box(&request));
        })
    });
}

fn bench_one_route(c: &mut Criterion) {
    let mut router = Router::new();
    router.handle("pb.Ping", handlers![|_c: &mut Context<'_>| {}]);
    run_dispatch(c, "dispatch_one_route", &router, "pb.Ping");
}

fn bench_with_recovery(c: &mut Criterion) {
    let mut router = Router::new();
    router.use_middleware(vec![recovery()]);
    router.handle("pb.Ping", handlers![|_c: &mut Context<'_>| {}]);
    run_dispatch(c, "dispatch_with_recovery", &router, "pb.Ping");
}

fn bench_many_handlers(c: &mut Criterion) {
    let mut router = Router::new();
    router.use_middleware(vec![recovery()]);
    router.use_middleware(handlers![|_c: &mut Context<'_>| {}]);
    router.use_middleware(handlers![|_c: &mut Context<'_>| {}]);
    router.handle("pb.Ping", handlers![|_c: &mut Context<'_>| {}]);
    run_dispatch(c, "dispatch_many_handlers", &router, "pb.Ping");
}

fn bench_route_with_set(c: &mut Criterion) {
    let mut router = Router::new();
    router.handle(
        "pb.Ping",
        handlers![|c: &mut Context<'_>| {
            c.set("hello", "world");
        }],
    );
    run_dispatch(c, "dispatch_with_set", &router, "pb.Ping");
}

fn bench_decode_and_encode(c: &mut Criterion) {
    let mut router = Router::new();
    router.handle(
        "pb.Ping",
        handlers![|c: &mut Context<'_>| {
            let body = c.data().to_vec();
            let _ = c.write_any("pb.Ping", body);
        }],
    );
    run_dispatch(c, "dispatch_decode_encode", &router, "pb.Ping");
}

fn bench_frame_roundtrip(c: &mut Criterion) {
    let codec = BinaryCodec;
    let envelope = Envelope::new("pb.Ping", Bytes::from_static(b"Hello World"));

    c.bench_function("frame_write_and_check", |b| {
        b.iter(|| {
            let mut wire = Vec::with_capacity(64);
            frame::write_frame(&mut wire, black_box(&envelope), &codec).unwrap();
            let fh = frame::check(&wire).unwrap().unwrap();
            let decoded = codec
                .decode(&wire[frame::FRAME_HEADER_LEN..frame::FRAME_HEADER_LEN + fh.length as usize])
                .unwrap();
            black_box(decoded);
        })
    });
}

fn bench_codec_roundtrip(c: &mut Criterion) {
    let codec = BinaryCodec;
    let envelope = Envelope::new("pb.Ping", Bytes::from_static(b"Hello World"));

    c.bench_function("binary_codec_roundtrip", |b| {
        b.iter(|| {
            let wire = codec.encode(black_box(&envelope)).unwrap();
            black_box(codec.decode(&wire).unwrap());
        })
    });
}

fn configure() -> Criterion {
    Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(200)
}

criterion_group! {
    name = benches;
    config = configure();
    targets = bench_one_route,
        bench_with_recovery,
        bench_many_handlers,
        bench_route_with_set,
        bench_decode_and_encode,
        bench_frame_roundtrip,
        bench_codec_roundtrip
}
criterion_main!(benches);
