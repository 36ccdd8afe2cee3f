use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use hivecache::lru::LruStore;
use hivecache::request::Request;
use hivecache::response::Response;
use hivecache::ring::HashRing;

fn request_benchmarks(c: &mut Criterion) {
    c.bench_function("parse simple request", |b| {
        b.iter(|| {
            let request = BytesMut::from("*3\r\n$9\r\nCACHE.GET\r\n$6\r\nscores\r\n$3\r\nTom\r\n");
            Request::parse(black_box(&request)).unwrap();
        })
    });

    c.bench_function("parse partial request", |b| {
        b.iter(|| {
            let request = BytesMut::from("*3\r\n$9\r\nCACHE.GET\r\n$6\r\nsco");
            Request::parse(black_box(&request)).unwrap();
        })
    });

    c.bench_function("parse short partial request", |b| {
        b.iter(|| {
            let request = BytesMut::from("*3\r");
            Request::parse(black_box(&request)).unwrap();
        })
    });
}

fn response_benchmarks(c: &mut Criterion) {
    c.bench_function("build bulk response", |b| {
        b.iter(|| {
            let mut response = Response::new();
            response.bulk_bytes(black_box(b"some cached payload"));
            black_box(response.complete());
        })
    });

    c.bench_function("build error response", |b| {
        b.iter(|| {
            let mut response = Response::new();
            response.error(black_box("CLIENT: Unknown group: scores"));
            black_box(response.complete());
        })
    });
}

fn lru_benchmarks(c: &mut Criterion) {
    c.bench_function("put into a bounded store", |b| {
        let mut store = LruStore::new(1024 * 1024);
        let mut index = 0_u64;
        b.iter(|| {
            index += 1;
            store.put(format!("key-{}", index % 10_000), "X".repeat(64));
        })
    });

    c.bench_function("get from a bounded store", |b| {
        let mut store = LruStore::new(1024 * 1024);
        for index in 0..1_000 {
            store.put(format!("key-{}", index), "X".repeat(64));
        }
        let mut index = 0_u64;
        b.iter(|| {
            index += 1;
            black_box(store.get(&format!("key-{}", index % 1_000)));
        })
    });
}

fn ring_benchmarks(c: &mut Criterion) {
    c.bench_function("pick an owner from the ring", |b| {
        let mut ring = HashRing::new(50);
        ring.add(&["10.0.0.1:2610", "10.0.0.2:2610", "10.0.0.3:2610"]);
        let mut index = 0_u64;
        b.iter(|| {
            index += 1;
            black_box(ring.get(&format!("key-{}", index)));
        })
    });
}

criterion_group!(
    benches,
    request_benchmarks,
    response_benchmarks,
    lru_benchmarks,
    ring_benchmarks
);
criterion_main!(benches);
