//! SOCKS5 codec benchmarks.
//!
//! Measures request parsing and reply encoding, the only per-connection
//! work the handshake does besides the upstream connect.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use socks5_relay::proxy::codec::{
    build_reply, parse_method_request, parse_request, Reply, ATYP_IPV4,
};
use std::net::{Ipv4Addr, SocketAddrV4};

fn ipv4_request() -> Vec<u8> {
    vec![0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB]
}

fn domain_request(host: &str) -> Vec<u8> {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&443u16.to_be_bytes());
    request
}

fn bench_parse_method_request(c: &mut Criterion) {
    let offer = [0x05, 0x03, 0x00, 0x01, 0x02];

    let mut group = c.benchmark_group("parse_method_request");
    group.throughput(Throughput::Bytes(offer.len() as u64));

    group.bench_function("three_methods", |b| {
        b.iter(|| black_box(parse_method_request(black_box(&offer))))
    });

    group.finish();
}

fn bench_parse_request(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_request");

    let ipv4 = ipv4_request();
    group.throughput(Throughput::Bytes(ipv4.len() as u64));
    group.bench_function("ipv4", |b| {
        b.iter(|| black_box(parse_request(black_box(&ipv4))))
    });

    for host in ["example.com", "a-much-longer-subdomain.cdn.example.org"] {
        let request = domain_request(host);
        group.throughput(Throughput::Bytes(request.len() as u64));
        group.bench_function(format!("domain_{}", host.len()), |b| {
            b.iter(|| black_box(parse_request(black_box(&request))))
        });
    }

    group.finish();
}

fn bench_build_reply(c: &mut Criterion) {
    let bound = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 8080);

    let mut group = c.benchmark_group("build_reply");

    group.bench_function("success", |b| {
        b.iter(|| black_box(build_reply(Reply::Succeeded, ATYP_IPV4, Some(bound))))
    });

    group.bench_function("error", |b| {
        b.iter(|| black_box(build_reply(Reply::CommandNotSupported, ATYP_IPV4, None)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_parse_method_request,
    bench_parse_request,
    bench_build_reply
);
criterion_main!(benches);
