use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;
use webmitm_core::message::{parse_request_line, parse_status_line};
use webmitm_core::tlspeek::parse_client_hello;

/// Helper to build a valid TLS ClientHello with SNI
fn build_client_hello_with_sni(domain: &str) -> Vec<u8> {
    let domain_bytes = domain.as_bytes();
    let domain_len = domain_bytes.len() as u16;

    let sni_list_len = 3 + domain_len;
    let sni_ext_len = 2 + sni_list_len;
    let extensions_len = 4 + sni_ext_len;
    let handshake_len = 2 + 32 + 1 + 2 + 2 + 2 + 2 + extensions_len;
    let record_len = 4 + handshake_len;

    let mut record = vec![
        0x16,
        0x03,
        0x03,
        (record_len >> 8) as u8,
        (record_len & 0xff) as u8,
        0x01,
        ((handshake_len as u32) >> 16) as u8,
        (handshake_len >> 8) as u8,
        (handshake_len & 0xff) as u8,
        0x03,
        0x03,
    ];
    record.extend_from_slice(&[0; 32]);
    record.extend_from_slice(&[
        0x00,
        0x00,
        0x02,
        0x00,
        0x00,
        0x01,
        0x00,
        (extensions_len >> 8) as u8,
        (extensions_len & 0xff) as u8,
        0x00,
        0x00,
        (sni_ext_len >> 8) as u8,
        (sni_ext_len & 0xff) as u8,
        (sni_list_len >> 8) as u8,
        (sni_list_len & 0xff) as u8,
        0x00,
        (domain_len >> 8) as u8,
        (domain_len & 0xff) as u8,
    ]);
    record.extend_from_slice(domain_bytes);
    record
}

fn bench_request_line(c: &mut Criterion) {
    let lines = [
        "GET /index.html HTTP/1.1",
        "GET http://example.test:8080/deep/path/resource?q=1 HTTP/1.1",
        "CONNECT api.example.test:443 HTTP/1.1",
    ];

    let mut group = c.benchmark_group("request_line");
    for line in lines {
        group.bench_with_input(BenchmarkId::from_parameter(line.len()), line, |b, line| {
            b.iter(|| parse_request_line(black_box(line)));
        });
    }
    group.finish();
}

fn bench_status_line(c: &mut Criterion) {
    c.bench_function("status_line", |b| {
        b.iter(|| parse_status_line(black_box("HTTP/1.1 407 Proxy Authentication Required")));
    });
}

fn bench_client_hello(c: &mut Criterion) {
    let domains = ["a.io", "api.example.test", "very.long.subdomain.chain.example.test"];

    let mut group = c.benchmark_group("client_hello");
    for domain in domains {
        let record = build_client_hello_with_sni(domain);
        group.bench_with_input(
            BenchmarkId::from_parameter(domain.len()),
            &record,
            |b, record| {
                b.iter(|| parse_client_hello(black_box(record)));
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_request_line,
    bench_status_line,
    bench_client_hello
);
criterion_main!(benches);
