use criterion::{Criterion, black_box, criterion_group, criterion_main};
use onet::{
    Addr, AnyTransport, OverlayNetwork, Protocol, register_protocols, register_transports,
    test_utils::{MemoryMux, MemoryTransport, TagTransport},
};

fn setup() {
    register_protocols([
        Protocol::new("kcp").with_native(true),
        Protocol::new("tls"),
        Protocol::new("mux"),
    ])
    .unwrap();
    register_transports([
        AnyTransport::native(MemoryTransport::new("kcp")),
        AnyTransport::overlay(TagTransport::new("tls")),
        AnyTransport::mux(MemoryMux::new("mux")),
    ])
    .unwrap();
}

pub fn resolve(c: &mut Criterion) {
    setup();
    let text = "/ip/127.0.0.1/udp/1812/kcp/tls/mux";
    let addr: Addr = text.parse().unwrap();

    let mut group = c.benchmark_group("resolve");
    group.bench_function("parse_addr", |b| {
        b.iter(|| black_box(black_box(text).parse::<Addr>().unwrap()))
    });
    group.bench_function("overlay_network", |b| {
        b.iter(|| black_box(OverlayNetwork::parse(black_box(&addr), []).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, resolve);
criterion_main!(benches);
