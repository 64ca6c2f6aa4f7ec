//! Performance benchmarks for finguard's hot paths: key generation, the
//! WireGuard UAPI encode/decode round trip, and proxy host-routing lookup.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use finguard::config::ServiceConfig;
use finguard::proxy::{ProxyServer, Service};
use finguard::wireguard::uapi::{encode_set, parse_set, DeviceSet, PeerSet};
use finguard::wireguard::KeyPair;

fn bench_key_generation(c: &mut Criterion) {
    c.bench_function("key_generation", |b| {
        b.iter(KeyPair::generate);
    });
}

fn bench_public_key_derivation(c: &mut Criterion) {
    let keypair = KeyPair::generate();

    c.bench_function("public_key_derivation", |b| {
        b.iter(|| black_box(&keypair.private).public_key());
    });
}

fn sample_device_set(peer_count: usize) -> DeviceSet {
    DeviceSet {
        private_key: Some("a".repeat(64)),
        listen_port: Some(51820),
        replace_peers: true,
        peers: (0..peer_count)
            .map(|i| PeerSet {
                public_key: format!("{:064x}", i),
                endpoint: Some(format!("10.0.0.{}:51820", i % 255)),
                persistent_keepalive_interval: Some(25),
                replace_allowed_ips: true,
                allowed_ips: vec![format!("10.8.{}.0/24", i % 255)],
                ..Default::default()
            })
            .collect(),
    }
}

fn bench_uapi_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("uapi_encode");
    for peer_count in [1, 10, 50].iter() {
        let set = sample_device_set(*peer_count);
        group.bench_with_input(BenchmarkId::from_parameter(peer_count), &set, |b, set| {
            b.iter(|| encode_set(black_box(set)));
        });
    }
    group.finish();
}

fn bench_uapi_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("uapi_decode");
    for peer_count in [1, 10, 50].iter() {
        let wire = encode_set(&sample_device_set(*peer_count));
        group.bench_with_input(BenchmarkId::from_parameter(peer_count), &wire, |b, wire| {
            b.iter(|| parse_set(black_box(wire)).unwrap());
        });
    }
    group.finish();
}

fn service_config(name: &str) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        upstream: "http://10.0.0.5:8096".to_string(),
        websocket: false,
        default: name == "default-svc",
        publish_mdns: false,
        jellyfin: false,
        tunnel: None,
    }
}

fn bench_proxy_host_routing(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let proxy = ProxyServer::new();

    rt.block_on(async {
        for i in 0..50 {
            let cfg = service_config(&format!("svc{}", i));
            proxy.add_service(Service::from_config(&cfg).unwrap()).await;
        }
        proxy
            .add_service(Service::from_config(&service_config("default-svc")).unwrap())
            .await;
    });

    let mut group = c.benchmark_group("proxy_host_routing");

    group.bench_function("lookup_existing_service", |b| {
        b.iter(|| {
            rt.block_on(async { proxy.get_service(black_box("svc25")).await });
        });
    });

    group.bench_function("lookup_missing_falls_through", |b| {
        b.iter(|| {
            rt.block_on(async { proxy.get_service(black_box("no-such-service")).await });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_key_generation,
    bench_public_key_derivation,
    bench_uapi_encode,
    bench_uapi_decode,
    bench_proxy_host_routing,
);

criterion_main!(benches);
