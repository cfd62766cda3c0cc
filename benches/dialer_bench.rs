//! Benchmarks for the dialer hot paths.
//!
//! Round-robin selection and cache lookups run on every cached dial, so they
//! are measured on their own; the TCP dial benchmark measures a full dial
//! against a local listener with and without the DNS cache.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

use vdial::Dialer;
use vdial::addr;
use vdial::cache::Cache;
use vdial::config::{with_dialer_timeout, with_enable_dns_cache};
use vdial::dns::DialerCacheEntry;

const HOSTS: usize = 1024;

fn bench_round_robin(c: &mut Criterion) {
    let mut group = c.benchmark_group("round_robin");
    group.throughput(Throughput::Elements(1));

    for len in [1usize, 3, 16] {
        let ips = (0..len).map(|i| format!("10.0.0.{}", i + 1)).collect();
        let entry = DialerCacheEntry::new(ips).unwrap();
        group.bench_function(BenchmarkId::new("ip", len), |b| {
            b.iter(|| black_box(entry.ip()).len())
        });
    }

    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let cache: Cache<Arc<DialerCacheEntry>> =
        Cache::new(Duration::from_secs(3600), Duration::from_secs(60));
    let hosts: Vec<String> = (0..HOSTS).map(|i| format!("svc-{i}.vald.svc")).collect();
    for host in &hosts {
        let entry = DialerCacheEntry::new(vec!["10.0.0.1".to_string()]).unwrap();
        cache.set(host.as_str(), Arc::new(entry));
    }

    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_hit", |b| {
        let mut rng = rand::rng();
        b.iter(|| {
            let host = &hosts[rng.random_range(0..HOSTS)];
            black_box(cache.get(host))
        })
    });

    group.bench_function("get_miss", |b| {
        b.iter(|| black_box(cache.get(black_box("missing.vald.svc"))))
    });

    group.bench_function("set", |b| {
        let mut rng = rand::rng();
        b.iter(|| {
            let host = &hosts[rng.random_range(0..HOSTS)];
            let entry = DialerCacheEntry::new(vec!["10.0.0.2".to_string()]).unwrap();
            cache.set(host.as_str(), Arc::new(entry));
        })
    });

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("addr");

    for input in ["vald-lb-gateway:8081", "10.0.0.1:8081", "[fd00::1]:8081", "::1"] {
        group.bench_function(BenchmarkId::new("parse", input), |b| {
            b.iter(|| addr::parse(black_box(input)))
        });
    }

    group.finish();
}

fn bench_dial(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
    let port = listener.local_addr().unwrap().port();
    rt.spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });

    let mut group = c.benchmark_group("dial");
    group.throughput(Throughput::Elements(1));

    let plain = Dialer::new([with_dialer_timeout("1s")]).unwrap();
    let target = format!("127.0.0.1:{port}");
    group.bench_function("tcp_ip", |b| {
        b.to_async(&rt)
            .iter(|| async { plain.dial_context("tcp", &target).await.unwrap() })
    });

    let cached = Dialer::new([with_dialer_timeout("1s"), with_enable_dns_cache()]).unwrap();
    let target = format!("localhost:{port}");
    group.bench_function("tcp_cached_host", |b| {
        b.to_async(&rt)
            .iter(|| async { cached.dial_context("tcp", &target).await.unwrap() })
    });

    group.finish();
}

criterion_group!(benches, bench_round_robin, bench_cache, bench_parse, bench_dial);
criterion_main!(benches);
