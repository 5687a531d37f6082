//! Benchmarks for the resolver's cached path.

use std::net::IpAddr;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box};
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::time::Instant;

use misha::backend::{Backend, Record};
use misha::error::BackendError;
use misha::resolver::Resolver;

/// Answers every name with one address for an hour.
struct Fixed(IpAddr);

impl Backend for Fixed {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn lookup<'a>(&'a self, _host: &'a str) -> BoxFuture<'a, Result<Option<Record>, BackendError>> {
        async move { Ok(Some((self.0, Instant::now() + Duration::from_secs(3600)))) }.boxed()
    }
}

fn bench_lookup(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let resolver = Resolver::new(vec![Box::new(Fixed("93.184.216.34".parse().unwrap()))]);
    let hosts: Vec<String> = (0..1000).map(|i| format!("host{i}.example.com")).collect();
    rt.block_on(async {
        for host in &hosts {
            resolver.lookup(host).await;
        }
    });

    let resolver = &resolver;
    let hosts = &hosts;
    let mut group = c.benchmark_group("resolver");

    group.bench_function(BenchmarkId::new("lookup", "cached"), |b| {
        b.to_async(&rt)
            .iter(move || async move { resolver.lookup(black_box("host7.example.com")).await })
    });

    group.bench_function(BenchmarkId::new("lookup", "cached_uppercase"), |b| {
        b.to_async(&rt)
            .iter(move || async move { resolver.lookup(black_box("HOST7.Example.com.")).await })
    });

    group.bench_function(BenchmarkId::new("lookup", "cached_spread"), |b| {
        let mut i = 0;
        b.to_async(&rt).iter(move || {
            i = (i + 1) % hosts.len();
            let host = hosts[i].as_str();
            async move { resolver.lookup(black_box(host)).await }
        })
    });

    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_lookup(&mut criterion);
    criterion.final_summary();
}
