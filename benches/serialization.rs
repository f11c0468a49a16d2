//! Component graph serialization benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use lumen::component::register_builtins;
use lumen::registry::ComponentRegistry;
use lumen::serial;
use serde_json::{Map, Value, json};
use std::hint::black_box;

/// A root with `children` films of `size` cells each.
fn scene(children: usize, size: usize) -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();
    register_builtins(&registry);
    let mut films = Map::new();
    for i in 0..children {
        films.insert(
            format!("film{i}"),
            json!({ "type": "film::accum", "props": { "size": size } }),
        );
    }
    let root = registry
        .create_with("context::default", "$", &json!({ "children": Value::Object(films) }))
        .unwrap();
    registry.register_root(root);
    registry
}

fn bench_save_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialization");

    for (children, size) in [(1usize, 1024usize), (16, 1024), (4, 256 * 1024)] {
        let registry = scene(children, size);
        let bytes = serial::to_bytes(registry.root()).unwrap();
        let id = format!("{children}x{size}");

        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("save", &id), &registry, |b, registry| {
            b.iter(|| black_box(serial::to_bytes(registry.root()).unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("load", &id), &bytes, |b, bytes| {
            b.iter(|| black_box(serial::from_bytes(&registry, bytes).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_save_load);
criterion_main!(benches);
