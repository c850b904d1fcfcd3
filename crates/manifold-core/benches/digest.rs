use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use manifold_core::Digest;

fn bench_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");

    for size in [64usize, 4096, 1 << 20] {
        let data = vec![0xA5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("update_{size}"), |b| {
            b.iter(|| {
                let mut digest = Digest::new();
                digest.update(black_box(&data));
                black_box(digest.finalize())
            })
        });
    }

    group.bench_function("hex_form", |b| {
        b.iter(|| {
            let mut digest = Digest::new();
            digest.update(black_box(b"vendor name driver"));
            black_box(digest.finalize_hex())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_digest);
criterion_main!(benches);
