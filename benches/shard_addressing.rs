// Microbenchmarks for the ingest hot paths: shard addressing, triplet
// hashing and HLL sketch updates
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use rs_dirbs_engine::hll::Hll;
use rs_dirbs_engine::shard::{calc_virt_imei_shard, hash_triplet, normalize_imei};

fn bench_shard_addressing(c: &mut Criterion) {
    let imeis: Vec<String> = (0..1000).map(|i| format!("35693803564{:04}3", i)).collect();

    c.bench_function("normalize_imei", |b| {
        b.iter(|| {
            for imei in &imeis {
                black_box(normalize_imei(black_box(imei)));
            }
        })
    });

    let normalized: Vec<String> = imeis.iter().map(|i| normalize_imei(i)).collect();
    c.bench_function("calc_virt_imei_shard", |b| {
        b.iter(|| {
            for imei in &normalized {
                black_box(calc_virt_imei_shard(Some(black_box(imei))));
            }
        })
    });

    c.bench_function("hash_triplet", |b| {
        b.iter(|| {
            for imei in &normalized {
                black_box(hash_triplet(
                    Some(black_box(imei)),
                    Some("111015113222222"),
                    Some("222000049781840"),
                ));
            }
        })
    });
}

fn bench_hll(c: &mut Criterion) {
    let values: Vec<String> = (0..10_000).map(|i| format!("35693803564{:05}", i)).collect();

    c.bench_function("hll_add_10k", |b| {
        b.iter(|| {
            let mut hll = Hll::new();
            for v in &values {
                hll.add(black_box(v));
            }
            black_box(hll.cardinality())
        })
    });

    let mut a = Hll::new();
    let mut other = Hll::new();
    for (i, v) in values.iter().enumerate() {
        if i % 2 == 0 {
            a.add(v);
        } else {
            other.add(v);
        }
    }
    c.bench_function("hll_union", |b| {
        b.iter(|| {
            let mut merged = a.clone();
            merged.union(black_box(&other));
            black_box(merged)
        })
    });
}

criterion_group!(benches, bench_shard_addressing, bench_hll);
criterion_main!(benches);
