use criterion::{criterion_group, criterion_main, Criterion};
use std::time::{Duration, Instant};

use bulkmap::{unique, Device, Hashmap, HostCpu};

const N: usize = 65_536;

fn bulk_insert(c: &mut Criterion) {
    let device = HostCpu::default();
    let keys_host: Vec<i64> = (0..N as i64).collect();
    let keys = device.upload(&keys_host).unwrap();
    let values = device.upload(&keys_host).unwrap();

    c.bench_function("Hashmap: bulk insert, 64k distinct", |b| {
        b.iter_custom(|iters| {
            let mut total = Duration::default();
            for _ in 0..iters {
                let mut map = Hashmap::new(N, 8, 8, device.clone()).unwrap();
                let start = Instant::now();
                map.insert(&keys, &values, None, None, N).unwrap();
                total += start.elapsed();
            }
            total
        })
    });
}

fn bulk_find(c: &mut Criterion) {
    let device = HostCpu::default();
    let keys_host: Vec<i64> = (0..N as i64).collect();
    let keys = device.upload(&keys_host).unwrap();
    let values = device.upload(&keys_host).unwrap();
    let mut map = Hashmap::new(N, 8, 8, device.clone()).unwrap();
    map.insert(&keys, &values, None, None, N).unwrap();

    let mut refs = device.allocate(N * 8).unwrap();
    let mut masks = device.allocate(N).unwrap();
    c.bench_function("Hashmap: bulk find, 64k hits", |b| {
        b.iter(|| {
            map.find(&keys, &mut refs, &mut masks, N).unwrap();
        })
    });
}

fn unique_half_duplicated(c: &mut Criterion) {
    let device = HostCpu::default();
    let keys_host: Vec<i64> = (0..N as i64).map(|k| k / 2).collect();
    let keys = device.upload(&keys_host).unwrap();

    c.bench_function("unique: 64k keys, half duplicated", |b| {
        b.iter(|| unique(&device, &keys, N, 8).unwrap())
    });
}

criterion_group!(benches, bulk_insert, bulk_find, unique_half_duplicated);
criterion_main!(benches);
