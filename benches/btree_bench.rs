use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::prelude::*;

use std::sync::Arc;
use tarndb::common::types::Rid;
use tarndb::index::btree::BPlusTree;
use tarndb::storage::buffer::BufferPoolManager;

// Create a temporary database for benchmarking
fn create_test_buffer_pool(pool_size: usize) -> Arc<BufferPoolManager> {
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    let path = temp_file.path().to_str().unwrap().to_string();
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, 2, path).unwrap());

    // Keep the temp file alive
    std::mem::forget(temp_file);

    buffer_pool
}

fn btree_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("BPlusTree");

    for size in [1_000, 10_000].iter() {
        group.bench_with_input(BenchmarkId::new("insert", size), size, |b, &size| {
            let buffer_pool = create_test_buffer_pool(256);
            let tree = BPlusTree::<i32, Rid>::new(buffer_pool, 64, 64).unwrap();

            let mut keys: Vec<i32> = (0..size).collect();
            keys.shuffle(&mut rand::thread_rng());
            let mut idx = 0;

            b.iter(|| {
                if idx >= keys.len() {
                    idx = 0;
                }
                let key = keys[idx];
                let _ = tree.insert(key, Rid::new(0, key as u32 + 1000)).unwrap();
                idx += 1;
            });
        });

        group.bench_with_input(BenchmarkId::new("lookup", size), size, |b, &size| {
            let buffer_pool = create_test_buffer_pool(256);
            let tree = BPlusTree::<i32, Rid>::new(buffer_pool, 64, 64).unwrap();
            for key in 0..size {
                tree.insert(key, Rid::new(0, key as u32)).unwrap();
            }

            let mut rng = rand::thread_rng();
            b.iter(|| {
                let key = rng.gen_range(0..size);
                let _ = tree.get(&key).unwrap();
            });
        });

        group.bench_with_input(BenchmarkId::new("full_scan", size), size, |b, &size| {
            let buffer_pool = create_test_buffer_pool(256);
            let tree = BPlusTree::<i32, Rid>::new(buffer_pool, 64, 64).unwrap();
            for key in 0..size {
                tree.insert(key, Rid::new(0, key as u32)).unwrap();
            }

            b.iter(|| {
                let count = tree.iter().unwrap().count();
                assert_eq!(count, size as usize);
            });
        });
    }

    group.finish();
}

criterion_group!(benches, btree_benchmark);
criterion_main!(benches);
