#![forbid(unsafe_code)]

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use weir_pool::{BlockPool, NoopRamAccountant, PoolConfig};
use weir_store::MemSwapDevice;
use weir_types::WorkerId;

const BLOCK_SIZE: usize = 64 * 1024;

fn bench_allocate_destroy(c: &mut Criterion) {
    let pool = BlockPool::new_for_tests(1);
    c.bench_function("allocate_destroy_64k", |b| {
        b.iter(|| {
            let pinned = pool.allocate(BLOCK_SIZE, WorkerId(0)).unwrap();
            black_box(pinned.id());
        });
    });
}

fn bench_unpin_repin_resident(c: &mut Criterion) {
    let pool = BlockPool::new_for_tests(1);
    let blk = pool.allocate(BLOCK_SIZE, WorkerId(0)).unwrap().unpin();
    c.bench_function("unpin_repin_resident_64k", |b| {
        b.iter(|| {
            let pinned = pool.pin(&blk, WorkerId(0)).wait().unwrap();
            black_box(pinned.read()[0]);
        });
    });
}

fn bench_pin_clone(c: &mut Criterion) {
    let pool = BlockPool::new_for_tests(1);
    let pinned = pool.allocate(BLOCK_SIZE, WorkerId(0)).unwrap();
    c.bench_function("pin_clone_64k", |b| {
        b.iter(|| black_box(pinned.clone()));
    });
}

fn bench_evict_swap_in_cycle(c: &mut Criterion) {
    // Soft limit of one byte: every unpin swaps out, every pin faults.
    let pool = Arc::new(
        BlockPool::new(
            PoolConfig {
                soft_ram_limit: 1,
                hard_ram_limit: 0,
                workers_per_host: 1,
            },
            Arc::new(MemSwapDevice::new()),
            Arc::new(NoopRamAccountant),
        )
        .unwrap(),
    );
    let blk = pool.allocate(BLOCK_SIZE, WorkerId(0)).unwrap().unpin();
    c.bench_function("evict_swap_in_cycle_64k", |b| {
        b.iter(|| {
            let pinned = pool.pin(&blk, WorkerId(0)).wait().unwrap();
            black_box(pinned.read()[0]);
        });
    });
}

fn bench_metrics_snapshot(c: &mut Criterion) {
    let pool = BlockPool::new_for_tests(4);
    let mut refs = Vec::new();
    for _ in 0..64 {
        refs.push(pool.allocate(4096, WorkerId(0)).unwrap().unpin());
    }
    c.bench_function("metrics_snapshot_64_blocks", |b| {
        b.iter(|| black_box(pool.metrics()));
    });
}

criterion_group!(
    pool_benches,
    bench_allocate_destroy,
    bench_unpin_repin_resident,
    bench_pin_clone,
    bench_evict_swap_in_cycle,
    bench_metrics_snapshot,
);
criterion_main!(pool_benches);
