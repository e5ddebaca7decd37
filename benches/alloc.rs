// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 shmarena contributors
//
// Allocation strategy benchmarks.
//
// Run with:
//   cargo bench --bench alloc
//   cargo bench --bench alloc --features bump_alloc
//
// Groups:
//   heap_baseline — the same malloc/free cycle through the process-local
//                   global allocator; arena_shared minus the semaphore
//                   round trips and chunk bookkeeping
//   arena_shared  — shared-memory arena malloc/free cycle
//   arena_bump    — bumpalo arena (feature = bump_alloc), for a sense of
//                   how much the cross-process locking and chunk
//                   bookkeeping cost over a process-local bump pointer
//
// Each group exercises the same workload at three request sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use shmarena::{Arena, ArenaConfig};

const SIZES: &[(&str, usize)] = &[
    ("small_48", 48),
    ("medium_256", 256),
    ("large_4096", 4096),
];

// ---------------------------------------------------------------------------
// Baseline: process-local heap, same allocate-then-release cycle
// ---------------------------------------------------------------------------

fn bench_heap_baseline(c: &mut Criterion) {
    let mut group = c.benchmark_group("heap_baseline");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                // mirror arena_shared's malloc + free pair: reserve the
                // request, touch the first byte, release
                let mut buf = Vec::<u8>::with_capacity(black_box(sz));
                buf.push(0xAB);
                drop(black_box(buf));
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Shared-memory arena: malloc + free under the arena-wide lock
// ---------------------------------------------------------------------------

fn bench_arena_alloc(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bench-arena");
    let mut cfg = ArenaConfig::new();
    cfg.init_size(8 << 20);
    cfg.max_locks(1);
    let arena = Arena::init(&path, &cfg).expect("init bench arena");

    let mut group = c.benchmark_group("arena_shared");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            b.iter(|| {
                let p = arena.malloc(black_box(sz));
                assert!(!p.is_null());
                unsafe { arena.free(p) };
            });
        });
    }

    group.finish();
    arena.free_arena();
}

// ---------------------------------------------------------------------------
// bumpalo: allocate into a process-local arena, reset between batches
// ---------------------------------------------------------------------------

#[cfg(feature = "bump_alloc")]
fn bench_bump_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_bump");

    for &(label, size) in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(label), &size, |b, &sz| {
            let mut bump = bumpalo::Bump::with_capacity(8 << 20);
            b.iter(|| {
                let slice = bump.alloc_slice_fill_copy(black_box(sz), 0xABu8);
                black_box(slice.as_ptr());
                bump.reset();
            });
        });
    }

    group.finish();
}

#[cfg(feature = "bump_alloc")]
criterion_group!(benches, bench_heap_baseline, bench_arena_alloc, bench_bump_alloc);
#[cfg(not(feature = "bump_alloc"))]
criterion_group!(benches, bench_heap_baseline, bench_arena_alloc);
criterion_main!(benches);
