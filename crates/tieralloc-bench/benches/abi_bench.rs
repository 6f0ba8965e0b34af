//! C ABI benchmarks: the cost of the boundary and of the throttle model.

use std::ffi::c_void;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tieralloc_abi::hook_abi::{ta_hook_allocate, ta_hook_free};
use tieralloc_abi::tieralloc_abi::{ta_alloc, ta_charge_bytes, ta_disable, ta_enable, ta_free};

fn bench_ta_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("ta_alloc_free");
    for (name, hint) in [("hot", 1), ("cold", 3), ("pin_fast", 4)] {
        group.bench_with_input(BenchmarkId::new(name, 4096), &hint, |b, &h| {
            b.iter(|| {
                let p = ta_alloc(4096, h);
                assert!(!p.is_null());
                assert_eq!(ta_free(criterion::black_box(p)), 0);
            });
        });
    }
    group.finish();
}

fn bench_hooks(c: &mut Criterion) {
    let mut group = c.benchmark_group("hooks");

    group.bench_function("native_malloc_free", |b| {
        b.iter(|| {
            // SAFETY: plain libc allocation.
            unsafe {
                let p = libc::malloc(4096);
                libc::free(criterion::black_box(p));
            }
        });
    });

    group.bench_function("disabled_passthrough", |b| {
        b.iter(|| {
            // SAFETY: hooks accept their own pointers.
            unsafe {
                let p: *mut c_void = ta_hook_allocate(4096);
                ta_hook_free(criterion::black_box(p));
            }
        });
    });

    assert_eq!(ta_enable(), 0);
    group.bench_function("enabled_tiered", |b| {
        b.iter(|| {
            // SAFETY: hooks accept their own pointers.
            unsafe {
                let p = ta_hook_allocate(4096);
                ta_hook_free(criterion::black_box(p));
            }
        });
    });
    assert_eq!(ta_disable(), 0);
    group.finish();
}

fn bench_charge(c: &mut Criterion) {
    let mut group = c.benchmark_group("charge_bytes");
    for bytes in [4096u64, 1 << 20, 1 << 30] {
        group.bench_with_input(BenchmarkId::new("hot", bytes), &bytes, |b, &n| {
            b.iter(|| {
                // SAFETY: null info is allowed.
                criterion::black_box(unsafe { ta_charge_bytes(1, n, std::ptr::null_mut()) })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_ta_alloc_free, bench_hooks, bench_charge);
criterion_main!(benches);
