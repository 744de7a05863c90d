use criterion::{criterion_group, criterion_main, Criterion};
use slotpool::SlotPool;

fn bench_acquire_release(c: &mut Criterion) {
    let pool = SlotPool::new(64, |i| i as u64);

    c.bench_function("acquire_release", |b| {
        b.iter(|| {
            let idx = pool.acquire().unwrap();
            std::hint::black_box(pool.get(idx));
            pool.release(idx);
        })
    });
}

fn bench_drain_refill(c: &mut Criterion) {
    let pool = SlotPool::new(64, |i| i as u64);
    let mut held = Vec::with_capacity(64);

    c.bench_function("drain_refill_64", |b| {
        b.iter(|| {
            while let Some(idx) = pool.acquire() {
                held.push(idx);
            }
            for idx in held.drain(..) {
                pool.release(idx);
            }
        })
    });
}

criterion_group!(benches, bench_acquire_release, bench_drain_refill);
criterion_main!(benches);
