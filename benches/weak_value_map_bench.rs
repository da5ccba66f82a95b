use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use std::time::Duration;
use weak_value_map::{Tracked, WeakValueMap};

fn lcg(mut s: u64) -> impl Iterator<Item = u64> {
    std::iter::from_fn(move || {
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
        Some(s)
    })
}

fn key(n: u64) -> String {
    format!("k{:016x}", n)
}

fn bench_insert(c: &mut Criterion) {
    c.bench_function("weak_value_map_insert_10k", |b| {
        b.iter_batched(
            || {
                let held: Vec<_> = (0..10_000u64).map(Tracked::new).collect();
                (WeakValueMap::<String, u64>::new(), held)
            },
            |(m, held)| {
                for (v, x) in held.iter().zip(lcg(1)) {
                    m.insert(key(x), v);
                }
                black_box((m, held))
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_get_hit(c: &mut Criterion) {
    c.bench_function("weak_value_map_get_hit", |b| {
        let m = WeakValueMap::new();
        let keys: Vec<_> = lcg(7).take(20_000).map(key).collect();
        // Keep strong handles so entries stay live.
        let _held: Vec<_> = keys
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, k)| {
                let v = Tracked::new(i as u64);
                m.insert(k, &v);
                v
            })
            .collect();
        let mut it = keys.iter().cycle();
        b.iter(|| {
            let k = it.next().unwrap();
            black_box(m.get(k.as_str()).unwrap());
        })
    });
}

fn bench_get_miss(c: &mut Criterion) {
    c.bench_function("weak_value_map_get_miss", |b| {
        let m = WeakValueMap::new();
        let _held: Vec<_> = lcg(11)
            .take(10_000)
            .enumerate()
            .map(|(i, x)| {
                let v = Tracked::new(i as u64);
                m.insert(key(x), &v);
                v
            })
            .collect();
        let mut miss = lcg(0xdead_beef);
        b.iter(|| {
            let k = key(miss.next().unwrap());
            black_box(m.get(k.as_str()).is_err());
        })
    });
}

// Insert then drop the only strong handle: exercises the reclamation hook.
fn bench_churn(c: &mut Criterion) {
    c.bench_function("weak_value_map_insert_reclaim", |b| {
        let m = WeakValueMap::<u64, u64>::new();
        let mut keys = lcg(3);
        b.iter(|| {
            let v = Tracked::new(1);
            m.insert(keys.next().unwrap() % 1024, &v);
            drop(v);
        });
        assert!(m.is_empty());
    });
}

fn bench_get_or_insert(c: &mut Criterion) {
    c.bench_function("weak_value_map_get_or_insert_with", |b| {
        let m = WeakValueMap::<u64, u64>::new();
        let pinned: Vec<_> = (0..512u64).map(Tracked::new).collect();
        for (i, v) in pinned.iter().enumerate() {
            m.insert(i as u64, v);
        }
        let mut keys = lcg(5);
        b.iter(|| {
            // Half hits on pinned keys, half inserts of temporaries.
            let k = keys.next().unwrap() % 1024;
            black_box(m.get_or_insert_with(k, || Tracked::new(k)));
        });
    });
}

fn bench_config() -> Criterion {
    Criterion::default()
        .sample_size(50)
        .measurement_time(Duration::from_secs(8))
        .warm_up_time(Duration::from_secs(2))
}

criterion_group! {
    name = benches;
    config = bench_config();
    targets = bench_insert, bench_get_hit, bench_get_miss, bench_churn, bench_get_or_insert
}
criterion_main!(benches);
