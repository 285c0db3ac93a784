use criterion::{black_box, criterion_group, criterion_main, Criterion};
use num_bigint::BigUint;

use ergo_pool::shares::autolykos;
use ergo_pool::shares::{ShareValidator, ShareWork};

const HEIGHT: u32 = 1_200_000;

fn target() -> BigUint {
    // roughly one share in 2^32 hashes
    BigUint::from(1u8) << 224u32
}

fn bench_hit(c: &mut Criterion) {
    let header = [0x5au8; 32];
    let mut nonce = 0u64;
    c.bench_function("autolykos2_hit", |b| {
        b.iter(|| {
            nonce = nonce.wrapping_add(1);
            autolykos::hit(black_box(&header), black_box(&nonce.to_be_bytes()), HEIGHT)
        })
    });
}

fn bench_calc_n(c: &mut Criterion) {
    c.bench_function("calc_n", |b| b.iter(|| autolykos::calc_n(black_box(HEIGHT))));
}

fn bench_validator_pool(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    let validator = ShareValidator::with_default_parallelism();
    let share_target = target();

    c.bench_function("validator_64_concurrent", |b| {
        b.to_async(&rt).iter(|| {
            let validator = validator.clone();
            let share_target = share_target.clone();
            async move {
                let jobs = (0..64u64).map(|i| {
                    validator.validate(ShareWork {
                        header: [0x5au8; 32],
                        nonce: i.to_be_bytes(),
                        height: HEIGHT,
                        share_target: share_target.clone(),
                        network_target: share_target.clone(),
                    })
                });
                futures::future::join_all(jobs).await
            }
        })
    });
}

criterion_group!(benches, bench_hit, bench_calc_n, bench_validator_pool);
criterion_main!(benches);
