use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use rand::SeedableRng;
use rand::rngs::StdRng;

use jobforge_core::RetryPolicy;

fn bench_decide(c: &mut Criterion) {
    let policy = RetryPolicy {
        enabled: true,
        max_retries: 25,
        min_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(3600),
        exponent: 2.0,
        max_jitter: Duration::from_secs(5),
    };
    let mut rng = StdRng::seed_from_u64(42);

    c.bench_function("retry_policy_decide_25_attempts", |b| {
        b.iter(|| {
            for n in 1..=26 {
                black_box(policy.decide(black_box(n), &mut rng));
            }
        })
    });

    c.bench_function("retry_policy_backoff_no_jitter", |b| {
        b.iter(|| black_box(policy.backoff(black_box(12), Duration::ZERO)))
    });
}

criterion_group!(benches, bench_decide);
criterion_main!(benches);
