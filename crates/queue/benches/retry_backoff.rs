use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use signalq_queue::{BackoffStrategy, RetryPolicy};
use std::time::Duration;

fn bench_delay_for_attempt(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_policy_delay_for_attempt");

    for strategy in [
        BackoffStrategy::Fixed,
        BackoffStrategy::Exponential,
        BackoffStrategy::Linear,
    ] {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            strategy,
            jitter: 0.1,
        };

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{strategy:?}")),
            &policy,
            |b, policy| {
                b.iter(|| {
                    for attempt in 1..=10 {
                        black_box(policy.delay_for_attempt(black_box(attempt)));
                    }
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_delay_for_attempt);
criterion_main!(benches);
