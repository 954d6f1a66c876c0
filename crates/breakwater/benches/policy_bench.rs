//! Benchmarks for the policy hot paths
//!
//! Covers the circuit breaker's synchronous decorator and state-machine
//! cycle, the rate limiter's packed-word acquisition, bulkhead admission,
//! and backoff interval calculation.
//!
//! Run with: `cargo bench --bench policy_bench -p breakwater`

use std::time::Duration;

use breakwater::{
    BackoffStrategy, Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, MockClock,
    PolicyError, RateLimiter, RateLimiterConfig, WindowKind,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_circuit_breaker_sync_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker_sync_paths");

    group.bench_function("call_success", |b| {
        let breaker = CircuitBreaker::with_defaults("bench");
        b.iter(|| {
            let result: Result<_, PolicyError<std::io::Error>> =
                breaker.call(|| Ok::<_, std::io::Error>(()));
            if let Err(err) = result {
                panic!("circuit breaker success path failed: {err}");
            }
        });
    });

    group.bench_function("open_short_circuit", |b| {
        let config = CircuitBreakerConfig::builder()
            .failure_rate_threshold(50.0)
            .sliding_window(WindowKind::CountBased, 1)
            .minimum_calls(1)
            .wait_in_open(Duration::from_secs(60))
            .build()
            .expect("valid circuit breaker config for benchmarks");
        let breaker = CircuitBreaker::new("bench", config).expect("breaker should build");

        // Trip the breaker so it stays open for the benchmark iterations.
        let _ = breaker.call(|| Err::<(), _>(std::io::Error::other("initial failure")));

        b.iter(|| {
            let result: Result<_, PolicyError<std::io::Error>> =
                breaker.call(|| Ok::<_, std::io::Error>(()));
            let _result = black_box(result);
        });
    });

    group.finish();
}

fn bench_circuit_breaker_state_machine(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker_state_machine");

    group.bench_function("open_half_open_recover", |b| {
        b.iter(|| {
            let clock = MockClock::new();
            let config = CircuitBreakerConfig::builder()
                .failure_rate_threshold(50.0)
                .sliding_window(WindowKind::CountBased, 3)
                .minimum_calls(3)
                .permitted_calls_in_half_open(2)
                .wait_in_open(Duration::from_millis(10))
                .build()
                .expect("valid config");
            let breaker = CircuitBreaker::with_clock("bench", config, clock.clone())
                .expect("breaker should build with mock clock");

            for _ in 0..3 {
                let _ = breaker.call(|| Err::<(), _>(std::io::Error::other("state transition")));
            }
            black_box(breaker.state());

            clock.advance(Duration::from_millis(10));
            let _ = breaker.call(|| Ok::<_, std::io::Error>(()));
            let _ = breaker.call(|| Ok::<_, std::io::Error>(()));

            black_box(breaker.state());
        });
    });

    group.finish();
}

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");

    group.bench_function("try_acquire_granted", |b| {
        let config = RateLimiterConfig::builder()
            .limit_for_period(1_000_000)
            .limit_refresh_period(Duration::from_millis(1))
            .timeout_duration(Duration::ZERO)
            .build()
            .expect("valid config");
        let limiter = RateLimiter::new("bench", config).expect("limiter should build");
        b.iter(|| {
            let _ = black_box(limiter.try_acquire());
        });
    });

    group.bench_function("try_acquire_denied", |b| {
        let config = RateLimiterConfig::builder()
            .limit_for_period(1)
            .limit_refresh_period(Duration::from_secs(3600))
            .timeout_duration(Duration::ZERO)
            .build()
            .expect("valid config");
        let limiter = RateLimiter::new("bench", config).expect("limiter should build");
        let _ = limiter.try_acquire();
        b.iter(|| {
            let _ = black_box(limiter.try_acquire());
        });
    });

    group.finish();
}

fn bench_bulkhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulkhead");

    group.bench_function("acquire_release", |b| {
        let config =
            BulkheadConfig::builder().max_concurrent(64).build().expect("valid config");
        let bulkhead = Bulkhead::new("bench", config).expect("bulkhead should build");
        b.iter(|| {
            let permit = bulkhead.try_acquire().expect("permit available");
            black_box(&permit);
        });
    });

    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");

    group.bench_function("exponential_delay", |b| {
        let strategy = BackoffStrategy::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        };
        b.iter(|| {
            for attempt in 1..=10 {
                black_box(strategy.delay_for(attempt));
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_circuit_breaker_sync_paths,
    bench_circuit_breaker_state_machine,
    bench_rate_limiter,
    bench_bulkhead,
    bench_backoff
);
criterion_main!(benches);
