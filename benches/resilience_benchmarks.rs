use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tokio::runtime::Runtime;
use upstream_resilience::{
    create_resilience_stack, CircuitBreaker, CircuitBreakerConfig, ExecuteOptions,
    MultiClientRateLimiter, RateLimitConfig, ResilienceConfig, TokenBucketRateLimiter,
};

fn benchmark_token_bucket(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let _guard = rt.enter();
    let limiter = TokenBucketRateLimiter::new(
        "bench",
        RateLimitConfig {
            max_tokens: u32::MAX,
            refill_rate: 1_000_000.0,
            refill_interval_ms: 1,
        },
    );

    c.bench_function("token_bucket_try_consume", |b| {
        b.iter(|| black_box(limiter.try_consume()))
    });
}

fn benchmark_multi_client(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let _guard = rt.enter();
    let mut group = c.benchmark_group("multi_client_try_consume");

    for clients in [10usize, 1_000, 10_000].iter() {
        let limiter = MultiClientRateLimiter::new(Default::default());
        let keys: Vec<String> = (0..*clients).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();

        group.bench_with_input(BenchmarkId::from_parameter(clients), &keys, |b, keys| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                black_box(limiter.try_consume(&keys[i]))
            })
        });
    }
    group.finish();
}

fn benchmark_circuit_breaker(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());

    c.bench_function("circuit_breaker_execute_closed", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(breaker.execute(|| async { Ok(1u32) }).await) })
    });
}

fn benchmark_stack_execute(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut config = ResilienceConfig::default();
    config.defaults.rate_limit = RateLimitConfig {
        max_tokens: u32::MAX,
        refill_rate: 1_000_000.0,
        refill_interval_ms: 1,
    };
    let stack = rt.block_on(async { create_resilience_stack(config).unwrap() });

    c.bench_function("stack_execute_success", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                stack
                    .execute("bench", || async { Ok(1u32) }, ExecuteOptions::new())
                    .await,
            )
        })
    });
}

fn benchmark_config_parsing(c: &mut Criterion) {
    let yaml = r#"
seed: 1
defaults:
  circuit_breaker:
    failure_threshold: 5
  retry:
    max_attempts: 3
    retryable_errors: [network, timeout]
upstreams:
  ipfs-gateway:
    bulkhead:
      max_concurrent: 4
  geodata-portal: {}
"#;

    c.bench_function("config_parsing", |b| {
        b.iter(|| black_box(ResilienceConfig::from_yaml(yaml)))
    });
}

criterion_group!(
    benches,
    benchmark_token_bucket,
    benchmark_multi_client,
    benchmark_circuit_breaker,
    benchmark_stack_execute,
    benchmark_config_parsing
);
criterion_main!(benches);
