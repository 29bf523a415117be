use anyhow::{bail, Context};
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;
use tracing::info;
use upstream_resilience::metrics::MetricsService;
use upstream_resilience::{
    create_resilience_stack, init_tracing, ExecuteOptions, FallbackSource, LogFormat,
    ResilienceConfig, ResilienceError,
};

const USAGE: &str = "Usage: resilience-drill [config_file] [--calls N] [--json-logs] [--metrics]";

struct Args {
    config_path: String,
    calls: usize,
    json_logs: bool,
    metrics: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config_path: "config/resilience.yaml".to_string(),
        calls: 100,
        json_logs: false,
        metrics: false,
    };

    let mut iter = env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--calls" => {
                let value = iter.next().context("--calls needs a value")?;
                args.calls = value
                    .parse()
                    .with_context(|| format!("invalid --calls value '{}'", value))?;
            }
            "--json-logs" => args.json_logs = true,
            "--metrics" => args.metrics = true,
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other if other.starts_with("--") => bail!("unknown flag '{}'\n{}", other, USAGE),
            path => args.config_path = path.to_string(),
        }
    }

    Ok(args)
}

#[derive(Default, serde::Serialize)]
struct Tally {
    primary: u64,
    fallback: u64,
    rate_limited: u64,
    rejected: u64,
    failed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args()?;

    init_tracing(if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Compact
    });

    let metrics = if args.metrics {
        Some(MetricsService::new()?)
    } else {
        None
    };

    let config = ResilienceConfig::from_file(&args.config_path)
        .with_context(|| format!("Failed to load configuration from {}", args.config_path))?;

    let mut upstreams: Vec<String> = config.upstreams.keys().cloned().collect();
    if upstreams.is_empty() {
        upstreams.push("synthetic".to_string());
    }

    let stack = create_resilience_stack(config)?;
    info!(upstreams = ?upstreams, calls = args.calls, "Starting chaos drill");

    let mut tallies: BTreeMap<String, Tally> = BTreeMap::new();
    for i in 0..args.calls {
        for name in &upstreams {
            let outcome = stack
                .execute(
                    name,
                    || async move {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        Ok(format!("payload-{}", i))
                    },
                    ExecuteOptions::new()
                        .with_chaos()
                        .with_fallback("placeholder".to_string())
                        .with_deadline(Duration::from_secs(10)),
                )
                .await;

            let tally = tallies.entry(name.clone()).or_default();
            match outcome {
                Ok(result) if result.source == FallbackSource::Primary => tally.primary += 1,
                Ok(_) => tally.fallback += 1,
                Err(ResilienceError::RateLimited { .. }) => tally.rate_limited += 1,
                Err(e) if e.is_admission_rejection() => tally.rejected += 1,
                Err(_) => tally.failed += 1,
            }
        }
    }

    let report = serde_json::json!({
        "calls": args.calls,
        "outcomes": tallies,
        "health": stack.health_state(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if let Some(metrics) = metrics {
        println!("{}", metrics.render());
    }

    Ok(())
}
