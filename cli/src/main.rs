//! callguard CLI: validate policy configs and rehearse failure storms.
//!
//! Usage:
//! ```bash
//! # Validate a config file and print it with defaults filled in
//! callguard check --config callguard.json
//!
//! # Push 500 calls through the recommended pipeline against a provider
//! # that times out 40% of the time
//! callguard simulate --calls 500 --failure-rate 0.4 --seed 7
//! ```

mod telemetry;

use std::env;
use std::io::{self, ErrorKind};
use std::process;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use callguard_core::{CallContext, GuardError, Pipeline, Registry, ResilienceConfig, Retryable};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "check" => cmd_check(&args[2..]),
        "simulate" => cmd_simulate(&args[2..]).await,
        "version" | "--version" | "-V" => {
            println!("callguard {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("callguard {}", env!("CARGO_PKG_VERSION"));
    println!("Circuit breaker, rate limiter and retry policies for unreliable providers\n");
    println!("USAGE:");
    println!("    callguard <COMMAND>\n");
    println!("COMMANDS:");
    println!("    check      Validate a config file and print it normalized");
    println!("    simulate   Run calls through the recommended pipeline against a flaky provider");
    println!("    version    Print version");
    println!("    help       Print this help\n");
    println!("CHECK FLAGS:");
    println!("    --config <PATH>         JSON config file  [required]\n");
    println!("SIMULATE FLAGS:");
    println!("    --config <PATH>         JSON config file  [default: built-in defaults]");
    println!("    --calls <N>             Number of calls  [default: 200]");
    println!("    --failure-rate <F>      Share of invocations that time out  [default: 0.3]");
    println!("    --fatal-rate <F>        Share of invocations rejected as invalid  [default: 0]");
    println!("    --interval-ms <MS>      Simulated pause between calls  [default: 100]");
    println!("    --seed <S>              RNG seed  [default: 42]");
    println!("    --resource <NAME>       Breaker / rate-limit key  [default: provider]");
    println!("    --log <LEVEL>           Override the configured log level");
}

fn cmd_check(args: &[String]) -> Result<()> {
    let path = parse_flag(args, "--config").context("--config is required")?;
    let config = ResilienceConfig::from_path(&path)
        .with_context(|| format!("config {path} is invalid"))?;

    println!("{path}: OK");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: u64,
    exhausted: u64,
    fatal: u64,
    circuit_open: u64,
    rate_limited: u64,
    invocations: u64,
}

async fn cmd_simulate(args: &[String]) -> Result<()> {
    let mut config = match parse_flag(args, "--config") {
        Some(path) => ResilienceConfig::from_path(&path)
            .with_context(|| format!("config {path} is invalid"))?,
        None => ResilienceConfig::default(),
    };
    if let Some(level) = parse_flag(args, "--log") {
        config.log.level = level;
    }
    telemetry::init_tracing(&config.log);

    let calls: u64 = parse_num(args, "--calls", 200)?;
    let failure_rate: f64 = parse_num(args, "--failure-rate", 0.3)?;
    let fatal_rate: f64 = parse_num(args, "--fatal-rate", 0.0)?;
    let interval_ms: u64 = parse_num(args, "--interval-ms", 100)?;
    let seed: u64 = parse_num(args, "--seed", 42)?;
    let resource = parse_flag(args, "--resource").unwrap_or_else(|| "provider".to_string());
    ensure!(
        (0.0..=1.0).contains(&failure_rate) && (0.0..=1.0).contains(&fatal_rate),
        "rates must be within [0, 1]"
    );
    ensure!(
        failure_rate + fatal_rate <= 1.0,
        "--failure-rate + --fatal-rate must not exceed 1"
    );

    tracing::info!(calls, failure_rate, fatal_rate, seed, "starting simulation");

    // Virtual clock: backoff sleeps and breaker timeouts elapse instantly.
    tokio::time::pause();
    let started = Instant::now();

    let registry = Arc::new(Registry::from_config(&config));
    let pipeline = Pipeline::recommended(Arc::clone(&registry));
    let ctx = CallContext::new(resource);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut tally = Tally::default();

    for _ in 0..calls {
        let mut invocations = 0u64;
        let outcome = pipeline
            .call(&ctx, || {
                invocations += 1;
                let roll: f64 = rng.gen();
                let result = if roll < fatal_rate {
                    Err(io::Error::new(ErrorKind::InvalidInput, "request rejected by provider"))
                } else if roll < fatal_rate + failure_rate {
                    Err(io::Error::new(ErrorKind::TimedOut, "provider timed out"))
                } else {
                    Ok(())
                };
                std::future::ready(result)
            })
            .await;
        tally.invocations += invocations;

        match outcome {
            Ok(()) => tally.succeeded += 1,
            Err(GuardError::RateLimited(_)) => tally.rate_limited += 1,
            Err(GuardError::CircuitOpen(_)) => tally.circuit_open += 1,
            Err(GuardError::Inner(e)) if e.is_retryable() => tally.exhausted += 1,
            Err(GuardError::Inner(_)) => tally.fatal += 1,
        }
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }

    println!(
        "Simulated {calls} calls to {} over {:.1}s (seed {seed})",
        ctx.resource,
        started.elapsed().as_secs_f64()
    );
    println!("  Pipeline:          {}", pipeline.describe());
    println!("  Succeeded:         {}", tally.succeeded);
    println!("  Retries exhausted: {}", tally.exhausted);
    println!("  Non-retryable:     {}", tally.fatal);
    println!("  Circuit open:      {}", tally.circuit_open);
    println!("  Rate limited:      {}", tally.rate_limited);
    println!("  Invocations:       {}", tally.invocations);
    println!(
        "  Window remaining:  {}",
        registry.limiter().get_remaining(ctx.default_key())
    );
    println!("\nBreakers:");
    println!("{}", serde_json::to_string_pretty(&registry.snapshot())?);
    Ok(())
}

fn parse_flag(args: &[String], flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    args.get(pos + 1).cloned()
}

fn parse_num<T>(args: &[String], flag: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match parse_flag(args, flag) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{flag}: cannot parse {raw:?}")),
        None => Ok(default),
    }
}
