// src/main.rs
use clap::Parser;
use oremill::miner::algorithm::{Algorithm, Sha256dAlgo};
use oremill::miner::{CpuMiner, MinerSettings};
use oremill::network::PoolSet;
use oremill::supervisor::{ExitReason, LogSink, Supervisor};
use oremill::types::AlgorithmKind;
use oremill::utils::logging::init_bench_logging;
use oremill::ws::commands::{admin_registry, monitor_registry};
use oremill::ws::server::WsServer;
use oremill::*;
use std::sync::Arc;
use std::time::Duration;

/// Main entry point for the mining supervisor
///
/// # Returns
/// - `Ok(())` on clean shutdown
/// - `Err(MinerError)` if any operation fails
///
/// # Flow
/// 1. Parses command line arguments
/// 2. Delegates to the appropriate subcommand handler
/// 3. Propagates any errors upward
fn main() -> Result<(), MinerError> {
    let cli = cli::Commands::parse();

    match cli.action {
        cli::Action::Start(opts) => start_supervising(opts),
        cli::Action::Benchmark(opts) => run_benchmark(opts),
        cli::Action::Config(opts) => generate_config(opts),
    }
}

/// Starts the supervisor with the given configuration options
///
/// # Operations
/// 1. Initializes logging
/// 2. Loads and validates the configuration (with bootstrap chaining)
/// 3. Builds the CPU compute backend
/// 4. Wires the pool supervisor and both web planes
/// 5. Runs the supervisor loop until exit or reload
fn start_supervising(opts: cli::StartOptions) -> Result<(), MinerError> {
    utils::init_logging();

    let specified = opts.config.is_some();
    let path = opts.config.unwrap_or_else(|| "init.json".into());
    let (tracker, config) = config::load(path, specified);
    for problem in &tracker.value_errors {
        log::warn!("configuration: {}", problem);
    }
    let mut config = config.ok_or_else(|| {
        MinerError::ConfigError(format!(
            "could not load {}: {}",
            tracker.file.display(),
            tracker.error_desc
        ))
    })?;

    // Apply CLI overrides
    if let Some(workers) = opts.workers {
        config.worker_threads = workers;
    }
    if let Some(algo) = opts.algorithm {
        config.algo = algo.to_string();
    }

    let kind: AlgorithmKind = config
        .algo
        .parse()
        .map_err(|_| MinerError::ConfigError(format!("Invalid algorithm: {}", config.algo)))?;
    let miner = CpuMiner::new(
        create_algorithm(kind),
        MinerSettings {
            worker_threads: config.worker_threads,
            batch_size: config.batch_size,
        },
    );

    let pools = PoolSet::new(
        config.pools.clone(),
        Duration::from_secs(config.reconnect_delay),
    );
    let monitor = WsServer::new(
        "monitor",
        config.monitor_port,
        "monitor",
        "M8M-monitor",
        monitor_registry(),
    );
    let admin = WsServer::new(
        "admin",
        config.admin_port,
        "admin",
        "M8M-admin",
        admin_registry(),
    );

    let mut supervisor = Supervisor::new(pools, monitor, admin, Box::new(miner), tracker);
    let mut sink = LogSink;
    match supervisor.run(&mut sink)? {
        ExitReason::OperatorExit => log::info!("operator requested exit, goodbye"),
        ExitReason::Reload => {
            log::info!("configuration reload requested; restart to pick up the new file")
        }
    }
    Ok(())
}

/// Runs hashing benchmarks
///
/// # Operations
/// 1. Initializes benchmark-specific logging
/// 2. Creates the specified algorithm instance
/// 3. Spawns worker threads scanning a fixed header
/// 4. Reports the measured hashrate
fn run_benchmark(opts: cli::BenchmarkOptions) -> Result<(), MinerError> {
    init_bench_logging();

    let algorithm = create_algorithm(opts.algorithm);
    log::info!(
        "Starting {} benchmark for {} seconds on {} thread(s)",
        opts.algorithm,
        opts.duration,
        opts.threads
    );

    let start_time = std::time::Instant::now();
    let handles: Vec<_> = (0..opts.threads)
        .map(|thread| {
            let algo = algorithm.clone();
            std::thread::spawn(move || {
                let base = [0u8; 76];
                let mut nonce = (thread as u32).wrapping_mul(0x1000_0000);
                let mut hashes: u64 = 0;
                while start_time.elapsed().as_secs() < opts.duration {
                    if algo.hash(&base, nonce).is_err() {
                        break;
                    }
                    nonce = nonce.wrapping_add(1);
                    hashes += 1;
                }
                hashes
            })
        })
        .collect();

    let mut total: u64 = 0;
    for handle in handles {
        total += handle.join().unwrap_or(0);
    }
    let elapsed = start_time.elapsed().as_secs_f64().max(1e-9);
    log::info!("Benchmark results:");
    log::info!("Total hashes: {}", total);
    log::info!("Average hashrate: {:.2} H/s", total as f64 / elapsed);
    log::logger().flush();
    Ok(())
}

/// Generates a configuration template file
fn generate_config(opts: cli::ConfigOptions) -> Result<(), MinerError> {
    let template = config::generate_template();
    std::fs::write(opts.output, template)?;
    Ok(())
}

/// Creates an algorithm instance for the requested kind
fn create_algorithm(kind: AlgorithmKind) -> Arc<dyn Algorithm> {
    match kind {
        AlgorithmKind::Sha256d => Arc::new(Sha256dAlgo::new()),
    }
}
