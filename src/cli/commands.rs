// src/cli/commands.rs
use crate::types::AlgorithmKind;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// oremill CLI - cryptocurrency mining supervisor
#[derive(Parser, Debug)]
#[command(name = "oremill")]
#[command(version, about, long_about = None)]
pub struct Commands {
    /// The action to perform (start supervising, run benchmarks, or generate config)
    #[command(subcommand)]
    pub action: Action,
}

/// Top-level commands for the supervisor application
#[derive(Subcommand, Debug)]
pub enum Action {
    /// Start supervising pools and miners with the specified options
    Start(StartOptions),

    /// Run performance benchmarks for hashing algorithms
    Benchmark(BenchmarkOptions),

    /// Generate a configuration file template
    Config(ConfigOptions),
}

/// Options for starting the supervisor
#[derive(Parser, Debug)]
pub struct StartOptions {
    /// Path to the configuration file; when omitted the bootstrap file
    /// "init.json" is read and may chain to a user configuration
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of worker threads to use (overrides config)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Mining algorithm to use (overrides config)
    #[arg(short, long)]
    pub algorithm: Option<AlgorithmKind>,
}

/// Options for running hashing benchmarks
#[derive(Parser, Debug)]
pub struct BenchmarkOptions {
    /// Algorithm to benchmark
    #[arg(short, long, default_value = "sha256d")]
    pub algorithm: AlgorithmKind,

    /// Duration of the benchmark in seconds
    #[arg(short, long, default_value_t = 60)]
    pub duration: u64,

    /// Number of threads to use
    #[arg(short, long, default_value_t = num_cpus::get())]
    pub threads: usize,
}

/// Options for generating configuration files
#[derive(Parser, Debug)]
pub struct ConfigOptions {
    /// Output file path
    #[arg(short, long, default_value = "init.json")]
    pub output: PathBuf,
}
