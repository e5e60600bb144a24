// src/cli/mod.rs
//! Command-line interface definitions

/// Argument structures for the supervisor's subcommands
pub mod commands;

pub use commands::{Action, BenchmarkOptions, Commands, ConfigOptions, StartOptions};
