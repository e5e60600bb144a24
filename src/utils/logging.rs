// src/utils/logging.rs
//! Log output for the supervisor
//!
//! The operator reads this stream for pool connection transitions, share
//! accept/reject lines and web client arrivals, so the prefix stays short:
//! timestamp, level, and the emitting subsystem. Built on `env_logger`, and
//! `RUST_LOG` still overrides everything for debugging a single module
//! (e.g. `RUST_LOG=oremill::stratum=trace`).

use env_logger::{Builder, Target};
use log::LevelFilter;
use std::env;

/// Sets up logging for a supervising run
///
/// Defaults to `Info`, which carries the lines worth watching: pool
/// lifecycle, worker authorization, share replies and the periodic share
/// summaries. Frame-level and stratum wire noise sits at `Debug`/`Trace`
/// and stays hidden unless `RUST_LOG` asks for it.
pub fn init_logging() {
    supervisor_format().filter(None, LevelFilter::Info).init();
}

/// Sets up logging for the benchmark subcommand
///
/// Benchmarks are short-lived and interactive, so the default drops to
/// `Debug` to show per-thread progress; an explicit `RUST_LOG` wins as
/// usual.
pub fn init_bench_logging() {
    let mut builder = supervisor_format();
    if env::var("RUST_LOG").is_ok() {
        builder.parse_env("RUST_LOG");
    } else {
        builder.filter_level(LevelFilter::Debug);
    }
    builder.init();
}

/// The shared line format: `[epoch-seconds LEVEL subsystem] message`
///
/// Targets are the module paths (`oremill::ws::server`, `oremill::network::pool`,
/// ...), which is exactly the granularity the supervisor's subsystems split
/// along. Everything goes to stdout; the process has no other console
/// output to interleave with.
fn supervisor_format() -> Builder {
    let mut builder = Builder::new();

    builder
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                buf.timestamp_seconds(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .target(Target::Stdout);

    builder
}
