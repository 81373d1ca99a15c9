//! Command-line interface for uptime-stream.
//!
//! Provides commands for running the check loops, one-off producer passes,
//! stream statistics and database migrations.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, Role};
