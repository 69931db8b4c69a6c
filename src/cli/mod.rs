//! Command-line interface for taskpool.
//!
//! Provides commands to push tasks, wait for results, run workers and
//! inspect channels.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
