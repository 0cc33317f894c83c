//! Command-line interface for taskflow.
//!
//! Provides the long-running `worker` command plus producer/operator
//! commands that talk to Redis directly.

mod commands;

pub use commands::{
    parse_cli, register_builtin_pipelines, run, run_with_cli, Cli, Commands, ECHO_TASK_TYPE,
};
