//! CLI command definitions for the `plumber` binary.
//!
//! Uses clap derive macros for argument parsing. Commands operate on the
//! local SQLite store in the data directory.

pub mod backoff;
pub mod execution;
pub mod flow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use uuid::Uuid;

/// Run and inspect Plumber flows.
#[derive(Parser)]
#[command(name = "plumber", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Only log errors. Command results are still printed.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log line format: pretty or json.
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: String,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    /// Data directory holding config.toml and plumber.db.
    #[arg(long, global = true, env = "PLUMBER_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import a flow definition from a JSON file.
    Import {
        /// Path to the flow definition.
        file: PathBuf,
    },

    /// Show a flow's steps.
    Show {
        flow_id: Uuid,
    },

    /// Check whether a flow can be activated.
    Check {
        flow_id: Uuid,
    },

    /// Show the if-then branch groups of a flow at a nesting depth.
    Branches {
        flow_id: Uuid,

        /// Nesting depth to group at.
        #[arg(long, default_value = "0")]
        depth: i64,
    },

    /// Process a single step of an existing execution.
    Process {
        flow_id: Uuid,
        execution_id: Uuid,
        step_id: Uuid,
    },

    /// Start a new execution and run every step in order.
    Run {
        flow_id: Uuid,

        /// JSON payload emitted by the trigger step.
        #[arg(long, default_value = "{}")]
        payload: String,

        /// Mark the execution as a test run.
        #[arg(long)]
        test_run: bool,

        /// Do not sleep between retries.
        #[arg(long)]
        no_wait: bool,
    },

    /// List the variables an execution exposes to later steps.
    Variables {
        flow_id: Uuid,
        execution_id: Uuid,
    },

    /// Show retry delays produced by the backoff policy.
    Backoff {
        /// Attempt number (1-based). Shows every allowed attempt when omitted.
        attempt: Option<u32>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
