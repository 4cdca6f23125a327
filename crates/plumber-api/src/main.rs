//! Plumber CLI entry point.
//!
//! Binary name: `plumber`
//!
//! Parses CLI arguments, initializes logging and the local store, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use plumber_core::engine::processor::ProcessRequest;
use plumber_observe::tracing_setup::{LogFormat, init_tracing, shutdown_tracing};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = log_filter(cli.verbose, cli.quiet);
    let log_format: LogFormat = cli.log_format.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    init_tracing(filter, log_format, cli.otel).map_err(|e| anyhow::anyhow!("{e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "plumber", &mut std::io::stdout());
        return Ok(());
    }

    let result = run(cli).await;
    shutdown_tracing();
    result
}

/// Tracing filter for the `-v` count and `--quiet`. `--quiet` only lowers
/// logging; command output is unaffected.
fn log_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,plumber_core=debug",
        _ => "trace",
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let json = cli.json;
    let state = AppState::init(cli.data_dir).await?;

    match cli.command {
        Commands::Import { file } => {
            cli::flow::import_flow(&state, &file, json).await?;
        }

        Commands::Show { flow_id } => {
            cli::flow::show_flow(&state, &flow_id, json).await?;
        }

        Commands::Check { flow_id } => {
            cli::flow::check_flow(&state, &flow_id, json).await?;
        }

        Commands::Branches { flow_id, depth } => {
            cli::flow::show_branches(&state, &flow_id, depth, json).await?;
        }

        Commands::Process {
            flow_id,
            execution_id,
            step_id,
        } => {
            let request = ProcessRequest {
                flow_id,
                execution_id,
                step_id,
            };
            cli::execution::process_step(&state, request, json).await?;
        }

        Commands::Run {
            flow_id,
            payload,
            test_run,
            no_wait,
        } => {
            cli::execution::run_flow(&state, &flow_id, &payload, test_run, no_wait, json).await?;
        }

        Commands::Variables {
            flow_id,
            execution_id,
        } => {
            cli::execution::list_variables(&state, &flow_id, &execution_id, json).await?;
        }

        Commands::Backoff { attempt } => {
            cli::backoff::show_backoff(&state.backoff(), attempt, json)?;
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}
