//! Stepwise CLI entry point.
//!
//! Binary name: `stepwise`
//!
//! Parses CLI arguments, loads the project config and dependency graph, then
//! dispatches to the command handler. Exit codes: 0 on success, 1 when a run
//! fails or is cancelled (or a verified artifact is missing or corrupted), 2
//! when the graph, config, or arguments are invalid.

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;
use stepwise_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

use cli::run::RunArgs;
use cli::{CacheCommand, Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(&TracingOptions {
        verbosity: cli.verbose,
        quiet: cli.quiet,
        json: cli.log_json,
        otel: cli.otel,
    }) {
        eprintln!("Warning: failed to initialize logging: {e}");
    }

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            eprintln!("{} {e:#}", console::style("error:").red().bold());
            ExitCode::from(2)
        }
    };

    shutdown_tracing();
    code
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    // Shell completions don't need a project
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepwise", &mut std::io::stdout());
        return Ok(ExitCode::SUCCESS);
    }

    let state = AppState::init(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Run {
            select,
            force,
            dry_run,
            workers,
        } => {
            let args = RunArgs {
                select,
                force,
                dry_run,
                workers,
            };
            cli::run::run(&state, args, cli.json, cli.quiet).await
        }

        Commands::Plan { select, force } => cli::run::plan(&state, select, force, cli.json).await,

        Commands::Graph { waves } => cli::graph::list(&state, waves, cli.json),

        Commands::Fingerprint { step } => cli::graph::fingerprint(&state, &step, cli.json).await,

        Commands::Show { step } => cli::graph::show(&state, &step, cli.json).await,

        Commands::Cache { action } => match action {
            CacheCommand::Verify { step } => cli::cache::verify(&state, &step, cli.json).await,
        },

        Commands::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}
