//! CLI command definitions for the `stepwise` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod cache;
pub mod graph;
pub mod output;
pub mod run;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use stepwise_core::graph::{Selection, Selector};
use stepwise_types::identifier::StepIdentifier;

/// Incremental, cache-aware builds of data-pipeline steps.
#[derive(Parser)]
#[command(name = "stepwise", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Project config file [default: ./stepwise.toml].
    #[arg(long, global = true, env = "STEPWISE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the selected steps, reusing cached artifacts.
    Run {
        #[command(flatten)]
        select: SelectArgs,

        /// Rebuild the selected steps even when cached.
        #[arg(long)]
        force: bool,

        /// Show what would run without executing anything.
        #[arg(long)]
        dry_run: bool,

        /// Maximum number of steps executing at once.
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Show what `run` would do (same as `run --dry-run`).
    Plan {
        #[command(flatten)]
        select: SelectArgs,

        /// Plan as if the selected steps were forced.
        #[arg(long)]
        force: bool,
    },

    /// Validate and list the dependency graph.
    Graph {
        /// Group steps into waves that could run in parallel.
        #[arg(long)]
        waves: bool,
    },

    /// Print the fingerprint of one step.
    Fingerprint {
        /// Step identifier.
        step: String,
    },

    /// Show a step's dependencies, dependents, fingerprint, and cache state.
    Show {
        /// Step identifier.
        step: String,
    },

    /// Inspect the artifact cache.
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum CacheCommand {
    /// Fetch and validate the artifact for a step's current fingerprint.
    Verify {
        /// Step identifier.
        step: String,
    },
}

/// Which steps a run covers.
#[derive(Args, Debug, Clone, Default)]
pub struct SelectArgs {
    /// Steps to select: substrings of identifiers, or full identifiers with
    /// --exact. Nothing selects every step.
    pub steps: Vec<String>,

    /// Select every step.
    #[arg(long, conflicts_with = "steps")]
    pub all: bool,

    /// Treat each selector as a full step identifier.
    #[arg(long)]
    pub exact: bool,

    /// Also select everything downstream of the matched steps.
    #[arg(long)]
    pub downstream: bool,

    /// Run only the matched steps, not their dependencies.
    #[arg(long)]
    pub only: bool,
}

impl SelectArgs {
    pub fn selection(&self) -> anyhow::Result<Selection> {
        let selectors = if self.all || self.steps.is_empty() {
            vec![Selector::All]
        } else if self.exact {
            self.steps
                .iter()
                .map(|s| StepIdentifier::parse(s).map(Selector::Exact))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            self.steps.iter().cloned().map(Selector::Pattern).collect()
        };
        Ok(Selection {
            selectors,
            downstream: self.downstream,
            only: self.only,
        })
    }
}
