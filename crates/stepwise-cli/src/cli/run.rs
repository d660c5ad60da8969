//! `stepwise run` and `stepwise plan`.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use comfy_table::{Cell, Color};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use stepwise_core::event::EventBus;
use stepwise_core::graph::ResolvedSelection;
use stepwise_core::scheduler::{PlannedAction, RunOptions, RunPlan, RunReport};
use stepwise_types::event::RunEvent;
use stepwise_types::run::NodeStatus;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::SelectArgs;
use super::output::{check_mark, format_duration, print_json, status_cell, table};
use crate::state::AppState;

/// Settings for `run`, after the command line is parsed.
pub struct RunArgs {
    pub select: SelectArgs,
    pub force: bool,
    pub dry_run: bool,
    pub workers: Option<usize>,
}

pub async fn run(
    state: &AppState,
    args: RunArgs,
    json: bool,
    quiet: bool,
) -> anyhow::Result<ExitCode> {
    let workers = match args.workers {
        Some(0) => anyhow::bail!("--workers must be at least 1"),
        Some(n) => n,
        None => state.workers(),
    };
    let selection = args.select.selection()?.resolve(&state.graph)?;

    if args.dry_run {
        return plan_selection(state, &selection, args.force, json).await;
    }

    let fingerprints = Arc::new(state.fingerprints(&selection.nodes).await?);
    let options = RunOptions {
        workers,
        force: args.force,
        dry_run: false,
        step_timeout: state.step_timeout(),
    };

    let events = EventBus::default();
    let cancel = CancellationToken::new();
    let interrupt = spawn_interrupt_handler(cancel.clone());
    let renderer = (!json && !quiet).then(|| spawn_progress(&events));

    let scheduler = state.scheduler(events.clone());
    let result = scheduler
        .execute(
            Arc::clone(&state.graph),
            fingerprints,
            &selection,
            &options,
            cancel,
        )
        .await;
    // Close the bus so the renderer sees the end even when the run never started.
    drop(scheduler);
    drop(events);
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }
    interrupt.abort();
    let report = result?;

    if json {
        print_json(&report)?;
    } else if !quiet {
        print_report(&report);
    }

    Ok(if report.is_success() && !report.cancelled {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

pub async fn plan(
    state: &AppState,
    select: SelectArgs,
    force: bool,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let selection = select.selection()?.resolve(&state.graph)?;
    plan_selection(state, &selection, force, json).await
}

async fn plan_selection(
    state: &AppState,
    selection: &ResolvedSelection,
    force: bool,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let fingerprints = state.fingerprints(&selection.nodes).await?;
    let plan = state
        .scheduler(EventBus::default())
        .plan(&state.graph, &fingerprints, selection, force)
        .await?;

    if json {
        print_json(&plan)?;
    } else {
        print_plan(&plan);
    }
    Ok(ExitCode::SUCCESS)
}

fn spawn_interrupt_handler(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    })
}

/// Progress bar fed by run events; one printed line per finished node.
fn spawn_progress(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.enable_steady_tick(Duration::from_millis(80));

        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "progress renderer lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match &event {
                RunEvent::RunStarted { nodes, .. } => bar.set_length(*nodes as u64),
                RunEvent::NodeStarted { step, .. } => bar.set_message(format!("building {step}")),
                RunEvent::RunFinished { .. } => break,
                _ => {}
            }
            if let Some(line) = event_line(&event) {
                bar.inc(1);
                bar.println(line);
            }
        }
        bar.finish_and_clear();
    })
}

/// The line printed when a node reaches a terminal state.
fn event_line(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::NodeCacheHit { step, fingerprint } => Some(format!(
            "  {} {step} {}",
            style("=").dim(),
            style(format!("(cached {})", fingerprint.short())).dim()
        )),
        RunEvent::NodeSucceeded {
            step, duration_ms, ..
        } => Some(format!(
            "  {} {step} {}",
            check_mark(true),
            style(format_duration(*duration_ms)).dim()
        )),
        RunEvent::NodeFailed { step, error } => Some(format!(
            "  {} {step}: {}",
            check_mark(false),
            style(error).red()
        )),
        RunEvent::NodeSkipped { step, reason } => Some(format!(
            "  {} {step} {}",
            style("-").yellow(),
            style(format!("({reason})")).dim()
        )),
        RunEvent::RunStarted { .. } | RunEvent::NodeStarted { .. } | RunEvent::RunFinished { .. } => {
            None
        }
    }
}

fn print_plan(plan: &RunPlan) {
    let mut table = table(&["Wave", "Step", "Fingerprint", "Action"]);
    for (wave, entries) in plan.waves.iter().enumerate() {
        for entry in entries {
            let action = match entry.action {
                PlannedAction::CacheHit => status_cell(NodeStatus::CacheHit),
                PlannedAction::Build => Cell::new("build").fg(Color::Cyan),
            };
            table.add_row(vec![
                Cell::new(wave + 1),
                Cell::new(&entry.step),
                Cell::new(entry.fingerprint.short()),
                action,
            ]);
        }
    }
    println!("{table}");
    println!();
    println!(
        "  {} to build, {} cached",
        style(plan.to_build()).bold(),
        style(plan.cache_hits()).bold()
    );
}

fn print_report(report: &RunReport) {
    let mut table = table(&["Step", "Status", "Duration", "Detail"]);
    for node in &report.nodes {
        let detail = node
            .error
            .clone()
            .or_else(|| node.skip_reason.as_ref().map(ToString::to_string))
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(&node.step),
            status_cell(node.status),
            Cell::new(node.duration_ms.map(format_duration).unwrap_or_default()),
            Cell::new(detail),
        ]);
    }
    println!("{table}");
    println!();

    let summary = &report.summary;
    let headline = if report.cancelled {
        style("Run cancelled").yellow().bold()
    } else if report.is_success() {
        style("Run succeeded").green().bold()
    } else {
        style("Run failed").red().bold()
    };
    println!(
        "  {headline} in {}: {} built, {} cached, {} failed, {} skipped",
        format_duration(report.duration_ms),
        summary.succeeded,
        summary.cache_hits,
        summary.failed,
        summary.skipped
    );
}
