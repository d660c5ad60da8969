//! Graph inspection: `graph`, `fingerprint`, `show`.

use std::collections::BTreeSet;
use std::process::ExitCode;

use comfy_table::Cell;
use console::style;
use serde::Serialize;
use stepwise_core::graph::{DagNode, DependencyGraph};
use stepwise_core::store::ArtifactStore;
use stepwise_types::fingerprint::Fingerprint;
use stepwise_types::identifier::StepIdentifier;

use super::output::{check_mark, print_json, table};
use crate::state::AppState;

#[derive(Serialize)]
struct GraphEntry<'a> {
    step: &'a StepIdentifier,
    dependencies: &'a BTreeSet<StepIdentifier>,
    external: bool,
}

pub fn list(state: &AppState, waves: bool, json: bool) -> anyhow::Result<ExitCode> {
    let graph = &state.graph;
    if waves {
        let waves = all_waves(graph);
        if json {
            print_json(&waves)?;
        } else {
            for (i, wave) in waves.iter().enumerate() {
                println!("{}", style(format!("Wave {}", i + 1)).bold());
                for step in wave {
                    println!("  {step}");
                }
            }
        }
        return Ok(ExitCode::SUCCESS);
    }

    let entries: Vec<GraphEntry<'_>> = graph
        .topological_order()
        .iter()
        .filter_map(|id| graph.node(id))
        .map(|node| GraphEntry {
            step: &node.id,
            dependencies: &node.dependencies,
            external: node.external,
        })
        .collect();

    if json {
        print_json(&entries)?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut table = table(&["Step", "Dependencies", "Origin"]);
    for id in graph.topological_order() {
        let Some(node) = graph.node(id) else { continue };
        table.add_row(vec![
            Cell::new(&node.id),
            Cell::new(node.dependencies.len()),
            Cell::new(origin_label(node)),
        ]);
    }
    println!("{table}");
    println!();
    println!(
        "  {} {} steps, {} external",
        check_mark(true),
        graph.len(),
        graph.nodes().filter(|n| n.external).count()
    );
    Ok(ExitCode::SUCCESS)
}

fn all_waves(graph: &DependencyGraph) -> Vec<Vec<StepIdentifier>> {
    let everything: BTreeSet<StepIdentifier> = graph.nodes().map(|n| n.id.clone()).collect();
    graph.execution_waves(&everything)
}

fn origin_label(node: &DagNode) -> String {
    match (&node.origin, node.external) {
        (_, true) => "external".to_string(),
        (Some(origin), false) => origin.clone(),
        (None, false) => String::new(),
    }
}

pub async fn fingerprint(state: &AppState, raw: &str, json: bool) -> anyhow::Result<ExitCode> {
    let step = state.step(raw)?;
    let fingerprint = state.fingerprint_of(&step).await?;
    if json {
        print_json(&serde_json::json!({ "step": step, "fingerprint": fingerprint }))?;
    } else {
        println!("{}", fingerprint.to_hex());
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct StepDetails {
    step: StepIdentifier,
    fingerprint: Fingerprint,
    cached: bool,
    external: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<String>,
    dependencies: Vec<StepIdentifier>,
    dependents: Vec<StepIdentifier>,
}

pub async fn show(state: &AppState, raw: &str, json: bool) -> anyhow::Result<ExitCode> {
    let step = state.step(raw)?;
    let Some(node) = state.graph.node(&step) else {
        anyhow::bail!("step {step} is not in the graph");
    };
    let fingerprint = state.fingerprint_of(&step).await?;
    let cached = state.store.exists(&step, &fingerprint).await?;

    let details = StepDetails {
        fingerprint,
        cached,
        external: node.external,
        origin: node.origin.clone(),
        dependencies: state.graph.dependencies(&step).cloned().collect(),
        dependents: state.graph.dependents(&step).cloned().collect(),
        step,
    };

    if json {
        print_json(&details)?;
        return Ok(ExitCode::SUCCESS);
    }

    println!("{}", style(&details.step).bold());
    println!("  Fingerprint: {}", details.fingerprint);
    println!("  Cached:      {}", check_mark(details.cached));
    if details.external {
        println!("  Origin:      external");
    } else if let Some(origin) = &details.origin {
        println!("  Origin:      {origin}");
    }
    print_list("Dependencies", &details.dependencies);
    print_list("Dependents", &details.dependents);
    Ok(ExitCode::SUCCESS)
}

fn print_list(label: &str, steps: &[StepIdentifier]) {
    println!();
    println!("  {} ({})", style(label).bold(), steps.len());
    for step in steps {
        println!("    {step}");
    }
}
